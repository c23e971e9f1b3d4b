//! Incremental parser for the search event stream
//!
//! Events are separated by a blank line. Each event carries an `event:`
//! kind and one or more `data:` lines holding JSON (or plain text for
//! string payloads). Events without an `event:` line fall back to a
//! `{"type": ..., "data": ...}` envelope inside the data.

use serde::Deserialize;
use serde_json::Value;

use super::{SearchError, SearchEvent};
use crate::streaming::Product;

/// Buffers raw bytes and yields complete events
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[serde(default)]
    intro_text: String,
    #[serde(default)]
    products: Vec<Product>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body; returns every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SearchEvent, SearchError>> {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&block[..end]);
            if let Some(event) = parse_block(&text) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever remains once the body has ended
    pub fn finish(&mut self) -> Option<Result<SearchEvent, SearchError>> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        parse_block(text.trim_end_matches('\n'))
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one event block; `None` for comment-only or empty blocks
fn parse_block(block: &str) -> Option<Result<SearchEvent, SearchError>> {
    let mut kind: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => kind = Some(value),
            "data" => data_lines.push(value),
            _ => {} // id, retry
        }
    }

    if kind.is_none() && data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    Some(match kind {
        Some(kind) => decode_event(kind, &data),
        None => decode_envelope(&data),
    })
}

fn decode_envelope(data: &str) -> Result<SearchEvent, SearchError> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| SearchError::Parse(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::Parse("Event has no type".to_string()))?
        .to_string();

    // `result` carries its fields at the top level
    let payload = match (kind.as_str(), value.get("data")) {
        ("result", None) => value.clone(),
        (_, Some(data)) => data.clone(),
        (_, None) => Value::Null,
    };
    decode_value(&kind, payload)
}

fn decode_event(kind: &str, data: &str) -> Result<SearchEvent, SearchError> {
    let value = match serde_json::from_str::<Value>(data) {
        Ok(value) => value,
        // Plain-text payloads are fine for string kinds
        Err(_) => Value::String(data.to_string()),
    };
    decode_value(kind, value)
}

fn decode_value(kind: &str, value: Value) -> Result<SearchEvent, SearchError> {
    match kind {
        "log" => Ok(SearchEvent::Log(text_of(value))),
        "final_text" => Ok(SearchEvent::FinalText(text_of(value))),
        "products" => {
            let list = match value {
                Value::Object(mut map) => map
                    .remove("products")
                    .or_else(|| map.remove("items"))
                    .unwrap_or(Value::Array(Vec::new())),
                other => other,
            };
            serde_json::from_value::<Vec<Product>>(list)
                .map(SearchEvent::Products)
                .map_err(|e| SearchError::Parse(format!("products: {}", e)))
        }
        "result" => serde_json::from_value::<LegacyResult>(value)
            .map(|r| SearchEvent::Result {
                intro_text: r.intro_text,
                products: r.products,
            })
            .map_err(|e| SearchError::Parse(format!("result: {}", e))),
        other => Err(SearchError::Parse(format!("Unknown event kind: {}", other))),
    }
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Object(mut map) => match map.remove("text") {
            Some(Value::String(s)) => s,
            _ => Value::Object(map).to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> Vec<Result<SearchEvent, SearchError>> {
        let mut parser = EventStreamParser::new();
        let mut events = parser.push(input.as_bytes());
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_log_and_final_text_events() {
        let events = parse_all(
            "event: log\ndata: \"Searching...\"\n\nevent: final_text\ndata: Here are some tents\n\n",
        );
        assert_eq!(
            events,
            vec![
                Ok(SearchEvent::Log("Searching...".to_string())),
                Ok(SearchEvent::FinalText("Here are some tents".to_string())),
            ]
        );
    }

    #[test]
    fn test_products_event() {
        let events = parse_all(
            "event: products\ndata: [{\"name\":\"Tent\",\"img_url\":\"u1\"},{\"name\":\"Lamp\",\"img_url\":\"u2\"}]\n\n",
        );
        match &events[0] {
            Ok(SearchEvent::Products(products)) => {
                assert_eq!(products.len(), 2);
                assert_eq!(products[1].name, "Lamp");
            }
            other => panic!("Expected Products, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_result_event() {
        let events = parse_all(
            "event: result\ndata: {\"intro_text\":\"Found these\",\"products\":[{\"name\":\"Tent\",\"img_url\":\"u\"}]}\n\n",
        );
        match &events[0] {
            Ok(SearchEvent::Result {
                intro_text,
                products,
            }) => {
                assert_eq!(intro_text, "Found these");
                assert_eq!(products.len(), 1);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_without_event_line() {
        let events = parse_all("data: {\"type\":\"log\",\"data\":\"step 1\"}\n\n");
        assert_eq!(events, vec![Ok(SearchEvent::Log("step 1".to_string()))]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = EventStreamParser::new();
        assert!(parser.push(b"event: fin").is_empty());
        assert!(parser.push(b"al_text\r\ndata: caf\xc3").is_empty());
        let events = parser.push(b"\xa9\r\n\r\n");
        assert_eq!(events, vec![Ok(SearchEvent::FinalText("café".to_string()))]);
    }

    #[test]
    fn test_unknown_kind_does_not_stop_stream() {
        let events = parse_all("event: weird\ndata: 1\n\nevent: log\ndata: ok\n\n");
        assert!(matches!(events[0], Err(SearchError::Parse(_))));
        assert_eq!(events[1], Ok(SearchEvent::Log("ok".to_string())));
    }

    #[test]
    fn test_comments_and_blank_blocks_skipped() {
        let events = parse_all(": keepalive\n\n\n\nevent: log\ndata: x\n\n");
        assert_eq!(events, vec![Ok(SearchEvent::Log("x".to_string()))]);
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut parser = EventStreamParser::new();
        assert!(parser.push(b"event: final_text\ndata: done").is_empty());
        assert_eq!(
            parser.finish(),
            Some(Ok(SearchEvent::FinalText("done".to_string())))
        );
        assert_eq!(parser.finish(), None);
    }
}
