//! HTTP client for the concierge text endpoints

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EventStreamParser, SearchError, SearchEvent};

/// Timeout for the single-shot `/chat` request
const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    text: &'a str,
}

/// `/chat` answers with either `response` or `error`
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchClient {
    base_url: String,
    http: Client,
}

impl SearchClient {
    pub fn new(base_url: &str) -> Result<Self, SearchError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SearchError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the agent a question and wait for its full answer
    pub async fn chat(&self, query: &str) -> Result<String, SearchError> {
        log::info!("Chat query: {} chars", query.len());

        let response = self
            .http
            .post(format!("{}/chat", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(&QueryRequest { text: query })
            .send()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;

        let result = parse_chat_response(status, &body);
        match &result {
            Ok(text) => log::info!("Chat answer: {} chars", text.len()),
            Err(e) => log::error!("Chat failed: {}", e),
        }
        result
    }

    /// Run a streaming search, handing each event to `on_event` as it arrives
    ///
    /// Malformed events are logged and skipped. Returns once the server ends
    /// the stream.
    pub async fn search<F>(&self, query: &str, mut on_event: F) -> Result<(), SearchError>
    where
        F: FnMut(SearchEvent),
    {
        log::info!("Search query: {} chars", query.len());

        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .header("Accept", "text/event-stream")
            .json(&QueryRequest { text: query })
            .send()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        let mut parser = EventStreamParser::new();
        let mut delivered = 0usize;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SearchError::Network(e.to_string()))?;
            for event in parser.push(&chunk) {
                deliver(event, &mut on_event, &mut delivered);
            }
        }
        if let Some(event) = parser.finish() {
            deliver(event, &mut on_event, &mut delivered);
        }

        log::info!("Search stream ended after {} events", delivered);
        Ok(())
    }
}

fn deliver<F: FnMut(SearchEvent)>(
    event: Result<SearchEvent, SearchError>,
    on_event: &mut F,
    delivered: &mut usize,
) {
    match event {
        Ok(event) => {
            *delivered += 1;
            on_event(event);
        }
        Err(e) => log::warn!("Skipping search event: {}", e),
    }
}

/// Interpret a `/chat` response body
pub fn parse_chat_response(status: u16, body: &str) -> Result<String, SearchError> {
    let parsed = serde_json::from_str::<ChatResponse>(body);

    if !(200..300).contains(&status) {
        return Err(api_error(status, body));
    }

    let parsed = parsed.map_err(|e| SearchError::Parse(e.to_string()))?;
    if let Some(error) = parsed.error {
        return Err(SearchError::Backend(error));
    }
    parsed
        .response
        .ok_or_else(|| SearchError::Backend("No response from agent".to_string()))
}

fn api_error(status: u16, body: &str) -> SearchError {
    let message = match serde_json::from_str::<ChatResponse>(body) {
        Ok(ChatResponse {
            error: Some(error), ..
        }) => error,
        _ => body.to_string(),
    };
    SearchError::Api { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_response_ok() {
        let text = parse_chat_response(200, r#"{"response":"Try the blue tent"}"#).unwrap();
        assert_eq!(text, "Try the blue tent");
    }

    #[test]
    fn test_chat_backend_error() {
        let err = parse_chat_response(200, r#"{"error":"Agent crashed"}"#).unwrap_err();
        assert_eq!(err, SearchError::Backend("Agent crashed".to_string()));
    }

    #[test]
    fn test_chat_missing_response() {
        let err = parse_chat_response(200, r#"{"response":null}"#).unwrap_err();
        assert!(matches!(err, SearchError::Backend(_)));
    }

    #[test]
    fn test_chat_http_error_uses_error_field() {
        let err = parse_chat_response(500, r#"{"error":"GOOGLE_API_KEY not set"}"#).unwrap_err();
        assert_eq!(
            err,
            SearchError::Api {
                status: 500,
                message: "GOOGLE_API_KEY not set".to_string()
            }
        );
    }

    #[test]
    fn test_chat_http_error_plain_body() {
        let err = parse_chat_response(404, "Not Found").unwrap_err();
        assert_eq!(
            err,
            SearchError::Api {
                status: 404,
                message: "Not Found".to_string()
            }
        );
    }

    #[test]
    fn test_chat_garbage_body() {
        let err = parse_chat_response(200, "<html>").unwrap_err();
        assert!(matches!(err, SearchError::Parse(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = SearchClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }
}
