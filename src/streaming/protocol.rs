//! Concierge audio server protocol types
//!
//! JSON text frames over a single WebSocket, one `type` per message.
//!
//! # Protocol Overview
//!
//! 1. Connect to the configured `ws://` endpoint
//! 2. Receive `ready`
//! 3. Stream microphone audio via `audio` (base64 PCM16LE, mono, 16kHz)
//! 4. Receive `audio` (base64 PCM16LE, mono, 24kHz), `text`, `user_text`,
//!    `products`, `log`, and the turn markers
//!    `bot_speech_start` / `bot_speech_end` / `turn_complete`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::SessionError;

/// Sample rate of outbound (microphone) audio
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Sample rate of inbound (bot speech) audio
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// A product returned by the concierge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Image URL for the product card
    #[serde(alias = "image_url", default)]
    pub img_url: String,

    /// Listing URL on the marketplace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

// ============================================================================
// Client Messages (sent TO the server)
// ============================================================================

/// Messages sent from client to the concierge audio server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One captured frame of microphone audio
    Audio {
        /// Base64-encoded PCM16LE, mono, 16kHz
        data: String,
    },
}

impl ClientMessage {
    /// Create an audio message from raw PCM16 samples
    pub fn audio(samples: &[i16]) -> Self {
        Self::Audio {
            data: encode_pcm16(samples),
        }
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Protocol(e.to_string()))
    }
}

// ============================================================================
// Server Messages (received FROM the server)
// ============================================================================

/// Messages received from the concierge audio server
///
/// Unknown `type` values fail to deserialize and are reported as protocol
/// errors by [`ServerMessage::parse`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server accepted the connection
    Ready,

    /// Chunk of bot speech
    Audio {
        /// Base64-encoded PCM16LE, mono, 24kHz
        data: String,
    },

    /// Assistant text increment
    Text { data: String },

    /// Transcribed user speech increment
    UserText { data: String },

    /// Full replacement for the displayed product set
    Products {
        #[serde(alias = "products", alias = "items")]
        data: Vec<Product>,
    },

    /// Diagnostic line for the operator console
    Log { data: String },

    TurnComplete,

    BotSpeechStart,

    BotSpeechEnd,
}

impl ServerMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| {
            SessionError::Protocol(format!("{} in message: {}", e, preview(text)))
        })
    }

    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ready => "ready",
            ServerMessage::Audio { .. } => "audio",
            ServerMessage::Text { .. } => "text",
            ServerMessage::UserText { .. } => "user_text",
            ServerMessage::Products { .. } => "products",
            ServerMessage::Log { .. } => "log",
            ServerMessage::TurnComplete => "turn_complete",
            ServerMessage::BotSpeechStart => "bot_speech_start",
            ServerMessage::BotSpeechEnd => "bot_speech_end",
        }
    }
}

/// Truncate a raw message for log output
fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

// ============================================================================
// PCM16 framing
// ============================================================================

/// Encode PCM16 samples as base64 little-endian bytes
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(&bytes)
}

/// Decode base64 little-endian PCM16
pub fn decode_pcm16(data: &str) -> Result<Vec<i16>, SessionError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| SessionError::Protocol(format!("Invalid base64 audio: {}", e)))?;
    pcm16_from_bytes(&bytes)
}

/// Interpret raw little-endian bytes as PCM16 samples
pub fn pcm16_from_bytes(bytes: &[u8]) -> Result<Vec<i16>, SessionError> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Protocol(format!(
            "Odd PCM16 byte length: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_audio_serialization() {
        let msg = ClientMessage::audio(&[100i16, 200, 300]);
        let json = msg.to_json().unwrap();

        assert!(json.contains("\"type\":\"audio\""));
        assert!(json.contains("\"data\":"));
    }

    #[test]
    fn test_audio_encoding_is_little_endian() {
        let encoded = encode_pcm16(&[0x1234i16, 0x5678]);
        let decoded = STANDARD.decode(&encoded).unwrap();

        assert_eq!(decoded, vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_pcm16_round_trip_is_lossless() {
        let samples: Vec<i16> = (0..1600)
            .map(|i| ((i * 37) % 65536) as i32 - 32768)
            .map(|s| s as i16)
            .chain([i16::MIN, -1, 0, 1, i16::MAX])
            .collect();

        assert_eq!(decode_pcm16(&encode_pcm16(&samples)).unwrap(), samples);
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            decode_pcm16("not base64!!"),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let odd = STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_pcm16(&odd),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_server_text_deserialization() {
        let msg = ServerMessage::parse(r#"{"type": "text", "data": "Hello "}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Text {
                data: "Hello ".to_string()
            }
        );
        assert_eq!(msg.kind(), "text");
    }

    #[test]
    fn test_server_markers_deserialization() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"ready"}"#).unwrap(),
            ServerMessage::Ready
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"turn_complete"}"#).unwrap(),
            ServerMessage::TurnComplete
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"bot_speech_start"}"#).unwrap(),
            ServerMessage::BotSpeechStart
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"bot_speech_end"}"#).unwrap(),
            ServerMessage::BotSpeechEnd
        );
    }

    #[test]
    fn test_server_products_deserialization() {
        let json = r#"{
            "type": "products",
            "data": [
                {"name": "Tent", "description": "2-person", "img_url": "https://img/1.jpg"},
                {"name": "Lamp", "img_url": "https://img/2.jpg", "url": "https://shop/2", "id": "m2"}
            ]
        }"#;

        match ServerMessage::parse(json).unwrap() {
            ServerMessage::Products { data } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].name, "Tent");
                assert_eq!(data[0].description.as_deref(), Some("2-person"));
                assert_eq!(data[1].description, None);
                assert_eq!(data[1].id.as_deref(), Some("m2"));
            }
            other => panic!("Expected Products, got {:?}", other),
        }
    }

    #[test]
    fn test_products_payload_aliases() {
        let json = r#"{"type":"products","products":[{"name":"A","image_url":"u"}]}"#;
        match ServerMessage::parse(json).unwrap() {
            ServerMessage::Products { data } => assert_eq!(data[0].img_url, "u"),
            other => panic!("Expected Products, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = ServerMessage::parse(r#"{"type":"some.future.type","data":1}"#).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_invalid_json_is_protocol_error() {
        assert!(matches!(
            ServerMessage::parse("{not json"),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert!(p.len() <= 123);
    }
}
