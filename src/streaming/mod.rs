//! Live voice session with the concierge audio server
//!
//! One WebSocket carries microphone audio out and bot speech, transcripts,
//! product results, and diagnostics back in.
//!
//! # Architecture
//!
//! ```text
//! Mic (cpal) ──▶ Capture ──frames──▶ send task ──▶ WebSocket
//!                                                      │
//!                                                      ▼
//!                 SessionEvent ◀── dispatch task ◀── inbound
//!                                        │
//!                                        ▼ audio
//!                                  Player (FIFO) ──▶ Speaker (cpal)
//! ```
//!
//! # Failure Strategy
//!
//! - No automatic retry or reconnect; the caller decides
//! - Malformed inbound messages are reported and skipped
//! - Frames captured while disconnected are reported and dropped

pub mod playback;
pub mod protocol;
mod session;

pub use playback::{AudioOutput, OutputFactory, PlaybackBuffer, PlaybackQueue, Player};
pub use protocol::{ClientMessage, Product, ServerMessage};
pub use session::{EventReceiver, SessionConfig, VoiceSession};

use crate::audio::AudioError;

/// Errors that can occur during a voice session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Another `connect()` call has not finished yet
    ConnectInProgress,
    /// Connection dropped after it was established
    Disconnected(String),
    /// Microphone or speaker unavailable
    Device(AudioError),
    /// Malformed or unrecognized inbound message
    Protocol(String),
    /// Outbound message attempted with no open connection
    SendWhileDisconnected,
    /// Writing to the socket failed
    SendFailed(String),
    /// Session was closed
    Closed,
}

impl SessionError {
    /// Short category used in metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::ConnectionFailed(_)
            | SessionError::ConnectInProgress
            | SessionError::Disconnected(_) => "connection",
            SessionError::Device(_) => "device",
            SessionError::Protocol(_) => "protocol",
            SessionError::SendWhileDisconnected | SessionError::SendFailed(_) => "send",
            SessionError::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to audio server: {}", e)
            }
            SessionError::ConnectInProgress => write!(f, "Already connecting to audio server"),
            SessionError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            SessionError::Device(e) => write!(f, "Audio device error: {}", e),
            SessionError::Protocol(e) => write!(f, "WebSocket protocol error: {}", e),
            SessionError::SendWhileDisconnected => {
                write!(f, "Cannot send: not connected to audio server")
            }
            SessionError::SendFailed(e) => write!(f, "Failed to send audio: {}", e),
            SessionError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        SessionError::Device(e)
    }
}

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Everything a session reports to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection established
    Ready,
    /// Server acknowledged the connection with `ready`
    ServerReady,
    /// Server closed the connection
    Closed,
    Error(SessionError),
    /// Assistant text increment
    AssistantText(String),
    /// Transcribed user speech increment
    UserText(String),
    /// Replaces the displayed product set
    Products(Vec<Product>),
    /// Diagnostic line from the server
    Log(String),
    TurnComplete,
    BotSpeechStart,
    BotSpeechEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = SessionError::Device(AudioError::NoInputDevice);
        assert!(err.to_string().contains("No audio input device"));

        assert!(SessionError::SendWhileDisconnected
            .to_string()
            .contains("not connected"));
    }

    #[test]
    fn test_session_error_category() {
        assert_eq!(
            SessionError::Protocol("x".to_string()).category(),
            "protocol"
        );
        assert_eq!(
            SessionError::from(AudioError::NoOutputDevice).category(),
            "device"
        );
        assert_eq!(SessionError::SendWhileDisconnected.category(), "send");
    }
}
