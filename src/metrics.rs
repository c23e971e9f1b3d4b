//! Metrics collection for a voice session
//!
//! Counts outbound frames, inbound audio, and protocol failures, and keeps a
//! short history of errors for diagnostics. Counters are atomics so the
//! audio callback thread can bump them without taking a lock.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Point-in-time view of the session counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Audio frames successfully written to the socket
    pub frames_sent: u64,
    /// Frames dropped because the outbound channel was full
    pub frames_dropped: u64,
    /// Frames discarded because no connection was open
    pub frames_unsent: u64,
    /// Inbound audio chunks queued for playback
    pub audio_chunks_received: u64,
    /// Inbound messages of any kind that parsed successfully
    pub messages_received: u64,
    /// Inbound messages that failed to parse
    pub protocol_errors: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "connection", "device", "protocol")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
}

/// Shared counters for one session
#[derive(Debug, Default)]
pub struct SessionMetrics {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_unsent: AtomicU64,
    audio_chunks_received: AtomicU64,
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_sent(&self) {
        let sent = self.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
        // Roughly every 5 seconds at 100ms frames
        if sent % 50 == 0 {
            log::debug!("Metrics: {} frames sent", sent);
        }
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_unsent(&self) {
        self.frames_unsent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_chunk(&self) {
        self.audio_chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error in the history, evicting the oldest past the limit
    pub fn record_error(&self, error_type: &str, message: String) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let Ok(mut errors) = self.errors.lock() else {
            return;
        };
        errors.push_back(ErrorRecord {
            timestamp,
            error_type: error_type.to_string(),
            message,
        });
        while errors.len() > MAX_ERROR_HISTORY {
            errors.pop_front();
        }
    }

    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_unsent: self.frames_unsent.load(Ordering::Relaxed),
            audio_chunks_received: self.audio_chunks_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            last_error: self.errors.lock().ok().and_then(|e| e.back().cloned()),
        }
    }
}
