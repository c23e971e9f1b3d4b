//! Text search against the concierge agent
//!
//! The non-voice chat page sends a free-text query and either waits for a
//! single answer (`/chat`) or follows an event stream (`/search`) carrying
//! progress logs, product lists, and the final reply.

mod client;
mod events;

pub use client::{parse_chat_response, SearchClient};
pub use events::EventStreamParser;

use crate::streaming::Product;

/// Errors that can occur during a text search
#[derive(Debug, Clone, PartialEq)]
pub enum SearchError {
    /// Network/HTTP error
    Network(String),
    /// Server returned a non-success status
    Api { status: u16, message: String },
    /// Failed to parse a response or stream event
    Parse(String),
    /// Backend answered with an explicit error
    Backend(String),
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchError::Network(e) => write!(f, "Network error: {}", e),
            SearchError::Api { status, message } => {
                write!(f, "Search API error ({}): {}", status, message)
            }
            SearchError::Parse(e) => write!(f, "Failed to parse search response: {}", e),
            SearchError::Backend(e) => write!(f, "Concierge error: {}", e),
        }
    }
}

impl std::error::Error for SearchError {}

/// One event from the search stream
///
/// Both the combined `result` event and the split `final_text` + `products`
/// pair are recognized; the caller decides which to render.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    Log(String),
    Products(Vec<Product>),
    FinalText(String),
    Result {
        intro_text: String,
        products: Vec<Product>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = SearchError::Api {
            status: 502,
            message: "Bad gateway".to_string(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("Bad gateway"));
    }

    #[test]
    fn test_backend_error_display() {
        let err = SearchError::Backend("GOOGLE_API_KEY environment variable not set.".to_string());
        assert!(err.to_string().contains("GOOGLE_API_KEY"));
    }
}
