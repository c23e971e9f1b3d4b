//! Conversation state for display
//!
//! Folds session (and search) events into chat bubbles and the current
//! product set, the way the chat page renders them.
//!
//! # Aggregation Strategy
//!
//! - **Bot text**: increments append to the open bot bubble; `bot_speech_start`,
//!   `bot_speech_end`, `turn_complete`, and user speech close it so the next
//!   increment starts a new bubble
//! - **User text**: increments append to the open user bubble until the bot
//!   speaks or the turn completes
//! - **Products**: each update replaces the whole set

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::search::SearchEvent;
use crate::streaming::{Product, SessionEvent};

/// Maximum number of operator log lines to retain
const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

/// One chat bubble
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    /// When the first increment of this bubble arrived
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    products: Vec<Product>,
    logs: VecDeque<String>,
    last_error: Option<String>,
    bot_open: bool,
    user_open: bool,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one session event into the conversation
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::AssistantText(text) => self.push_bot_text(text),
            SessionEvent::UserText(text) => self.push_user_text(text),
            SessionEvent::Products(products) => self.replace_products(products.clone()),
            SessionEvent::Log(line) => self.push_log(line.clone()),
            SessionEvent::BotSpeechStart | SessionEvent::BotSpeechEnd => {
                self.bot_open = false;
            }
            SessionEvent::TurnComplete => {
                self.bot_open = false;
                self.user_open = false;
            }
            SessionEvent::Error(e) => self.last_error = Some(e.to_string()),
            SessionEvent::Ready | SessionEvent::ServerReady | SessionEvent::Closed => {}
        }
    }

    /// Fold one text-search event into the conversation
    pub fn apply_search(&mut self, event: &SearchEvent) {
        match event {
            SearchEvent::Log(line) => self.push_log(line.clone()),
            SearchEvent::Products(products) => self.replace_products(products.clone()),
            SearchEvent::FinalText(text) => {
                self.bot_open = false;
                self.push_bot_text(text);
                self.bot_open = false;
            }
            SearchEvent::Result {
                intro_text,
                products,
            } => {
                self.bot_open = false;
                self.push_bot_text(intro_text);
                self.bot_open = false;
                self.replace_products(products.clone());
            }
        }
    }

    /// Record a query typed by the user as its own bubble
    pub fn push_user_query(&mut self, query: &str) {
        self.user_open = false;
        self.push_user_text(query);
        self.user_open = false;
    }

    fn push_bot_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.user_open = false;
        match self.messages.last_mut() {
            Some(last) if self.bot_open && last.role == Role::Bot => last.text.push_str(text),
            _ => self.messages.push(ChatMessage {
                role: Role::Bot,
                text: text.to_string(),
                at: Utc::now(),
            }),
        }
        self.bot_open = true;
    }

    fn push_user_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.bot_open = false;
        match self.messages.last_mut() {
            Some(last) if self.user_open && last.role == Role::User => last.text.push_str(text),
            _ => self.messages.push(ChatMessage {
                role: Role::User,
                text: text.to_string(),
                at: Utc::now(),
            }),
        }
        self.user_open = true;
    }

    fn replace_products(&mut self, products: Vec<Product>) {
        log::debug!(
            "Conversation: replacing {} products with {}",
            self.products.len(),
            products.len()
        );
        self.products = products;
    }

    fn push_log(&mut self, line: String) {
        self.logs.push_back(line);
        while self.logs.len() > MAX_LOG_LINES {
            self.logs.pop_front();
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Currently displayed product set
    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn logs(&self) -> impl Iterator<Item = &str> {
        self.logs.iter().map(String::as_str)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
