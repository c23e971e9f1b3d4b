//! Terminal front end for the voice and text modes

use std::error::Error;
use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::conversation::{Conversation, Role};
use crate::search::{SearchClient, SearchEvent};
use crate::settings::{self, AppSettings};
use crate::streaming::{Product, SessionConfig, SessionEvent, VoiceSession};

type CliResult = Result<(), Box<dyn Error>>;

/// Prints conversation bubbles incrementally as they grow
#[derive(Default)]
struct TranscriptPrinter {
    shown_messages: usize,
    shown_chars: usize,
}

impl TranscriptPrinter {
    fn print_new(&mut self, conversation: &Conversation) {
        let messages = conversation.messages();
        let mut out = std::io::stdout().lock();

        if let Some(last) = self.shown_messages.checked_sub(1).and_then(|i| messages.get(i)) {
            if let Some(rest) = last.text.get(self.shown_chars..) {
                let _ = write!(out, "{}", rest);
            }
        }
        for message in messages.iter().skip(self.shown_messages) {
            let label = match message.role {
                Role::User => "you",
                Role::Bot => "concierge",
            };
            let _ = write!(out, "\n{}> {}", label, message.text);
        }

        self.shown_messages = messages.len();
        self.shown_chars = messages.last().map(|m| m.text.len()).unwrap_or(0);
        let _ = out.flush();
    }

    /// Next output starts on a fresh line
    fn break_line(&mut self) {
        if self.shown_messages > 0 {
            println!();
        }
    }
}

fn print_products(products: &[Product]) {
    if products.is_empty() {
        return;
    }
    println!("\n--- {} product(s) ---", products.len());
    for (i, product) in products.iter().enumerate() {
        println!("{:>2}. {}", i + 1, product.name);
        if let Some(description) = &product.description {
            println!("    {}", description);
        }
        if let Some(url) = &product.url {
            println!("    {}", url);
        }
    }
}

pub async fn run_voice(settings: AppSettings, muted: bool) -> CliResult {
    let config = SessionConfig::from_settings(&settings);
    println!("Connecting to {} ...", config.url);

    let (session, mut events) = VoiceSession::with_default_devices(config);
    session.connect().await?;
    if !muted {
        session.start_recording()?;
    }

    let mut conversation = Conversation::new();
    let mut printer = TranscriptPrinter::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, closing session");
                break;
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(_)) => {
                        printer.break_line();
                        if session.is_recording() {
                            session.stop_recording();
                            println!("[mic muted]");
                        } else {
                            match session.start_recording() {
                                Ok(()) => println!("[mic live]"),
                                Err(e) => eprintln!("[mic error] {}", e),
                            }
                        }
                    }
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                conversation.apply(&event);
                match &event {
                    SessionEvent::Ready => {
                        println!("Connected. Press Enter to toggle the mic, Ctrl+C to quit.");
                        if muted {
                            println!("[mic muted]");
                        }
                    }
                    SessionEvent::ServerReady => log::debug!("Server ready"),
                    SessionEvent::Closed => {
                        printer.break_line();
                        println!("Server closed the connection.");
                        break;
                    }
                    SessionEvent::Error(e) => {
                        printer.break_line();
                        eprintln!("[error] {}", e);
                    }
                    SessionEvent::Products(products) => print_products(products),
                    SessionEvent::Log(line) => log::debug!("server: {}", line),
                    _ => printer.print_new(&conversation),
                }
            }
        }
    }

    session.close().await;
    let summary = session.metrics();
    log::info!(
        "Session {} ended: {} frames sent, {} dropped, {} audio chunks, {} protocol errors",
        session.id(),
        summary.frames_sent,
        summary.frames_dropped + summary.frames_unsent,
        summary.audio_chunks_received,
        summary.protocol_errors
    );
    for error in session.recent_errors() {
        log::debug!("  [{}] {}: {}", error.timestamp, error.error_type, error.message);
    }
    Ok(())
}

pub async fn run_search(settings: AppSettings, query: &str, stream: bool) -> CliResult {
    let client = SearchClient::new(&settings.search_url)?;
    let mut conversation = Conversation::new();
    let mut printer = TranscriptPrinter::default();

    conversation.push_user_query(query);
    printer.print_new(&conversation);

    if stream {
        client
            .search(query, |event| {
                conversation.apply_search(&event);
                match &event {
                    SearchEvent::Log(line) => {
                        printer.break_line();
                        print!("  ... {}", line);
                    }
                    SearchEvent::Products(products) => print_products(products),
                    SearchEvent::FinalText(_) => printer.print_new(&conversation),
                    SearchEvent::Result { products, .. } => {
                        printer.print_new(&conversation);
                        print_products(products);
                    }
                }
            })
            .await?;
    } else {
        let answer = client.chat(query).await?;
        conversation.apply_search(&SearchEvent::FinalText(answer));
        printer.print_new(&conversation);
    }

    println!();
    Ok(())
}

pub fn show_config(settings: &AppSettings, save: bool) -> CliResult {
    match settings::settings_path() {
        Ok(path) => println!("# {}", path.display()),
        Err(e) => println!("# {}", e),
    }
    println!("{}", serde_json::to_string_pretty(settings)?);

    if save {
        let path = settings::save_settings(settings)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
