pub mod audio;
mod console;
pub mod conversation;
pub mod metrics;
pub mod search;
pub mod settings;
pub mod streaming;

use clap::{Parser, Subcommand};

use settings::AppSettings;

#[derive(Parser)]
#[command(
    name = "shop-concierge",
    version,
    about = "Talk to the shopping concierge by voice or text"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Live voice conversation through the default microphone and speaker
    Voice {
        /// Audio server WebSocket URL
        #[arg(long)]
        url: Option<String>,
        /// Start with the microphone muted (press Enter to toggle)
        #[arg(long)]
        muted: bool,
    },
    /// Ask a text question
    Search {
        query: String,
        /// Search backend base URL
        #[arg(long)]
        url: Option<String>,
        /// Follow the event stream instead of waiting for one answer
        #[arg(long)]
        stream: bool,
    },
    /// Show the effective settings
    Config {
        /// Write the effective settings to the settings file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();
}

pub fn run() {
    let cli = Cli::parse();
    init_logging();

    // tokio-tungstenite and reqwest both pull in rustls; pick one provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings = settings::load_settings();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Command::Voice { url, muted } => {
                let settings = AppSettings {
                    audio_url: url.unwrap_or(settings.audio_url),
                    ..settings
                };
                console::run_voice(settings, muted).await
            }
            Command::Search { query, url, stream } => {
                let settings = AppSettings {
                    search_url: url.unwrap_or(settings.search_url),
                    ..settings
                };
                console::run_search(settings, &query, stream).await
            }
            Command::Config { save } => console::show_config(&settings, save),
        }
    });

    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
