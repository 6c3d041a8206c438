use clap::{Parser, Subcommand};
use llm_relay::cli::AppConfig;
use llm_relay::models::{ChatMessage, ChatRequest, ResponseFragment};
use llm_relay::server::{self, AppState};
use llm_relay::usage::{Channel, UsageContext};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llm-relay")]
#[command(about = "LLM Relay - one streaming chat interface over many model backends", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.llm-relay/config.toml)
    #[arg(short, long, env = "LLM_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send one prompt and print the answer
    Chat {
        /// Model id from the [[models]] section
        #[arg(short, long)]
        model: String,
        /// Wait for the whole answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
        /// Optional system prompt
        #[arg(short, long)]
        system: Option<String>,
        prompt: String,
    },
    /// List configured models and providers
    Models,
    /// Write a starter configuration file
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llm_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Get config path (use default if not specified)
    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };

    match cli.command {
        Commands::Init => {
            AppConfig::write_starter(&config_path)?;
            println!("✅ Starter configuration written to {}", config_path.display());
            println!("   Set OPENAI_API_KEY / ANTHROPIC_API_KEY or edit the file to add keys.");
        }
        Commands::Start { port } => {
            let mut config = AppConfig::from_file(&config_path)?;

            // Override port if specified
            if let Some(port) = port {
                config.server.port = port;
            }

            println!("🚀 LLM Relay v{}", env!("CARGO_PKG_VERSION"));
            println!("📡 Starting server on {}:{}", config.server.host, config.server.port);
            println!("Press Ctrl+C to stop");

            server::start_server(config).await?;
        }
        Commands::Models => {
            let config = AppConfig::from_file(&config_path)?;
            let state = AppState::from_config(&config)?;
            let registry = state.service.registry();

            println!("Providers:");
            for provider in &config.providers {
                let status = if provider.is_enabled() { "" } else { " (disabled)" };
                println!("  • {} ({}){}", provider.name, provider.provider_type, status);
            }
            println!();
            println!("Models:");
            for model in registry.list_models() {
                let caps = model.capabilities;
                println!(
                    "  • {} → {}/{} [stream={} web_search={} reasoning={} tools={}]",
                    model.name,
                    model.provider,
                    model.upstream_model,
                    caps.streaming,
                    caps.web_search,
                    caps.reasoning,
                    caps.tools
                );
            }
        }
        Commands::Chat {
            model,
            no_stream,
            system,
            prompt,
        } => {
            let config = AppConfig::from_file(&config_path)?;
            let state = AppState::from_config(&config)?;

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let request = ChatRequest::new(model.clone(), messages).streaming(!no_stream);
            let context = UsageContext::new(Channel::Api, model);

            let (tx, mut rx) = mpsc::channel::<ResponseFragment>(32);
            let print = async move {
                let mut stdout = std::io::stdout();
                let mut failure = None;
                while let Some(fragment) = rx.recv().await {
                    let _ = write!(stdout, "{}", fragment.text);
                    let _ = stdout.flush();
                    if let Some(error) = fragment.error {
                        failure = Some(error);
                    }
                }
                println!();
                failure
            };

            let (report, failure) =
                tokio::join!(state.service.stream(&request, &context, tx), print);
            if let Some(error) = failure {
                anyhow::bail!(error);
            }
            tracing::debug!("Chat finished: {:?}", report);
        }
    }

    Ok(())
}
