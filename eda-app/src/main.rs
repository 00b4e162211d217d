//! `eda-whatsapp`: WhatsApp intake bot for the Eda AI API, with an optional
//! HTTP messaging gateway.

mod admission;
mod commands;
mod config;
mod dispatcher;
mod gateway;
mod init;
mod message_handler;
mod queue;
mod reactions;
mod routes;
mod server;
mod store;
mod supervisor;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "eda-whatsapp", version, about = "Eda WhatsApp assistant")]
struct Cli {
    /// Config file (defaults to ~/.eda/whatsapp.toml).
    #[arg(long, global = true, env = "EDA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bot, plus the messaging API when enabled (default).
    Serve,
    /// Initialize ~/.eda with the config template (idempotent).
    Init,
    /// Validate config and probe the AI API and the WhatsApp bridge.
    Doctor,
    /// One-shot text message to a chat jid or phone number.
    Send { chat: String, message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to load .env: {e}");
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(cli.config).await,
        Command::Init => {
            match init::init_config(cli.config).await? {
                init::InitOutcome::Created { path, seeded } => {
                    println!("eda-whatsapp init: created {}", path.display());
                    if !seeded.is_empty() {
                        println!("seeded from environment: {}", seeded.join(", "));
                    }
                    println!("next: edit {}", path.display());
                }
                init::InitOutcome::Existing(path) => {
                    println!(
                        "eda-whatsapp init: {} already exists; left unchanged",
                        path.display()
                    );
                }
            }
            Ok(())
        }
        Command::Doctor => server::doctor(cli.config).await,
        Command::Send { chat, message } => {
            server::send_one_shot(cli.config, &chat, &message).await
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,eda_whatsapp=debug,eda_channels=debug,eda_ai=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("EDA_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported EDA_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
