//! CLI binary for voxcoach.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voxcoach::audio::capture::AudioCaptureEngine;
use voxcoach::audio::playback::CpalSink;
use voxcoach::call::run_call;
use voxcoach::CallConfig;

/// Voxcoach: real-time voice calls with an AI coach.
#[derive(Parser)]
#[command(name = "voxcoach", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a voice call with the coach.
    Call,

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Suppress noisy dependency logs by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voxcoach=info,tungstenite=warn,reqwest=warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.config {
        CallConfig::from_file(path)?
    } else {
        CallConfig::default()
    };

    match cli.command.unwrap_or(Command::Call) {
        Command::Call => start_call(config).await,
        Command::Devices => list_devices(),
    }
}

async fn start_call(config: CallConfig) -> anyhow::Result<()> {
    println!("Voxcoach v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, ending call...");
            shutdown_clone.cancel();
        }
    });

    println!("\nCall connected. Speak into your microphone. Press Ctrl+C to hang up.\n");

    let record = run_call(&config, shutdown).await?;

    println!("\nCall summary ({} coach replies):", record.ai_responses.len());
    if !record.transcript.is_empty() {
        println!("\nYou said:\n{}", record.transcript);
    }
    for reply in &record.ai_responses {
        println!("\nCoach: {reply}");
    }

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in AudioCaptureEngine::list_input_devices()? {
        println!("  {name}");
    }
    println!("\nOutput devices:");
    for name in CpalSink::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
