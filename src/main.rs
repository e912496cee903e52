// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! replaycam — RTSP replay buffer with on-demand clip capture.
//!
//! Usage:
//!   replaycam run    [--env-file config.env]
//!   replaycam status [--env-file config.env]
//!
//! Configuration comes from the environment (see config.rs); the optional
//! env file is loaded first. `run` starts capture and blocks until Ctrl+C
//! or a keyboard quit; `status` prints the resolved configuration and an
//! offline scan of whatever segments are on scratch storage.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use replaycam::config::{Config, LogFormat};
use replaycam::manager::Orchestrator;
use replaycam::watcher::list_segment_files;

#[derive(Parser)]
#[command(name = "replaycam", about = "RTSP replay buffer with on-demand clip capture", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start capturing all configured cameras.
    Run {
        /// Env file loaded before resolving configuration.
        #[arg(short, long, default_value = "config.env")]
        env_file: PathBuf,
    },
    /// Print the resolved configuration and scan scratch storage, then exit.
    Status {
        #[arg(short, long, default_value = "config.env")]
        env_file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { env_file } => run(env_file).await,
        Command::Status { env_file } => status(env_file),
    }
}

fn load_config(env_file: &PathBuf) -> Config {
    match try_load_config(env_file) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn try_load_config(env_file: &PathBuf) -> anyhow::Result<Config> {
    // A missing env file is fine — plain environment variables still apply.
    if env_file.exists() {
        dotenvy::from_path(env_file)
            .with_context(|| format!("loading env file {}", env_file.display()))?;
    }
    Config::from_env().context("resolving configuration from environment")
}

/// Console layer per `LOG_FORMAT`, plus a JSON file layer under `./logs/`.
/// The returned guard must stay alive for the file writer to flush.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let guard = match std::fs::create_dir_all("./logs") {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily("./logs", "system.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);

            match config.log_format {
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init(),
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(tracing_subscriber::fmt::layer())
                    .init(),
            }
            Some(guard)
        }
        Err(e) => {
            // No file logging, console only.
            match config.log_format {
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init(),
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init(),
            }
            eprintln!("File logging disabled ({e})");
            None
        }
    };
    guard
}

async fn run(env_file: PathBuf) {
    let config = load_config(&env_file);
    let _log_guard = init_tracing(&config);

    info!(
        cameras = config.cameras.len(),
        chunk_seconds = config.chunk_seconds,
        buffer_seconds = config.buffer_seconds,
        clip_seconds = config.clip_seconds,
        "Starting replay buffer"
    );

    let mut orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "Initialisation failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = orchestrator.run().await {
        error!(error = %e, "Fatal error in main loop");
        std::process::exit(1);
    }
}

fn status(env_file: PathBuf) {
    let config = load_config(&env_file);

    println!("=== replaycam status ===");
    println!("Chunk       : {} s", config.chunk_seconds);
    println!("Window      : {} s ({} chunks)", config.buffer_seconds, config.window_chunks());
    println!("Clip length : {} s", config.clip_seconds);
    println!("Scratch     : {}", config.temp_dir.display());
    println!("Clips       : {}", config.clips_dir.display());
    println!("Trigger     : {:?}", config.trigger_mode);
    println!("Cameras     : {}", config.cameras.len());

    for cam in &config.cameras {
        let prefix = format!("{}_", cam.id);
        let files = list_segment_files(&cam.scratch_dir, &prefix);
        let bytes: u64 = files
            .iter()
            .filter_map(|name| std::fs::metadata(cam.scratch_dir.join(name)).ok())
            .map(|m| m.len())
            .sum();
        println!(
            "  {} — {} — {} segments on scratch ({} KiB)",
            cam.id,
            cam.url,
            files.len(),
            bytes / 1024,
        );
    }
}
