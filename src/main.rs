mod app;
mod beat_oracle;
mod config;
mod error;
mod input_source;
mod loop_source;
mod monitoring;
mod realtime;
mod ring_buffer;
mod stretcher;
mod sync_engine;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use app::{LoopSyncApp, SessionConfig};
use config::ConfigManager;

/// Real-time beat-synchronized loop player.
#[derive(Parser, Debug)]
#[command(name = "loopsync", version, about)]
struct Cli {
    /// Path to a loop blob produced by `analyze_loop`.
    #[arg(short = 'l', long = "loop")]
    loop_path: PathBuf,

    /// Play back a WAV file at real time instead of reading the microphone.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Disable looping the input file once it's been fully played (ignored
    /// for microphone input).
    #[arg(long = "no-loop-input")]
    no_loop_input: bool,

    /// Reserved for a future offline-rendering mode; live sessions ignore it.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Frames per processing block.
    #[arg(short = 'b', long = "block-size")]
    block_size: Option<usize>,

    /// Load settings from a specific config file instead of the platform
    /// default location.
    #[arg(long = "config")]
    config_path: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8, configured_level: &str) {
    let level = match verbose {
        0 => configured_level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config_path {
        Some(path) => config::ConfigManager::at_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let app_config = config_manager.get_config().clone();

    init_logging(cli.verbose, &app_config.logging.level);

    app::validate_loop_path(&cli.loop_path)?;
    if let Some(output) = &cli.output {
        log::warn!(
            "--output {} ignored: offline rendering is not implemented yet",
            output.display()
        );
    }

    let block_size = cli.block_size.unwrap_or(app_config.audio.block_size);
    let session_config = SessionConfig {
        loop_path: cli.loop_path,
        input_path: cli.input,
        block_size,
        loop_on_eof: !cli.no_loop_input,
    };

    info!("starting loopsync, block_size={block_size}");
    let mut session = LoopSyncApp::start(session_config).context("starting session")?;

    println!("loopsync running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let report = session.report();
    info!(
        "shutting down: {} iterations, synced={}, status={:?}",
        report.sync_iterations, report.synced, report.overall_status
    );
    session.stop();

    Ok(())
}
