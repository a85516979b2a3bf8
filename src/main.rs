//! Stowage - content-addressed bundle unpack cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use stowage::cli::{Cli, Commands};
use stowage::config::ConfigManager;
use stowage::error::StowageResult;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StowageResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    if let Some(root) = cli.cache_root.clone() {
        config.cache.root = root;
    }

    init_logging(cli.verbose, &config.general.log_format);

    // Ctrl-C cancels in-flight unpacks; they roll back before returning
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Config(args) => {
            stowage::cli::commands::config(args, &config, &config_manager).await
        }
        Commands::Unpack(args) => {
            ConfigManager::ensure_state_dirs(&config).await?;
            stowage::cli::commands::unpack(args, &config, cancel).await
        }
        Commands::Gc(args) => stowage::cli::commands::gc(args, &config).await,
        Commands::Cleanup(args) => stowage::cli::commands::cleanup(args, &config).await,
        Commands::List(args) => stowage::cli::commands::list(args, &config).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug
fn init_logging(verbose: u8, format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("stowage=warn"),
        1 => EnvFilter::new("stowage=info"),
        _ => EnvFilter::new("stowage=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
