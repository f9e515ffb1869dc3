//! # delio
//!
//! Operator console for the delio control kernel. Each stdin line is one
//! message event; `/remind <text>` dispatches a reminder and `/health`
//! prints the kernel status.

#![deny(unsafe_code)]

mod console;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use delio_core::{KernelEvent, UserId};
use delio_kernel::Kernel;
use delio_settings::{load_settings, load_settings_from_path, LoggingSettings};
use delio_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// delio kernel console.
#[derive(Parser, Debug)]
#[command(name = "delio", about = "delio cognitive control kernel")]
struct Cli {
    /// Settings file (defaults to `~/.delio/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// User id the console speaks as.
    #[arg(long, default_value_t = 1)]
    user: i64,

    /// Run the periodic heartbeat for the console user.
    #[arg(long)]
    heartbeat: bool,
}

fn telemetry_config(logging: &LoggingSettings) -> TelemetryConfig {
    let mut config = TelemetryConfig {
        log_level: parse_level(&logging.level),
        module_levels: logging
            .modules
            .iter()
            .map(|(module, level)| (module.clone(), parse_level(level)))
            .collect(),
        log_to_sqlite: logging.persist_warnings,
        ..TelemetryConfig::default()
    };
    if let Some(path) = &logging.db_path {
        config.log_db_path = PathBuf::from(path);
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let mut settings = match &args.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("Failed to load settings")?;

    let user = UserId::new(args.user);
    if args.heartbeat {
        settings.heartbeat.enabled = true;
        if !settings.heartbeat.users.contains(&args.user) {
            settings.heartbeat.users.push(args.user);
        }
    }

    let telemetry = init_telemetry(telemetry_config(&settings.logging));
    let kernel = Kernel::boot(settings, console::collaborators(), Some(telemetry.metrics()));
    let cancel = CancellationToken::new();
    let tasks = kernel.start_background(&cancel);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/health" {
            println!("{}", serde_json::to_string_pretty(&kernel.health())?);
        } else if let Some(text) = line.strip_prefix("/remind ") {
            let outcome = kernel.dispatch_notification(user, text).await;
            tracing::info!(outcome = ?outcome, "reminder dispatched");
        } else {
            let ctx = kernel.process_event(KernelEvent::message(user, line)).await;
            for err in ctx.errors() {
                eprintln!("error: {err}");
            }
        }
    }

    tracing::info!("Shutting down...");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
