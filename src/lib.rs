pub mod db;
pub mod lookup;
pub mod reader;
pub mod scanner;
pub mod settings;
mod utils;

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use db::Database;
use lookup::PermitLookup;
use reader::{AlienSession, SimulatedReader, TagSource};
use scanner::{ScanController, ScanEvent};
use settings::SettingsStore;

const DEFAULT_SETTINGS_FILE: &str = "alienprobe-settings.json";

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Runs the scanner with a console presentation until Ctrl-C.
pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("AlienProbe starting up...");

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run_probe())
}

async fn run_probe() -> Result<()> {
    let settings_path = std::env::var("ALIENPROBE_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_FILE));
    let settings_store = SettingsStore::new(settings_path)?;
    let settings = settings_store.current();

    let database = Database::new(settings.database_path.clone())?;
    info!("{} tag(s) already stored", database.count_tags().await?);

    let options = settings.poll.scan_options();
    let lookup = Arc::new(PermitLookup);

    if env_flag("ALIENPROBE_SIMULATE") {
        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        info!("using simulated reader (seed {seed})");
        let controller = ScanController::new(SimulatedReader::new(seed), database, options)
            .with_lookup(lookup);
        run_console(controller).await
    } else {
        info!("using reader at {}", settings.reader.address());
        let session = AlienSession::new(settings.reader, settings.poll.session_timeouts());
        let controller = ScanController::new(session, database, options).with_lookup(lookup);
        run_console(controller).await
    }
}

async fn run_console<S: TagSource>(controller: ScanController<S>) -> Result<()> {
    let mut events = controller.subscribe();
    controller.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = events.recv() => match event {
                Ok(ScanEvent::StoreUnavailable { message }) => {
                    error!("tag store unavailable, stopping: {message}");
                    break;
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("console fell behind, skipped {skipped} event(s)"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    controller.shutdown().await?;
    let stored = controller.list_tags().await?;
    controller.database().close();
    info!("AlienProbe stopped with {} stored tag(s)", stored.len());
    Ok(())
}

fn log_event(event: &ScanEvent) {
    match event {
        ScanEvent::Cycle(report) => {
            if report.readings.is_empty() {
                info!("cycle {}: no tags in range", report.cycle);
            }
            for tag in &report.inserted {
                info!(
                    "new tag #{} {} at ({}, {})",
                    tag.id, tag.epc, tag.latitude, tag.longitude
                );
            }
        }
        ScanEvent::CycleFailed { kind, message } => {
            warn!("reader unavailable ({kind:?}): {message}")
        }
        ScanEvent::LookupResolved { epc, summary, .. } => match summary {
            Some(summary) => info!("{epc}: {summary}"),
            None => info!("{epc}: no lookup match"),
        },
        ScanEvent::StoreUnavailable { message } => error!("{message}"),
        ScanEvent::Cleared => info!("display cleared"),
    }
}
