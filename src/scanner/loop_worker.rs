use std::sync::Arc;

use chrono::Utc;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{is_fatal_store_error, Database, StoredTag},
    lookup::TagLookup,
    reader::{parse_tag_list_at, SessionError, SessionState, TagSource},
};

use super::{CycleReport, ScanEvent, ScannerState, SessionPolicy};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub interval: Duration,
    pub session_policy: SessionPolicy,
    pub lookup_timeout: Duration,
    pub log_raw_replies: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            session_policy: SessionPolicy::Persistent,
            lookup_timeout: Duration::from_secs(5),
            log_raw_replies: false,
        }
    }
}

pub(crate) struct CycleContext<S: TagSource> {
    pub source: Arc<Mutex<S>>,
    pub db: Database,
    pub state: Arc<Mutex<ScannerState>>,
    pub events: broadcast::Sender<ScanEvent>,
    pub lookups: Option<mpsc::Sender<StoredTag>>,
    pub options: ScanOptions,
    pub generation: u64,
}

impl<S: TagSource> CycleContext<S> {
    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine; the cycle still counts.
        let _ = self.events.send(event);
    }
}

enum CycleOutcome {
    Continue,
    Halt,
}

pub(crate) async fn poll_loop<S: TagSource>(ctx: CycleContext<S>, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("poll loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let CycleOutcome::Halt = run_cycle(&ctx).await {
                    log_error!("poll loop halted after store failure");
                    break;
                }
            }
        }
    }
}

async fn run_cycle<S: TagSource>(ctx: &CycleContext<S>) -> CycleOutcome {
    let raw = match poll_source(ctx).await {
        Ok(raw) => raw,
        Err(err) => {
            log_warn!("poll cycle failed: {err}");
            ctx.state.lock().await.record_failure(Utc::now());
            ctx.emit(ScanEvent::CycleFailed {
                kind: err.kind(),
                message: err.to_string(),
            });
            return CycleOutcome::Continue;
        }
    };

    if ctx.options.log_raw_replies {
        log_info!("reader reply: {raw:?}");
    }

    let now = Utc::now();
    let parsed = parse_tag_list_at(&raw, now);
    for warning in &parsed.warnings {
        log_warn!("tag list parse warning: {warning}");
    }

    let mut inserted = Vec::new();
    for reading in &parsed.readings {
        match ctx.db.insert_tag(reading).await {
            Ok(Some(tag)) => inserted.push(tag),
            Ok(None) => {}
            Err(err) if is_fatal_store_error(&err) => {
                log_error!("tag store unavailable: {err:#}");
                ctx.state.lock().await.halt(ctx.generation);
                ctx.emit(ScanEvent::StoreUnavailable {
                    message: format!("{err:#}"),
                });
                return CycleOutcome::Halt;
            }
            Err(err) => log_warn!("tag {} not stored: {err:#}", reading.epc),
        }
    }

    if !inserted.is_empty() {
        log_info!(
            "cycle stored {} new tag(s) out of {} reading(s)",
            inserted.len(),
            parsed.readings.len()
        );
    }

    let report = {
        let mut state = ctx.state.lock().await;
        let cycle = state.record_success(now);
        CycleReport {
            cycle,
            completed_at: now,
            newly_displayed: state.remember(&parsed.readings),
            displayed_total: state.displayed().len(),
            readings: parsed.readings,
            inserted: inserted.clone(),
            warnings: parsed.warnings,
        }
    };
    log_debug!(
        "cycle {}: {} reading(s), {} new, {} on display",
        report.cycle,
        report.readings.len(),
        report.inserted.len(),
        report.displayed_total
    );
    ctx.emit(ScanEvent::Cycle(report));

    queue_lookups(ctx, inserted);
    CycleOutcome::Continue
}

async fn poll_source<S: TagSource>(ctx: &CycleContext<S>) -> Result<String, SessionError> {
    let mut source = ctx.source.lock().await;

    if source.state() != SessionState::Open {
        source.open().await?;
    }

    let result = source.poll().await;
    if result.is_err() || ctx.options.session_policy == SessionPolicy::PerCycle {
        source.close().await;
    }
    result
}

/// Hands new tags to the lookup worker without waiting on it. A full queue
/// drops the lookup, never the cycle.
fn queue_lookups<S: TagSource>(ctx: &CycleContext<S>, inserted: Vec<StoredTag>) {
    let Some(queue) = ctx.lookups.as_ref() else {
        return;
    };

    for tag in inserted {
        match queue.try_send(tag) {
            Ok(()) => {}
            Err(TrySendError::Full(tag)) => {
                log_warn!("lookup queue full, skipping tag {}", tag.epc)
            }
            Err(TrySendError::Closed(tag)) => {
                log_warn!("lookup worker gone, skipping tag {}", tag.epc)
            }
        }
    }
}

/// Resolves queued tags one at a time until the queue closes or
/// `cancel_token` fires. Each lookup is bounded by `wait`.
pub(crate) async fn lookup_worker(
    lookup: Arc<dyn TagLookup>,
    mut queue: mpsc::Receiver<StoredTag>,
    events: broadcast::Sender<ScanEvent>,
    wait: Duration,
    cancel_token: CancellationToken,
) {
    loop {
        let tag = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            tag = queue.recv() => match tag {
                Some(tag) => tag,
                None => break,
            },
        };

        let resolved = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            resolved = tokio::time::timeout(wait, lookup.lookup(&tag)) => resolved,
        };

        match resolved {
            Ok(Ok(summary)) => {
                let _ = events.send(ScanEvent::LookupResolved {
                    tag_id: tag.id,
                    epc: tag.epc,
                    summary,
                });
            }
            Ok(Err(err)) => log_warn!("lookup failed for tag {}: {err:#}", tag.epc),
            Err(_) => log_warn!(
                "lookup for tag {} timed out (> {}ms)",
                tag.epc,
                wait.as_millis()
            ),
        }
    }
    log_info!("lookup worker stopped");
}
