use std::sync::Arc;

use anyhow::{bail, Result};
use log::{info, warn};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{Database, StoredTag, TagReading},
    lookup::TagLookup,
    reader::{ConnectionConfig, SessionError, SessionState, TagSource},
};

use super::{
    loop_worker::{lookup_worker, poll_loop, CycleContext, ScanOptions},
    ScanEvent, ScannerSnapshot, ScannerState, ScannerStatus,
};

const EVENT_BUFFER: usize = 64;
const LOOKUP_QUEUE: usize = 256;

/// Lookups run beside the poll loop and outlive `stop`, so queued tags still
/// resolve while the scanner is idle.
struct LookupWorker {
    queue: mpsc::Sender<StoredTag>,
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

#[derive(Default)]
struct Worker {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    lookups: Option<LookupWorker>,
}

/// Drives periodic reader polls and is the entry point for presentation code.
///
/// The source is only touched under its mutex, so a loop restarted right after
/// `stop` waits for the previous loop's in-flight cycle instead of polling
/// alongside it.
pub struct ScanController<S: TagSource> {
    source: Arc<Mutex<S>>,
    db: Database,
    state: Arc<Mutex<ScannerState>>,
    events: broadcast::Sender<ScanEvent>,
    worker: Arc<Mutex<Worker>>,
    lookup: Option<Arc<dyn TagLookup>>,
    options: ScanOptions,
}

impl<S: TagSource> Clone for ScanController<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            db: self.db.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            worker: Arc::clone(&self.worker),
            lookup: self.lookup.clone(),
            options: self.options,
        }
    }
}

impl<S: TagSource> ScanController<S> {
    pub fn new(source: S, db: Database, options: ScanOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            source: Arc::new(Mutex::new(source)),
            db,
            state: Arc::new(Mutex::new(ScannerState::new())),
            events,
            worker: Arc::new(Mutex::new(Worker::default())),
            lookup: None,
            options,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn TagLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn status(&self) -> ScannerSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Starts polling. Returns `false` if the scanner was already running.
    pub async fn start(&self) -> Result<bool> {
        if self.options.interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }

        let mut worker = self.worker.lock().await;
        let generation = {
            let mut state = self.state.lock().await;
            if state.status == ScannerStatus::Running {
                return Ok(false);
            }
            state.begin_run()
        };

        let cancel_token = CancellationToken::new();
        let ctx = CycleContext {
            source: Arc::clone(&self.source),
            db: self.db.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            lookups: self.lookup_queue(&mut worker),
            options: self.options,
            generation,
        };

        worker.handle = Some(tokio::spawn(poll_loop(ctx, cancel_token.clone())));
        worker.cancel_token = Some(cancel_token);

        info!(
            "scanner started (every {}ms, {:?} sessions)",
            self.options.interval.as_millis(),
            self.options.session_policy
        );
        Ok(true)
    }

    /// Stops scheduling new cycles. Returns immediately; a cycle already in
    /// flight finishes on its own.
    pub async fn stop(&self) -> bool {
        let mut worker = self.worker.lock().await;
        let was_running = {
            let mut state = self.state.lock().await;
            let running = state.status == ScannerStatus::Running;
            state.stop();
            running
        };

        if let Some(token) = worker.cancel_token.take() {
            token.cancel();
        }
        if was_running {
            info!("scanner stopped");
        }
        was_running
    }

    /// Stops, waits for the loop to exit, abandons pending lookups and closes
    /// the reader session.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;

        let (handle, lookups) = {
            let mut worker = self.worker.lock().await;
            (worker.handle.take(), worker.lookups.take())
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("poll loop task failed to join: {err}");
            }
        }
        if let Some(lookups) = lookups {
            lookups.cancel_token.cancel();
            drop(lookups.queue);
            if let Err(err) = lookups.handle.await {
                warn!("lookup task failed to join: {err}");
            }
        }

        self.close_session().await;
        Ok(())
    }

    /// Queue feeding the lookup worker, spawning the worker if it is not
    /// running. `None` without a configured lookup.
    fn lookup_queue(&self, worker: &mut Worker) -> Option<mpsc::Sender<StoredTag>> {
        let lookup = self.lookup.as_ref()?;

        let running = worker
            .lookups
            .as_ref()
            .is_some_and(|lookups| !lookups.handle.is_finished());
        if !running {
            let (queue, receiver) = mpsc::channel(LOOKUP_QUEUE);
            let cancel_token = CancellationToken::new();
            let handle = tokio::spawn(lookup_worker(
                Arc::clone(lookup),
                receiver,
                self.events.clone(),
                self.options.lookup_timeout,
                cancel_token.clone(),
            ));
            worker.lookups = Some(LookupWorker {
                queue,
                handle,
                cancel_token,
            });
        }

        worker.lookups.as_ref().map(|lookups| lookups.queue.clone())
    }

    /// Empties the displayed list. Stored tags are untouched.
    pub async fn clear(&self) {
        self.state.lock().await.clear_displayed();
        let _ = self.events.send(ScanEvent::Cleared);
    }

    pub async fn displayed(&self) -> Vec<TagReading> {
        self.state.lock().await.displayed().to_vec()
    }

    pub async fn list_tags(&self) -> Result<Vec<StoredTag>> {
        self.db.list_tags().await
    }

    pub async fn delete_tag(&self, tag_id: i64) -> Result<bool> {
        let deleted = self.db.delete_tag(tag_id).await?;
        if deleted {
            info!("deleted stored tag {tag_id}");
        }
        Ok(deleted)
    }

    /// Waits for any in-flight cycle.
    pub async fn session_state(&self) -> SessionState {
        self.source.lock().await.state()
    }

    pub async fn open_session(&self) -> Result<(), SessionError> {
        self.source.lock().await.open().await
    }

    pub async fn close_session(&self) {
        self.source.lock().await.close().await;
    }

    /// Swaps reader settings. The scanner must be idle and the session closed.
    pub async fn reconfigure(&self, config: ConnectionConfig) -> Result<()> {
        if self.state.lock().await.status == ScannerStatus::Running {
            bail!("stop the scanner before changing reader settings");
        }
        self.source.lock().await.reconfigure(config)?;
        info!("reader settings updated");
        Ok(())
    }
}
