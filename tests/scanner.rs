use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use alienprobe_lib::{
    db::{Database, StoredTag},
    lookup::TagLookup,
    reader::{ConnectionConfig, SessionError, SessionErrorKind, SessionState, TagSource},
    scanner::{ScanController, ScanEvent, ScanOptions, ScannerStatus, SessionPolicy},
};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

const INTERVAL: Duration = Duration::from_millis(50);
const EVENT_WAIT: Duration = Duration::from_secs(2);

const TWO_TAGS: &str = "E1,2024-01-01T00:00:00,12.5,45.2\r\nE2,2024-01-01T00:00:01,12.6,45.3";
const THIRD_TAG: &str = "E3,2024-01-01T00:00:02,12.7,45.4";

enum Step {
    Reply(&'static str),
    Timeout,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    polls: AtomicUsize,
    closes: AtomicUsize,
}

impl Counters {
    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Replays `script`, then answers every later poll with `fallback`.
struct ScriptedSource {
    script: VecDeque<Step>,
    fallback: &'static str,
    state: SessionState,
    counters: Arc<Counters>,
}

impl ScriptedSource {
    fn new(script: Vec<Step>, fallback: &'static str) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let source = Self {
            script: script.into(),
            fallback,
            state: SessionState::Closed,
            counters: Arc::clone(&counters),
        };
        (source, counters)
    }
}

#[async_trait]
impl TagSource for ScriptedSource {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.state = SessionState::Open;
        Ok(())
    }

    async fn poll(&mut self) -> Result<String, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::NotOpen(self.state));
        }
        self.counters.polls.fetch_add(1, Ordering::SeqCst);

        match self.script.pop_front().unwrap_or(Step::Reply(self.fallback)) {
            Step::Reply(raw) => Ok(raw.to_string()),
            Step::Timeout => {
                self.state = SessionState::Failed;
                Err(SessionError::Timeout {
                    operation: "tag list",
                    after: INTERVAL,
                })
            }
        }
    }

    async fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.state = SessionState::Closed;
    }

    fn reconfigure(&mut self, _config: ConnectionConfig) -> Result<()> {
        if self.state != SessionState::Closed {
            anyhow::bail!("session is {:?}", self.state);
        }
        Ok(())
    }
}

struct EchoLookup;

/// Never answers within any sensible lookup timeout.
struct StalledLookup;

#[async_trait]
impl TagLookup for StalledLookup {
    async fn lookup(&self, _tag: &StoredTag) -> Result<Option<String>> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(None)
    }
}

#[async_trait]
impl TagLookup for EchoLookup {
    async fn lookup(&self, tag: &StoredTag) -> Result<Option<String>> {
        Ok(Some(format!("seen {}", tag.epc)))
    }
}

fn options(session_policy: SessionPolicy) -> ScanOptions {
    ScanOptions {
        interval: INTERVAL,
        session_policy,
        lookup_timeout: Duration::from_secs(1),
        log_raw_replies: false,
    }
}

fn controller(
    script: Vec<Step>,
    fallback: &'static str,
    policy: SessionPolicy,
) -> (ScanController<ScriptedSource>, Arc<Counters>) {
    let (source, counters) = ScriptedSource::new(script, fallback);
    let db = Database::in_memory().unwrap();
    (ScanController::new(source, db, options(policy)), counters)
}

async fn next_event(events: &mut broadcast::Receiver<ScanEvent>) -> ScanEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("no scanner event in time")
        .expect("event channel closed")
}

/// Next `Cycle` or `CycleFailed` event.
async fn next_cycle(events: &mut broadcast::Receiver<ScanEvent>) -> ScanEvent {
    loop {
        match next_event(events).await {
            event @ (ScanEvent::Cycle(_) | ScanEvent::CycleFailed { .. }) => return event,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_timeout_cycle_leaves_store_unchanged_and_next_cycle_runs() {
    let (scanner, _) = controller(
        vec![Step::Reply(TWO_TAGS), Step::Timeout, Step::Reply(THIRD_TAG)],
        "(No Tags)",
        SessionPolicy::Persistent,
    );
    let mut events = scanner.subscribe();
    assert!(scanner.start().await.unwrap());

    match next_cycle(&mut events).await {
        ScanEvent::Cycle(report) => {
            assert_eq!(report.readings.len(), 2);
            assert_eq!(report.inserted.len(), 2);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    match next_cycle(&mut events).await {
        ScanEvent::CycleFailed { kind, .. } => assert_eq!(kind, SessionErrorKind::Timeout),
        other => panic!("expected a failed cycle, got {other:?}"),
    }
    let failed_at = Instant::now();
    assert_eq!(scanner.database().count_tags().await.unwrap(), 2);

    match next_cycle(&mut events).await {
        ScanEvent::Cycle(report) => {
            assert_eq!(report.inserted.len(), 1);
            assert_eq!(report.inserted[0].epc, "E3");
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(failed_at.elapsed() < INTERVAL * 6);

    scanner.shutdown().await.unwrap();
    let status = scanner.status().await;
    assert_eq!(status.status, ScannerStatus::Idle);
    assert_eq!(status.failed_cycles, 1);
    assert_eq!(scanner.database().count_tags().await.unwrap(), 3);
}

#[tokio::test]
async fn test_repeated_readings_are_stored_once() {
    let (scanner, _) = controller(Vec::new(), TWO_TAGS, SessionPolicy::Persistent);
    let mut events = scanner.subscribe();
    scanner.start().await.unwrap();

    let mut inserted = 0;
    let mut newly_displayed = 0;
    for _ in 0..3 {
        if let ScanEvent::Cycle(report) = next_cycle(&mut events).await {
            assert_eq!(report.readings.len(), 2);
            assert_eq!(report.displayed_total, 2);
            inserted += report.inserted.len();
            newly_displayed += report.newly_displayed.len();
        }
    }
    assert_eq!(newly_displayed, 2);
    scanner.shutdown().await.unwrap();

    assert_eq!(inserted, 2);
    let epcs: Vec<String> = scanner
        .list_tags()
        .await
        .unwrap()
        .into_iter()
        .map(|tag| tag.epc)
        .collect();
    assert_eq!(epcs, vec!["E1", "E2"]);
}

#[tokio::test]
async fn test_start_twice_runs_one_loop() {
    let (scanner, counters) = controller(Vec::new(), "(No Tags)", SessionPolicy::Persistent);

    assert!(scanner.start().await.unwrap());
    assert!(!scanner.start().await.unwrap());

    tokio::time::sleep(Duration::from_millis(230)).await;
    scanner.shutdown().await.unwrap();

    let polls = counters.polls();
    assert!(polls >= 2, "loop barely ran: {polls} polls");
    assert!(polls <= 6, "more than one loop polled: {polls} polls");
}

#[tokio::test]
async fn test_stop_then_start_resumes_polling() {
    let (scanner, counters) = controller(Vec::new(), "(No Tags)", SessionPolicy::Persistent);
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    next_cycle(&mut events).await;
    assert!(scanner.stop().await);
    assert!(!scanner.stop().await);
    assert_eq!(scanner.status().await.status, ScannerStatus::Idle);

    tokio::time::sleep(INTERVAL * 2).await;
    let polls_after_stop = counters.polls();
    tokio::time::sleep(INTERVAL * 3).await;
    assert_eq!(counters.polls(), polls_after_stop);

    while events.try_recv().is_ok() {}
    assert!(scanner.start().await.unwrap());
    next_cycle(&mut events).await;
    assert!(counters.polls() > polls_after_stop);

    scanner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persistent_policy_opens_once() {
    let (scanner, counters) = controller(Vec::new(), "(No Tags)", SessionPolicy::Persistent);
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    for _ in 0..3 {
        next_cycle(&mut events).await;
    }
    scanner.stop().await;

    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.closes(), 0);
    assert_eq!(scanner.session_state().await, SessionState::Open);

    scanner.shutdown().await.unwrap();
    assert_eq!(scanner.session_state().await, SessionState::Closed);
}

#[tokio::test]
async fn test_per_cycle_policy_reopens_every_cycle() {
    let (scanner, counters) = controller(Vec::new(), "(No Tags)", SessionPolicy::PerCycle);
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    for _ in 0..3 {
        next_cycle(&mut events).await;
    }
    scanner.shutdown().await.unwrap();

    let polls = counters.polls();
    assert!(polls >= 3);
    assert_eq!(counters.opens(), polls);
    assert!(counters.closes() >= polls);
}

#[tokio::test]
async fn test_failed_poll_forces_reopen() {
    let (scanner, counters) = controller(
        vec![Step::Reply("(No Tags)"), Step::Timeout],
        "(No Tags)",
        SessionPolicy::Persistent,
    );
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    for _ in 0..4 {
        next_cycle(&mut events).await;
    }
    scanner.stop().await;

    assert_eq!(counters.opens(), 2);
    assert_eq!(counters.closes(), 1);
    scanner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clear_empties_display_but_keeps_store() {
    let (scanner, _) = controller(Vec::new(), TWO_TAGS, SessionPolicy::Persistent);
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    next_cycle(&mut events).await;
    scanner.shutdown().await.unwrap();
    assert_eq!(scanner.displayed().await.len(), 2);

    scanner.clear().await;
    loop {
        if let ScanEvent::Cleared = next_event(&mut events).await {
            break;
        }
    }

    assert!(scanner.displayed().await.is_empty());
    assert_eq!(scanner.list_tags().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_new_tags_are_forwarded_to_lookup_once() {
    let (source, _) = ScriptedSource::new(Vec::new(), TWO_TAGS);
    let db = Database::in_memory().unwrap();
    let scanner = ScanController::new(source, db, options(SessionPolicy::Persistent))
        .with_lookup(Arc::new(EchoLookup));
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    let mut resolved = Vec::new();
    let mut cycles = 0;
    while cycles < 3 || resolved.len() < 2 {
        match next_event(&mut events).await {
            ScanEvent::Cycle(_) => cycles += 1,
            ScanEvent::LookupResolved { epc, summary, .. } => resolved.push((epc, summary)),
            _ => {}
        }
    }
    scanner.shutdown().await.unwrap();

    assert_eq!(
        resolved,
        vec![
            ("E1".to_string(), Some("seen E1".to_string())),
            ("E2".to_string(), Some("seen E2".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_delete_through_controller() {
    let (scanner, _) = controller(Vec::new(), TWO_TAGS, SessionPolicy::Persistent);
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    next_cycle(&mut events).await;
    scanner.shutdown().await.unwrap();

    let tags = scanner.list_tags().await.unwrap();
    assert!(scanner.delete_tag(tags[0].id).await.unwrap());
    assert!(!scanner.delete_tag(tags[0].id).await.unwrap());
    assert_eq!(scanner.list_tags().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconfigure_rejected_while_running() {
    let (scanner, _) = controller(Vec::new(), "(No Tags)", SessionPolicy::Persistent);
    let new_config = ConnectionConfig::new("10.0.0.9", 23, "alien", "password").unwrap();

    scanner.start().await.unwrap();
    assert!(scanner.reconfigure(new_config.clone()).await.is_err());

    scanner.shutdown().await.unwrap();
    scanner.reconfigure(new_config).await.unwrap();
}

#[tokio::test]
async fn test_zero_interval_is_rejected() {
    let (source, _) = ScriptedSource::new(Vec::new(), "(No Tags)");
    let db = Database::in_memory().unwrap();
    let scanner = ScanController::new(
        source,
        db,
        ScanOptions {
            interval: Duration::ZERO,
            ..ScanOptions::default()
        },
    );

    assert!(scanner.start().await.is_err());
    assert_eq!(scanner.status().await.status, ScannerStatus::Idle);
}

#[tokio::test]
async fn test_slow_lookup_does_not_delay_polling() {
    let (source, counters) = ScriptedSource::new(
        vec![
            Step::Reply(TWO_TAGS),
            Step::Reply(THIRD_TAG),
            Step::Reply("E4,2024-01-01T00:00:03,1,2\r\nE5,2024-01-01T00:00:04,1,2"),
        ],
        "(No Tags)",
    );
    let db = Database::in_memory().unwrap();
    let scanner = ScanController::new(
        source,
        db,
        ScanOptions {
            lookup_timeout: Duration::from_secs(5),
            ..options(SessionPolicy::Persistent)
        },
    )
    .with_lookup(Arc::new(StalledLookup));
    let mut events = scanner.subscribe();

    scanner.start().await.unwrap();
    let mut completed = Vec::new();
    while completed.len() < 3 {
        if let ScanEvent::Cycle(report) = next_cycle(&mut events).await {
            assert!(!report.inserted.is_empty());
            completed.push(Instant::now());
        }
    }
    for pair in completed.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap < Duration::from_millis(500), "cycles {gap:?} apart");
    }
    assert!(counters.polls() >= 3);

    let started = Instant::now();
    scanner.shutdown().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "shutdown waited on pending lookups"
    );
}

#[tokio::test]
async fn test_unusable_store_stops_scanner() {
    let (scanner, counters) = controller(Vec::new(), TWO_TAGS, SessionPolicy::Persistent);
    scanner.database().close();
    let mut events = scanner.subscribe();

    assert!(scanner.start().await.unwrap());
    loop {
        match next_event(&mut events).await {
            ScanEvent::StoreUnavailable { message } => {
                assert!(message.contains("not running"), "unexpected message: {message}");
                break;
            }
            ScanEvent::Cycle(report) => panic!("cycle completed without a store: {report:?}"),
            _ => {}
        }
    }

    assert_eq!(scanner.status().await.status, ScannerStatus::Idle);
    let polls = counters.polls();
    tokio::time::sleep(INTERVAL * 4).await;
    assert_eq!(counters.polls(), polls, "loop kept polling after the store failed");

    // The scanner is idle again, so it can be restarted.
    assert!(scanner.start().await.unwrap());
    scanner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_session_control() {
    let (scanner, counters) = controller(Vec::new(), "(No Tags)", SessionPolicy::Persistent);
    assert_eq!(scanner.session_state().await, SessionState::Closed);

    scanner.open_session().await.unwrap();
    assert_eq!(scanner.session_state().await, SessionState::Open);
    let config = ConnectionConfig::new("10.0.0.9", 23, "alien", "password").unwrap();
    assert!(scanner.reconfigure(config.clone()).await.is_err());

    // A session opened by hand is reused by the first cycle.
    let mut events = scanner.subscribe();
    scanner.start().await.unwrap();
    next_cycle(&mut events).await;
    scanner.stop().await;
    assert_eq!(counters.opens(), 1);

    scanner.close_session().await;
    assert_eq!(scanner.session_state().await, SessionState::Closed);
    scanner.reconfigure(config).await.unwrap();
    scanner.shutdown().await.unwrap();
}
