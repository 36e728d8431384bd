use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    db::{StoredTag, TagReading},
    reader::{ParseWarning, SessionErrorKind},
};

/// Everything the scanner tells its subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ScanEvent {
    /// The reader answered. `readings` may be empty.
    Cycle(CycleReport),
    /// The reader could not be reached or did not answer this cycle.
    CycleFailed {
        kind: SessionErrorKind,
        message: String,
    },
    /// The store is unusable; the scanner has stopped.
    StoreUnavailable { message: String },
    LookupResolved {
        tag_id: i64,
        epc: String,
        summary: Option<String>,
    },
    Cleared,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle: u64,
    pub completed_at: DateTime<Utc>,
    pub readings: Vec<TagReading>,
    /// Rows created this cycle, i.e. EPCs the store had never seen.
    pub inserted: Vec<StoredTag>,
    /// Readings that joined the displayed list this cycle.
    pub newly_displayed: Vec<TagReading>,
    /// Size of the displayed list after this cycle.
    pub displayed_total: usize,
    pub warnings: Vec<ParseWarning>,
}
