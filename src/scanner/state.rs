use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::TagReading;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScannerStatus {
    #[default]
    Idle,
    Running,
}

/// Whether the reader connection survives between cycles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionPolicy {
    /// Open once and keep polling the same session. A failed poll closes it
    /// and the next cycle opens a fresh one.
    #[default]
    Persistent,
    /// Open, poll and close on every cycle.
    PerCycle,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerSnapshot {
    pub status: ScannerStatus,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub displayed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScannerState {
    pub status: ScannerStatus,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Unique readings shown since the last clear. Not store state.
    displayed: Vec<TagReading>,
    displayed_epcs: HashSet<String>,
    /// Bumped on every start so a stale loop cannot change a newer run.
    generation: u64,
}

impl ScannerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&mut self) -> u64 {
        self.generation += 1;
        self.status = ScannerStatus::Running;
        self.generation
    }

    pub fn stop(&mut self) {
        self.status = ScannerStatus::Idle;
    }

    /// Stops the run identified by `generation` if it is still the current one.
    pub fn halt(&mut self, generation: u64) {
        if self.generation == generation {
            self.status = ScannerStatus::Idle;
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) -> u64 {
        self.cycles += 1;
        self.last_cycle_at = Some(at);
        self.cycles
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.cycles += 1;
        self.failed_cycles += 1;
        self.last_cycle_at = Some(at);
    }

    /// Adds readings whose EPC is not on display yet and returns just those.
    pub fn remember(&mut self, readings: &[TagReading]) -> Vec<TagReading> {
        let mut added = Vec::new();
        for reading in readings {
            if self.displayed_epcs.insert(reading.epc.clone()) {
                self.displayed.push(reading.clone());
                added.push(reading.clone());
            }
        }
        added
    }

    pub fn displayed(&self) -> &[TagReading] {
        &self.displayed
    }

    pub fn clear_displayed(&mut self) {
        self.displayed.clear();
        self.displayed_epcs.clear();
    }

    pub fn snapshot(&self) -> ScannerSnapshot {
        ScannerSnapshot {
            status: self.status,
            cycles: self.cycles,
            failed_cycles: self.failed_cycles,
            last_cycle_at: self.last_cycle_at,
            displayed: self.displayed.len(),
        }
    }
}
