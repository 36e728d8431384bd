//! Tag data models.
//!
//! `TagReading` is what the parser produces on every poll; `StoredTag` is the
//! persisted row created the first time an EPC is seen.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::helpers::parse_datetime;

/// A single tag observation reported by the reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReading {
    pub epc: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

impl TagReading {
    pub fn new(epc: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            epc: epc.into(),
            timestamp,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }
}

/// A row of the `rfid_tags` table. Rows are never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTag {
    pub id: i64,
    pub epc: String,
    pub longitude: f64,
    pub latitude: f64,
    pub timestamp: String,
}

impl StoredTag {
    pub fn read_at(&self) -> Result<DateTime<Utc>> {
        parse_datetime(&self.timestamp, "timestamp")
    }
}
