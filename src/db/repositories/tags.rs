use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::is_unique_violation,
    models::{StoredTag, TagReading},
};

fn row_to_tag(row: &Row) -> rusqlite::Result<StoredTag> {
    Ok(StoredTag {
        id: row.get("id")?,
        epc: row.get("epc")?,
        longitude: row.get("longitude")?,
        latitude: row.get("latitude")?,
        timestamp: row.get("timestamp")?,
    })
}

impl Database {
    /// Stores `reading` unless its EPC is already known.
    ///
    /// The UNIQUE constraint on `epc` decides, so two racing inserts of the same
    /// EPC produce exactly one row. Returns the created row, or `None` for a
    /// duplicate.
    pub async fn insert_tag(&self, reading: &TagReading) -> Result<Option<StoredTag>> {
        let record = reading.clone();
        self.execute(move |conn| {
            let timestamp = record.timestamp.to_rfc3339();
            let inserted = conn.execute(
                "INSERT INTO rfid_tags (epc, longitude, latitude, timestamp)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(epc) DO NOTHING",
                params![record.epc, record.longitude, record.latitude, timestamp],
            );

            let changed = match inserted {
                Ok(changed) => changed,
                Err(err) if is_unique_violation(&err) => 0,
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to insert tag {}", record.epc)))
                }
            };

            if changed == 0 {
                return Ok(None);
            }

            Ok(Some(StoredTag {
                id: conn.last_insert_rowid(),
                epc: record.epc,
                longitude: record.longitude,
                latitude: record.latitude,
                timestamp,
            }))
        })
        .await
    }

    pub async fn insert_if_absent(&self, reading: &TagReading) -> Result<bool> {
        Ok(self.insert_tag(reading).await?.is_some())
    }

    /// Snapshot of every stored tag, oldest first.
    pub async fn list_tags(&self) -> Result<Vec<StoredTag>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, epc, longitude, latitude, timestamp
                 FROM rfid_tags
                 ORDER BY id ASC",
            )?;

            let tags = stmt
                .query_map([], row_to_tag)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read stored tags")?;

            Ok(tags)
        })
        .await
    }

    pub async fn get_tag_by_epc(&self, epc: &str) -> Result<Option<StoredTag>> {
        let epc = epc.to_string();
        self.execute(move |conn| {
            let tag = conn
                .query_row(
                    "SELECT id, epc, longitude, latitude, timestamp
                     FROM rfid_tags
                     WHERE epc = ?1",
                    params![epc],
                    row_to_tag,
                )
                .optional()?;
            Ok(tag)
        })
        .await
    }

    /// Removes the row with `tag_id`. Returns false when no such row exists.
    pub async fn delete_tag(&self, tag_id: i64) -> Result<bool> {
        self.execute(move |conn| {
            let rows_affected = conn
                .execute("DELETE FROM rfid_tags WHERE id = ?1", params![tag_id])
                .with_context(|| format!("failed to delete tag {tag_id}"))?;
            Ok(rows_affected > 0)
        })
        .await
    }

    pub async fn count_tags(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM rfid_tags", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}
