//! Tag-list reply parsing.
//!
//! The reader is configured for a custom comma-separated list, one tag per
//! line, as `epc,timestamp,longitude,latitude`. Firmware without a GPS feed
//! leaves the trailing fields off, so short lines are filled with defaults.
//! The factory text format (`Tag:…, Disc:…, Last:…`) is accepted as well.
//!
//! Bad lines never fail the batch: they are dropped and reported as
//! [`ParseWarning`]s.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::db::TagReading;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_warn;

const FIELD_DELIMITER: char = ',';
const NO_TAGS_MARKER: &str = "(No Tags)";
const NATIVE_TAG_KEY: &str = "Tag";

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y/%m/%d %H:%M:%S%.f"];

/// A line that was skipped or only partly understood.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseWarning {
    /// 1-based line number within the reply.
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} ({:?}): {}", self.line_number, self.line, self.reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTagList {
    pub readings: Vec<TagReading>,
    pub warnings: Vec<ParseWarning>,
}

/// Parses a tag-list reply, logging any warnings.
pub fn parse_tag_list(raw: &str) -> Vec<TagReading> {
    let parsed = parse_tag_list_at(raw, Utc::now());
    for warning in &parsed.warnings {
        log_warn!("tag list parse warning: {warning}");
    }
    parsed.readings
}

/// Parses a tag-list reply. `now` stands in for missing or unreadable
/// timestamps.
pub fn parse_tag_list_at(raw: &str, now: DateTime<Utc>) -> ParsedTagList {
    let mut parsed = ParsedTagList::default();

    for (index, line) in raw.split('\n').enumerate() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() || line.eq_ignore_ascii_case(NO_TAGS_MARKER) {
            continue;
        }

        let mut warn = |reason: String| {
            parsed.warnings.push(ParseWarning {
                line_number: index + 1,
                line: line.to_string(),
                reason,
            })
        };

        let result = if is_native_line(line) {
            parse_native_line(line, now, &mut warn)
        } else {
            parse_custom_line(line, now, &mut warn)
        };

        match result {
            Ok(reading) => parsed.readings.push(reading),
            Err(reason) => warn(reason),
        }
    }

    parsed
}

fn parse_custom_line(
    line: &str,
    now: DateTime<Utc>,
    warn: &mut impl FnMut(String),
) -> Result<TagReading, String> {
    let mut fields = line.split(FIELD_DELIMITER).map(str::trim);

    let epc = fields.next().unwrap_or_default();
    if epc.is_empty() {
        return Err("missing EPC".into());
    }

    let timestamp = match fields.next().filter(|value| !value.is_empty()) {
        Some(value) => parse_timestamp(value).unwrap_or_else(|| {
            warn(format!("unreadable timestamp {value:?}, using read time"));
            now
        }),
        None => now,
    };
    let longitude = parse_coordinate(fields.next(), "longitude")?;
    let latitude = parse_coordinate(fields.next(), "latitude")?;

    Ok(TagReading::new(epc, timestamp).with_position(latitude, longitude))
}

fn parse_coordinate(field: Option<&str>, name: &str) -> Result<f64, String> {
    match field.filter(|value| !value.is_empty()) {
        None => Ok(0.0),
        Some(value) => match value.parse::<f64>() {
            Ok(number) if number.is_finite() => Ok(number),
            _ => Err(format!("invalid {name} {value:?}")),
        },
    }
}

fn is_native_line(line: &str) -> bool {
    line.split_once(':')
        .map(|(key, _)| key.trim().eq_ignore_ascii_case(NATIVE_TAG_KEY))
        .unwrap_or(false)
}

/// `Tag:E200 3411 B802, Disc:2024/01/01 00:00:00, Last:2024/01/01 00:00:05, Count:3, Ant:0`
fn parse_native_line(
    line: &str,
    now: DateTime<Utc>,
    warn: &mut impl FnMut(String),
) -> Result<TagReading, String> {
    let mut epc = None;
    let mut discovered = None;
    let mut last_seen = None;

    for field in line.split(FIELD_DELIMITER) {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "tag" => epc = Some(value.split_whitespace().collect::<String>()),
            "disc" => discovered = Some(value),
            "last" => last_seen = Some(value),
            _ => {}
        }
    }

    let epc = epc.filter(|epc| !epc.is_empty()).ok_or("missing EPC")?;
    let timestamp = match last_seen.or(discovered) {
        Some(value) => parse_timestamp(value).unwrap_or_else(|| {
            warn(format!("unreadable timestamp {value:?}, using read time"));
            now
        }),
        None => now,
    };

    Ok(TagReading::new(epc, timestamp))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
