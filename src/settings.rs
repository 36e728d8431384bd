use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

use crate::{
    reader::{ConnectionConfig, SessionTimeouts},
    scanner::{ScanOptions, SessionPolicy},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub session_policy: SessionPolicy,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub lookup_timeout_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            session_policy: SessionPolicy::Persistent,
            connect_timeout_ms: 5000,
            response_timeout_ms: 3000,
            lookup_timeout_ms: 5000,
        }
    }
}

impl PollSettings {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            response: Duration::from_millis(self.response_timeout_ms),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        let log_raw_replies = std::env::var("ALIENPROBE_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        ScanOptions {
            interval: Duration::from_millis(self.interval_ms),
            session_policy: self.session_policy,
            lookup_timeout: Duration::from_millis(self.lookup_timeout_ms),
            log_raw_replies,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub reader: ConnectionConfig,
    pub poll: PollSettings,
    pub database_path: PathBuf,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            reader: ConnectionConfig::default(),
            poll: PollSettings::default(),
            database_path: PathBuf::from("alienprobe.sqlite3"),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<ProbeSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data: ProbeSettings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid settings file {}", path.display()))?
        } else {
            ProbeSettings::default()
        };
        data.reader
            .validate()
            .with_context(|| format!("Invalid reader settings in {}", path.display()))?;

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> ProbeSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the reader connection. Callers must have stopped the scanner
    /// and closed the session first.
    pub fn update_reader(&self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        self.update(|settings| settings.reader = config)
    }

    pub fn update_poll(&self, poll: PollSettings) -> Result<()> {
        self.update(|settings| settings.poll = poll)
    }

    fn update(&self, apply: impl FnOnce(&mut ProbeSettings)) -> Result<()> {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut *guard);
        self.persist(&guard)
    }

    fn persist(&self, data: &ProbeSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
