//! Runtime configuration and progress events.

use log::{info, warn};
use loopmap_error::{LoopmapError, Result};
use loopmap_hal::HalPaths;
use serde::Deserialize;
use std::path::Path;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

const DEFAULT_READY_TIMEOUT_MS: u64 = 2_000;

/// Progress messages forwarded to an embedding program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Status(String),
    Warning(String),
}

/// On-disk shape of the configuration file.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    paths: HalPaths,
    strict_checksums: bool,
    ready_timeout_ms: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            paths: HalPaths::default(),
            strict_checksums: false,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub paths: HalPaths,
    /// Fail partition table reads on CRC mismatch instead of warning.
    pub strict_checksums: bool,
    /// Upper bound for the per-mapping readiness poll.
    pub ready_timeout: Duration,
    pub events: Option<SyncSender<Event>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from(ConfigFile::default())
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Self {
            paths: file.paths,
            strict_checksums: file.strict_checksums,
            ready_timeout: Duration::from_millis(file.ready_timeout_ms),
            events: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| LoopmapError::Config(e.to_string()))?;
        Ok(file.into())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LoopmapError::io(path, e))?;
        Self::from_toml_str(&text)
            .map_err(|e| LoopmapError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_events(mut self, tx: SyncSender<Event>) -> Self {
        self.events = Some(tx);
        self
    }

    pub(crate) fn ready_timeout_ms(&self) -> u64 {
        self.ready_timeout.as_millis().min(u64::MAX as u128) as u64
    }

    fn send(&self, event: Event) {
        if let Some(ref tx) = self.events {
            let _ = tx.try_send(event);
        }
    }

    pub(crate) fn status(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{}", msg);
        self.send(Event::Status(msg));
    }

    pub(crate) fn warn(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("{}", msg);
        self.send(Event::Warning(msg));
    }
}
