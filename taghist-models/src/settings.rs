use crate::source::SourceSpec;
use config::{Config, File};
use serde::Deserialize;
use std::{collections::HashMap, ops::Deref, sync::Arc};
use taghist_error::THResult;

#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Load settings from a file plus `TH__`-prefixed environment overrides
    /// (e.g. `TH__POLLER__INTERVAL_MS=500`). The file is optional; every
    /// field has a default.
    pub fn new(config_path: &str) -> THResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("TH")
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    /// Settings with built-in defaults, for tests and embedded use.
    pub fn defaults() -> Self {
        Self(Arc::new(Inner::default()))
    }

    pub fn with_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }

    /// Resolve the configured source table into `SourceSpec`s keyed by
    /// source key.
    pub fn source_specs(&self) -> HashMap<String, SourceSpec> {
        self.sources
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    SourceSpec::new(key.clone(), entry.address.clone(), entry.rack, entry.slot),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Configured sources, keyed by source key.
    #[serde(default)]
    pub sources: HashMap<String, SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Directory holding the day shard files.
    #[serde(default = "General::data_dir_default")]
    pub data_dir: String,
}

impl Default for General {
    fn default() -> Self {
        General {
            data_dir: General::data_dir_default(),
        }
    }
}

impl General {
    fn data_dir_default() -> String {
        "./data".into()
    }
}

/// One configured controller.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    /// Host name or IP address.
    pub address: String,
    #[serde(default)]
    pub rack: u16,
    #[serde(default = "SourceEntry::slot_default")]
    pub slot: u16,
}

impl SourceEntry {
    fn slot_default() -> u16 {
        2
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PollerConfig {
    /// Poll cycle interval in milliseconds.
    #[serde(default = "PollerConfig::interval_ms_default")]
    pub interval_ms: u64,
    /// Upper bound for one merged device read, in bytes.
    #[serde(default = "PollerConfig::max_window_bytes_default")]
    pub max_window_bytes: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            interval_ms: PollerConfig::interval_ms_default(),
            max_window_bytes: PollerConfig::max_window_bytes_default(),
        }
    }
}

impl PollerConfig {
    fn interval_ms_default() -> u64 {
        1000
    }

    fn max_window_bytes_default() -> u32 {
        2000
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HistoryConfig {
    /// Queue length that triggers a flush to the store.
    #[serde(default = "HistoryConfig::flush_threshold_default")]
    pub flush_threshold: usize,
    /// Capacity of the bounded channel between the buffer and the writer task.
    #[serde(default = "HistoryConfig::queue_capacity_default")]
    pub queue_capacity: usize,
    /// How many prior days a new shard inspects when seeding its tag table,
    /// and the default lookback for tag name listings.
    #[serde(default = "HistoryConfig::tag_seed_lookback_days_default")]
    pub tag_seed_lookback_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            flush_threshold: HistoryConfig::flush_threshold_default(),
            queue_capacity: HistoryConfig::queue_capacity_default(),
            tag_seed_lookback_days: HistoryConfig::tag_seed_lookback_days_default(),
        }
    }
}

impl HistoryConfig {
    fn flush_threshold_default() -> usize {
        50
    }

    fn queue_capacity_default() -> usize {
        64
    }

    fn tag_seed_lookback_days_default() -> u32 {
        10
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Console/file log level: trace | debug | info | warn | error.
    #[serde(default = "LogConfig::level_default")]
    pub level: String,
    /// Directory for the daily-rolling log file.
    #[serde(default = "LogConfig::dir_default")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogConfig::level_default(),
            dir: LogConfig::dir_default(),
        }
    }
}

impl LogConfig {
    fn level_default() -> String {
        "info".into()
    }

    fn dir_default() -> String {
        "logs".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let s = Settings::defaults();
        assert_eq!(s.poller.interval_ms, 1000);
        assert_eq!(s.poller.max_window_bytes, 2000);
        assert_eq!(s.history.flush_threshold, 50);
        assert_eq!(s.history.tag_seed_lookback_days, 10);
        assert!(s.sources.is_empty());
    }
}
