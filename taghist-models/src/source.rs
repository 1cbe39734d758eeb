use serde::{Deserialize, Serialize};

/// A physical or logical controller instance identified by a stable key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Stable key referenced by tag names (`{key}_DB{block}...`).
    pub key: String,
    /// Host name or IP address of the controller.
    pub host: String,
    /// Rack number of the CPU module.
    pub rack: u16,
    /// Slot number of the CPU module.
    pub slot: u16,
}

impl SourceSpec {
    pub fn new(key: impl Into<String>, host: impl Into<String>, rack: u16, slot: u16) -> Self {
        Self {
            key: key.into(),
            host: host.into(),
            rack,
            slot,
        }
    }

    /// Fallback used when a key has no configured entry: the key itself is
    /// treated as the address, rack 0, slot 0.
    pub fn synthesized(key: &str) -> Self {
        Self {
            key: key.to_string(),
            host: key.to_string(),
            rack: 0,
            slot: 0,
        }
    }
}
