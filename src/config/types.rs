use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_TIMEOUT, DISCOVER_TIMEOUT, DEFAULT_SCAN_DURATION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkConfig {
    /// How long (milliseconds) a connection attempt may stay in the connecting state.
    pub connect_timeout_ms: u64,
    /// How long (milliseconds) service discovery may take after the link is established.
    pub discover_timeout_ms: u64,
    /// Default length (milliseconds) of a scan window.
    pub scan_duration_ms: u64,
    /// Sightings weaker than this are ignored while scanning.
    pub min_rssi: Option<i16>,
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            connect_timeout_ms: CONNECT_TIMEOUT,
            discover_timeout_ms: DISCOVER_TIMEOUT,
            scan_duration_ms: DEFAULT_SCAN_DURATION,
            min_rssi: None,
        }
    }
}
