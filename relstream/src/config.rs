//! Connection configuration.
//!
//! Loaded from JSON (every field optional) and validated before any
//! connection is built from it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelStreamError, Result};

/// Default window: one outstanding segment (stop-and-wait).
pub const DEFAULT_WINDOW: u32 = 1;
/// Default retransmission timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Settings shared by every connection of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of unacknowledged segments in flight, and the size of
    /// the receive window.
    pub window: u32,
    /// Milliseconds before an unacknowledged segment is sent again.
    pub timeout_ms: u64,
    /// Scheduler period in milliseconds; `None` means `timeout_ms / 5`.
    pub tick_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tick_ms: None,
        }
    }
}

impl Config {
    /// Create a config with the given window and timeout.
    pub fn new(window: u32, timeout_ms: u64) -> Self {
        Self {
            window,
            timeout_ms,
            tick_ms: None,
        }
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(RelStreamError::InvalidConfig("window must be at least 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(RelStreamError::InvalidConfig(
                "timeout_ms must be at least 1".into(),
            ));
        }
        if self.tick_ms == Some(0) {
            return Err(RelStreamError::InvalidConfig("tick_ms must be at least 1".into()));
        }
        Ok(())
    }

    /// Retransmission timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Scheduler period, never shorter than a millisecond.
    pub fn tick_interval(&self) -> Duration {
        let ms = self.tick_ms.unwrap_or(self.timeout_ms / 5).max(1);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.window, 1);
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.tick_interval(), Duration::from_millis(400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = Config::from_json(r#"{ "window": 4 }"#).unwrap();
        assert_eq!(config.window, 4);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.tick_ms, None);
    }

    #[test]
    fn explicit_tick() {
        let config = Config::from_json(r#"{ "timeout_ms": 200, "tick_ms": 10 }"#).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
    }

    #[test]
    fn tiny_timeout_still_ticks() {
        let config = Config::new(1, 3);
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
    }

    #[test]
    fn zero_window_rejected() {
        let err = Config::from_json(r#"{ "window": 0 }"#).unwrap_err();
        assert!(matches!(err, RelStreamError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = Config::from_json("{ window: ").unwrap_err();
        assert!(matches!(err, RelStreamError::ConfigParse(_)));
    }
}
