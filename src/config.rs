// Timeouts, topics, controller configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lhystudios::speed::Board;

// Runtime loop frequency (health publishing)
pub const LOOP_HZ: u64 = 10;

// Zenoh topics
pub const TOPIC_CMD_JOB: &str = "lhystudios/cmd/job"; // motion ops
pub const TOPIC_CMD_CONTROL: &str = "lhystudios/cmd/control"; // pause/resume/abort
pub const TOPIC_EVENT: &str = "lhystudios/state/event"; // controller events
pub const TOPIC_HEALTH: &str = "lhystudios/state/health"; // periodic health

// Board defaults
pub const DEFAULT_BOARD: Board = Board::M2;
pub const DEFAULT_USB_INDEX: usize = 0;

// Diagonal correction ratio used when none is configured
pub const DEFAULT_D_RATIO: f64 = 0.261199033289;

// Rail stays locked after rapid moves unless disabled
pub const DEFAULT_AUTOLOCK: bool = true;

// Skip the USB driver entirely and synthesize status bytes
pub const MOCK_ENABLED: bool = false;

// Connection handling
pub const DEFAULT_MAX_OPEN_ATTEMPTS: u32 = 500;
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const CONNECTION_ERROR_DELAY: Duration = Duration::from_millis(500);

// Worker loop pacing
pub const PAUSE_POLL_DELAY: Duration = Duration::from_millis(250);
pub const IDLE_BACKOFF_STEP: Duration = Duration::from_millis(20);
pub const IDLE_BACKOFF_MAX_COUNT: u32 = 50;
pub const WAIT_POLL_DELAY: Duration = Duration::from_millis(50);
pub const WAIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60); // before a Wait op sleeps

// Status confirmation after each packet
pub const CONFIRMATION_POLL_LIMIT: u32 = 300;

/// Error loading a controller configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for one controller instance.
///
/// Every field has a default taken from the constants above, so a config file
/// only has to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub board: Board,
    pub usb_index: usize,
    pub mock: bool,
    pub autolock: bool,
    pub d_ratio: Option<f64>,
    pub fix_speeds: bool,
    pub max_open_attempts: u32,
    pub confirmation_poll_limit: u32,
    #[serde(with = "duration_ms")]
    pub open_retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub connection_error_delay: Duration,
    #[serde(with = "duration_ms")]
    pub pause_poll_delay: Duration,
    #[serde(with = "duration_ms")]
    pub idle_backoff_step: Duration,
    #[serde(with = "duration_ms")]
    pub wait_poll_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            board: DEFAULT_BOARD,
            usb_index: DEFAULT_USB_INDEX,
            mock: MOCK_ENABLED,
            autolock: DEFAULT_AUTOLOCK,
            d_ratio: None,
            fix_speeds: false,
            max_open_attempts: DEFAULT_MAX_OPEN_ATTEMPTS,
            confirmation_poll_limit: CONFIRMATION_POLL_LIMIT,
            open_retry_delay: OPEN_RETRY_DELAY,
            connection_error_delay: CONNECTION_ERROR_DELAY,
            pause_poll_delay: PAUSE_POLL_DELAY,
            idle_backoff_step: IDLE_BACKOFF_STEP,
            wait_poll_delay: WAIT_POLL_DELAY,
        }
    }
}

impl ControllerConfig {
    /// Load a config from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Same config with every delay zeroed, for simulation and tests
    pub fn without_delays(mut self) -> Self {
        self.open_retry_delay = Duration::ZERO;
        self.connection_error_delay = Duration::ZERO;
        self.pause_poll_delay = Duration::ZERO;
        self.idle_backoff_step = Duration::ZERO;
        self.wait_poll_delay = Duration::ZERO;
        self
    }
}

// Durations travel as integer milliseconds in config files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ControllerConfig::from_json(r#"{"board": "LASER-B1", "mock": true}"#)
            .expect("config should parse");
        assert_eq!(config.board, Board::LaserB1);
        assert!(config.mock);
        assert_eq!(config.max_open_attempts, DEFAULT_MAX_OPEN_ATTEMPTS);
        assert_eq!(config.open_retry_delay, OPEN_RETRY_DELAY);
    }

    #[test]
    fn test_delays_in_milliseconds() {
        let config = ControllerConfig::from_json(r#"{"open_retry_delay": 1500}"#)
            .expect("config should parse");
        assert_eq!(config.open_retry_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_without_delays() {
        let config = ControllerConfig::default().without_delays();
        assert_eq!(config.pause_poll_delay, Duration::ZERO);
        assert_eq!(config.idle_backoff_step, Duration::ZERO);
        assert_eq!(config.confirmation_poll_limit, CONFIRMATION_POLL_LIMIT);
    }

    #[test]
    fn test_topics_share_prefix() {
        for topic in [TOPIC_CMD_JOB, TOPIC_CMD_CONTROL] {
            assert!(topic.starts_with("lhystudios/cmd/"), "{}", topic);
        }
        for topic in [TOPIC_EVENT, TOPIC_HEALTH] {
            assert!(topic.starts_with("lhystudios/state/"), "{}", topic);
        }
        assert_ne!(TOPIC_CMD_JOB, TOPIC_CMD_CONTROL);
    }
}
