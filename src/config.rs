//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DEFAULT_SCOPE;
use crate::error::{Result, VolleyError};

/// Limits and timings for a [`BulkSender`](crate::BulkSender).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sends admitted per second, per scope
    pub max_per_second: u32,

    /// Sends admitted per minute, per scope
    pub max_per_minute: u32,

    /// Most recipients accepted in one request
    pub max_batch_size: usize,

    /// Longest freeform body, in characters
    pub max_message_length: usize,

    /// Bound on each transport send in milliseconds
    pub send_timeout_ms: u64,

    /// How often stale rate-gate samples are discarded, in milliseconds
    pub cleanup_interval_ms: u64,

    /// Rate-gate scope shared by every send
    pub scope: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_per_second: 10,
            max_per_minute: 300,
            max_batch_size: 100,
            max_message_length: 1600,
            send_timeout_ms: 30_000,
            cleanup_interval_ms: 60_000,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Reject limits the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(VolleyError::Configuration(msg.to_string())) };

        if self.max_per_second == 0 {
            return fail("max_per_second must be at least 1");
        }
        if self.max_per_minute == 0 {
            return fail("max_per_minute must be at least 1");
        }
        if self.max_batch_size == 0 {
            return fail("max_batch_size must be at least 1");
        }
        if self.max_message_length == 0 {
            return fail("max_message_length must be at least 1");
        }
        if self.send_timeout_ms == 0 {
            return fail("send_timeout_ms must be non-zero");
        }
        if self.cleanup_interval_ms == 0 {
            return fail("cleanup_interval_ms must be non-zero");
        }
        if self.scope.trim().is_empty() {
            return fail("scope must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.max_message_length, 1600);
        assert_eq!(config.send_timeout(), Duration::from_secs(30));
        assert_eq!(config.scope, "whatsapp");
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_per_second": 5, "scope": "sms"}"#).unwrap();
        assert_eq!(config.max_per_second, 5);
        assert_eq!(config.scope, "sms");
        assert_eq!(config.max_per_minute, 300);
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let config = PipelineConfig {
            max_per_minute: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VolleyError::Configuration(_))));

        let config = PipelineConfig {
            scope: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VolleyError::Configuration(_))));
    }
}
