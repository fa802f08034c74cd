//! Session configuration.
//!
//! All timings are stored in milliseconds so the structures serialize to
//! plain numbers (feature `serde`); accessors return [`Duration`]s.

use std::time::Duration;

use crate::chip::CapabilityOverrides;
use crate::error::{Error, Result};
use crate::protocol::hci::MAX_PARAMS_LEN;

/// Largest file block: one parameter byte is taken by the block id.
pub const MAX_CHUNK_SIZE: usize = MAX_PARAMS_LEN - 1;

/// Default self-test poll bound.
pub const DEFAULT_SELFTEST_MAX_RETRIES: u32 = 50;

/// Self-test polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SelfTestPolicy {
    /// Wait before the first poll, in milliseconds.
    pub initial_delay_ms: u64,
    /// Base wait between polls, in milliseconds.
    pub retry_delay_ms: u64,
    /// Extra wait added per attempt, in milliseconds.
    pub retry_step_ms: u64,
    /// Maximum number of "not complete" answers tolerated.
    pub max_retries: u32,
}

impl Default for SelfTestPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            retry_delay_ms: 5,
            retry_step_ms: 2,
            max_retries: DEFAULT_SELFTEST_MAX_RETRIES,
        }
    }
}

impl SelfTestPolicy {
    /// Wait before the first poll.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Wait after the `attempt`-th "not complete" answer (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.retry_delay_ms
                .saturating_add(self.retry_step_ms.saturating_mul(u64::from(attempt))),
        )
    }
}

/// Bounded waits of the boot and shutdown sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BootTimings {
    /// Wait for the response to one boot or shutdown command.
    pub command_timeout_ms: u64,
    /// How long `open()` waits for a boot to finish.
    pub open_timeout_ms: u64,
    /// How long `close()` waits for shutdown to finish.
    pub close_timeout_ms: u64,
    /// Deadline for the whole shutdown sequence.
    pub shutdown_deadline_ms: u64,
    /// Settle time after the power-switch-off command.
    pub power_off_settle_ms: u64,
}

impl Default for BootTimings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 2_000,
            open_timeout_ms: 30_000,
            close_timeout_ms: 5_000,
            shutdown_deadline_ms: 4_000,
            power_off_settle_ms: 50,
        }
    }
}

impl BootTimings {
    /// Wait for one command response.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Wait in `open()`.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Wait in `close()`.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Whole-shutdown deadline.
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    /// Settle time after power-switch-off.
    pub fn power_off_settle(&self) -> Duration {
        Duration::from_millis(self.power_off_settle_ms)
    }
}

/// Configuration of a [`ChipSession`](crate::session::ChipSession).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Maximum payload bytes per file block.
    pub chunk_size: usize,
    /// Command credits assumed after power-up.
    pub initial_command_credits: usize,
    /// Device address written during boot.
    pub device_address: [u8; 6],
    /// File name prefix of patch and settings blobs.
    pub blob_prefix: String,
    /// File name extension of patch and settings blobs.
    pub blob_extension: String,
    /// Bounded waits.
    pub timings: BootTimings,
    /// Self-test polling.
    pub self_test: SelfTestPolicy,
    /// Revision capability overrides.
    pub capabilities: CapabilityOverrides,
    /// Copy all traffic to an open logger client.
    pub mirror_traffic_to_logger: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            initial_command_credits: 1,
            device_address: [0x00, 0x80, 0xE1, 0x00, 0x00, 0x01],
            blob_prefix: "CG2900".to_string(),
            blob_extension: "fw".to_string(),
            timings: BootTimings::default(),
            self_test: SelfTestPolicy::default(),
            capabilities: CapabilityOverrides::default(),
            mirror_traffic_to_logger: true,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the file block size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the device address written during boot.
    #[must_use]
    pub fn with_device_address(mut self, address: [u8; 6]) -> Self {
        self.device_address = address;
        self
    }

    /// Set blob file naming.
    #[must_use]
    pub fn with_blob_naming(mut self, prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        self.blob_prefix = prefix.into();
        self.blob_extension = extension.into();
        self
    }

    /// Set the bounded waits.
    #[must_use]
    pub fn with_timings(mut self, timings: BootTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Set the self-test policy.
    #[must_use]
    pub fn with_self_test(mut self, policy: SelfTestPolicy) -> Self {
        self.self_test = policy;
        self
    }

    /// Set capability overrides.
    #[must_use]
    pub fn with_capabilities(mut self, overrides: CapabilityOverrides) -> Self {
        self.capabilities = overrides;
        self
    }

    /// Enable or disable logger mirroring.
    #[must_use]
    pub fn with_logger_mirror(mut self, enabled: bool) -> Self {
        self.mirror_traffic_to_logger = enabled;
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.initial_command_credits == 0 {
            return Err(Error::Config("initial_command_credits must be at least 1".into()));
        }
        if self.blob_prefix.is_empty() {
            return Err(Error::Config("blob_prefix must not be empty".into()));
        }
        if self.timings.command_timeout_ms == 0 {
            return Err(Error::Config("command_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 254);
        assert_eq!(config.self_test.max_retries, 50);
    }

    #[test]
    fn test_validate_rejects_oversized_chunks() {
        let config = SessionConfig::new().with_chunk_size(255);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = SessionConfig::new().with_chunk_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_test_delay_increases() {
        let policy = SelfTestPolicy::default();
        assert!(policy.retry_delay(2) > policy.retry_delay(1));
        assert_eq!(policy.retry_delay(0), Duration::from_millis(5));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            chunk_size = 128
            blob_prefix = "RADIO"

            [self_test]
            max_retries = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 128);
        assert_eq!(config.blob_prefix, "RADIO");
        assert_eq!(config.self_test.max_retries, 10);
        assert_eq!(config.self_test.initial_delay_ms, 100);
        assert_eq!(config.timings, BootTimings::default());
    }
}
