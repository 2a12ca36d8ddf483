//! Client and playback configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest batch the service will run in one call.
pub const MAX_BATCH_SIZE: u32 = 200;

/// Fastest auto-run cadence accepted.
pub const MIN_SPEED_MS: u64 = 10;

/// How long the crash flash stays lit after a successful crash.
pub const CRASH_FLASH: Duration = Duration::from_millis(1200);

/// Connection settings for the simulation service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the simulation service, without trailing slash.
    pub base_url: String,

    /// Timeout for init, step, auto-step, crash and state reads.
    pub timeout: Duration,

    /// Timeout for jump. Replaying to an arbitrary step is the most
    /// expensive call the service offers.
    pub jump_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(30),
            jump_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            base_url: std::env::var("AUTONOMITY_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            timeout: env_or("AUTONOMITY_TIMEOUT_MS", defaults.timeout.as_millis() as u64)
                .map(Duration::from_millis)?,
            jump_timeout: env_or("AUTONOMITY_JUMP_TIMEOUT_MS", defaults.jump_timeout.as_millis() as u64)
                .map(Duration::from_millis)?,
        })
    }

    /// Point the client at another service.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the standard and jump timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeout: Duration, jump_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.jump_timeout = jump_timeout;
        self
    }
}

/// Initial auto-run cadence for a controller.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Delay between the end of one auto-run step and the start of the next.
    pub speed_ms: u64,

    /// Steps requested per manual or auto-run step.
    pub batch_size: u32,

    /// Crash flash window.
    pub crash_flash: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed_ms: 500,
            batch_size: 1,
            crash_flash: CRASH_FLASH,
        }
    }
}

impl PlaybackConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            speed_ms: clamp_speed(env_or("AUTONOMITY_SPEED_MS", defaults.speed_ms)?),
            batch_size: clamp_batch(env_or("AUTONOMITY_BATCH_SIZE", defaults.batch_size)?),
            crash_flash: defaults.crash_flash,
        })
    }

    #[must_use]
    pub fn with_speed_ms(mut self, speed_ms: u64) -> Self {
        self.speed_ms = clamp_speed(speed_ms);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = clamp_batch(batch_size);
        self
    }
}

pub(crate) fn clamp_speed(speed_ms: u64) -> u64 {
    speed_ms.max(MIN_SPEED_MS)
}

pub(crate) fn clamp_batch(batch_size: u32) -> u32 {
    batch_size.clamp(1, MAX_BATCH_SIZE)
}

/// Parse environment variable `key`, or fall back to `default` when unset.
pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{}={:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_budget_exceeds_standard() {
        let config = ClientConfig::default();
        assert!(config.jump_timeout > config.timeout);
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let config = ClientConfig::default().with_base_url("http://sim:5000/");
        assert_eq!(config.base_url, "http://sim:5000");
    }

    #[test]
    fn cadence_is_clamped() {
        let config = PlaybackConfig::default().with_speed_ms(0).with_batch_size(10_000);
        assert_eq!(config.speed_ms, MIN_SPEED_MS);
        assert_eq!(config.batch_size, MAX_BATCH_SIZE);
        assert_eq!(PlaybackConfig::default().with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn malformed_env_value_is_config_error() {
        std::env::set_var("AUTONOMITY_TEST_BOGUS_MS", "soon");
        let err = env_or::<u64>("AUTONOMITY_TEST_BOGUS_MS", 5).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(env_or::<u64>("AUTONOMITY_TEST_UNSET_MS", 5).unwrap(), 5);
    }
}
