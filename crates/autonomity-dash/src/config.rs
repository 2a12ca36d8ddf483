//! Bridge configuration.

use std::net::SocketAddr;

use autonomity_playback::{env_or, ClientConfig, PlaybackConfig, Result};

/// Everything the bridge binary needs to start.
#[derive(Debug, Clone)]
pub struct DashConfig {
    /// Address the HTTP and WebSocket listener binds.
    pub listen_addr: SocketAddr,

    pub client: ClientConfig,
    pub playback: PlaybackConfig,

    /// Drive an in-process simulation instead of the remote service.
    pub offline: bool,

    /// Run length of the in-process simulation.
    pub offline_steps: u64,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            client: ClientConfig::default(),
            playback: PlaybackConfig::default(),
            offline: false,
            offline_steps: 78,
        }
    }
}

impl DashConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            listen_addr: env_or("AUTONOMITY_DASH_ADDR", defaults.listen_addr)?,
            client: ClientConfig::from_env()?,
            playback: PlaybackConfig::from_env()?,
            offline: std::env::var("AUTONOMITY_OFFLINE")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(defaults.offline),
            offline_steps: env_or("AUTONOMITY_OFFLINE_STEPS", defaults.offline_steps)?,
        })
    }
}
