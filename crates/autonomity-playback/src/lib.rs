//! Autonomity Playback
//!
//! Drives a remote, step-indexed market simulation from a dashboard.
//!
//! # Architecture
//!
//! - **Snapshot**: the service's full report of a run at one step
//! - **Client**: one HTTP call per remote operation, nothing else
//! - **Controller**: status machine, auto-run timer, jump guard, watermark
//! - **Memory**: in-process service stand-in for offline use and tests
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use autonomity_playback::{
//!     ClientConfig, InitParams, PlaybackConfig, PlaybackController, SimulationClient,
//! };
//!
//! # async fn run() -> autonomity_playback::Result<()> {
//! let client = SimulationClient::new(ClientConfig::from_env()?)?;
//! let playback = PlaybackController::new(Arc::new(client), PlaybackConfig::default());
//!
//! playback.init(InitParams::default()).await;
//! playback.auto_run();
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod controller;
mod error;
pub mod memory;
mod snapshot;

pub use client::{SimulationApi, SimulationClient};
pub use config::{env_or, ClientConfig, PlaybackConfig, CRASH_FLASH, MAX_BATCH_SIZE, MIN_SPEED_MS};
pub use controller::{Outcome, PlaybackController, PlaybackStatus, PlaybackView, Rejection};
pub use error::{Error, Result};
pub use snapshot::{decode_reply, AgentKind, InitParams, Snapshot};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySimulation, Op};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn dashboard_session() {
        let sim = Arc::new(MemorySimulation::new(78));
        let playback = PlaybackController::new(sim.clone(), PlaybackConfig::default().with_speed_ms(50));

        playback.init(InitParams::new("AAPL", "5d", "5m")).await;
        assert_eq!(playback.status(), PlaybackStatus::Paused);

        playback.auto_run();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        playback.pause();
        let reached = playback.view().max_reached_step;
        assert!(reached >= 19);

        playback.jump(reached / 2).await;
        playback.crash().await;
        let view = playback.view();
        assert_eq!(view.highlight_step, Some(reached / 2));
        assert!(view.crash_flash);
        assert!(view.snapshot.unwrap().crash_active);

        playback.step(Some(78)).await;
        assert_eq!(playback.status(), PlaybackStatus::Finished);
        assert_eq!(playback.view().max_reached_step, 78);
        assert_eq!(sim.calls(Op::Jump), 1);
    }
}
