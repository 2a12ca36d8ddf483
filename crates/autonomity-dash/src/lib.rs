//! Autonomity Dashboard Bridge
//!
//! Shares one playback controller between every open dashboard screen.
//!
//! # Architecture
//!
//! - **Events**: intents screens send and the messages they get back
//! - **REST API**: one POST per intent, each answered with the new view
//! - **WebSocket**: streams every published view, accepts the same intents
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use autonomity_dash::{DashConfig, DashServer};
//! use autonomity_playback::{PlaybackController, SimulationClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DashConfig::from_env()?;
//! let client = SimulationClient::new(config.client.clone())?;
//! let playback = PlaybackController::new(Arc::new(client), config.playback.clone());
//!
//! DashServer::new(playback).serve(config.listen_addr).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod events;
mod server;

pub use config::DashConfig;
pub use events::{Command, WsMessage};
pub use server::{CommandResponse, DashServer};

#[cfg(test)]
mod tests {
    use super::*;
    use autonomity_playback::memory::MemorySimulation;
    use autonomity_playback::{InitParams, Outcome, PlaybackConfig, PlaybackController, PlaybackStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn screens_share_one_controller() {
        let sim = Arc::new(MemorySimulation::new(78));
        let playback = PlaybackController::new(sim, PlaybackConfig::default());
        let other_screen = playback.clone();
        let mut views = other_screen.subscribe();

        let outcome = Command::Init(InitParams::default()).apply(&playback).await;
        assert_eq!(outcome, Outcome::Applied);
        Command::Step { count: Some(3) }.apply(&playback).await;

        views.changed().await.unwrap();
        let view = views.borrow_and_update().clone();
        assert_eq!(view.status, PlaybackStatus::Paused);
        assert_eq!(view.max_reached_step, 3);
        assert_eq!(other_screen.view().snapshot.unwrap().step, 3);
    }
}
