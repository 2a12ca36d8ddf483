//! Autonomity Dashboard Bridge
//!
//! Connects to the simulation service (or an in-process stand-in) and serves
//! playback to dashboard screens.

use std::sync::Arc;

use autonomity_dash::{DashConfig, DashServer};
use autonomity_playback::memory::MemorySimulation;
use autonomity_playback::{PlaybackController, SimulationApi, SimulationClient};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("autonomity_dash=info,autonomity_playback=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DashConfig::from_env()?;

    let api: Arc<dyn SimulationApi> = if config.offline {
        info!(steps = config.offline_steps, "offline mode, using in-process simulation");
        Arc::new(MemorySimulation::new(config.offline_steps))
    } else {
        info!(url = %config.client.base_url, "using simulation service");
        Arc::new(SimulationClient::new(config.client.clone())?)
    };

    let playback = PlaybackController::new(api, config.playback.clone());

    // Attach to a run the service may already hold.
    if !config.offline {
        let outcome = playback.refresh().await;
        if !outcome.is_applied() {
            warn!(?outcome, "no run attached at startup");
        }
    }

    DashServer::new(playback.clone()).serve(config.listen_addr).await?;
    playback.dispose();

    Ok(())
}
