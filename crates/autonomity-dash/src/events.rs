//! Dashboard intents and the messages streamed back over WebSocket.

use autonomity_playback::{InitParams, Outcome, PlaybackController, PlaybackView};
use serde::{Deserialize, Serialize};

/// A user intent sent by any dashboard screen.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Ask for the current view.
    GetView,
    /// Load a new run.
    Init(InitParams),
    /// Advance by `count` steps, or the batch size.
    Step {
        #[serde(default)]
        count: Option<u32>,
    },
    AutoRun,
    Pause,
    /// Scrub to an already visited step.
    Jump { step: u64 },
    Crash,
    /// Re-read the service's snapshot.
    Refresh,
    /// Change the auto-run cadence.
    Settings {
        #[serde(default)]
        speed_ms: Option<u64>,
        #[serde(default)]
        batch_size: Option<u32>,
    },
}

impl Command {
    /// Short name used in logs and replies.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetView => "get_view",
            Command::Init(_) => "init",
            Command::Step { .. } => "step",
            Command::AutoRun => "auto_run",
            Command::Pause => "pause",
            Command::Jump { .. } => "jump",
            Command::Crash => "crash",
            Command::Refresh => "refresh",
            Command::Settings { .. } => "settings",
        }
    }

    /// Run the intent against the controller.
    pub async fn apply(self, playback: &PlaybackController) -> Outcome {
        match self {
            Command::GetView => Outcome::Applied,
            Command::Init(params) => playback.init(params).await,
            Command::Step { count } => playback.step(count).await,
            Command::AutoRun => playback.auto_run(),
            Command::Pause => playback.pause(),
            Command::Jump { step } => playback.jump(step).await,
            Command::Crash => playback.crash().await,
            Command::Refresh => playback.refresh().await,
            Command::Settings {
                speed_ms,
                batch_size,
            } => {
                if let Some(speed_ms) = speed_ms {
                    playback.set_speed_ms(speed_ms);
                }
                if let Some(batch_size) = batch_size {
                    playback.set_batch_size(batch_size);
                }
                Outcome::Applied
            }
        }
    }
}

/// Messages pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// The controller published a new view.
    View(PlaybackView),
    /// A command sent on this socket settled.
    Outcome {
        command: &'static str,
        outcome: Outcome,
    },
    /// A frame could not be parsed as a command.
    Invalid { message: String },
}
