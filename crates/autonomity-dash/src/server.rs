//! Axum web server bridging dashboard screens to one playback controller.

use std::net::SocketAddr;

use autonomity_playback::{InitParams, Outcome, PlaybackController, PlaybackView};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::events::{Command, WsMessage};

/// Dashboard bridge server.
pub struct DashServer {
    playback: PlaybackController,
}

impl DashServer {
    /// Serve the given controller.
    pub fn new(playback: PlaybackController) -> Self {
        Self { playback }
    }

    /// Build the router for the server.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            // Playback intents
            .route("/api/playback", get(view_handler))
            .route("/api/playback/init", post(init_handler))
            .route("/api/playback/step", post(step_handler))
            .route("/api/playback/auto-run", post(auto_run_handler))
            .route("/api/playback/pause", post(pause_handler))
            .route("/api/playback/jump", post(jump_handler))
            .route("/api/playback/crash", post(crash_handler))
            .route("/api/playback/refresh", post(refresh_handler))
            .route("/api/playback/settings", post(settings_handler))
            // WebSocket for view updates
            .route("/ws", get(ws_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.playback.clone())
    }

    /// Run the server until ctrl-c.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Dashboard bridge running on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Reply to every intent: what happened, and the view afterwards.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub outcome: Outcome,
    pub view: PlaybackView,
}

async fn respond(playback: &PlaybackController, command: Command) -> Json<CommandResponse> {
    let name = command.name();
    let outcome = command.apply(playback).await;
    debug!(command = name, ?outcome, "intent handled");
    Json(CommandResponse {
        outcome,
        view: playback.view(),
    })
}

async fn view_handler(State(playback): State<PlaybackController>) -> Json<PlaybackView> {
    Json(playback.view())
}

async fn init_handler(
    State(playback): State<PlaybackController>,
    Json(params): Json<InitParams>,
) -> Json<CommandResponse> {
    respond(&playback, Command::Init(params)).await
}

#[derive(Deserialize)]
struct StepRequest {
    #[serde(default)]
    count: Option<u32>,
}

async fn step_handler(
    State(playback): State<PlaybackController>,
    Json(req): Json<StepRequest>,
) -> Json<CommandResponse> {
    respond(&playback, Command::Step { count: req.count }).await
}

async fn auto_run_handler(State(playback): State<PlaybackController>) -> Json<CommandResponse> {
    respond(&playback, Command::AutoRun).await
}

async fn pause_handler(State(playback): State<PlaybackController>) -> Json<CommandResponse> {
    respond(&playback, Command::Pause).await
}

#[derive(Deserialize)]
struct JumpRequest {
    step: u64,
}

async fn jump_handler(
    State(playback): State<PlaybackController>,
    Json(req): Json<JumpRequest>,
) -> Json<CommandResponse> {
    respond(&playback, Command::Jump { step: req.step }).await
}

async fn crash_handler(State(playback): State<PlaybackController>) -> Json<CommandResponse> {
    respond(&playback, Command::Crash).await
}

async fn refresh_handler(State(playback): State<PlaybackController>) -> Json<CommandResponse> {
    respond(&playback, Command::Refresh).await
}

#[derive(Deserialize)]
struct SettingsRequest {
    #[serde(default)]
    speed_ms: Option<u64>,
    #[serde(default)]
    batch_size: Option<u32>,
}

async fn settings_handler(
    State(playback): State<PlaybackController>,
    Json(req): Json<SettingsRequest>,
) -> Json<CommandResponse> {
    let command = Command::Settings {
        speed_ms: req.speed_ms,
        batch_size: req.batch_size,
    };
    respond(&playback, command).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(playback): State<PlaybackController>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, playback))
}

async fn send(socket: &mut WebSocket, msg: &WsMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}

/// Push every published view and run commands without blocking the stream.
///
/// Commands run in their own tasks so a slow jump neither delays view updates
/// nor queues a second jump behind it; the controller's guards decide.
async fn handle_ws(mut socket: WebSocket, playback: PlaybackController) {
    info!("dashboard client connected");
    let mut views = playback.subscribe();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WsMessage>();

    let initial = WsMessage::View(views.borrow_and_update().clone());
    if let Err(e) = send(&mut socket, &initial).await {
        warn!("Failed to send initial view: {}", e);
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Command>(text.as_str()) {
                            Ok(command) => {
                                let playback = playback.clone();
                                let done_tx = done_tx.clone();
                                tokio::spawn(async move {
                                    let name = command.name();
                                    let outcome = command.apply(&playback).await;
                                    let _ = done_tx.send(WsMessage::Outcome { command: name, outcome });
                                });
                            }
                            Err(e) => {
                                let invalid = WsMessage::Invalid { message: e.to_string() };
                                if send(&mut socket, &invalid).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = WsMessage::View(views.borrow_and_update().clone());
                if send(&mut socket, &view).await.is_err() {
                    break;
                }
            }
            Some(done) = done_rx.recv() => {
                if send(&mut socket, &done).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("dashboard client disconnected");
}
