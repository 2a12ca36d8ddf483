//! Playback controller for a remote simulation run.
//!
//! [`PlaybackController`] is the single owner of playback status. Every user
//! intent (init, step, auto-run, pause, jump, crash) goes through one guarded
//! transition plus at most one call to the [`SimulationApi`], and every
//! resulting change is published as a [`PlaybackView`] on a watch channel.
//!
//! # Status machine
//!
//! ```text
//! idle    --init(ok)-->             paused
//! idle    --init(fail)-->           idle
//! paused  --auto_run-->             running
//! running --pause-->                paused
//! running --step(fail)-->           paused
//! paused  --step(ok, finished)-->   finished
//! running --step(ok, finished)-->   finished
//! !idle   --jump-->                 paused | finished
//! ```
//!
//! `finished` is terminal for step and auto-run; jump stays available so the
//! explored history can still be reviewed.
//!
//! # Scheduling
//!
//! Auto-run is a self-rescheduling chain: the next tick is only armed once
//! the previous step has settled, so two auto-run steps are never in flight
//! at once. Pausing cancels the next tick, not the request already sent; its
//! reply is still applied because the service's state is canonical.
//!
//! State sits behind a mutex that is never held across an `.await`, which
//! makes each transition atomic with respect to the cooperative scheduler.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::SimulationApi;
use crate::config::{clamp_batch, clamp_speed, PlaybackConfig};
use crate::error::Error;
use crate::snapshot::{InitParams, Snapshot};

/// Playback status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    /// No run loaded (or the last init failed).
    Idle,
    /// Run loaded, not advancing on its own.
    Paused,
    /// Auto-run is stepping the run.
    Running,
    /// The run reached the end of its window.
    Finished,
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Paused => write!(f, "paused"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Why a request was dropped without contacting the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// No run has been loaded yet.
    NotInitialised,
    /// The operation is not valid in the current status.
    InvalidStatus { status: PlaybackStatus },
    /// Jump target lies beyond the furthest step observed.
    BeyondExplored { target: u64, max_reached: u64 },
    /// Another jump has not settled yet.
    JumpInFlight,
    /// A step of zero was requested.
    ZeroSteps,
    /// Auto-run already has a live timer.
    AlreadyRunning,
    /// The reply belongs to a run replaced by a later init.
    Superseded,
    /// The controller has been disposed.
    Disposed,
}

/// Result of a controller operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// The transition happened.
    Applied,
    /// The service call failed; `message` is now the view's `last_error`.
    Failed { message: String },
    /// The request was ignored. Never surfaced as an error.
    Rejected { reason: Rejection },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected { .. })
    }
}

/// Everything the presentation layer needs to render playback.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackView {
    pub status: PlaybackStatus,
    pub speed_ms: u64,
    pub batch_size: u32,
    /// Furthest step returned since the last successful init.
    pub max_reached_step: u64,
    /// Last step explicitly jumped to.
    pub highlight_step: Option<u64>,
    pub jump_in_flight: bool,
    pub last_error: Option<String>,
    /// Lit for a fixed window after a successful crash.
    pub crash_flash: bool,
    pub auto_running: bool,
    pub snapshot: Option<Arc<Snapshot>>,
}

/// A spawned timer task and the id that tells it whether it is still current.
#[derive(Debug)]
struct Timer {
    id: u64,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct PlaybackState {
    status: PlaybackStatus,
    speed_ms: u64,
    batch_size: u32,
    max_reached_step: u64,
    highlight_step: Option<u64>,
    last_error: Option<String>,
    snapshot: Option<Arc<Snapshot>>,
    jump_in_flight: bool,
    timer: Option<Timer>,
    /// An auto-run step has been sent and not yet settled. Outlives the
    /// chain that sent it, so a restarted chain waits for it.
    tick_in_flight: bool,
    crash_flash: bool,
    flash: Option<Timer>,
    next_task_id: u64,
    timers_started: u64,
    epoch: u64,
    disposed: bool,
}

impl PlaybackState {
    fn new(config: &PlaybackConfig) -> Self {
        Self {
            status: PlaybackStatus::Idle,
            speed_ms: clamp_speed(config.speed_ms),
            batch_size: clamp_batch(config.batch_size),
            max_reached_step: 0,
            highlight_step: None,
            last_error: None,
            snapshot: None,
            jump_in_flight: false,
            timer: None,
            tick_in_flight: false,
            crash_flash: false,
            flash: None,
            next_task_id: 0,
            timers_started: 0,
            epoch: 0,
            disposed: false,
        }
    }

    fn view(&self) -> PlaybackView {
        PlaybackView {
            status: self.status,
            speed_ms: self.speed_ms,
            batch_size: self.batch_size,
            max_reached_step: self.max_reached_step,
            highlight_step: self.highlight_step,
            jump_in_flight: self.jump_in_flight,
            last_error: self.last_error.clone(),
            crash_flash: self.crash_flash,
            auto_running: self.timer.is_some(),
            snapshot: self.snapshot.clone(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Cancel the auto-run timer. Returns whether one was live.
    fn stop_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    fn stop_flash(&mut self) {
        if let Some(flash) = self.flash.take() {
            flash.task.abort();
        }
    }

    fn is_live_timer(&self, id: u64) -> bool {
        self.status == PlaybackStatus::Running && self.timer.as_ref().map(|t| t.id) == Some(id)
    }

    /// Replace the snapshot wholesale and raise the watermark.
    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.max_reached_step = self.max_reached_step.max(snapshot.step);
        let snapshot = Arc::new(snapshot);
        self.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    fn finish(&mut self, step: u64) {
        self.stop_timer();
        if self.status != PlaybackStatus::Finished {
            info!(step, "run finished");
        }
        self.status = PlaybackStatus::Finished;
    }

    fn fail(&mut self, op: &'static str, err: &Error) -> Outcome {
        let message = err.user_message();
        warn!(op, error = %message, "simulation call failed");
        self.last_error = Some(message.clone());
        Outcome::Failed { message }
    }

    fn check_live(&self) -> Result<u64, Rejection> {
        if self.disposed {
            Err(Rejection::Disposed)
        } else {
            Ok(self.epoch)
        }
    }

    fn check_active(&self) -> Result<u64, Rejection> {
        let epoch = self.check_live()?;
        match self.status {
            PlaybackStatus::Paused | PlaybackStatus::Running => Ok(epoch),
            status => Err(Rejection::InvalidStatus { status }),
        }
    }
}

fn rejected(op: &'static str, reason: Rejection) -> Outcome {
    debug!(op, ?reason, "request ignored");
    Outcome::Rejected { reason }
}

struct Shared {
    client: Arc<dyn SimulationApi>,
    crash_flash: Duration,
    state: Mutex<PlaybackState>,
    view_tx: watch::Sender<PlaybackView>,
    /// Woken whenever an auto-run step settles.
    tick_settled: Arc<Notify>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R>(&self, f: impl FnOnce(&PlaybackState) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate state and publish the resulting view.
    fn update<R>(&self, f: impl FnOnce(&mut PlaybackState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        self.view_tx.send_replace(state.view());
        result
    }

    async fn init(self: &Arc<Self>, params: InitParams) -> Outcome {
        let live = self.update(|state| -> Result<(), Rejection> {
            state.check_live()?;
            if state.stop_timer() {
                debug!("auto-run cancelled by init");
            }
            if state.status == PlaybackStatus::Running {
                state.status = PlaybackStatus::Paused;
            }
            Ok(())
        });
        if let Err(reason) = live {
            return rejected("init", reason);
        }

        info!(ticker = %params.ticker, period = %params.period, interval = %params.interval, "initialising run");
        let result = self.client.init(&params).await;

        self.update(|state| {
            state.stop_timer();
            match result {
                Ok(snapshot) => {
                    state.epoch += 1;
                    state.max_reached_step = 0;
                    state.highlight_step = None;
                    state.last_error = None;
                    let snapshot = state.apply_snapshot(snapshot);
                    state.status = PlaybackStatus::Paused;
                    info!(step = snapshot.step, max_steps = snapshot.max_steps, "run initialised");
                    Outcome::Applied
                }
                Err(err) => {
                    state.status = PlaybackStatus::Idle;
                    state.fail("init", &err)
                }
            }
        })
    }

    async fn step(self: &Arc<Self>, count: Option<u32>) -> Outcome {
        let checked = self.read(|state| -> Result<(u32, u64), Rejection> {
            let epoch = state.check_active()?;
            match count.unwrap_or(state.batch_size) {
                0 => Err(Rejection::ZeroSteps),
                count => Ok((count, epoch)),
            }
        });
        let (count, epoch) = match checked {
            Ok(checked) => checked,
            Err(reason) => return rejected("step", reason),
        };

        let result = self.client.step(count).await;

        self.update(|state| {
            if state.epoch != epoch {
                return rejected("step", Rejection::Superseded);
            }
            match result {
                Ok(snapshot) => {
                    let snapshot = state.apply_snapshot(snapshot);
                    debug!(step = snapshot.step, "stepped");
                    if snapshot.finished {
                        state.finish(snapshot.step);
                    }
                    Outcome::Applied
                }
                Err(err) => {
                    if state.stop_timer() {
                        state.status = PlaybackStatus::Paused;
                        info!("auto-run stopped after failed step");
                    }
                    state.fail("step", &err)
                }
            }
        })
    }

    fn auto_run(self: &Arc<Self>) -> Outcome {
        let mut state = self.lock();
        if let Err(reason) = state.check_live() {
            return rejected("auto_run", reason);
        }
        if state.timer.is_some() {
            return rejected("auto_run", Rejection::AlreadyRunning);
        }
        if state.status != PlaybackStatus::Paused {
            return rejected("auto_run", Rejection::InvalidStatus { status: state.status });
        }

        let id = state.next_id();
        state.status = PlaybackStatus::Running;
        state.timers_started += 1;
        let task = tokio::spawn(run_ticker(Arc::downgrade(self), id));
        state.timer = Some(Timer { id, task });
        info!(speed_ms = state.speed_ms, batch_size = state.batch_size, "auto-run started");

        self.view_tx.send_replace(state.view());
        Outcome::Applied
    }

    fn pause(&self) -> Outcome {
        self.update(|state| {
            let stopped = state.stop_timer();
            if state.status == PlaybackStatus::Running {
                state.status = PlaybackStatus::Paused;
            }
            if stopped {
                info!("auto-run paused");
            }
            Outcome::Applied
        })
    }

    async fn jump(self: &Arc<Self>, target: u64) -> Outcome {
        let acquired = {
            let mut state = self.lock();
            let checked = state.check_live().and_then(|epoch| {
                if state.status == PlaybackStatus::Idle {
                    Err(Rejection::NotInitialised)
                } else if target > state.max_reached_step {
                    Err(Rejection::BeyondExplored {
                        target,
                        max_reached: state.max_reached_step,
                    })
                } else if state.jump_in_flight {
                    Err(Rejection::JumpInFlight)
                } else {
                    Ok(epoch)
                }
            });
            checked.map(|epoch| {
                state.jump_in_flight = true;
                if state.stop_timer() {
                    state.status = PlaybackStatus::Paused;
                    info!("auto-run interrupted by jump");
                }
                self.view_tx.send_replace(state.view());
                epoch
            })
        };
        let epoch = match acquired {
            Ok(epoch) => epoch,
            Err(reason) => return rejected("jump", reason),
        };
        let mut guard = JumpGuard {
            shared: Arc::as_ref(self),
            armed: true,
        };

        debug!(target, "jumping");
        let result = self.client.jump(target).await;

        let outcome = self.update(|state| {
            state.jump_in_flight = false;
            if state.epoch != epoch {
                return rejected("jump", Rejection::Superseded);
            }
            match result {
                Ok(snapshot) => {
                    let snapshot = state.apply_snapshot(snapshot);
                    state.highlight_step = Some(target);
                    if snapshot.finished {
                        state.finish(snapshot.step);
                    }
                    Outcome::Applied
                }
                Err(err) => state.fail("jump", &err),
            }
        });
        guard.armed = false;
        outcome
    }

    async fn crash(self: &Arc<Self>) -> Outcome {
        let epoch = match self.read(PlaybackState::check_active) {
            Ok(epoch) => epoch,
            Err(reason) => return rejected("crash", reason),
        };

        info!("triggering crash");
        let result = self.client.crash().await;

        self.update(|state| {
            if state.epoch != epoch {
                return rejected("crash", Rejection::Superseded);
            }
            match result {
                Ok(snapshot) => {
                    state.apply_snapshot(snapshot);
                    self.arm_flash(state);
                    Outcome::Applied
                }
                Err(err) => state.fail("crash", &err),
            }
        })
    }

    /// Light the crash flash and (re)start its window.
    fn arm_flash(self: &Arc<Self>, state: &mut PlaybackState) {
        state.stop_flash();
        state.crash_flash = true;
        let id = state.next_id();
        let shared = Arc::downgrade(self);
        let window = self.crash_flash;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(shared) = shared.upgrade() {
                shared.update(|state| {
                    if state.flash.as_ref().map(|f| f.id) == Some(id) {
                        state.flash = None;
                        state.crash_flash = false;
                    }
                });
            }
        });
        state.flash = Some(Timer { id, task });
    }

    async fn refresh(self: &Arc<Self>) -> Outcome {
        let epoch = match self.read(PlaybackState::check_live) {
            Ok(epoch) => epoch,
            Err(reason) => return rejected("refresh", reason),
        };

        let result = self.client.read_state().await;

        self.update(|state| {
            if state.epoch != epoch {
                return rejected("refresh", Rejection::Superseded);
            }
            match result {
                Ok(snapshot) => {
                    let snapshot = state.apply_snapshot(snapshot);
                    if state.status == PlaybackStatus::Idle {
                        state.status = PlaybackStatus::Paused;
                        info!(step = snapshot.step, "attached to existing run");
                    }
                    if snapshot.finished {
                        state.finish(snapshot.step);
                    }
                    Outcome::Applied
                }
                Err(err) => state.fail("refresh", &err),
            }
        })
    }

    fn dispose(&self) {
        self.update(|state| {
            state.disposed = true;
            state.stop_timer();
            state.stop_flash();
            state.crash_flash = false;
            if state.status == PlaybackStatus::Running {
                state.status = PlaybackStatus::Paused;
            }
        });
        debug!("playback controller disposed");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.stop_timer();
        state.stop_flash();
    }
}

/// Releases the jump guard on every exit path, including cancellation.
struct JumpGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for JumpGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.update(|state| state.jump_in_flight = false);
        }
    }
}

/// Clears `tick_in_flight` when an auto-run step settles, however it exits.
struct TickGuard(Arc<Shared>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.lock().tick_in_flight = false;
        self.0.tick_settled.notify_waiters();
    }
}

/// Wait until no auto-run step is in flight. Returns false once the
/// controller is gone.
async fn wait_for_tick(shared: &Weak<Shared>) -> bool {
    loop {
        let Some(strong) = shared.upgrade() else { return false };
        let notify = Arc::clone(&strong.tick_settled);
        let settled = notify.notified();
        let busy = strong.read(|state| state.tick_in_flight);
        drop(strong);
        if !busy {
            return true;
        }
        debug!("auto-run waiting for previous step");
        settled.await;
    }
}

/// Auto-run loop: wait `speed_ms`, run one step to completion, repeat.
///
/// The step runs in its own task so that aborting this loop (pause, jump,
/// init) never cancels a request already sent. A chain started while an
/// earlier chain's step is still out waits for it before its first sleep.
async fn run_ticker(shared: Weak<Shared>, id: u64) {
    if !wait_for_tick(&shared).await {
        return;
    }
    loop {
        let delay = match shared.upgrade() {
            Some(shared) => shared.read(|state| {
                state
                    .is_live_timer(id)
                    .then(|| Duration::from_millis(state.speed_ms))
            }),
            None => None,
        };
        let Some(delay) = delay else { return };

        tokio::time::sleep(delay).await;

        let Some(strong) = shared.upgrade() else { return };
        let armed = {
            let mut state = strong.lock();
            let live = state.is_live_timer(id);
            if live {
                state.tick_in_flight = true;
            }
            live
        };
        if !armed {
            return;
        }
        debug!(timer = id, "auto-run tick");
        let tick = tokio::spawn(async move {
            let guard = TickGuard(strong);
            guard.0.step(None).await
        });
        if tick.await.is_err() {
            return;
        }
    }
}

/// Owns playback status for one simulation session.
///
/// Cloning yields another handle to the same controller. Timers are tied to
/// the controller's lifetime: [`dispose`](Self::dispose) or dropping the last
/// handle cancels them.
///
/// Operations that start timers must be called from within a tokio runtime.
#[derive(Clone)]
pub struct PlaybackController {
    shared: Arc<Shared>,
}

impl PlaybackController {
    /// Create a controller in the `idle` status.
    pub fn new(client: Arc<dyn SimulationApi>, config: PlaybackConfig) -> Self {
        let state = PlaybackState::new(&config);
        let (view_tx, _) = watch::channel(state.view());
        Self {
            shared: Arc::new(Shared {
                client,
                crash_flash: config.crash_flash,
                state: Mutex::new(state),
                view_tx,
                tick_settled: Arc::new(Notify::new()),
            }),
        }
    }

    /// Current view.
    pub fn view(&self) -> PlaybackView {
        self.shared.view_tx.borrow().clone()
    }

    /// Receive every published view.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackView> {
        self.shared.view_tx.subscribe()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.read(|state| state.status)
    }

    /// Auto-run timers created over the controller's lifetime.
    pub fn timers_started(&self) -> u64 {
        self.shared.read(|state| state.timers_started)
    }

    /// Auto-run timers alive right now (0 or 1).
    pub fn live_timers(&self) -> usize {
        self.shared.read(|state| usize::from(state.timer.is_some()))
    }

    /// Change the auto-run cadence; takes effect from the next tick.
    pub fn set_speed_ms(&self, speed_ms: u64) {
        self.shared.update(|state| state.speed_ms = clamp_speed(speed_ms));
    }

    /// Change the default step count.
    pub fn set_batch_size(&self, batch_size: u32) {
        self.shared.update(|state| state.batch_size = clamp_batch(batch_size));
    }

    /// Load a new run, cancelling any auto-run first.
    pub async fn init(&self, params: InitParams) -> Outcome {
        self.shared.init(params).await
    }

    /// Advance by `count` steps (the batch size when `None`).
    pub async fn step(&self, count: Option<u32>) -> Outcome {
        self.shared.step(count).await
    }

    /// Start stepping every `speed_ms`. Idempotent.
    pub fn auto_run(&self) -> Outcome {
        self.shared.auto_run()
    }

    /// Stop auto-run after the current step, if any, settles.
    pub fn pause(&self) -> Outcome {
        self.shared.pause()
    }

    /// Scrub to an already visited step.
    pub async fn jump(&self, target: u64) -> Outcome {
        self.shared.jump(target).await
    }

    /// Inject a market crash.
    pub async fn crash(&self) -> Outcome {
        self.shared.crash().await
    }

    /// Re-read the service's current snapshot.
    pub async fn refresh(&self) -> Outcome {
        self.shared.refresh().await
    }

    /// Stop all timers and reject every later request.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackController")
            .field("view", &self.view())
            .finish()
    }
}
