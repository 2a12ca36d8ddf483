//! In-process stand-in for the simulation service.
//!
//! [`MemorySimulation`] follows the service's cursor rules (init resets to
//! step 0, step advances until the window is exhausted, jump replays to a
//! clamped target, crash marks the market as crashed) without any market
//! model behind it. Per-operation latency and scripted failures make it
//! suitable for exercising the controller's timing guarantees.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map};

use crate::client::SimulationApi;
use crate::config::MAX_BATCH_SIZE;
use crate::error::{Error, Result};
use crate::snapshot::{InitParams, Snapshot};

/// Remote operations, for latency, failure and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Init,
    Step,
    AutoStep,
    Jump,
    Crash,
    ReadState,
}

#[derive(Debug)]
struct Run {
    params: InitParams,
    step: u64,
    crash_active: bool,
}

#[derive(Debug, Default)]
struct Book {
    run: Option<Run>,
    latency: HashMap<Op, Duration>,
    failures: HashMap<Op, VecDeque<String>>,
    calls: HashMap<Op, usize>,
    in_flight: HashMap<Op, usize>,
    peak_in_flight: HashMap<Op, usize>,
    jump_targets: Vec<u64>,
}

/// In-memory [`SimulationApi`].
#[derive(Debug)]
pub struct MemorySimulation {
    max_steps: u64,
    book: Mutex<Book>,
}

impl MemorySimulation {
    /// A service whose every run spans `max_steps` steps.
    pub fn new(max_steps: u64) -> Self {
        Self {
            max_steps,
            book: Mutex::new(Book::default()),
        }
    }

    /// Delay every call of `op` by `latency`.
    #[must_use]
    pub fn with_latency(self, op: Op, latency: Duration) -> Self {
        self.lock().latency.insert(op, latency);
        self
    }

    /// Make the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: Op, message: impl Into<String>) {
        self.lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Number of calls of `op` received so far.
    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Highest number of concurrently outstanding calls of `op`.
    pub fn peak_in_flight(&self, op: Op) -> usize {
        self.lock().peak_in_flight.get(&op).copied().unwrap_or(0)
    }

    /// Targets of every jump received, in arrival order.
    pub fn jump_targets(&self) -> Vec<u64> {
        self.lock().jump_targets.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for a call and wait out its latency.
    async fn enter(&self, op: Op) -> Result<()> {
        let latency = {
            let mut book = self.lock();
            *book.calls.entry(op).or_default() += 1;
            let in_flight = book.in_flight.entry(op).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let peak = book.peak_in_flight.entry(op).or_default();
            *peak = (*peak).max(current);
            book.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut book = self.lock();
        if let Some(count) = book.in_flight.get_mut(&op) {
            *count = count.saturating_sub(1);
        }
        match book.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(message) => Err(Error::Server {
                status: Some(400),
                message,
            }),
            None => Ok(()),
        }
    }

    fn with_run(&self, f: impl FnOnce(&mut Run, u64)) -> Result<Snapshot> {
        let mut book = self.lock();
        let run = book.run.as_mut().ok_or_else(|| Error::Server {
            status: Some(400),
            message: "Simulation not initialised. Call /api/init first.".into(),
        })?;
        f(run, self.max_steps);
        Ok(self.snapshot(run))
    }

    fn snapshot(&self, run: &Run) -> Snapshot {
        let mut payload = Map::new();
        payload.insert("ticker".into(), json!(run.params.ticker));
        payload.insert("period".into(), json!(run.params.period));
        payload.insert("interval".into(), json!(run.params.interval));
        Snapshot {
            step: run.step,
            max_steps: self.max_steps,
            finished: run.step >= self.max_steps,
            crash_active: run.crash_active,
            payload,
        }
    }

    fn advance(&self, count: u32) -> Result<Snapshot> {
        self.with_run(|run, max_steps| {
            run.step = (run.step + u64::from(count.max(1))).min(max_steps);
        })
    }
}

#[async_trait]
impl SimulationApi for MemorySimulation {
    async fn init(&self, params: &InitParams) -> Result<Snapshot> {
        self.enter(Op::Init).await?;
        let run = Run {
            params: params.clone(),
            step: 0,
            crash_active: false,
        };
        let snapshot = self.snapshot(&run);
        self.lock().run = Some(run);
        Ok(snapshot)
    }

    async fn step(&self, count: u32) -> Result<Snapshot> {
        self.enter(Op::Step).await?;
        self.advance(count)
    }

    async fn auto_step(&self, steps: u32) -> Result<Snapshot> {
        self.enter(Op::AutoStep).await?;
        self.advance(steps.min(MAX_BATCH_SIZE))
    }

    async fn jump(&self, step: u64) -> Result<Snapshot> {
        self.lock().jump_targets.push(step);
        self.enter(Op::Jump).await?;
        self.with_run(|run, max_steps| {
            let target = step.min(max_steps.saturating_sub(1));
            if target <= run.step {
                run.crash_active = false;
            }
            run.step = target;
        })
    }

    async fn crash(&self) -> Result<Snapshot> {
        self.enter(Op::Crash).await?;
        self.with_run(|run, _| run.crash_active = true)
    }

    async fn read_state(&self) -> Result<Snapshot> {
        self.enter(Op::ReadState).await?;
        self.with_run(|_, _| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requires_init() {
        let sim = MemorySimulation::new(10);
        let err = sim.step(1).await.unwrap_err();
        assert!(err.is_server());
        assert_eq!(sim.calls(Op::Step), 1);
    }

    #[tokio::test]
    async fn step_stops_at_window_end() {
        let sim = MemorySimulation::new(10);
        sim.init(&InitParams::default()).await.unwrap();
        let snap = sim.step(7).await.unwrap();
        assert_eq!(snap.step, 7);
        assert!(!snap.finished);
        let snap = sim.auto_step(50).await.unwrap();
        assert_eq!(snap.step, 10);
        assert!(snap.finished);
    }

    #[tokio::test]
    async fn jump_rewinds_and_clears_crash() {
        let sim = MemorySimulation::new(10);
        sim.init(&InitParams::default()).await.unwrap();
        sim.step(6).await.unwrap();
        assert!(sim.crash().await.unwrap().crash_active);

        let snap = sim.jump(2).await.unwrap();
        assert_eq!(snap.step, 2);
        assert!(!snap.crash_active);

        let snap = sim.jump(99).await.unwrap();
        assert_eq!(snap.step, 9);
        assert_eq!(sim.jump_targets(), vec![2, 99]);
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let sim = MemorySimulation::new(10);
        sim.init(&InitParams::default()).await.unwrap();
        sim.fail_next(Op::Step, "rate limited");
        assert_eq!(sim.step(1).await.unwrap_err().user_message(), "rate limited");
        assert_eq!(sim.step(1).await.unwrap().step, 1);
    }
}
