//! HTTP client for the remote simulation service.
//!
//! One method per remote operation, no retries and no state. Every reply is
//! decoded with [`decode_reply`], so an `{error}` body surfaces exactly like a
//! transport failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use tracing::debug;

use crate::config::{ClientConfig, MAX_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::snapshot::{decode_reply, InitParams, Snapshot};

/// The operations the simulation service exposes.
///
/// [`PlaybackController`](crate::PlaybackController) depends on this trait
/// rather than on [`SimulationClient`], so tests and alternative transports
/// can stand in for the HTTP service.
#[async_trait]
pub trait SimulationApi: Send + Sync {
    /// Reset the server-side run.
    async fn init(&self, params: &InitParams) -> Result<Snapshot>;

    /// Advance by `count` steps.
    async fn step(&self, count: u32) -> Result<Snapshot>;

    /// Batch variant of `step`; the service caps it at 200.
    async fn auto_step(&self, steps: u32) -> Result<Snapshot>;

    /// Replay the run to an already visited step.
    async fn jump(&self, step: u64) -> Result<Snapshot>;

    /// Inject a market crash.
    async fn crash(&self) -> Result<Snapshot>;

    /// Read the current snapshot without changing it.
    async fn read_state(&self) -> Result<Snapshot>;
}

/// [`SimulationApi`] over HTTP.
#[derive(Clone)]
pub struct SimulationClient {
    client: Client,
    config: ClientConfig,
}

impl SimulationClient {
    /// Build a client for the configured service.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client, config })
    }

    /// Configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, timeout: Duration) -> Result<Snapshot> {
        let resp = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| classify(e, timeout))?;
        decode_reply(status, &body)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout(timeout)
    } else {
        Error::Transport(err)
    }
}

#[async_trait]
impl SimulationApi for SimulationClient {
    async fn init(&self, params: &InitParams) -> Result<Snapshot> {
        debug!(ticker = %params.ticker, period = %params.period, interval = %params.interval, "POST /api/init");
        let request = self.client.post(self.url("/api/init")).json(params);
        self.send(request, self.config.timeout).await
    }

    async fn step(&self, count: u32) -> Result<Snapshot> {
        debug!(count, "POST /api/step");
        let request = self
            .client
            .post(self.url("/api/step"))
            .query(&[("n", count)])
            .json(&json!({}));
        self.send(request, self.config.timeout).await
    }

    async fn auto_step(&self, steps: u32) -> Result<Snapshot> {
        let steps = steps.clamp(1, MAX_BATCH_SIZE);
        debug!(steps, "POST /api/auto-step");
        let request = self
            .client
            .post(self.url("/api/auto-step"))
            .json(&json!({ "steps": steps }));
        self.send(request, self.config.timeout).await
    }

    async fn jump(&self, step: u64) -> Result<Snapshot> {
        debug!(step, "POST /api/jump");
        let request = self
            .client
            .post(self.url("/api/jump"))
            .json(&json!({ "step": step }));
        self.send(request, self.config.jump_timeout).await
    }

    async fn crash(&self) -> Result<Snapshot> {
        debug!("POST /api/trigger-crash");
        let request = self
            .client
            .post(self.url("/api/trigger-crash"))
            .json(&json!({}));
        self.send(request, self.config.timeout).await
    }

    async fn read_state(&self) -> Result<Snapshot> {
        debug!("GET /api/state");
        let request = self.client.get(self.url("/api/state"));
        self.send(request, self.config.timeout).await
    }
}
