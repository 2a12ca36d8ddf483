//! Simulation snapshots and run parameters.
//!
//! A [`Snapshot`] is the service's complete, authoritative report of a run at
//! one step. The controller only reads the cursor fields; everything else is
//! carried through to the dashboard untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// State of the simulation at a given step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current simulation cursor.
    pub step: u64,
    /// Number of steps in the loaded historical window.
    pub max_steps: u64,
    /// True once `step` reaches the end of the window.
    #[serde(default)]
    pub finished: bool,
    /// True while an injected crash is still affecting the market.
    #[serde(default)]
    pub crash_active: bool,
    /// Price history, trade log, regulation log, agents, risk, ...
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Snapshot {
    /// Create a snapshot with an empty payload.
    pub fn new(step: u64, max_steps: u64) -> Self {
        Self {
            step,
            max_steps,
            finished: step >= max_steps,
            crash_active: false,
            payload: Map::new(),
        }
    }

    /// Look up an opaque payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Fraction of the window already simulated (0.0 - 1.0).
    pub fn progress(&self) -> f64 {
        if self.max_steps == 0 {
            0.0
        } else {
            (self.step.min(self.max_steps)) as f64 / self.max_steps as f64
        }
    }
}

/// Decode a service reply into a snapshot.
///
/// Any body with a top-level `error` field is a server error regardless of
/// the HTTP status. Non-2xx replies without one still fail.
pub fn decode_reply(status: u16, body: &[u8]) -> Result<Snapshot> {
    let success = (200..300).contains(&status);
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) if !success => {
            return Err(Error::Server {
                status: Some(status),
                message: format!("HTTP {}", status),
            })
        }
        Err(e) => return Err(Error::Decode(e)),
    };

    if let Some(err) = value.get("error") {
        let message = match err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(Error::Server {
            status: Some(status),
            message,
        });
    }

    if !success {
        return Err(Error::Server {
            status: Some(status),
            message: format!("HTTP {}", status),
        });
    }

    Ok(serde_json::from_value(value)?)
}

/// Trading agents known to the simulation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Conservative,
    Momentum,
    MeanReversion,
    NoiseTrader,
    Adversarial,
}

impl AgentKind {
    /// Every agent, in service registry order.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Conservative,
        AgentKind::Momentum,
        AgentKind::MeanReversion,
        AgentKind::NoiseTrader,
        AgentKind::Adversarial,
    ];
}

/// Parameters for (re)initializing a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    /// Ticker symbol, e.g. `AAPL`.
    pub ticker: String,
    /// Historical window, e.g. `5d`.
    pub period: String,
    /// Candle interval, e.g. `5m`.
    pub interval: String,
    /// Agents taking part. `None` lets the service enable all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agents: Option<Vec<AgentKind>>,
    /// Per-agent parameter overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_params: Option<BTreeMap<AgentKind, Map<String, Value>>>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self::new("AAPL", "5d", "5m")
    }
}

impl InitParams {
    pub fn new(ticker: impl Into<String>, period: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            period: period.into(),
            interval: interval.into(),
            active_agents: None,
            agent_params: None,
        }
    }

    /// Restrict the run to the given agents.
    #[must_use]
    pub fn with_agents(mut self, agents: impl IntoIterator<Item = AgentKind>) -> Self {
        self.active_agents = Some(agents.into_iter().collect());
        self
    }

    /// Override parameters for one agent.
    #[must_use]
    pub fn with_agent_params(mut self, agent: AgentKind, params: Map<String, Value>) -> Self {
        self.agent_params
            .get_or_insert_with(BTreeMap::new)
            .insert(agent, params);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_keeps_payload_opaque() {
        let body = json!({
            "step": 3,
            "max_steps": 78,
            "finished": false,
            "crash_active": true,
            "ticker": "AAPL",
            "price_history": [{"Close": 190.5}],
        });
        let snap = decode_reply(200, body.to_string().as_bytes()).unwrap();
        assert_eq!(snap.step, 3);
        assert_eq!(snap.max_steps, 78);
        assert!(snap.crash_active);
        assert_eq!(snap.field("ticker"), Some(&json!("AAPL")));

        let back = serde_json::to_value(&snap).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn error_field_is_a_server_error_on_any_status() {
        let err = decode_reply(200, br#"{"error":"Simulation not initialised."}"#).unwrap_err();
        assert_eq!(err.user_message(), "Simulation not initialised.");

        let err = decode_reply(400, br#"{"error":"rate limited"}"#).unwrap_err();
        match err {
            Error::Server { status, message } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_success_without_body_is_server_error() {
        let err = decode_reply(502, b"<html>Bad Gateway</html>").unwrap_err();
        assert_eq!(err.user_message(), "HTTP 502");
    }

    #[test]
    fn missing_cursor_is_decode_error() {
        let err = decode_reply(200, br#"{"ticker":"AAPL"}"#).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn init_params_omit_absent_options() {
        let params = InitParams::default();
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, json!({"ticker": "AAPL", "period": "5d", "interval": "5m"}));

        let mut risk = Map::new();
        risk.insert("risk_pct".into(), json!(0.05));
        let params = InitParams::new("MSFT", "1mo", "1h")
            .with_agents([AgentKind::Conservative, AgentKind::MeanReversion])
            .with_agent_params(AgentKind::Conservative, risk);
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["active_agents"], json!(["conservative", "meanreversion"]));
        assert_eq!(value["agent_params"]["conservative"]["risk_pct"], json!(0.05));
    }

    #[test]
    fn progress_is_bounded() {
        assert_eq!(Snapshot::new(0, 0).progress(), 0.0);
        assert_eq!(Snapshot::new(39, 78).progress(), 0.5);
        assert_eq!(Snapshot::new(78, 78).progress(), 1.0);
        assert!(Snapshot::new(78, 78).finished);
    }
}
