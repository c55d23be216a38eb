//! Broker reachability checks.
//!
//! Each probe opens its own short-lived transport link with a unique client id and no
//! reconnection, waits for the handshake (or a failure) within a timeout, and releases
//! the link again. Probes never touch a [`DeviceSession`](super::session::DeviceSession).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::ControlError;
use super::session::CLOSED_BEFORE_HANDSHAKE;
use super::types::BrokerEndpoint;
use crate::mqtt::{Connector, TransportEvent, TransportLink, TransportOptions};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(4500);

/// Reason reported when no handshake arrived within the probe timeout.
pub const PROBE_TIMEOUT: &str = "timeout";

/// A broker endpoint to check, with a human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCandidate {
    pub label: String,
    pub url: String,
}

impl ProbeCandidate {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub label: String,
    pub url: String,
    pub ok: bool,
    /// Failure reason; `None` when `ok`.
    pub reason: Option<String>,
}

#[state]
#[derive(Debug, Clone)]
pub enum ProbeStage {
    Armed,   // Candidate known, nothing opened yet
    Dialing, // Link opened (or failed to open), handshake pending
    Settled, // Verdict reached, link released
}

/// One reachability check, moved through its stages at compile time.
#[machine]
pub struct BrokerProbe<S: ProbeStage> {
    candidate: ProbeCandidate,
    timeout: Duration,
    link: Option<Arc<dyn TransportLink>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    verdict: Option<Result<(), String>>,
}

impl<S: ProbeStage> BrokerProbe<S> {
    pub fn candidate(&self) -> &ProbeCandidate {
        &self.candidate
    }
}

impl BrokerProbe<Armed> {
    pub fn create(candidate: ProbeCandidate, timeout: Duration) -> Self {
        Self::new(candidate, timeout, None, None, None)
    }

    /// Validates the endpoint and starts the connection attempt.
    ///
    /// Failures to open are recorded and surface from `settle` without waiting.
    pub fn dial(mut self, connector: &dyn Connector) -> BrokerProbe<Dialing> {
        match BrokerEndpoint::parse(&self.candidate.url) {
            Ok(endpoint) => {
                let options = TransportOptions::probe(self.timeout);
                debug!(url = %endpoint, client_id = %options.client_id, "dialing broker");
                match connector.open(&endpoint, &options) {
                    Ok((link, events)) => {
                        self.link = Some(link);
                        self.events = Some(events);
                    }
                    Err(fault) => self.verdict = Some(Err(fault.to_string())),
                }
            }
            Err(err) => {
                let reason = match err {
                    ControlError::InvalidEndpoint { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.verdict = Some(Err(format!("invalid endpoint: {}", reason)));
            }
        }
        self.transition()
    }
}

impl BrokerProbe<Dialing> {
    /// Waits for the handshake outcome, bounded by the probe timeout, then releases
    /// the link whatever the outcome.
    pub async fn settle(mut self) -> BrokerProbe<Settled> {
        if self.verdict.is_none() {
            let verdict = match self.events.as_mut() {
                Some(events) => {
                    match tokio::time::timeout(self.timeout, await_handshake(events)).await {
                        Ok(verdict) => verdict,
                        Err(_) => Err(PROBE_TIMEOUT.to_string()),
                    }
                }
                None => Err(CLOSED_BEFORE_HANDSHAKE.to_string()),
            };
            self.verdict = Some(verdict);
        }

        if let Some(link) = self.link.take() {
            link.end();
        }
        self.events = None;
        self.transition()
    }
}

impl BrokerProbe<Settled> {
    pub fn result(&self) -> ProbeResult {
        let reason = match &self.verdict {
            Some(Ok(())) => None,
            Some(Err(reason)) => Some(reason.clone()),
            None => Some(CLOSED_BEFORE_HANDSHAKE.to_string()),
        };
        ProbeResult {
            label: self.candidate.label.clone(),
            url: self.candidate.url.clone(),
            ok: reason.is_none(),
            reason,
        }
    }
}

async fn await_handshake(events: &mut mpsc::Receiver<TransportEvent>) -> Result<(), String> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => return Ok(()),
            TransportEvent::Error(reason) => return Err(reason),
            TransportEvent::Closed => break,
            TransportEvent::Message(_) => {}
        }
    }
    Err(CLOSED_BEFORE_HANDSHAKE.to_string())
}

/// Checks whether `candidate` accepts a connection within `timeout`.
pub async fn probe(
    connector: &dyn Connector,
    candidate: &ProbeCandidate,
    timeout: Duration,
) -> ProbeResult {
    let result = BrokerProbe::create(candidate.clone(), timeout)
        .dial(connector)
        .settle()
        .await
        .result();

    match &result.reason {
        None => info!(label = %result.label, url = %result.url, "broker reachable"),
        Some(reason) => warn!(
            label = %result.label,
            url = %result.url,
            reason = %reason,
            "broker unreachable"
        ),
    }
    result
}

/// [`probe`] for a bare URL, labelled with the URL itself.
pub async fn probe_url(connector: &dyn Connector, url: &str, timeout: Duration) -> ProbeResult {
    probe(connector, &ProbeCandidate::new(url, url), timeout).await
}

/// Probes every candidate one after another; results keep the input order.
pub async fn probe_all(
    connector: &dyn Connector,
    candidates: &[ProbeCandidate],
    timeout: Duration,
) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        results.push(probe(connector, candidate, timeout).await);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::ScriptedConnector;
    use crate::mqtt::MQTTMessage;
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn candidate(label: &str, url: &str) -> ProbeCandidate {
        ProbeCandidate::new(label, url)
    }

    #[tokio::test]
    async fn handshake_marks_broker_reachable() {
        let connector = ScriptedConnector::new();
        let principal = candidate("Principal", "wss://broker.local/mqtt");
        let (result, ()) = tokio::join!(
            probe(&connector, &principal, DEFAULT_PROBE_TIMEOUT),
            connector.emit(TransportEvent::Connected)
        );

        assert_eq!(
            result,
            ProbeResult {
                label: "Principal".into(),
                url: "wss://broker.local/mqtt".into(),
                ok: true,
                reason: None,
            }
        );
        assert!(connector.ended(0));
    }

    #[tokio::test]
    async fn probe_uses_isolated_transport_options() {
        let connector = ScriptedConnector::new();
        let (_, ()) = tokio::join!(
            probe_url(&connector, "ws://broker.local:8083/mqtt", DEFAULT_PROBE_TIMEOUT),
            connector.emit(TransportEvent::Connected)
        );

        let options = connector.last_options().unwrap();
        assert!(options.client_id.starts_with("remoteline-probe-"));
        assert_eq!(options.reconnect_period, None);
        assert_eq!(options.connect_timeout, DEFAULT_PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let connector = ScriptedConnector::new();
        let (result, ()) = tokio::join!(
            probe_url(&connector, "ws://broker.local", DEFAULT_PROBE_TIMEOUT),
            connector.emit(TransportEvent::Error("connection refused".into()))
        );
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("connection refused"));
        assert!(connector.ended(0));
    }

    #[tokio::test]
    async fn close_before_handshake_is_reported() {
        let connector = ScriptedConnector::new();
        let (result, ()) = tokio::join!(
            probe_url(&connector, "ws://broker.local", DEFAULT_PROBE_TIMEOUT),
            async {
                connector
                    .emit(TransportEvent::Message(MQTTMessage::from_topic("x", "y")))
                    .await;
                connector.emit(TransportEvent::Closed).await;
            }
        );
        assert_eq!(result.reason.as_deref(), Some(CLOSED_BEFORE_HANDSHAKE));
    }

    #[tokio::test]
    async fn invalid_endpoint_fails_without_io() {
        let connector = ScriptedConnector::new();
        let result = probe_url(&connector, "http://broker.local", DEFAULT_PROBE_TIMEOUT).await;

        assert!(!result.ok);
        assert!(result
            .reason
            .as_deref()
            .unwrap()
            .starts_with("invalid endpoint: "));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let connector = ScriptedConnector::new();
        connector.fail_open("bad keepalive");
        let result = probe_url(&connector, "ws://broker.local", DEFAULT_PROBE_TIMEOUT).await;

        assert!(!result.ok);
        assert!(result.reason.unwrap().contains("bad keepalive"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_times_out_within_bound() {
        let connector = ScriptedConnector::new();
        let timeout = Duration::from_millis(1200);

        let started = Instant::now();
        let result = probe_url(&connector, "ws://broker.local", timeout).await;
        let elapsed = started.elapsed();

        assert_eq!(result.reason.as_deref(), Some(PROBE_TIMEOUT));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(50));
        assert!(connector.ended(0));
    }

    #[tokio::test]
    async fn probe_all_preserves_input_order() {
        let connector = ScriptedConnector::new();
        let candidates = vec![
            candidate("first", "ws://one.local"),
            candidate("broken", "not a url"),
            candidate("second", "ws://two.local"),
        ];

        let (results, ()) = tokio::join!(
            probe_all(&connector, &candidates, DEFAULT_PROBE_TIMEOUT),
            async {
                connector.emit(TransportEvent::Error("refused".into())).await;
                while connector.opened() < 2 {
                    tokio::task::yield_now().await;
                }
                connector.emit_to(1, TransportEvent::Connected).await;
            }
        );

        let summary: Vec<(&str, bool)> = results
            .iter()
            .map(|r| (r.label.as_str(), r.ok))
            .collect();
        assert_eq!(
            summary,
            vec![("first", false), ("broken", false), ("second", true)]
        );
        assert_eq!(results[0].reason.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn stages_expose_candidate() {
        let connector = ScriptedConnector::new();
        let armed = BrokerProbe::create(candidate("c", "mqtt://broker.local"), DEFAULT_PROBE_TIMEOUT);
        assert_eq!(armed.candidate().label, "c");

        let dialing = armed.dial(&connector);
        assert_eq!(connector.opened(), 1);
        connector.emit(TransportEvent::Connected).await;
        let settled = dialing.settle().await;
        assert!(settled.result().ok);
    }
}
