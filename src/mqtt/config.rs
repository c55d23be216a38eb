use std::time::Duration;

use uuid::Uuid;

/// Client-side settings for one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub client_id: String,
    /// `None` disables transport-level reconnection.
    pub reconnect_period: Option<Duration>,
    /// Upper bound for the broker handshake.
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl TransportOptions {
    /// Options for a short-lived reachability check: unique client id, no reconnects,
    /// handshake bounded by `timeout`.
    pub fn probe(timeout: Duration) -> Self {
        Self {
            client_id: unique_client_id("remoteline-probe"),
            reconnect_period: None,
            connect_timeout: timeout,
            ..Self::default()
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            client_id: unique_client_id("remoteline"),
            reconnect_period: None,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// `prefix` followed by 12 random hex digits.
pub fn unique_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..12])
}
