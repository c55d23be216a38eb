//! Value types shared by the session and the probe.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use super::error::ControlError;

/// Identifier of the remote device a session controls.
///
/// Used verbatim in topic names; only values that would break topic construction
/// are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>) -> Result<Self, ControlError> {
        let device_id = device_id.into();
        let reason = if device_id.is_empty() {
            Some("identifier is empty")
        } else if device_id.contains(['+', '#']) {
            Some("identifier contains an MQTT wildcard")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ControlError::InvalidDevice {
                device_id,
                reason: reason.to_string(),
            }),
            None => Ok(Self { device_id }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_id)
    }
}

/// Socket transports a broker endpoint may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportScheme {
    /// `ws://`: MQTT over WebSocket
    Ws,
    /// `wss://`: MQTT over WebSocket with TLS
    Wss,
    /// `mqtt://`: plain TCP
    Mqtt,
    /// `mqtts://`: TCP with TLS
    Mqtts,
}

impl TransportScheme {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            "mqtt" => Some(Self::Mqtt),
            "mqtts" => Some(Self::Mqtts),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Ws => 80,
            Self::Wss => 443,
            Self::Mqtt => 1883,
            Self::Mqtts => 8883,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Wss | Self::Mqtts)
    }
}

/// A validated broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    url: String,
    scheme: TransportScheme,
    host: String,
    port: u16,
}

impl BrokerEndpoint {
    /// Validates `url` against the recognized transport schemes. Performs no I/O.
    pub fn parse(url: &str) -> Result<Self, ControlError> {
        let invalid = |reason: String| ControlError::InvalidEndpoint {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        let scheme = TransportScheme::from_scheme(parsed.scheme()).ok_or_else(|| {
            invalid(format!(
                "unsupported scheme '{}', expected ws, wss, mqtt or mqtts",
                parsed.scheme()
            ))
        })?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            url: url.to_string(),
            scheme,
            host,
            port,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> TransportScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// The two mutually exclusive cooling lines a device can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceLine {
    Principal,
    Auxiliary,
}

/// Wire tokens, canonical upper-case form.
const LINE_TOKENS: [(DeviceLine, &str); 2] = [
    (DeviceLine::Principal, "PRINCIPAL"),
    (DeviceLine::Auxiliary, "AUXILIAR"),
];

impl DeviceLine {
    /// Canonical token published on the command topic.
    pub fn token(self) -> &'static str {
        match self {
            DeviceLine::Principal => LINE_TOKENS[0].1,
            DeviceLine::Auxiliary => LINE_TOKENS[1].1,
        }
    }

    /// Parses a received token; case-insensitive, surrounding whitespace ignored.
    pub fn from_token(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        LINE_TOKENS
            .iter()
            .find(|(_, token)| *token == normalized)
            .map(|(line, _)| *line)
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        std::str::from_utf8(payload).ok().and_then(Self::from_token)
    }
}

impl fmt::Display for DeviceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLine::Principal => write!(f, "principal"),
            DeviceLine::Auxiliary => write!(f, "auxiliary"),
        }
    }
}

/// Liveness payload a device publishes while reachable.
pub const ONLINE_TOKEN: &str = "ONLINE";

pub(crate) fn is_online_payload(payload: &[u8]) -> bool {
    std::str::from_utf8(payload)
        .map(|text| text.trim().eq_ignore_ascii_case(ONLINE_TOKEN))
        .unwrap_or(false)
}

/// Transport-level connection state of a session.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Immutable view of a session, replaced on every change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    /// `None` while the device has not reported since the last (re)connect.
    pub reported_line: Option<DeviceLine>,
    /// Last line this session asked for.
    pub desired_line: Option<DeviceLine>,
    pub command_in_flight: bool,
    pub last_error: Option<String>,
    /// Liveness from the device status topic; `None` until the device reported.
    pub device_online: Option<bool>,
}

impl SessionSnapshot {
    /// Connected at transport level and not reported offline by the device.
    ///
    /// The status topic can only lower this, never raise it above the transport state.
    pub fn is_live(&self) -> bool {
        self.connection == ConnectionState::Connected && self.device_online != Some(false)
    }

    /// The device reports the line this session last asked for.
    pub fn converged(&self) -> bool {
        self.desired_line.is_some() && self.desired_line == self.reported_line
    }
}

/// The last command that passed the rate gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub line: DeviceLine,
    pub issued_at: Instant,
    pub issued_at_wall: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_tokens_are_case_insensitive() {
        assert_eq!(DeviceLine::from_token("principal"), Some(DeviceLine::Principal));
        assert_eq!(DeviceLine::from_token("  Auxiliar\n"), Some(DeviceLine::Auxiliary));
        assert_eq!(DeviceLine::from_token("AUXILIARY"), None);
        assert_eq!(DeviceLine::from_token("garbage"), None);
        assert_eq!(DeviceLine::from_payload(&[0xff, 0xfe]), None);
    }

    #[test]
    fn canonical_tokens_parse_back() {
        for line in [DeviceLine::Principal, DeviceLine::Auxiliary] {
            assert_eq!(DeviceLine::from_token(line.token()), Some(line));
        }
        assert_eq!(DeviceLine::Auxiliary.token(), "AUXILIAR");
    }

    #[test]
    fn endpoint_accepts_socket_schemes() {
        let ws = BrokerEndpoint::parse("ws://broker.local:8083/mqtt").unwrap();
        assert_eq!(ws.scheme(), TransportScheme::Ws);
        assert_eq!(ws.port(), 8083);
        assert_eq!(ws.host(), "broker.local");

        let wss = BrokerEndpoint::parse("wss://broker.local/mqtt").unwrap();
        assert_eq!(wss.port(), 443);
        assert!(wss.scheme().is_secure());

        let tcp = BrokerEndpoint::parse("mqtt://10.0.0.5").unwrap();
        assert_eq!(tcp.port(), 1883);
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        for url in ["http://broker.local", "broker.local:1883", "", "ws://", "ftp://x/y"] {
            let result = BrokerEndpoint::parse(url);
            assert!(
                matches!(result, Err(ControlError::InvalidEndpoint { .. })),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn device_identity_rejects_empty_and_wildcards() {
        assert!(DeviceIdentity::new("MRI-07").is_ok());
        assert!(matches!(
            DeviceIdentity::new(""),
            Err(ControlError::InvalidDevice { .. })
        ));
        assert!(DeviceIdentity::new("MRI/#").is_err());
        assert!(DeviceIdentity::new("a+b").is_err());
    }

    #[test]
    fn online_payload_matching() {
        assert!(is_online_payload(b"ONLINE"));
        assert!(is_online_payload(b" online "));
        assert!(!is_online_payload(b"OFFLINE"));
        assert!(!is_online_payload(b""));
    }

    #[test]
    fn status_only_downgrades_liveness() {
        let mut snapshot = SessionSnapshot {
            connection: ConnectionState::Connected,
            ..SessionSnapshot::default()
        };
        assert!(snapshot.is_live());

        snapshot.device_online = Some(false);
        assert!(!snapshot.is_live());

        snapshot.connection = ConnectionState::Disconnected;
        snapshot.device_online = Some(true);
        assert!(!snapshot.is_live());
    }

    #[test]
    fn convergence_needs_a_desired_line() {
        let mut snapshot = SessionSnapshot::default();
        assert!(!snapshot.converged());
        snapshot.desired_line = Some(DeviceLine::Auxiliary);
        snapshot.reported_line = Some(DeviceLine::Auxiliary);
        assert!(snapshot.converged());
    }
}
