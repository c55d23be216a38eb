//! Error taxonomy of the device control session.

use std::time::Duration;

use thiserror::Error;

use super::types::DeviceLine;

/// Errors surfaced by [`DeviceSession`](super::session::DeviceSession).
///
/// Connection-level failures (`SubscriptionFailed`, `TransportError`) are also
/// reflected in the session snapshot. Command-level failures (`NotConnected`,
/// `RateLimited`, `NoOp`, `PublishFailed`) only reach the caller of
/// `request_line` and never change the connection state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Broker URL is malformed or uses an unsupported scheme. No I/O was attempted.
    #[error("invalid broker endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    /// Device identifier cannot be used to build topic names.
    #[error("invalid device identifier '{device_id}': {reason}")]
    InvalidDevice { device_id: String, reason: String },

    /// A command was attempted outside the `Connected` state.
    #[error("session is not connected")]
    NotConnected,

    /// A command was attempted too soon after the previous one.
    #[error("command rate limited, retry in {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// The device already reports the requested line.
    #[error("device already reports the {0} line")]
    NoOp(DeviceLine),

    /// The transport rejected the command publish.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Subscribing to the device topics failed after a successful handshake.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Generic transport failure, carrying the transport's message.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The session was closed while the operation was pending.
    #[error("session closed before the operation completed")]
    Closed,

    /// The device did not report the expected line in time.
    #[error("device did not converge within {}ms", .waited.as_millis())]
    Timeout { waited: Duration },
}

impl ControlError {
    /// Errors that only concern a single command, never the connection.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            ControlError::NotConnected
                | ControlError::RateLimited { .. }
                | ControlError::NoOp(_)
                | ControlError::PublishFailed(_)
        )
    }
}
