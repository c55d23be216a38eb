//! # MQTT Transport Module
//!
//! Provides the broker connection primitives the device control session is built on.
//! The session never talks to `rumqttc` directly; it consumes the small capability set
//! defined here, which keeps the session logic independent from the wire client and
//! lets tests drive it with a scripted transport.
//!
//! ## Why This Module Exists
//!
//! A remote-actuation UI needs exactly five things from its messaging client:
//! - open a connection to a broker endpoint with a client identifier, keepalive,
//!   connect timeout and (optional) reconnect period
//! - subscribe to a set of topics and learn whether the broker accepted them
//! - publish a payload, optionally retained, and learn when the broker acknowledged it
//! - observe connection lifecycle events (`connected`, `message`, `error`, `closed`)
//! - end the connection
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Transport options (client id, timeouts, keepalive)
//! ├── message_manager.rs  - Inbound message representation
//! └── mqtt_handler.rs     - rumqttc-backed connector, event loop and ack tracking
//! ```
//!
//! ## Event Model
//!
//! [`Connector::open`] returns immediately with a link handle and an event receiver.
//! The handshake outcome, inbound publishes and transport failures all arrive on that
//! receiver as [`TransportEvent`]s, in the order the transport produced them.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::control::types::BrokerEndpoint;

pub use config::TransportOptions;
pub use message_manager::MQTTMessage;
pub use mqtt_handler::MqttConnector;
pub use rumqttc::QoS;

/// Lifecycle and data events emitted by an open transport link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker accepted the connection handshake.
    Connected,
    /// A publish arrived on one of the subscribed topics.
    Message(MQTTMessage),
    /// The transport failed; carries the transport's own message.
    Error(String),
    /// The connection was closed by the broker or by ending the link.
    Closed,
}

/// Failures reported by a transport link.
#[derive(Debug, Error)]
pub enum TransportFault {
    /// Options could not be turned into a usable client configuration.
    #[error("invalid transport options: {0}")]
    Options(String),

    /// The broker refused the request (e.g. a SubAck failure code).
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// The request could not be handed to the client.
    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The link went away before the request was acknowledged.
    #[error("transport link closed before acknowledgment")]
    Disconnected,
}

/// Handle to a single open broker connection.
///
/// Exclusively owned by whoever opened it. `end` must be safe to call more than once
/// and must never fail.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Subscribes to all `topics` and resolves once the broker acknowledged them.
    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), TransportFault>;

    /// Publishes `payload` to `topic` and resolves once the broker acknowledged it.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportFault>;

    /// Releases the connection.
    fn end(&self);
}

/// Factory for transport links.
pub trait Connector: Send + Sync {
    /// Starts a connection attempt towards `endpoint`.
    ///
    /// Returns without waiting for the handshake; its outcome is reported as the first
    /// [`TransportEvent`] on the returned receiver.
    fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &TransportOptions,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<TransportEvent>), TransportFault>;
}
