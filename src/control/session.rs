//! # Device Control Session
//!
//! Owns one broker connection for one device, keeps a [`SessionSnapshot`] of what is
//! known about that device and issues line-change commands through a rate gate.
//!
//! ## Lifecycle
//!
//! ```text
//!            connect()              handshake + subscribe ok
//! Disconnected ───────► Connecting ──────────────────────────► Connected
//!      ▲                    │  │                                  │
//!      │    transport Closed│  │transport Error /                 │transport Closed
//!      └────────────────────┘  │subscription failed               │
//!      ▲                       ▼                                  │
//!      └─────── close() ──── Error(reason) ◄──────────────────────┘
//!                                            transport Error
//! ```
//!
//! Every transport link is tagged with a generation number. `close()` and a fresh
//! `connect()` bump the generation, so events and acknowledgments that belong to a
//! released link can never touch the snapshot again.
//!
//! ## Observation
//!
//! Snapshots are published through a `tokio::sync::watch` channel. Receivers see the
//! latest value; rapid successive changes may be coalesced into one notification.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::ControlError;
use super::rate_gate::RateGate;
use super::topics::{DeviceTopics, TopicKind};
use super::types::{
    is_online_payload, BrokerEndpoint, CommandRecord, ConnectionState, DeviceIdentity,
    DeviceLine, SessionSnapshot,
};
use crate::mqtt::config::unique_client_id;
use crate::mqtt::{Connector, MQTTMessage, QoS, TransportEvent, TransportLink, TransportOptions};

/// Reason stored in `ConnectionState::Error` when the topic subscription is refused.
pub const SUBSCRIPTION_FAILED: &str = "subscription failed";

/// Reason reported when the transport closes before completing its handshake.
pub const CLOSED_BEFORE_HANDSHAKE: &str = "closed before handshake";

/// Tunables of a [`DeviceSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Fixed client id; a unique one is generated per connection when `None`.
    pub client_id: Option<String>,
    /// Transport-level reconnect period. `None` disables reconnection.
    pub reconnect_period: Option<Duration>,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    /// Minimum spacing between two commands that pass the gate.
    pub min_command_interval: Duration,
    pub command_qos: QoS,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            reconnect_period: None,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            min_command_interval: Duration::from_millis(350),
            command_qos: QoS::AtLeastOnce,
        }
    }
}

impl SessionOptions {
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| unique_client_id("remoteline")),
            reconnect_period: self.reconnect_period,
            connect_timeout: self.connect_timeout,
            keep_alive: self.keep_alive,
        }
    }
}

struct SessionState {
    generation: u64,
    link: Option<Arc<dyn TransportLink>>,
    pump: Option<JoinHandle<()>>,
    snapshot: SessionSnapshot,
    rate_gate: RateGate,
    pending_commands: usize,
}

struct Shared {
    state: Mutex<SessionState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    topics: DeviceTopics,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes the snapshot held in `state` to observers if it differs from the last one.
    fn emit(&self, state: &SessionState) {
        let next = &state.snapshot;
        self.snapshot_tx.send_if_modified(|current| {
            if current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
    }

    /// Runs `apply` against the state of `generation` and emits the result.
    /// Returns `None` without touching anything if the generation is stale.
    fn update<R>(&self, generation: u64, apply: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }
        let result = apply(&mut *state);
        self.emit(&state);
        Some(result)
    }

    async fn on_handshake(&self, generation: u64, link: &Arc<dyn TransportLink>) {
        debug!(generation, "transport handshake complete, subscribing");
        let outcome = link
            .subscribe(&self.topics.subscriptions(), QoS::AtLeastOnce)
            .await;

        self.update(generation, |state| {
            // Device state is unknown again until the retained reports arrive.
            state.snapshot.reported_line = None;
            state.snapshot.device_online = None;
            match outcome {
                Ok(()) => {
                    info!(
                        reported = %self.topics.reported,
                        status = %self.topics.status,
                        "session connected"
                    );
                    state.snapshot.connection = ConnectionState::Connected;
                    state.snapshot.last_error = None;
                }
                Err(fault) => {
                    warn!(error = %fault, "subscription to device topics failed");
                    state.snapshot.connection =
                        ConnectionState::Error(SUBSCRIPTION_FAILED.to_string());
                    state.snapshot.last_error = Some(fault.to_string());
                }
            }
        });
    }

    fn on_message(&self, generation: u64, message: &MQTTMessage) {
        match self.topics.classify(message.topic()) {
            TopicKind::Reported => match DeviceLine::from_payload(message.payload()) {
                Some(line) => {
                    self.update(generation, |state| {
                        debug!(%line, received_at = %message.received_at(), "device reported line");
                        state.snapshot.reported_line = Some(line);
                    });
                }
                None => warn!(
                    topic = message.topic(),
                    payload = %message.payload_text(),
                    "ignoring unrecognized line report"
                ),
            },
            TopicKind::Status => {
                let online = is_online_payload(message.payload());
                self.update(generation, |state| {
                    debug!(online, "device status");
                    state.snapshot.device_online = Some(online);
                });
            }
            TopicKind::Desired | TopicKind::Foreign => {
                debug!(topic = message.topic(), "ignoring message on unrelated topic");
            }
        }
    }

    fn on_error(&self, generation: u64, reason: String) {
        self.update(generation, |state| {
            warn!(error = %reason, "transport error");
            state.snapshot.connection = ConnectionState::Error(reason.clone());
            state.snapshot.last_error = Some(reason);
        });
    }

    fn on_closed(&self, generation: u64) {
        self.update(generation, |state| {
            if matches!(
                state.snapshot.connection,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                info!("transport closed");
                state.snapshot.connection = ConnectionState::Disconnected;
                state.snapshot.reported_line = None;
                state.snapshot.device_online = None;
            }
        });
    }
}

/// Translates the events of one link into session state until the link goes away.
async fn run_pump(
    shared: Arc<Shared>,
    generation: u64,
    link: Arc<dyn TransportLink>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        if shared.lock().generation != generation {
            break;
        }
        match event {
            TransportEvent::Connected => shared.on_handshake(generation, &link).await,
            TransportEvent::Message(message) => shared.on_message(generation, &message),
            TransportEvent::Error(reason) => shared.on_error(generation, reason),
            TransportEvent::Closed => shared.on_closed(generation),
        }
    }
    debug!(generation, "event pump finished");
}

/// Control session for a single remote device.
///
/// Dropping the session closes it.
pub struct DeviceSession {
    identity: DeviceIdentity,
    endpoint: BrokerEndpoint,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl DeviceSession {
    /// Validates the device id and broker URL. Performs no I/O.
    pub fn open(
        device_id: &str,
        endpoint_url: &str,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Result<Self, ControlError> {
        let identity = DeviceIdentity::new(device_id)?;
        let endpoint = BrokerEndpoint::parse(endpoint_url)?;
        let topics = DeviceTopics::derive(&identity);
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                generation: 0,
                link: None,
                pump: None,
                snapshot: SessionSnapshot::default(),
                rate_gate: RateGate::new(options.min_command_interval),
                pending_commands: 0,
            }),
            snapshot_tx,
            topics,
        });

        Ok(Self {
            identity,
            endpoint,
            options,
            connector,
            shared,
        })
    }

    /// Opens the transport and waits until the attempt settles.
    ///
    /// Returns immediately when already connected and joins the running attempt when
    /// one is in progress. `Err(Closed)` means `close()` was called before the attempt
    /// settled.
    pub async fn connect(&self) -> Result<(), ControlError> {
        let mut changes = self.shared.snapshot_tx.subscribe();
        let generation = {
            let mut state = self.shared.lock();
            match state.snapshot.connection {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => state.generation,
                ConnectionState::Disconnected | ConnectionState::Error(_) => {
                    self.start_attempt(&mut state)?
                }
            }
        };

        loop {
            {
                let state = self.shared.lock();
                if state.generation != generation {
                    return Err(ControlError::Closed);
                }
                match &state.snapshot.connection {
                    ConnectionState::Connecting => {}
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Error(reason) if reason == SUBSCRIPTION_FAILED => {
                        let detail = state
                            .snapshot
                            .last_error
                            .clone()
                            .unwrap_or_else(|| reason.clone());
                        return Err(ControlError::SubscriptionFailed(detail));
                    }
                    ConnectionState::Error(reason) => {
                        return Err(ControlError::TransportError(reason.clone()))
                    }
                    ConnectionState::Disconnected => {
                        return Err(ControlError::TransportError(
                            CLOSED_BEFORE_HANDSHAKE.to_string(),
                        ))
                    }
                }
            }
            if changes.changed().await.is_err() {
                return Err(ControlError::Closed);
            }
        }
    }

    /// Releases any previous link and starts a new one under a fresh generation.
    fn start_attempt(&self, state: &mut SessionState) -> Result<u64, ControlError> {
        release_link(state);
        state.generation += 1;
        let generation = state.generation;

        state.snapshot.connection = ConnectionState::Connecting;
        state.snapshot.last_error = None;
        state.snapshot.reported_line = None;
        state.snapshot.device_online = None;
        self.shared.emit(state);

        let transport = self.options.transport_options();
        info!(
            device = %self.identity,
            broker = %self.endpoint,
            client_id = %transport.client_id,
            generation,
            "connecting"
        );

        match self.connector.open(&self.endpoint, &transport) {
            Ok((link, events)) => {
                state.link = Some(link.clone());
                state.pump = Some(tokio::spawn(run_pump(
                    self.shared.clone(),
                    generation,
                    link,
                    events,
                )));
                Ok(generation)
            }
            Err(fault) => {
                let reason = fault.to_string();
                warn!(error = %reason, "failed to open transport");
                state.snapshot.connection = ConnectionState::Error(reason.clone());
                state.snapshot.last_error = Some(reason.clone());
                self.shared.emit(state);
                Err(ControlError::TransportError(reason))
            }
        }
    }

    /// Moves to `Disconnected` and releases the link. Safe to call at any time,
    /// any number of times.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        let had_link = release_link(&mut state);
        state.generation += 1;
        state.pending_commands = 0;
        state.snapshot.connection = ConnectionState::Disconnected;
        state.snapshot.reported_line = None;
        state.snapshot.device_online = None;
        state.snapshot.command_in_flight = false;
        self.shared.emit(&state);

        if had_link {
            info!(device = %self.identity, "session closed");
        }
    }

    /// Asks the device to switch to `target`.
    ///
    /// Resolves once the broker acknowledged the command publish, not when the device
    /// reports the new line; use [`wait_for_reported`](Self::wait_for_reported) for that.
    /// Gates are checked in order: connection, rate, then idempotency.
    pub async fn request_line(&self, target: DeviceLine) -> Result<(), ControlError> {
        let (generation, link) = {
            let mut state = self.shared.lock();
            if state.snapshot.connection != ConnectionState::Connected {
                return Err(ControlError::NotConnected);
            }
            let link = state.link.clone().ok_or(ControlError::NotConnected)?;

            let now = Instant::now();
            if let Err(retry_after) = state.rate_gate.check(now) {
                debug!(
                    ?retry_after,
                    min_interval = ?state.rate_gate.min_interval(),
                    "command rate limited"
                );
                return Err(ControlError::RateLimited { retry_after });
            }
            if state.snapshot.reported_line == Some(target) {
                return Err(ControlError::NoOp(target));
            }

            state.rate_gate.record(target, now);
            state.pending_commands += 1;
            state.snapshot.command_in_flight = true;
            state.snapshot.desired_line = Some(target);
            self.shared.emit(&state);
            (state.generation, link)
        };

        info!(line = %target, topic = %self.shared.topics.desired, "requesting line change");
        let outcome = link
            .publish(
                &self.shared.topics.desired,
                target.token().as_bytes().to_vec(),
                self.options.command_qos,
                true,
            )
            .await;

        let current = self
            .shared
            .update(generation, |state| {
                state.pending_commands = state.pending_commands.saturating_sub(1);
                state.snapshot.command_in_flight = state.pending_commands > 0;
            })
            .is_some();

        match outcome {
            Ok(()) => Ok(()),
            Err(_) if !current => Err(ControlError::Closed),
            Err(fault) => {
                warn!(error = %fault, line = %target, "command publish failed");
                Err(ControlError::PublishFailed(fault.to_string()))
            }
        }
    }

    /// Waits until the device reports `line`, bounded by `timeout`.
    ///
    /// Fails early when the session leaves the `Connected` state.
    pub async fn wait_for_reported(
        &self,
        line: DeviceLine,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let mut changes = self.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            changes.wait_for(|snapshot| {
                snapshot.reported_line == Some(line)
                    || snapshot.connection != ConnectionState::Connected
            }),
        )
        .await;

        let snapshot = match settled {
            Err(_) => return Err(ControlError::Timeout { waited: timeout }),
            Ok(Err(_)) => return Err(ControlError::Closed),
            Ok(Ok(snapshot)) => snapshot.clone(),
        };

        if snapshot.reported_line == Some(line) {
            return Ok(());
        }
        match snapshot.connection {
            ConnectionState::Error(reason) => Err(ControlError::TransportError(reason)),
            _ => Err(ControlError::Closed),
        }
    }

    /// A receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Calls `callback` with the latest snapshot after every change until the returned
    /// subscription is dropped or unsubscribed. Must be called within a tokio runtime.
    pub fn on_change<F>(&self, mut callback: F) -> ChangeSubscription
    where
        F: FnMut(&SessionSnapshot) + Send + 'static,
    {
        let mut changes = self.subscribe();
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let snapshot = changes.borrow_and_update().clone();
                callback(&snapshot);
            }
        });
        ChangeSubscription { task }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().snapshot.clone()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.shared.topics
    }

    /// The last command that passed the rate gate.
    pub fn last_command(&self) -> Option<CommandRecord> {
        self.shared.lock().rate_gate.last_command().cloned()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ends the current link and stops its pump. Returns whether there was one.
fn release_link(state: &mut SessionState) -> bool {
    if let Some(pump) = state.pump.take() {
        pump.abort();
    }
    match state.link.take() {
        Some(link) => {
            link.end();
            true
        }
        None => false,
    }
}

/// Handle returned by [`DeviceSession::on_change`].
pub struct ChangeSubscription {
    task: JoinHandle<()>,
}

impl ChangeSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
