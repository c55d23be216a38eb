//! rumqttc-backed implementation of the transport seam.
//!
//! Every [`MqttConnector::open`] call creates its own `AsyncClient`/`EventLoop` pair and
//! spawns one task that polls the event loop, translating rumqttc events into
//! [`TransportEvent`]s and resolving pending subscribe/publish acknowledgments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connector, MQTTMessage, TransportEvent, TransportFault, TransportLink, TransportOptions};
use crate::control::types::{BrokerEndpoint, TransportScheme};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 100;
/// Time granted to flush a DISCONNECT packet when a connected link is ended.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

type AckSender = oneshot::Sender<Result<(), TransportFault>>;

/// Opens rumqttc connections over TCP, TLS, WebSocket or secure WebSocket,
/// depending on the endpoint scheme.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    request_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: REQUEST_CHANNEL_CAPACITY,
        }
    }
}

impl Connector for MqttConnector {
    fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &TransportOptions,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<TransportEvent>), TransportFault> {
        let mqtt_options = build_mqtt_options(endpoint, options)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let acks = Arc::new(AckTracker::default());
        let cancel = CancellationToken::new();

        info!(
            url = %endpoint.url(),
            client_id = %options.client_id,
            secure = endpoint.scheme().is_secure(),
            "opening MQTT connection"
        );

        tokio::spawn(run_event_loop(
            eventloop,
            event_tx,
            Arc::clone(&acks),
            cancel.clone(),
            options.connect_timeout,
            options.reconnect_period,
        ));

        let link = MqttLink {
            client,
            acks,
            cancel,
            request_order: tokio::sync::Mutex::new(()),
        };
        Ok((Arc::new(link), event_rx))
    }
}

/// Translates an endpoint and transport options into rumqttc client options.
pub(crate) fn build_mqtt_options(
    endpoint: &BrokerEndpoint,
    options: &TransportOptions,
) -> Result<MqttOptions, TransportFault> {
    if options.client_id.is_empty() || options.client_id.starts_with(' ') {
        return Err(TransportFault::Options(format!(
            "client id '{}' is not usable",
            options.client_id
        )));
    }
    if !options.keep_alive.is_zero() && options.keep_alive < Duration::from_secs(1) {
        return Err(TransportFault::Options(
            "keepalive must be zero or at least one second".to_string(),
        ));
    }

    // WebSocket transports take the full URL (path included) as broker address.
    let broker = match endpoint.scheme() {
        TransportScheme::Ws | TransportScheme::Wss => endpoint.url().to_string(),
        TransportScheme::Mqtt | TransportScheme::Mqtts => endpoint.host().to_string(),
    };

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), broker, endpoint.port());
    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(true);

    match endpoint.scheme() {
        TransportScheme::Mqtt => {}
        TransportScheme::Mqtts => {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        TransportScheme::Ws => {
            mqtt_options.set_transport(Transport::Ws);
        }
        TransportScheme::Wss => {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
    }

    Ok(mqtt_options)
}

struct MqttLink {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    cancel: CancellationToken,
    // Serializes "queue waiter + hand request to client" so waiter order matches
    // the order rumqttc emits the outgoing packets.
    request_order: tokio::sync::Mutex<()>,
}

#[async_trait]
impl TransportLink for MqttLink {
    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), TransportFault> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            self.acks.queue(AckKind::Subscribe, tx);
            let filters = topics
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), qos));
            if let Err(e) = self.client.subscribe_many(filters).await {
                self.acks.unqueue_last(AckKind::Subscribe);
                return Err(e.into());
            }
        }
        debug!(?topics, "subscribe request queued");
        rx.await.unwrap_or(Err(TransportFault::Disconnected))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportFault> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            self.acks.queue(AckKind::Publish, tx);
            if let Err(e) = self.client.publish(topic, qos, retain, payload).await {
                self.acks.unqueue_last(AckKind::Publish);
                return Err(e.into());
            }
        }
        debug!(topic, ?qos, retain, "publish request queued");
        rx.await.unwrap_or(Err(TransportFault::Disconnected))
    }

    fn end(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not delivered");
        }
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Publish,
}

/// Pairs outgoing packet ids with the callers waiting for their acknowledgment.
#[derive(Default)]
struct AckTracker {
    inner: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    queued_subscribes: VecDeque<AckSender>,
    queued_publishes: VecDeque<AckSender>,
    subscribes: HashMap<u16, AckSender>,
    publishes: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn state(&self) -> std::sync::MutexGuard<'_, AckState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, kind: AckKind, waiter: AckSender) {
        let mut state = self.state();
        match kind {
            AckKind::Subscribe => state.queued_subscribes.push_back(waiter),
            AckKind::Publish => state.queued_publishes.push_back(waiter),
        }
    }

    fn unqueue_last(&self, kind: AckKind) {
        let mut state = self.state();
        match kind {
            AckKind::Subscribe => state.queued_subscribes.pop_back(),
            AckKind::Publish => state.queued_publishes.pop_back(),
        };
    }

    /// Called when rumqttc wrote a packet; packet id 0 marks a QoS 0 publish,
    /// which is complete once written.
    fn bind(&self, kind: AckKind, pkid: u16) {
        let mut state = self.state();
        match kind {
            AckKind::Subscribe => {
                if let Some(waiter) = state.queued_subscribes.pop_front() {
                    state.subscribes.insert(pkid, waiter);
                }
            }
            AckKind::Publish => {
                if let Some(waiter) = state.queued_publishes.pop_front() {
                    if pkid == 0 {
                        let _ = waiter.send(Ok(()));
                    } else {
                        state.publishes.insert(pkid, waiter);
                    }
                }
            }
        }
    }

    fn resolve(&self, kind: AckKind, pkid: u16, outcome: Result<(), TransportFault>) {
        let waiter = {
            let mut state = self.state();
            match kind {
                AckKind::Subscribe => state.subscribes.remove(&pkid),
                AckKind::Publish => state.publishes.remove(&pkid),
            }
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!(?kind, pkid, "acknowledgment without waiter"),
        }
    }

    /// Drops every waiter; their callers observe [`TransportFault::Disconnected`].
    fn fail_all(&self) {
        let mut state = self.state();
        state.queued_subscribes.clear();
        state.queued_publishes.clear();
        state.subscribes.clear();
        state.publishes.clear();
    }
}

fn suback_outcome(return_codes: &[SubscribeReasonCode]) -> Result<(), TransportFault> {
    let rejected = return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count();
    if rejected == 0 {
        Ok(())
    } else {
        Err(TransportFault::Rejected(format!(
            "{} of {} subscriptions refused",
            rejected,
            return_codes.len()
        )))
    }
}

/// Polls the rumqttc event loop until the link is ended, the consumer goes away,
/// or the transport fails without a reconnect period.
async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    acks: Arc<AckTracker>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    reconnect_period: Option<Duration>,
) {
    let mut handshake_deadline = Some(Instant::now() + connect_timeout);

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            polled = poll_with_deadline(&mut eventloop, handshake_deadline) => Some(polled),
        };

        let Some(polled) = polled else {
            if handshake_deadline.is_none() {
                flush_disconnect(&mut eventloop).await;
            }
            break;
        };

        let event = match polled {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                acks.fail_all();
                warn!(error = %e, "MQTT event loop error");
                if events.send(TransportEvent::Error(e.to_string())).await.is_err() {
                    break;
                }
                match reconnect_period {
                    Some(period) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(period) => {}
                        }
                        handshake_deadline = Some(Instant::now() + connect_timeout);
                        continue;
                    }
                    None => break,
                }
            }
            None => {
                warn!(timeout_ms = connect_timeout.as_millis() as u64, "MQTT handshake timed out");
                let _ = events
                    .send(TransportEvent::Error("connect timeout".to_string()))
                    .await;
                break;
            }
        };

        let forwarded = match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("connected to MQTT broker");
                handshake_deadline = None;
                Some(TransportEvent::Connected)
            }
            Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message(
                MQTTMessage::from_topic(publish.topic, publish.payload.to_vec()),
            )),
            Event::Incoming(Packet::SubAck(ack)) => {
                acks.resolve(AckKind::Subscribe, ack.pkid, suback_outcome(&ack.return_codes));
                None
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                acks.resolve(AckKind::Publish, ack.pkid, Ok(()));
                None
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                acks.resolve(AckKind::Publish, comp.pkid, Ok(()));
                None
            }
            Event::Incoming(Packet::Disconnect) => {
                info!("broker closed the MQTT session");
                let _ = events.send(TransportEvent::Closed).await;
                break;
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                acks.bind(AckKind::Subscribe, pkid);
                None
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                acks.bind(AckKind::Publish, pkid);
                None
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                let _ = events.send(TransportEvent::Closed).await;
                break;
            }
            _ => None,
        };

        if let Some(event) = forwarded {
            if events.send(event).await.is_err() {
                debug!("transport event consumer dropped");
                break;
            }
        }
    }

    acks.fail_all();
    debug!("MQTT event loop stopped");
}

/// `None` when the handshake deadline passed before the event loop produced anything.
async fn poll_with_deadline(
    eventloop: &mut EventLoop,
    deadline: Option<Instant>,
) -> Option<Result<Event, rumqttc::ConnectionError>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, eventloop.poll()).await.ok(),
        None => Some(eventloop.poll().await),
    }
}

async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("disconnect not flushed in time");
    }
}
