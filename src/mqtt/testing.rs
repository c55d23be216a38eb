//! Scripted in-memory transport used by the session and probe tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::{Connector, QoS, TransportEvent, TransportFault, TransportLink, TransportOptions};
use crate::control::types::BrokerEndpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PublishMode {
    Ack,
    Reject(String),
    /// Blocks every publish until `release_publish` is called.
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PublishRecord {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

struct LinkRecord {
    url: String,
    options: TransportOptions,
    events: mpsc::Sender<TransportEvent>,
    subscriptions: Mutex<Vec<String>>,
    ended: AtomicBool,
}

struct Script {
    fail_open: Option<String>,
    fail_subscribe: Option<String>,
    publish_mode: PublishMode,
    links: Vec<Arc<LinkRecord>>,
    publishes: Vec<PublishRecord>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_open: None,
            fail_subscribe: None,
            publish_mode: PublishMode::Ack,
            links: Vec::new(),
            publishes: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    release: Arc<Notify>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_open(&self, reason: &str) {
        self.script().fail_open = Some(reason.to_string());
    }

    pub fn fail_subscribe(&self, reason: &str) {
        self.script().fail_subscribe = Some(reason.to_string());
    }

    pub fn set_publish_mode(&self, mode: PublishMode) {
        self.script().publish_mode = mode;
    }

    pub fn release_publish(&self) {
        self.release.notify_one();
    }

    pub fn opened(&self) -> usize {
        self.script().links.len()
    }

    /// Sends `event` on the most recently opened link, waiting for one to exist.
    pub async fn emit(&self, event: TransportEvent) {
        let sender = loop {
            if let Some(link) = self.script().links.last() {
                break link.events.clone();
            }
            tokio::task::yield_now().await;
        };
        let _ = sender.send(event).await;
    }

    pub async fn emit_to(&self, index: usize, event: TransportEvent) {
        let sender = self.script().links[index].events.clone();
        let _ = sender.send(event).await;
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.script().publishes.clone()
    }

    pub fn subscriptions(&self, index: usize) -> Vec<String> {
        self.script().links[index]
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ended(&self, index: usize) -> bool {
        self.script().links[index].ended.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<TransportOptions> {
        self.script().links.last().map(|link| link.options.clone())
    }

    pub fn last_url(&self) -> Option<String> {
        self.script().links.last().map(|link| link.url.clone())
    }
}

impl Connector for ScriptedConnector {
    fn open(
        &self,
        endpoint: &BrokerEndpoint,
        options: &TransportOptions,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<TransportEvent>), TransportFault> {
        let mut script = self.script();
        if let Some(reason) = &script.fail_open {
            return Err(TransportFault::Options(reason.clone()));
        }

        let (events, rx) = mpsc::channel(32);
        let record = Arc::new(LinkRecord {
            url: endpoint.url().to_string(),
            options: options.clone(),
            events,
            subscriptions: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        });
        script.links.push(record.clone());

        let link = ScriptedLink {
            record,
            script: self.script.clone(),
            release: self.release.clone(),
        };
        Ok((Arc::new(link), rx))
    }
}

struct ScriptedLink {
    record: Arc<LinkRecord>,
    script: Arc<Mutex<Script>>,
    release: Arc<Notify>,
}

impl ScriptedLink {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransportLink for ScriptedLink {
    async fn subscribe(&self, topics: &[String], _qos: QoS) -> Result<(), TransportFault> {
        if let Some(reason) = self.script().fail_subscribe.clone() {
            return Err(TransportFault::Rejected(reason));
        }
        self.record
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(topics.iter().cloned());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportFault> {
        let mode = {
            let mut script = self.script();
            script.publishes.push(PublishRecord {
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(&payload).into_owned(),
                qos,
                retain,
            });
            script.publish_mode.clone()
        };

        match mode {
            PublishMode::Ack => Ok(()),
            PublishMode::Reject(reason) => Err(TransportFault::Rejected(reason)),
            PublishMode::Hold => {
                self.release.notified().await;
                Ok(())
            }
        }
    }

    fn end(&self) {
        self.record.ended.store(true, Ordering::SeqCst);
    }
}
