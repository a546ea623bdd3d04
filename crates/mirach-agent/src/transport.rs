//! MQTT transport shared by every plugin execution and the command listener.
//!
//! Publishes use QoS 1 and wait for the broker's PUBACK. rumqttc does not
//! hand back the packet id of a publish, so acknowledgements are matched by
//! order: each publish registers a waiter while holding the enqueue lock, the
//! event loop assigns the next new outgoing packet id to the oldest waiter,
//! and the matching PUBACK resolves it. Retransmissions after a reconnect
//! reuse their packet id and keep the waiter they already had.

use crate::config::AgentConfig;
use crate::error::{AgentError, ConfigError, Result};
use async_trait::async_trait;
use mirach_common::codec::{self, Encoded};
use mirach_common::types::PluginResult;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeReasonCode,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

/// Sends one wire message to a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns once the broker acknowledged the message.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Transport`] if the message could not be queued or
    /// was not acknowledged in time.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Registers interest in a topic; matching messages arrive as [`Inbound`].
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
}

/// Events forwarded from the connection to the command listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message { topic: String, payload: Vec<u8> },
    /// The broker refused a subscription.
    SubscribeRejected { pkid: u16 },
    /// A subscription could not be renewed after the session was lost.
    SubscriptionLost { topic: String, reason: String },
}

/// Where and how plugin results are published. Built once at startup.
pub struct PublishContext {
    publisher: Arc<dyn Publisher>,
    topic: String,
    chunk_size: usize,
}

impl PublishContext {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            chunk_size,
        }
    }

    pub fn from_config(config: &AgentConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self::new(publisher, config.data_topic(), config.chunk_size)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encodes `result` and publishes it as a single message.
    pub async fn publish_result(&self, result: &PluginResult) -> Result<Encoded> {
        let encoded = codec::encode(result, self.chunk_size)
            .map_err(|e| AgentError::Transport(format!("failed to encode result: {e}")))?;
        tracing::trace!(
            topic = %self.topic,
            kind = %result.kind,
            bytes = encoded.result_len,
            fragments = encoded.fragments,
            "Publishing result"
        );
        self.publisher
            .publish(&self.topic, encoded.body.clone())
            .await?;
        Ok(encoded)
    }
}

/// Matches QoS 1 publishes to their PUBACKs.
#[derive(Default)]
pub struct AckTracker {
    queued: Mutex<VecDeque<oneshot::Sender<()>>>,
    inflight: Mutex<HashMap<u16, oneshot::Sender<()>>>,
}

impl AckTracker {
    /// Adds a waiter for the next publish handed to the client.
    pub fn register(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        lock(&self.queued).push_back(tx);
        rx
    }

    /// Drops the newest waiter after its publish failed to queue.
    pub fn cancel_last(&self) {
        lock(&self.queued).pop_back();
    }

    /// The event loop sent a publish with `pkid`.
    ///
    /// A pkid that already has a waiter is a retransmission after reconnect
    /// and keeps its waiter; only a fresh pkid takes the oldest queued one.
    pub fn on_outgoing(&self, pkid: u16) {
        let mut inflight = lock(&self.inflight);
        if inflight.contains_key(&pkid) {
            tracing::trace!(pkid, "Resent unacknowledged publish");
            return;
        }
        if let Some(tx) = lock(&self.queued).pop_front() {
            inflight.insert(pkid, tx);
        }
    }

    /// The broker acknowledged `pkid`.
    pub fn on_ack(&self, pkid: u16) {
        if let Some(tx) = lock(&self.inflight).remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// The connection dropped. Every waiter is kept: the client resends
    /// unacknowledged packets with their old pkid and then the queued
    /// requests in order, so matching resumes after reconnect.
    pub fn on_connection_lost(&self) {
        let queued = lock(&self.queued).len();
        let inflight = lock(&self.inflight).len();
        if queued + inflight > 0 {
            tracing::warn!(queued, inflight, "Connection lost with unacknowledged publishes");
        }
    }

    pub fn pending(&self) -> usize {
        let queued = lock(&self.queued).len();
        queued + lock(&self.inflight).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// rumqttc-backed [`Publisher`] and [`Subscriber`].
pub struct MqttTransport {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    enqueue: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

impl MqttTransport {
    /// Connects to the broker and waits for the first CONNACK.
    ///
    /// After that, connection errors are logged and retried forever; only
    /// the initial connection is allowed to fail.
    pub async fn connect(config: &AgentConfig) -> Result<(Self, mpsc::Receiver<Inbound>)> {
        let options = mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let acks = Arc::new(AckTracker::default());
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = Driver {
            client: client.clone(),
            acks: acks.clone(),
            subscriptions: subscriptions.clone(),
            inbound: inbound_tx,
            reconnect_delay: Duration::from_secs(config.broker.reconnect_delay_secs),
        };
        tokio::spawn(driver.run(eventloop, ready_tx));

        let connect_timeout = Duration::from_secs(config.broker.connect_timeout_secs);
        match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                return Err(AgentError::Transport(format!(
                    "failed to connect to {}:{}: {reason}",
                    config.broker.host, config.broker.port
                )))
            }
            Ok(Err(_)) => {
                return Err(AgentError::Transport(
                    "connection task ended before connecting".to_string(),
                ))
            }
            Err(_) => {
                return Err(AgentError::Transport(format!(
                    "no CONNACK from {}:{} within {}s",
                    config.broker.host, config.broker.port, config.broker.connect_timeout_secs
                )))
            }
        }

        Ok((
            Self {
                client,
                acks,
                subscriptions,
                enqueue: tokio::sync::Mutex::new(()),
                ack_timeout: Duration::from_secs(config.broker.ack_timeout_secs),
            },
            inbound_rx,
        ))
    }

    /// Closes the connection; outstanding publishes are abandoned.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request failed");
        }
    }
}

#[async_trait]
impl Publisher for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let ack = {
            let _guard = self.enqueue.lock().await;
            let ack = self.acks.register();
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                self.acks.cancel_last();
                return Err(AgentError::Transport(format!(
                    "failed to queue publish to {topic}: {e}"
                )));
            }
            ack
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AgentError::Transport(format!(
                "acknowledgment for {topic} publish was abandoned"
            ))),
            Err(_) => Err(AgentError::Transport(format!(
                "no acknowledgment for {topic} publish within {}s",
                self.ack_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl Subscriber for MqttTransport {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        lock(&self.subscriptions).push(topic.to_string());
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| AgentError::Subscription {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

struct Driver {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::Sender<Inbound>,
    reconnect_delay: Duration,
}

impl Driver {
    async fn run(self, mut eventloop: EventLoop, ready: oneshot::Sender<std::result::Result<(), String>>) {
        let mut ready = Some(ready);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "Received message");
                    let msg = Inbound::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if self.inbound.send(msg).await.is_err() {
                        tracing::debug!("Inbound receiver gone, dropping message");
                    }
                }
                Ok(Event::Incoming(Incoming::PubAck(ack))) => self.acks.on_ack(ack.pkid),
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        let _ = self
                            .inbound
                            .send(Inbound::SubscribeRejected { pkid: ack.pkid })
                            .await;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    tracing::info!(session_present = ack.session_present, "Connected to broker");
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Ok(()));
                        }
                        None => self.resubscribe(ack.session_present),
                    }
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.acks.on_outgoing(pkid),
                Ok(_) => {}
                Err(e) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e.to_string()));
                        return;
                    }
                    tracing::warn!(error = %e, retry_secs = self.reconnect_delay.as_secs(), "MQTT connection error");
                    self.acks.on_connection_lost();
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    fn resubscribe(&self, session_present: bool) {
        if session_present {
            return;
        }
        for topic in lock(&self.subscriptions).iter() {
            tokio::spawn(renew_subscription(
                self.client.clone(),
                topic.clone(),
                self.inbound.clone(),
            ));
        }
    }
}

/// Subscribes again after a clean-session reconnect. Runs outside the event
/// loop task, which has to keep polling to drain a full request channel.
async fn renew_subscription(client: AsyncClient, topic: String, inbound: mpsc::Sender<Inbound>) {
    match client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
        Ok(()) => tracing::debug!(topic = %topic, "Renewed subscription"),
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "Failed to renew subscription");
            let lost = Inbound::SubscriptionLost {
                topic,
                reason: e.to_string(),
            };
            if inbound.send(lost).await.is_err() {
                tracing::debug!("Inbound receiver gone, dropping subscription loss");
            }
        }
    }
}

fn mqtt_options(config: &AgentConfig) -> Result<MqttOptions> {
    let broker = &config.broker;
    let mut options = MqttOptions::new(config.client_id(), &broker.host, broker.port);
    options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    options.set_clean_session(true);
    options.set_max_packet_size(broker.max_packet_size, broker.max_packet_size);

    if let (Some(user), Some(pass)) = (&broker.username, &broker.password) {
        options.set_credentials(user, pass);
    }

    if let Some(tls) = &broker.tls {
        let read = |path: &std::path::Path| {
            let resolved = config.resolve_path(path);
            std::fs::read(&resolved).map_err(|e| {
                ConfigError::Tls(format!("failed to read {}: {e}", resolved.display()))
            })
        };
        let ca = read(&tls.ca_file)?;
        let client_auth = match (&tls.client_cert_file, &tls.client_key_file) {
            (Some(cert), Some(key)) => Some((read(cert)?, read(key)?)),
            _ => None,
        };
        options.set_transport(Transport::tls(ca, client_auth, None));
    }

    Ok(options)
}
