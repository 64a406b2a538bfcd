//! MQTT connection management using rumqttc.
//!
//! [`ConnectionManager`] owns the single broker session:
//! - Background reconnection with bounded exponential backoff
//! - Broker-level subscriptions, restored after every reconnect
//! - Publish acknowledgement tracking for QoS 1 and 2
//! - Inbound messages forwarded, uninterpreted, on one channel
//!
//! The [`Connection`] trait is the seam the orchestrator drives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::error::{Error, Result};
use crate::types::{ConnectionState, Message, PublishAck, QoS};

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 256;
/// Capacity of the inbound message channel.
const INBOUND_CAPACITY: usize = 1024;
/// How long `close` waits for DISCONNECT to be flushed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Broker session as seen by the orchestrator.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Watch the session state.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Add a broker-level subscription. Must not wait for SUBACK.
    fn subscribe_filter(&self, filter: &str) -> Result<()>;

    /// Remove a broker-level subscription. Must not wait for UNSUBACK.
    fn unsubscribe_filter(&self, filter: &str) -> Result<()>;

    /// Publish a message; for QoS 1 and 2 resolves once the broker acknowledged it.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<PublishAck>;
}

type AckSender = oneshot::Sender<Result<u16>>;

/// Matches outgoing publishes to their packet ids and acknowledgements.
///
/// rumqttc assigns packet ids inside the event loop, in request order, and
/// reports each as `Outgoing::Publish(pkid)`. Every publish request pushes
/// one slot (QoS 0 pushes an empty one) so the n-th outgoing publish pops
/// the n-th slot.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<Option<AckSender>>,
    inflight: HashMap<u16, AckSender>,
    /// Packet ids failed on session loss that rumqttc will resend.
    resent: HashSet<u16>,
}

impl AckTracker {
    fn enqueue(&mut self, waiter: Option<AckSender>) {
        self.queued.push_back(waiter);
    }

    fn assign(&mut self, pkid: u16) {
        if pkid != 0 && self.resent.remove(&pkid) {
            return;
        }
        if let Some(Some(tx)) = self.queued.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn complete(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(Ok(pkid));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for (pkid, tx) in self.inflight.drain() {
            self.resent.insert(pkid);
            let _ = tx.send(Err(Error::BrokerUnavailable(reason.to_string())));
        }
        // Keep the slots until CONNACK tells whether the client replays its
        // queued requests.
        for slot in self.queued.iter_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(Error::BrokerUnavailable(reason.to_string())));
            }
        }
    }

    /// Align with the new session after CONNACK.
    ///
    /// A resumed session replays in-flight packets under their old ids and
    /// then the queued requests. A fresh session drops all of them, so
    /// nothing recorded before the reconnect will report a packet id again.
    fn session_started(&mut self, resumed: bool) {
        if !resumed {
            self.resent.clear();
            self.queued.clear();
        }
    }
}

/// Reconnect delay doubling from `min` up to `max`.
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Owner of the single broker session.
pub struct ConnectionManager {
    client: AsyncClient,
    broker: String,
    subscribe_qos: QoS,
    publish_timeout: Duration,
    state_tx: watch::Sender<ConnectionState>,
    /// Broker-level filters currently held; restored on reconnect.
    subscriptions: Mutex<Vec<String>>,
    acks: Mutex<AckTracker>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the session in the background.
    ///
    /// Returns the manager and the channel every inbound PUBLISH is forwarded
    /// on. The first connection attempt begins immediately; use
    /// [`connect`](Self::connect) to wait for it.
    pub fn start(config: &MqttConfig) -> Result<(Arc<Self>, mpsc::Receiver<Message>)> {
        let id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mcpmqtt-{}", Uuid::new_v4()));

        let mut options = MqttOptions::new(&id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive));
        options.set_clean_session(config.clean_session);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
            info!("MQTT authentication configured");
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            client,
            broker: format!("{}:{}", config.host, config.port),
            subscribe_qos: config.subscribe_qos,
            publish_timeout: config.publish_timeout(),
            state_tx,
            subscriptions: Mutex::new(Vec::new()),
            acks: Mutex::new(AckTracker::default()),
            shutdown_tx,
            task: Mutex::new(None),
        });

        let backoff = Backoff::new(config.reconnect_min_delay(), config.reconnect_max_delay());
        info!(broker = %manager.broker, client_id = %id, "connecting to MQTT broker");

        let runner = manager.clone();
        let handle = tokio::spawn(async move {
            runner.run_event_loop(event_loop, inbound_tx, backoff).await;
        });
        *manager.task.lock() = Some(handle);

        Ok((manager, inbound_rx))
    }

    /// Wait until the session is up.
    ///
    /// On expiry returns `BrokerUnavailable`; the background loop keeps
    /// retrying regardless.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let ready = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_connected()).await.map(|_| ())
        })
        .await;

        match ready {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::BrokerUnavailable(format!(
                "no connection to {} within {:?}",
                self.broker, timeout
            ))),
        }
    }

    /// Current session state.
    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    /// Broker address as `host:port`.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Close the session and stop reconnecting.
    pub async fn close(&self) -> Result<()> {
        self.state_tx.send_replace(ConnectionState::Closed);
        let handle = self.task.lock().take();

        let flushed = self.client.try_disconnect().is_ok();
        if let Some(mut handle) = handle {
            if !flushed || tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                let _ = self.shutdown_tx.send(());
                let _ = handle.await;
            }
        }

        self.acks.lock().fail_all("connection closed");
        info!(broker = %self.broker, "disconnected from MQTT broker");
        Ok(())
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        inbound: mpsc::Sender<Message>,
        mut backoff: Backoff,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("connection shutdown requested");
                    break;
                }
                event = event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    info!(
                        broker = %self.broker,
                        session_present = connack.session_present,
                        "connected to MQTT broker"
                    );
                    backoff.reset();
                    self.acks.lock().session_started(connack.session_present);
                    self.state_tx.send_replace(ConnectionState::Connected);
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "received message");

                    let msg = Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos: publish.qos.into(),
                        retain: publish.retain,
                        received_at: Utc::now(),
                    };
                    if inbound.send(msg).await.is_err() {
                        debug!("inbound channel closed, message dropped");
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(puback))) => {
                    debug!(pkid = puback.pkid, "publish acknowledged");
                    self.acks.lock().complete(puback.pkid);
                }
                Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                    debug!(pkid = pubcomp.pkid, "publish completed");
                    self.acks.lock().complete(pubcomp.pkid);
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    if suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        warn!(pkid = suback.pkid, "broker rejected subscription");
                    } else {
                        debug!(pkid = suback.pkid, "subscription acknowledged");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("disconnected by broker");
                    self.session_lost("disconnected by broker");
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.acks.lock().assign(pkid);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.current_state() == ConnectionState::Closed {
                        break;
                    }
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "MQTT connection error");
                    self.session_lost(&e.to_string());

                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Closed);
        self.acks.lock().fail_all("connection closed");
    }

    fn session_lost(&self, reason: &str) {
        self.state_tx.send_if_modified(|state| match state {
            ConnectionState::Closed | ConnectionState::Disconnected => false,
            _ => {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        self.acks.lock().fail_all(reason);
    }

    fn resubscribe(&self) {
        let filters = self.subscriptions.lock();
        for filter in filters.iter() {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), self.subscribe_qos.into()) {
                warn!(filter = %filter, error = %e, "resubscribe failed");
            }
        }
        if !filters.is_empty() {
            debug!(count = filters.len(), "restored broker subscriptions");
        }
    }
}

#[async_trait]
impl Connection for ConnectionManager {
    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn subscribe_filter(&self, filter: &str) -> Result<()> {
        let mut filters = self.subscriptions.lock();
        self.client
            .try_subscribe(filter, self.subscribe_qos.into())
            .map_err(|e| Error::Subscribe(e.to_string()))?;
        filters.push(filter.to_string());
        debug!(filter, "subscribed");
        Ok(())
    }

    fn unsubscribe_filter(&self, filter: &str) -> Result<()> {
        let mut filters = self.subscriptions.lock();
        filters.retain(|f| f != filter);
        self.client
            .try_unsubscribe(filter)
            .map_err(|e| Error::Subscribe(e.to_string()))?;
        debug!(filter, "unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<PublishAck> {
        if !self.is_connected() {
            return Err(Error::BrokerUnavailable(format!(
                "not connected to {} ({})",
                self.broker,
                self.current_state()
            )));
        }

        let waiter = {
            let mut acks = self.acks.lock();
            self.client
                .try_publish(topic, qos.into(), retain, payload.to_vec())
                .map_err(|e| Error::Publish(e.to_string()))?;
            if qos == QoS::AtMostOnce {
                acks.enqueue(None);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                acks.enqueue(Some(tx));
                Some(rx)
            }
        };

        debug!(topic, qos = qos as u8, retain, bytes = payload.len(), "published message");

        let Some(rx) = waiter else {
            return Ok(PublishAck {
                topic: topic.to_string(),
                qos,
                acknowledged: false,
                packet_id: 0,
            });
        };

        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(Ok(pkid))) => Ok(PublishAck {
                topic: topic.to_string(),
                qos,
                acknowledged: true,
                packet_id: pkid,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::BrokerUnavailable("connection closed".to_string())),
            Err(_) => Err(Error::Publish(format!(
                "no acknowledgement for '{}' within {:?}",
                topic, self.publish_timeout
            ))),
        }
    }
}
