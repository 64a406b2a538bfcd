//! Permission-checked MQTT operations over one shared connection.
//!
//! The [`Orchestrator`] turns a single broker session into many isolated,
//! concurrent operations:
//!
//! - [`publish`](Orchestrator::publish): check write, then publish.
//! - [`subscribe`](Orchestrator::subscribe): collect up to `max_messages`
//!   on a filter until a deadline; an empty result is not an error.
//! - [`read`](Orchestrator::read): one message or [`Error::Timeout`].
//! - [`query`](Orchestrator::query): listen on a response filter, publish a
//!   request, await the first reply.
//!
//! Every subscribe/read/query owns a [`LogicalSubscription`] with its own
//! bounded buffer. The subscription is removed from the dispatch table on
//! every exit path, including cancellation and dropping the call future.
//!
//! Query replies are correlated by topic filter only. Two concurrent queries
//! on the same response filter both receive every matching reply, so one
//! may observe the answer to the other's request.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acl::{Permission, PermissionRegistry};
use crate::client::Connection;
use crate::demux::{Demux, SubscriptionId};
use crate::error::{Error, Result};
use crate::topic;
use crate::types::{ConnectionState, Message, PublishAck, QoS};

/// Upper bound on `max_messages` for one subscribe call.
pub const MAX_MESSAGES: usize = 10_000;

/// Default time a publish waits for the session to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs publish / subscribe / read / query against a shared [`Connection`].
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<PermissionRegistry>,
    connection: Arc<dyn Connection>,
    demux: Arc<Demux>,
    ready_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator. Call [`spawn_dispatcher`](Self::spawn_dispatcher)
    /// with the connection's inbound stream before subscribing.
    pub fn new(registry: Arc<PermissionRegistry>, connection: Arc<dyn Connection>) -> Self {
        Self {
            registry,
            connection,
            demux: Arc::new(Demux::new()),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// How long a publish waits for the session to become ready.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Start the task that fans inbound messages out to live subscriptions.
    ///
    /// The task ends when the inbound stream closes.
    pub fn spawn_dispatcher(&self, mut inbound: mpsc::Receiver<Message>) -> JoinHandle<()> {
        let demux = self.demux.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                demux.dispatch(&msg);
            }
            debug!("inbound stream closed, dispatcher stopped");
        })
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    /// Current session state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.state().borrow()
    }

    /// Number of live logical subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.demux.active()
    }

    /// Number of logical subscriptions sharing the broker subscription on `filter`.
    pub fn refcount(&self, filter: &str) -> usize {
        self.demux.refcount(filter)
    }

    /// Publish `payload` to `topic` after checking write permission.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishAck> {
        topic::validate_topic_name(topic).map_err(Error::InvalidArgument)?;
        self.registry.check(topic, Permission::Write)?;

        let deadline = deadline_after(self.ready_timeout)?;
        let mut state = self.connection.state();
        wait_ready(&mut state, deadline, &CancellationToken::new()).await?;

        let ack = self.connection.publish(topic, payload, qos, retain).await?;
        info!(topic, qos = qos as u8, acknowledged = ack.acknowledged, "published");
        Ok(ack)
    }

    /// Collect up to `max_messages` messages on `filter` until `timeout` elapses.
    ///
    /// Returns early once `max_messages` have arrived. An empty list after
    /// the timeout is a successful result.
    pub async fn subscribe(
        &self,
        filter: &str,
        timeout: Duration,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        validate_filter(filter)?;
        if max_messages == 0 || max_messages > MAX_MESSAGES {
            return Err(Error::InvalidArgument(format!(
                "max_messages must be between 1 and {MAX_MESSAGES}, got {max_messages}"
            )));
        }
        self.registry.check(filter, Permission::Read)?;

        let deadline = deadline_after(timeout)?;
        let mut state = self.connection.state();
        wait_ready(&mut state, deadline, cancel).await?;

        let sub = self.open(filter, max_messages, deadline)?;
        let messages = sub.collect(&mut state, cancel).await?;
        debug!(filter, received = messages.len(), "subscribe finished");
        Ok(messages)
    }

    /// Wait for a single message on `filter`.
    pub async fn read(
        &self,
        filter: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        self.subscribe(filter, timeout, 1, cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Timeout {
                filter: filter.to_string(),
                timeout,
            })
    }

    /// Publish a request and wait for the first reply on `response_filter`.
    ///
    /// The response subscription is registered before the request goes out
    /// so a fast responder's reply is not missed.
    pub async fn query(
        &self,
        request_topic: &str,
        response_filter: &str,
        payload: Bytes,
        qos: QoS,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        topic::validate_topic_name(request_topic).map_err(Error::InvalidArgument)?;
        validate_filter(response_filter)?;
        self.registry.check(request_topic, Permission::Write)?;
        self.registry.check(response_filter, Permission::Read)?;

        let deadline = deadline_after(timeout)?;
        let mut state = self.connection.state();
        wait_ready(&mut state, deadline, cancel).await?;

        let sub = self.open(response_filter, 1, deadline)?;

        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.connection.publish(request_topic, payload, qos, false) => result?,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::Timeout { filter: response_filter.to_string(), timeout });
            }
        };
        debug!(request_topic, response_filter, acknowledged = published.acknowledged, "query request sent");

        sub.collect(&mut state, cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Timeout {
                filter: response_filter.to_string(),
                timeout,
            })
    }

    /// Register a call-scoped subscription on `filter`.
    pub(crate) fn open(&self, filter: &str, capacity: usize, deadline: Instant) -> Result<LogicalSubscription> {
        let connection = &self.connection;
        let (id, rx) = self
            .demux
            .register(filter, capacity, |f| connection.subscribe_filter(f))?;

        Ok(LogicalSubscription {
            id,
            filter: filter.to_string(),
            capacity,
            deadline,
            rx,
            demux: self.demux.clone(),
            connection: self.connection.clone(),
        })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("rules", &self.registry.rules().len())
            .field("demux", &self.demux)
            .finish()
    }
}

/// Call-scoped subscription with a bounded buffer and a deadline.
///
/// Unregisters from the dispatch table when dropped. Once dropped no
/// further message is enqueued, and the broker subscription is released if
/// this was its last user.
pub struct LogicalSubscription {
    id: SubscriptionId,
    filter: String,
    capacity: usize,
    deadline: Instant,
    rx: mpsc::Receiver<Message>,
    demux: Arc<Demux>,
    connection: Arc<dyn Connection>,
}

impl LogicalSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait until the buffer holds `capacity` messages or the deadline passes.
    ///
    /// Fails with `Cancelled` when `cancel` fires and with
    /// `BrokerUnavailable` when the session drops.
    pub async fn collect(
        mut self,
        state: &mut watch::Receiver<ConnectionState>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        if !state.borrow_and_update().is_connected() {
            return Err(self.connection_lost());
        }

        let mut messages = Vec::with_capacity(self.capacity.min(64));
        while messages.len() < self.capacity {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(id = %self.id, filter = %self.filter, "subscription cancelled");
                    return Err(Error::Cancelled);
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => messages.push(msg),
                    None => break,
                },
                changed = state.changed() => {
                    if changed.is_err() || !state.borrow_and_update().is_connected() {
                        return Err(self.connection_lost());
                    }
                }
                _ = tokio::time::sleep_until(self.deadline) => break,
            }
        }
        Ok(messages)
    }

    fn connection_lost(&self) -> Error {
        warn!(id = %self.id, filter = %self.filter, "connection lost during subscription");
        Error::BrokerUnavailable(format!("connection lost while waiting on '{}'", self.filter))
    }
}

impl Drop for LogicalSubscription {
    fn drop(&mut self) {
        let connection = &self.connection;
        self.demux.unregister(self.id, |filter| {
            if let Err(e) = connection.unsubscribe_filter(filter) {
                warn!(filter, error = %e, "broker unsubscribe failed");
            }
        });
    }
}

fn validate_filter(filter: &str) -> Result<()> {
    topic::validate_filter(filter).map_err(Error::InvalidArgument)
}

fn deadline_after(timeout: Duration) -> Result<Instant> {
    Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| Error::InvalidArgument(format!("timeout {timeout:?} is too large")))
}

/// Wait for `Connected`, giving up at `deadline` or on `Closed`.
async fn wait_ready(
    state: &mut watch::Receiver<ConnectionState>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<()> {
    if state.borrow_and_update().is_connected() {
        return Ok(());
    }

    let ready = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        ready = state.wait_for(|s| s.is_connected() || *s == ConnectionState::Closed) => {
            ready.map(|s| *s).ok()
        }
        _ = tokio::time::sleep_until(deadline) => None,
    };

    match ready {
        Some(ConnectionState::Connected) => Ok(()),
        Some(other) => Err(Error::BrokerUnavailable(format!("connection {other}"))),
        None => Err(Error::BrokerUnavailable(format!(
            "broker not connected ({})",
            *state.borrow()
        ))),
    }
}
