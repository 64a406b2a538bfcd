//! In-memory [`Connection`] for tests.
//!
//! Publishes loop straight back into the inbound channel, as a broker would
//! deliver them to this client's own subscriptions. Responders reply to
//! requests matching a filter, like a device answering a query.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::client::Connection;
use crate::error::{Error, Result};
use crate::topic;
use crate::types::{ConnectionState, Message, PublishAck, QoS};

struct Responder {
    request_filter: String,
    response_topic: String,
    payload: Bytes,
}

pub(crate) struct MockConnection {
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::Sender<Message>,
    events: Mutex<Vec<String>>,
    responders: Mutex<Vec<Responder>>,
    next_pkid: AtomicU16,
}

impl MockConnection {
    pub(crate) fn new(state: ConnectionState) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (state_tx, _) = watch::channel(state);
        let mock = Arc::new(Self {
            state_tx,
            inbound_tx,
            events: Mutex::new(Vec::new()),
            responders: Mutex::new(Vec::new()),
            next_pkid: AtomicU16::new(1),
        });
        (mock, inbound_rx)
    }

    pub(crate) fn connected() -> (Arc<Self>, mpsc::Receiver<Message>) {
        Self::new(ConnectionState::Connected)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Deliver a message as if the broker sent it.
    pub(crate) fn inject(&self, topic: &str, payload: &str) {
        let _ = self.inbound_tx.try_send(Message::new(topic, payload.to_string()));
    }

    /// Reply with `payload` on `response_topic` to every publish matching `request_filter`.
    pub(crate) fn respond(&self, request_filter: &str, response_topic: &str, payload: &str) {
        self.responders.lock().push(Responder {
            request_filter: request_filter.to_string(),
            response_topic: response_topic.to_string(),
            payload: Bytes::from(payload.to_string()),
        });
    }

    /// Broker interactions in order: `subscribe f`, `unsubscribe f`, `publish t`.
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn subscribe_filter(&self, filter: &str) -> Result<()> {
        self.events.lock().push(format!("subscribe {filter}"));
        Ok(())
    }

    fn unsubscribe_filter(&self, filter: &str) -> Result<()> {
        self.events.lock().push(format!("unsubscribe {filter}"));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<PublishAck> {
        if !self.state_tx.borrow().is_connected() {
            return Err(Error::BrokerUnavailable("mock disconnected".to_string()));
        }
        self.events.lock().push(format!("publish {topic}"));

        let msg = Message::new(topic, payload)
            .with_qos(qos)
            .with_retain(retain);
        let _ = self.inbound_tx.try_send(msg);

        for responder in self.responders.lock().iter() {
            if topic::matches(&responder.request_filter, topic) {
                let reply = Message::new(responder.response_topic.as_str(), responder.payload.clone());
                let _ = self.inbound_tx.try_send(reply);
            }
        }

        let acknowledged = qos != QoS::AtMostOnce;
        Ok(PublishAck {
            topic: topic.to_string(),
            qos,
            acknowledged,
            packet_id: if acknowledged {
                self.next_pkid.fetch_add(1, Ordering::Relaxed)
            } else {
                0
            },
        })
    }
}
