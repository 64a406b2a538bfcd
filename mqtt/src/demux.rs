//! Fan-out of inbound messages to call-scoped subscriptions.
//!
//! Routes every inbound message to **all** registered subscriptions whose
//! filter matches its topic. Each subscription owns a bounded buffer; a full
//! buffer drops further messages for that subscription only and never stalls
//! dispatch.
//!
//! Subscriptions sharing a filter string share one broker-level subscription.
//! The table reference-counts filters: the first registration for a filter
//! runs the `on_first` hook (subscribe at the broker) and the last
//! unregistration runs `on_last` (unsubscribe). Hooks run under the table
//! lock so broker requests are issued in the same order as refcount changes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::topic;
use crate::types::Message;

/// Identifier of one call-scoped subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct Table {
    /// Filter string -> subscribers on it. An entry exists only while it
    /// has at least one subscriber.
    filters: HashMap<String, Vec<Subscriber>>,
    index: HashMap<SubscriptionId, String>,
}

/// Refcounted filter table shared by all in-flight operations.
pub struct Demux {
    table: Mutex<Table>,
    next_id: AtomicU64,
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

impl Demux {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscription on `filter` with a buffer of `capacity`.
    ///
    /// `on_first` runs when `filter` had no subscribers; if it fails the
    /// registration is rolled back and the error returned.
    pub fn register<F>(
        &self,
        filter: &str,
        capacity: usize,
        on_first: F,
    ) -> Result<(SubscriptionId, mpsc::Receiver<Message>)>
    where
        F: FnOnce(&str) -> Result<()>,
    {
        if capacity == 0 {
            return Err(Error::InvalidArgument("buffer capacity must be at least 1".to_string()));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity);

        let mut table = self.table.lock();
        if !table.filters.contains_key(filter) {
            on_first(filter)?;
            debug!(filter, "first subscriber, broker subscription added");
        }
        table
            .filters
            .entry(filter.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        table.index.insert(id, filter.to_string());

        trace!(%id, filter, capacity, "subscription registered");
        Ok((id, rx))
    }

    /// Remove a subscription. Idempotent.
    ///
    /// `on_last` runs when this was the last subscriber on its filter. Once
    /// this returns, no further message is enqueued for `id`.
    pub fn unregister<F>(&self, id: SubscriptionId, on_last: F)
    where
        F: FnOnce(&str),
    {
        let mut table = self.table.lock();
        let Some(filter) = table.index.remove(&id) else {
            return;
        };

        let now_empty = match table.filters.get_mut(&filter) {
            Some(subscribers) => {
                subscribers.retain(|s| s.id != id);
                subscribers.is_empty()
            }
            None => false,
        };

        if now_empty {
            table.filters.remove(&filter);
            on_last(&filter);
            debug!(filter, "last subscriber gone, broker subscription removed");
        }
        trace!(%id, filter, "subscription unregistered");
    }

    /// Offer `msg` to every subscription whose filter matches its topic.
    ///
    /// Returns the number of buffers the message was enqueued into.
    pub fn dispatch(&self, msg: &Message) -> usize {
        let table = self.table.lock();
        let mut delivered = 0;

        for (filter, subscribers) in &table.filters {
            if !topic::matches(filter, &msg.topic) {
                continue;
            }
            for sub in subscribers {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(id = %sub.id, topic = %msg.topic, "buffer full, message dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        if delivered == 0 {
            debug!(topic = %msg.topic, "no subscription accepted message");
        }
        delivered
    }

    /// Filters that currently hold a broker-level subscription.
    pub fn filters(&self) -> Vec<String> {
        self.table.lock().filters.keys().cloned().collect()
    }

    /// Number of subscribers sharing `filter`.
    pub fn refcount(&self, filter: &str) -> usize {
        self.table
            .lock()
            .filters
            .get(filter)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Number of live subscriptions across all filters.
    pub fn active(&self) -> usize {
        self.table.lock().index.len()
    }
}

impl fmt::Debug for Demux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        let mut lines: Vec<String> = table
            .filters
            .iter()
            .map(|(filter, subs)| format!("{}: {} subscribers", filter, subs.len()))
            .collect();
        lines.sort();
        write!(f, "Demux {{ {} }}", lines.join(", "))
    }
}
