use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use wagate_core::{InstanceEvent, SubscriberId};

/// Per-instance set of bounded subscriber queues.
///
/// `broadcast` never waits: a subscriber whose queue is full misses that
/// event, and a subscriber whose receiver is gone is pruned.
pub struct EventFanout {
    subscribers: DashMap<SubscriberId, mpsc::Sender<InstanceEvent>>,
    capacity: usize,
    closed: AtomicBool,
}

impl EventFanout {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribe_with(None)
    }

    /// Subscribe and queue `initial` ahead of any broadcast event.
    pub fn subscribe_with(self: &Arc<Self>, initial: Option<InstanceEvent>) -> Subscription {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.capacity);
        if let Some(event) = initial {
            let _ = tx.try_send(event);
        }
        // A closed set hands out already-finished subscriptions.
        if !self.closed.load(Ordering::Acquire) {
            self.subscribers.insert(id.clone(), tx);
            if self.closed.load(Ordering::Acquire) {
                self.subscribers.remove(&id);
            }
        }
        Subscription {
            id,
            rx,
            fanout: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }

    /// Returns the number of subscribers the event was queued for.
    pub fn broadcast(&self, event: &InstanceEvent) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = %entry.key(), event = event.kind(), "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => gone.push(entry.key().clone()),
            }
        }
        for id in gone {
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Ends every subscription and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Receiving side of one subscriber queue. Unsubscribes on drop.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<InstanceEvent>,
    fanout: Weak<EventFanout>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// `None` once the instance is removed.
    pub async fn recv(&mut self) -> Option<InstanceEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InstanceEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = InstanceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unsubscribe(&self.id);
        }
    }
}
