//! The change notification bus.
//!
//! The appliance server publishes one [`Event`] per committed change; the
//! cloud mirror republishes an equivalent stream per site. Fan-out goes
//! through per-subscriber bounded queues with a coalesced "data available"
//! wake-up: enqueuers never block, and a subscriber drains every pending
//! message (and any stale wake signals) each time it wakes.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Change,
    Delete,
    Expire,
}

/// A single property change, delete, or expiration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires: Option<OffsetDateTime>,
}

impl Event {
    /// The wire rendering of the new value; deletes and expirations carry
    /// `-`.
    pub fn display_value(&self) -> &str {
        self.value.as_deref().unwrap_or("-")
    }
}

/// Number of messages a subscriber may lag behind before the oldest are
/// dropped.
const SUBSCRIBER_CAP: usize = 1024;

struct SubEntry<T> {
    queue: Arc<Mutex<VecDeque<T>>>,
    wake: crossbeam_channel::Sender<()>,
    closed: Arc<AtomicBool>,
    dropped: u64,
}

/// A multi-subscriber broadcast queue. Subscribers receive every message
/// pushed after they subscribed, in push order.
pub struct MessageQueue<T> {
    subs: Mutex<Vec<SubEntry<T>>>,
}

impl<T: Clone> MessageQueue<T> {
    pub fn new() -> Self {
        MessageQueue {
            subs: Mutex::new(Vec::new()),
        }
    }

    pub fn push_messages(&self, messages: &[T]) {
        if messages.is_empty() {
            return;
        }

        let mut subs = self.subs.lock().unwrap();
        subs.retain(|sub| !sub.closed.load(Ordering::Acquire));

        for sub in subs.iter_mut() {
            {
                let mut queue = sub.queue.lock().unwrap();
                for message in messages {
                    if queue.len() >= SUBSCRIBER_CAP {
                        queue.pop_front();
                        sub.dropped += 1;
                        if sub.dropped % 256 == 1 {
                            log::warn!("slow subscriber: {} messages dropped", sub.dropped);
                        }
                    }
                    queue.push_back(message.clone());
                }
            }
            // A full channel means a wake-up is already pending; bursts
            // coalesce into one signal.
            let _ = sub.wake.try_send(());
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);

        self.subs.lock().unwrap().push(SubEntry {
            queue: Arc::clone(&queue),
            wake: wake_tx,
            closed: Arc::clone(&closed),
            dropped: 0,
        });

        Subscription {
            queue,
            wake: wake_rx,
            closed,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|sub| !sub.closed.load(Ordering::Acquire));
        subs.len()
    }
}

impl<T: Clone> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of a [`MessageQueue`]. Dropping it unsubscribes
/// (the queue side reaps the entry on its next push).
pub struct Subscription<T> {
    queue: Arc<Mutex<VecDeque<T>>>,
    wake: crossbeam_channel::Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl<T: Clone> Subscription<T> {
    /// Drains everything currently queued, along with any stale wake
    /// signals.
    pub fn try_drain(&self) -> Vec<T> {
        while self.wake.try_recv().is_ok() {}
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Waits up to `timeout` for messages. Returns an empty vec on timeout
    /// or when the queue side has gone away.
    pub fn recv_timeout(&self, timeout: Duration) -> Vec<T> {
        let messages = self.try_drain();
        if !messages.is_empty() {
            return messages;
        }

        match self.wake.recv_timeout(timeout) {
            Ok(()) => self.try_drain(),
            Err(_) => Vec::new(),
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(property: &str) -> Event {
        Event {
            kind: EventKind::Change,
            property: property.to_owned(),
            value: Some("v".to_owned()),
            expires: None,
        }
    }

    #[test]
    fn subscribers_only_see_messages_after_subscribing() {
        let mq = MessageQueue::new();
        mq.push_messages(&[event("@/before")]);

        let sub = mq.subscribe();
        mq.push_messages(&[event("@/a"), event("@/b")]);

        let got = sub.try_drain();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].property, "@/a");
        assert_eq!(got[1].property, "@/b");
    }

    #[test]
    fn burst_coalesces_into_one_wake() {
        let mq = MessageQueue::new();
        let sub = mq.subscribe();

        for i in 0..10 {
            mq.push_messages(&[event(&format!("@/p{i}"))]);
        }

        let got = sub.recv_timeout(Duration::from_millis(100));
        assert_eq!(got.len(), 10);

        // No stale wake signal should remain.
        let got = sub.recv_timeout(Duration::from_millis(10));
        assert!(got.is_empty());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let mq = MessageQueue::<Event>::new();
        let sub = mq.subscribe();
        assert_eq!(mq.subscriber_count(), 1);
        drop(sub);
        assert_eq!(mq.subscriber_count(), 0);
    }
}
