//! Pub/Sub hub
//!
//! Fans published messages out to subscribers over crossbeam channels.
//! Acknowledgements for (un)subscribe travel on the same channel as the
//! messages, in the order the hub produced them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use super::glob::glob_match;
use crate::protocol::PubSubMessage;

/// Identifies one subscriber connection
pub type SubscriberId = u64;

struct Subscriber {
    sender: Sender<PubSubMessage>,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

impl Subscriber {
    fn count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }
}

/// Registry of subscribers and their channels/patterns
#[derive(Default)]
pub struct PubSubHub {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl PubSubHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; messages for it arrive on the receiver
    pub fn register(&self) -> (SubscriberId, Receiver<PubSubMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = unbounded();
        self.subscribers.lock().insert(
            id,
            Subscriber {
                sender,
                channels: BTreeSet::new(),
                patterns: BTreeSet::new(),
            },
        );
        (id, receiver)
    }

    /// Drop a subscriber and every subscription it holds
    pub fn remove(&self, id: SubscriberId) {
        self.subscribers.lock().remove(&id);
    }

    pub fn subscribe(&self, id: SubscriberId, channels: &[String]) {
        let mut subscribers = self.subscribers.lock();
        if let Some(sub) = subscribers.get_mut(&id) {
            for channel in channels {
                sub.channels.insert(channel.clone());
                let count = sub.count();
                let _ = sub.sender.send(PubSubMessage::Subscribed {
                    channel: channel.clone(),
                    count,
                });
            }
        }
    }

    pub fn psubscribe(&self, id: SubscriberId, patterns: &[String]) {
        let mut subscribers = self.subscribers.lock();
        if let Some(sub) = subscribers.get_mut(&id) {
            for pattern in patterns {
                sub.patterns.insert(pattern.clone());
                let count = sub.count();
                let _ = sub.sender.send(PubSubMessage::PSubscribed {
                    pattern: pattern.clone(),
                    count,
                });
            }
        }
    }

    /// Unsubscribe from channels; an empty list means all of them
    pub fn unsubscribe(&self, id: SubscriberId, channels: &[String]) {
        let mut subscribers = self.subscribers.lock();
        if let Some(sub) = subscribers.get_mut(&id) {
            let targets: Vec<String> = if channels.is_empty() {
                sub.channels.iter().cloned().collect()
            } else {
                channels.to_vec()
            };
            for channel in targets {
                sub.channels.remove(&channel);
                let count = sub.count();
                let _ = sub.sender.send(PubSubMessage::Unsubscribed { channel, count });
            }
        }
    }

    /// Unsubscribe from patterns; an empty list means all of them
    pub fn punsubscribe(&self, id: SubscriberId, patterns: &[String]) {
        let mut subscribers = self.subscribers.lock();
        if let Some(sub) = subscribers.get_mut(&id) {
            let targets: Vec<String> = if patterns.is_empty() {
                sub.patterns.iter().cloned().collect()
            } else {
                patterns.to_vec()
            };
            for pattern in targets {
                sub.patterns.remove(&pattern);
                let count = sub.count();
                let _ = sub.sender.send(PubSubMessage::PUnsubscribed { pattern, count });
            }
        }
    }

    /// Deliver a message; returns how many subscriptions received it
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, sub) in subscribers.iter() {
            let mut ok = true;
            if sub.channels.contains(channel) {
                ok &= sub
                    .sender
                    .send(PubSubMessage::Message {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok();
                delivered += 1;
            }
            for pattern in sub.patterns.iter().filter(|p| glob_match(p, channel)) {
                ok &= sub
                    .sender
                    .send(PubSubMessage::PMessage {
                        pattern: pattern.clone(),
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok();
                delivered += 1;
            }
            if !ok {
                gone.push(*id);
            }
        }

        for id in gone {
            trace!(subscriber = id, "Dropping subscriber with closed channel");
            subscribers.remove(&id);
        }
        delivered
    }

    /// Drop every subscriber; their receivers observe a disconnect
    pub fn disconnect_all(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
