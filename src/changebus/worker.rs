//! Change bus worker
//!
//! One thread per entity kind. It owns the subscriber connection, the
//! subscription table and every pending (un)subscribe ack. Callers talk
//! to it only through the command channel.
//!
//! ## Loop turn
//! 1. Apply queued commands
//! 2. Advance the connection state (connect, detect address moves)
//! 3. Drain buffered messages and hand them to the sinks
//! 4. Expire pending acks whose deadline has passed

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::event::{ChangeSink, Notification};
use super::state::{BusState, BusStatus, Session};
use crate::backend::PubSub;
use crate::connection::ConnectionManager;
use crate::error::{Result, SubscriptionError};
use crate::keyspace::is_pattern;
use crate::protocol::PubSubMessage;
use crate::record::EntityKind;

pub(crate) type Ack = oneshot::Sender<std::result::Result<(), SubscriptionError>>;

pub(crate) enum Command {
    Subscribe {
        channel: String,
        sink: Arc<dyn ChangeSink>,
        ack: Ack,
    },
    Unsubscribe {
        channel: String,
        ack: Ack,
    },
    Shutdown,
}

/// Callers waiting for the backend to confirm a subscription change
struct Pending {
    acks: Vec<Ack>,
    deadline: Instant,
}

impl Pending {
    fn resolve(self, result: std::result::Result<(), SubscriptionError>) {
        for ack in self.acks {
            let _ = ack.send(result.clone());
        }
    }
}

pub(crate) struct Worker {
    kind: EntityKind,
    manager: Arc<ConnectionManager>,
    commands: Receiver<Command>,
    status: Arc<Mutex<BusStatus>>,
    state: BusState,

    // -------------------------------------------------------------------------
    // Subscriptions (full channel or pattern -> sink)
    // -------------------------------------------------------------------------
    subscriptions: BTreeMap<String, Arc<dyn ChangeSink>>,
    pending_sub: HashMap<String, Pending>,
    pending_unsub: HashMap<String, Pending>,

    // -------------------------------------------------------------------------
    // Timing
    // -------------------------------------------------------------------------
    poll_interval: Duration,
    ack_timeout: Duration,
}

impl Worker {
    pub fn new(
        kind: EntityKind,
        manager: Arc<ConnectionManager>,
        commands: Receiver<Command>,
        status: Arc<Mutex<BusStatus>>,
    ) -> Self {
        let config = manager.config();
        let poll_interval = config.bus_poll_interval().max(Duration::from_millis(1));
        let ack_timeout = config.subscribe_timeout();
        Self {
            kind,
            manager,
            commands,
            status,
            state: BusState::disconnected_now(),
            subscriptions: BTreeMap::new(),
            pending_sub: HashMap::new(),
            pending_unsub: HashMap::new(),
            poll_interval,
            ack_timeout,
        }
    }

    pub fn run(mut self) {
        debug!(kind = %self.kind, "Change bus worker started");

        while self.handle_commands() {
            self.advance();
            self.expire_pending();
            *self.status.lock() = self.state.status();
        }

        for (channel, pending) in self.pending_sub.drain().chain(self.pending_unsub.drain()) {
            debug!(%channel, "Failing pending ack on shutdown");
            pending.resolve(Err(SubscriptionError::WorkerGone(self.kind.to_string())));
        }
        *self.status.lock() = BusStatus::Stopped;
        info!(kind = %self.kind, "Change bus worker stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply every queued command; false once the worker should stop
    fn handle_commands(&mut self) -> bool {
        // While connected, the message pump does the waiting
        if !matches!(self.state, BusState::Connected(_)) {
            match self.commands.recv_timeout(self.idle_wait()) {
                Ok(command) => {
                    if !self.apply(command) {
                        return false;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }

        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.apply(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn idle_wait(&self) -> Duration {
        match &self.state {
            BusState::Disconnected { retry_at, .. } if !self.subscriptions.is_empty() => retry_at
                .saturating_duration_since(Instant::now())
                .min(self.poll_interval),
            BusState::Connecting { .. } => Duration::ZERO,
            _ => self.poll_interval,
        }
    }

    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe { channel, sink, ack } => self.subscribe(channel, sink, ack),
            Command::Unsubscribe { channel, ack } => self.unsubscribe(channel, ack),
            Command::Shutdown => return false,
        }
        true
    }

    fn subscribe(&mut self, channel: String, sink: Arc<dyn ChangeSink>, ack: Ack) {
        debug!(kind = %self.kind, %channel, "Subscribing");
        self.subscriptions.insert(channel.clone(), sink);
        let deadline = Instant::now() + self.ack_timeout;
        self.pending_sub
            .entry(channel.clone())
            .or_insert_with(|| Pending {
                acks: Vec::new(),
                deadline,
            })
            .acks
            .push(ack);

        // Otherwise issued once a connection comes up
        if let BusState::Connected(session) = &mut self.state {
            if let Err(e) = issue(session.pubsub.as_mut(), &channel, true) {
                warn!(kind = %self.kind, %channel, "Subscribe failed, reconnecting: {}", e);
                self.state = BusState::disconnected_now();
            }
        }
    }

    fn unsubscribe(&mut self, channel: String, ack: Ack) {
        debug!(kind = %self.kind, %channel, "Unsubscribing");
        if self.subscriptions.remove(&channel).is_none() {
            let _ = ack.send(Ok(()));
            return;
        }
        if let Some(pending) = self.pending_sub.remove(&channel) {
            pending.resolve(Err(SubscriptionError::Backend {
                pattern: channel.clone(),
                action: "subscribe",
                reason: "unsubscribed before the backend confirmed".to_string(),
            }));
        }

        let BusState::Connected(session) = &mut self.state else {
            // Nothing is subscribed on the wire
            let _ = ack.send(Ok(()));
            return;
        };

        let deadline = Instant::now() + self.ack_timeout;
        self.pending_unsub
            .entry(channel.clone())
            .or_insert_with(|| Pending {
                acks: Vec::new(),
                deadline,
            })
            .acks
            .push(ack);

        if let Err(e) = issue(session.pubsub.as_mut(), &channel, false) {
            warn!(kind = %self.kind, %channel, "Unsubscribe failed, reconnecting: {}", e);
            self.state = BusState::disconnected_now();
        }
    }

    // =========================================================================
    // Connection state
    // =========================================================================

    fn advance(&mut self) {
        let state = mem::replace(&mut self.state, BusState::disconnected_now());
        self.state = match state {
            BusState::Disconnected { failures, retry_at } => {
                if !self.subscriptions.is_empty() && Instant::now() >= retry_at {
                    BusState::Connecting { failures }
                } else {
                    BusState::Disconnected { failures, retry_at }
                }
            }
            BusState::Connecting { failures } => self.connect(failures),
            BusState::Connected(session) => self.service(session),
        };
    }

    fn connect(&mut self, failures: u32) -> BusState {
        match self.open_session() {
            Ok(session) => {
                info!(kind = %self.kind, addr = %session.addr, "Change bus connected");
                // The new connection carries none of the old unsubscriptions
                for (_, pending) in self.pending_unsub.drain() {
                    pending.resolve(Ok(()));
                }
                BusState::Connected(session)
            }
            Err(e) => {
                let failures = failures + 1;
                let delay = self
                    .manager
                    .config()
                    .bus_reconnect_delay(failures.saturating_sub(1));
                warn!(
                    kind = %self.kind,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Change bus connect failed: {}",
                    e
                );
                BusState::Disconnected {
                    failures,
                    retry_at: Instant::now() + delay,
                }
            }
        }
    }

    /// Connect and re-issue every registered subscription
    fn open_session(&self) -> Result<Session> {
        let binding = self.manager.get(self.kind)?;
        let mut pubsub = binding.backend().pubsub()?;
        for channel in self.subscriptions.keys() {
            issue(pubsub.as_mut(), channel, true)?;
        }
        Ok(Session {
            pubsub,
            addr: binding.addr().clone(),
        })
    }

    fn service(&mut self, mut session: Session) -> BusState {
        match self.manager.resolve(self.kind) {
            Ok(addr) if addr != session.addr => {
                info!(kind = %self.kind, from = %session.addr, to = %addr, "Change bus address moved");
                return BusState::Connecting { failures: 0 };
            }
            Ok(_) => {}
            Err(e) => warn!(kind = %self.kind, "Could not resolve change bus address: {}", e),
        }

        match self.pump(session.pubsub.as_mut()) {
            Ok(()) => BusState::Connected(session),
            Err(e) => {
                warn!(kind = %self.kind, addr = %session.addr, "Change bus connection lost: {}", e);
                BusState::disconnected_now()
            }
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Wait up to one poll interval, then drain whatever else is buffered
    fn pump(&mut self, pubsub: &mut dyn PubSub) -> Result<()> {
        let first = match pubsub.recv_timeout(self.poll_interval)? {
            Some(message) => message,
            None => return Ok(()),
        };

        let mut batch = vec![first];
        let mut failure = None;
        loop {
            match pubsub.try_recv() {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.dispatch(batch);
        failure.map_or(Ok(()), Err)
    }

    fn dispatch(&mut self, batch: Vec<PubSubMessage>) {
        // Per-sink batches in arrival order
        let mut groups: Vec<(String, Vec<Notification>)> = Vec::new();

        for message in batch {
            match message {
                PubSubMessage::Subscribed { channel, .. }
                | PubSubMessage::PSubscribed {
                    pattern: channel, ..
                } => {
                    if let Some(pending) = self.pending_sub.remove(&channel) {
                        debug!(kind = %self.kind, %channel, "Subscription confirmed");
                        pending.resolve(Ok(()));
                    }
                }
                PubSubMessage::Unsubscribed { channel, .. }
                | PubSubMessage::PUnsubscribed {
                    pattern: channel, ..
                } => {
                    if let Some(pending) = self.pending_unsub.remove(&channel) {
                        debug!(kind = %self.kind, %channel, "Unsubscription confirmed");
                        pending.resolve(Ok(()));
                    }
                }
                PubSubMessage::Message { channel, payload } => {
                    route(&mut groups, channel.clone(), &channel, &payload);
                }
                PubSubMessage::PMessage {
                    pattern,
                    channel,
                    payload,
                } => {
                    route(&mut groups, pattern, &channel, &payload);
                }
            }
        }

        for (subscription, notes) in groups {
            // Unsubscribed while the batch was buffered
            let Some(sink) = self.subscriptions.get(&subscription) else {
                continue;
            };
            sink.deliver(notes);
        }
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let timeout_ms = self.ack_timeout.as_millis() as u64;

        let expired: Vec<String> = self
            .pending_sub
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in expired {
            let Some(pending) = self.pending_sub.remove(&channel) else {
                continue;
            };
            warn!(kind = %self.kind, %channel, timeout_ms, "Subscribe ack timed out, rolling back");
            self.subscriptions.remove(&channel);
            if let BusState::Connected(session) = &mut self.state {
                let _ = issue(session.pubsub.as_mut(), &channel, false);
            }
            pending.resolve(Err(SubscriptionError::Timeout {
                pattern: channel,
                action: "subscribe",
                timeout_ms,
            }));
        }

        let expired: Vec<String> = self
            .pending_unsub
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in expired {
            let Some(pending) = self.pending_unsub.remove(&channel) else {
                continue;
            };
            warn!(kind = %self.kind, %channel, timeout_ms, "Unsubscribe ack timed out");
            pending.resolve(Err(SubscriptionError::Timeout {
                pattern: channel,
                action: "unsubscribe",
                timeout_ms,
            }));
        }
    }
}

/// SUBSCRIBE or PSUBSCRIBE (and the reverse) depending on the channel
fn issue(pubsub: &mut dyn PubSub, channel: &str, subscribe: bool) -> Result<()> {
    match (is_pattern(channel), subscribe) {
        (true, true) => pubsub.psubscribe(channel),
        (false, true) => pubsub.subscribe(channel),
        (true, false) => pubsub.punsubscribe(channel),
        (false, false) => pubsub.unsubscribe(channel),
    }
}

fn route(groups: &mut Vec<(String, Vec<Notification>)>, subscription: String, channel: &str, payload: &str) {
    let Some(note) = Notification::from_channel(channel, payload) else {
        return;
    };
    match groups.iter_mut().find(|(s, _)| *s == subscription) {
        Some((_, notes)) => notes.push(note),
        None => groups.push((subscription, vec![note])),
    }
}
