//! Connection state of a change bus worker

use std::fmt;
use std::time::Instant;

use crate::backend::PubSub;
use crate::config::BackendAddr;

/// A live subscriber connection
pub(crate) struct Session {
    pub pubsub: Box<dyn PubSub>,
    pub addr: BackendAddr,
}

/// State machine owned by the worker thread
pub(crate) enum BusState {
    /// No connection; the next attempt happens at `retry_at`
    Disconnected { failures: u32, retry_at: Instant },

    Connecting { failures: u32 },

    Connected(Session),
}

impl BusState {
    pub fn disconnected_now() -> Self {
        BusState::Disconnected {
            failures: 0,
            retry_at: Instant::now(),
        }
    }

    pub fn status(&self) -> BusStatus {
        match self {
            BusState::Disconnected { failures, .. } => BusStatus::Disconnected {
                failures: *failures,
            },
            BusState::Connecting { .. } => BusStatus::Connecting,
            BusState::Connected(session) => BusStatus::Connected {
                addr: session.addr.clone(),
            },
        }
    }
}

/// Snapshot of a worker's state for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusStatus {
    Disconnected { failures: u32 },
    Connecting,
    Connected { addr: BackendAddr },
    Stopped,
}

impl BusStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, BusStatus::Connected { .. })
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusStatus::Disconnected { failures } => {
                write!(f, "disconnected ({} failed attempts)", failures)
            }
            BusStatus::Connecting => f.write_str("connecting"),
            BusStatus::Connected { addr } => write!(f, "connected to {}", addr),
            BusStatus::Stopped => f.write_str("stopped"),
        }
    }
}
