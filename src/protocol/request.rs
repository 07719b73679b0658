//! Request definitions
//!
//! Commands sent by clients, one variant per backend primitive.

use serde::{Deserialize, Serialize};

/// Opcodes carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0x01,
    Get = 0x02,
    Set = 0x03,
    Del = 0x04,
    MGet = 0x05,
    MSet = 0x06,
    SAdd = 0x07,
    SRem = 0x08,
    SMembers = 0x09,
    SScan = 0x0a,
    Scan = 0x0b,
    WatchGet = 0x0c,
    Exec = 0x0d,
    Publish = 0x0e,
    FlushDb = 0x0f,
    Subscribe = 0x10,
    PSubscribe = 0x11,
    Unsubscribe = 0x12,
    PUnsubscribe = 0x13,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Opcode::*;
        [
            Ping, Get, Set, Del, MGet, MSet, SAdd, SRem, SMembers, SScan, Scan, WatchGet, Exec,
            Publish, FlushDb, Subscribe, PSubscribe, Unsubscribe, PUnsubscribe,
        ]
        .into_iter()
        .find(|op| *op as u8 == byte)
    }
}

/// A write queued inside an optimistic transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Set { key: String, value: String },
    Del { key: String },
    SAdd { set: String, members: Vec<String> },
    SRem { set: String, members: Vec<String> },
}

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Health check
    Ping,

    Get { key: String },

    Set { key: String, value: String },

    /// Delete keys; answers the number removed
    Del { keys: Vec<String> },

    MGet { keys: Vec<String> },

    MSet { pairs: Vec<(String, String)> },

    SAdd { set: String, members: Vec<String> },

    SRem { set: String, members: Vec<String> },

    SMembers { set: String },

    /// Cursor scan over a set's members; cursor 0 starts and ends a scan
    SScan {
        set: String,
        cursor: u64,
        pattern: Option<String>,
        count: usize,
    },

    /// Cursor scan over the whole keyspace
    Scan {
        cursor: u64,
        pattern: Option<String>,
        count: usize,
    },

    /// Read values together with their versions, opening a transaction
    WatchGet { keys: Vec<String> },

    /// Apply `ops` atomically if every watched key is still at its version
    Exec {
        watched: Vec<(String, u64)>,
        ops: Vec<WriteOp>,
    },

    Publish { channel: String, message: String },

    /// Drop every key
    FlushDb,

    Subscribe { channels: Vec<String> },

    PSubscribe { patterns: Vec<String> },

    Unsubscribe { channels: Vec<String> },

    PUnsubscribe { patterns: Vec<String> },
}

impl Request {
    /// Get the opcode
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Ping => Opcode::Ping,
            Request::Get { .. } => Opcode::Get,
            Request::Set { .. } => Opcode::Set,
            Request::Del { .. } => Opcode::Del,
            Request::MGet { .. } => Opcode::MGet,
            Request::MSet { .. } => Opcode::MSet,
            Request::SAdd { .. } => Opcode::SAdd,
            Request::SRem { .. } => Opcode::SRem,
            Request::SMembers { .. } => Opcode::SMembers,
            Request::SScan { .. } => Opcode::SScan,
            Request::Scan { .. } => Opcode::Scan,
            Request::WatchGet { .. } => Opcode::WatchGet,
            Request::Exec { .. } => Opcode::Exec,
            Request::Publish { .. } => Opcode::Publish,
            Request::FlushDb => Opcode::FlushDb,
            Request::Subscribe { .. } => Opcode::Subscribe,
            Request::PSubscribe { .. } => Opcode::PSubscribe,
            Request::Unsubscribe { .. } => Opcode::Unsubscribe,
            Request::PUnsubscribe { .. } => Opcode::PUnsubscribe,
        }
    }

    /// Whether the request switches a connection into subscribe mode
    pub fn is_pubsub(&self) -> bool {
        matches!(
            self,
            Request::Subscribe { .. }
                | Request::PSubscribe { .. }
                | Request::Unsubscribe { .. }
                | Request::PUnsubscribe { .. }
        )
    }
}
