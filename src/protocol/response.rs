//! Response definitions
//!
//! Represents responses and pub/sub pushes sent to clients.

use serde::{Deserialize, Serialize};

use crate::error::{ObjStoreError, Result};

/// Response status codes carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    Error = 0x02,
    Push = 0x03,
}

/// Class of a backend-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Dataset still loading; try again later
    BusyLoading,

    /// Operation against a key holding the wrong kind of value
    WrongType,

    /// Malformed or out-of-place request
    Protocol,

    Internal,
}

/// Messages delivered to a connection in subscribe mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PubSubMessage {
    Subscribed { channel: String, count: usize },
    PSubscribed { pattern: String, count: usize },
    Unsubscribed { channel: String, count: usize },
    PUnsubscribed { pattern: String, count: usize },
    Message { channel: String, payload: String },
    PMessage {
        pattern: String,
        channel: String,
        payload: String,
    },
}

/// A response to send to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Pong,
    Value(Option<String>),
    Values(Vec<Option<String>>),
    /// Values with the versions a later `Exec` must match
    Versioned(Vec<(Option<String>, u64)>),
    Members(Vec<String>),
    Scan { cursor: u64, keys: Vec<String> },
    Int(i64),
    /// Outcome of `Exec`; false on a watch conflict
    Committed(bool),
    Error { kind: ErrorKind, message: String },
    Push(PubSubMessage),
}

impl Response {
    /// Create an ERROR response
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Error { .. } => Status::Error,
            Response::Push(_) => Status::Push,
            _ => Status::Ok,
        }
    }

    /// Turn an error response into the matching crate error
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { kind, message } => Err(match kind {
                ErrorKind::BusyLoading => ObjStoreError::Busy(message),
                ErrorKind::WrongType => ObjStoreError::Command(message),
                ErrorKind::Protocol => ObjStoreError::Protocol(message),
                ErrorKind::Internal => ObjStoreError::BackendInternal(message),
            }),
            other => Ok(other),
        }
    }

    pub fn into_unit(self) -> Result<()> {
        match self.into_result()? {
            Response::Ok | Response::Pong | Response::Int(_) => Ok(()),
            other => Err(unexpected("OK", &other)),
        }
    }

    pub fn into_value(self) -> Result<Option<String>> {
        match self.into_result()? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected("VALUE", &other)),
        }
    }

    pub fn into_values(self) -> Result<Vec<Option<String>>> {
        match self.into_result()? {
            Response::Values(values) => Ok(values),
            other => Err(unexpected("VALUES", &other)),
        }
    }

    pub fn into_versioned(self) -> Result<Vec<(Option<String>, u64)>> {
        match self.into_result()? {
            Response::Versioned(values) => Ok(values),
            other => Err(unexpected("VERSIONED", &other)),
        }
    }

    pub fn into_members(self) -> Result<Vec<String>> {
        match self.into_result()? {
            Response::Members(members) => Ok(members),
            other => Err(unexpected("MEMBERS", &other)),
        }
    }

    pub fn into_scan(self) -> Result<(u64, Vec<String>)> {
        match self.into_result()? {
            Response::Scan { cursor, keys } => Ok((cursor, keys)),
            other => Err(unexpected("SCAN", &other)),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self.into_result()? {
            Response::Int(n) => Ok(n),
            other => Err(unexpected("INT", &other)),
        }
    }

    pub fn into_committed(self) -> Result<bool> {
        match self.into_result()? {
            Response::Committed(committed) => Ok(committed),
            other => Err(unexpected("COMMITTED", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> ObjStoreError {
    ObjStoreError::Protocol(format!("expected {} response, got {:?}", expected, got))
}
