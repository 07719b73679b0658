//! Protocol Module
//!
//! Defines the wire protocol between backend drivers and the server.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//! `Kind` is the request opcode or the response status; the length is big
//! endian and the payload is the bincode encoding of a `Request` or
//! `Response`.
//!
//! ### Status Codes
//! - 0x00: OK
//! - 0x02: ERROR
//! - 0x03: PUSH (pub/sub message on a subscribed connection)

mod codec;
mod request;
mod response;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, read_request,
    read_response, write_request, write_response, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use request::{Opcode, Request, WriteOp};
pub use response::{ErrorKind, PubSubMessage, Response, Status};
