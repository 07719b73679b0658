//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Request Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Op (1)   │ Len (4)  │   Payload (bincode Request) │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │  Payload (bincode Response) │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! The header byte must agree with the decoded payload.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Opcode, Request, Response, Status};
use crate::error::{ObjStoreError, Result};

/// Header size: 1 byte opcode/status + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Frames
// =============================================================================

fn encode_frame(kind: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(ObjStoreError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut message = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    message.put_u8(kind);
    message.put_u32(payload.len() as u32);
    message.put_slice(payload);
    Ok(message.freeze())
}

/// Split a complete frame into its header byte and payload
fn split_frame(bytes: &[u8]) -> Result<(u8, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(ObjStoreError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let mut header = &bytes[..HEADER_SIZE];
    let kind = header.get_u8();
    let payload_len = header.get_u32() as usize;

    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(ObjStoreError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return Err(ObjStoreError::Protocol(format!(
            "Incomplete payload: expected {} bytes, got {}",
            total_len,
            bytes.len()
        )));
    }

    Ok((kind, &bytes[HEADER_SIZE..total_len]))
}

/// Read one whole frame (header + payload) from a stream
///
/// Blocks until a complete frame is received or an error occurs
fn read_frame<R: Read>(reader: &mut R) -> Result<BytesMut> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(ObjStoreError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload_len);
    frame.put_slice(&header);
    frame.resize(HEADER_SIZE + payload_len, 0);
    if payload_len > 0 {
        reader.read_exact(&mut frame[HEADER_SIZE..])?;
    }
    Ok(frame)
}

// =============================================================================
// Request Encoding/Decoding
// =============================================================================

/// Encode a request to bytes
pub fn encode_request(request: &Request) -> Result<Bytes> {
    let payload = bincode::serialize(request)?;
    encode_frame(request.opcode() as u8, &payload)
}

/// Decode a request from bytes
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let (op, payload) = split_frame(bytes)?;
    let opcode = Opcode::from_u8(op)
        .ok_or_else(|| ObjStoreError::Protocol(format!("Unknown opcode: 0x{:02x}", op)))?;

    let request: Request = bincode::deserialize(payload)?;
    if request.opcode() != opcode {
        return Err(ObjStoreError::Protocol(format!(
            "Opcode 0x{:02x} does not match {:?} payload",
            op,
            request.opcode()
        )));
    }
    Ok(request)
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
pub fn encode_response(response: &Response) -> Result<Bytes> {
    let payload = bincode::serialize(response)?;
    encode_frame(response.status() as u8, &payload)
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let (status, payload) = split_frame(bytes)?;
    let expected = match status {
        0x00 => Status::Ok,
        0x02 => Status::Error,
        0x03 => Status::Push,
        _ => {
            return Err(ObjStoreError::Protocol(format!(
                "Unknown response status: 0x{:02x}",
                status
            )))
        }
    };

    let response: Response = bincode::deserialize(payload)?;
    if response.status() != expected {
        return Err(ObjStoreError::Protocol(format!(
            "Status 0x{:02x} does not match response payload",
            status
        )));
    }
    Ok(response)
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete request from a stream
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request> {
    let frame = read_frame(reader)?;
    decode_request(&frame)
}

/// Write a request to a stream
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<()> {
    let bytes = encode_request(request)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let frame = read_frame(reader)?;
    decode_response(&frame)
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let bytes = encode_response(response)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
