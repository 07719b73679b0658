//! Codec Tests
//!
//! Tests for request and response framing.

use std::io::Cursor;

use objstore::protocol::{
    decode_request, decode_response, encode_request, encode_response, read_request,
    read_response, write_request, write_response, ErrorKind, Opcode, PubSubMessage, Request,
    Response, Status, WriteOp, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

// =============================================================================
// Request Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_exec() {
    let request = Request::Exec {
        watched: vec![("account_a".into(), 7)],
        ops: vec![
            WriteOp::SAdd {
                set: "objset:account".into(),
                members: vec!["account_a".into()],
            },
            WriteOp::Set {
                key: "account_a".into(),
                value: r#"{"_type":"NeonUserAccount","_data":{}}"#.into(),
            },
        ],
    };
    let encoded = encode_request(&request).unwrap();
    assert_eq!(encoded[0], Opcode::Exec as u8);
    assert_eq!(decode_request(&encoded).unwrap(), request);
}

#[test]
fn test_encode_decode_empty_values() {
    let request = Request::Set {
        key: String::new(),
        value: String::new(),
    };
    let encoded = encode_request(&request).unwrap();
    assert_eq!(decode_request(&encoded).unwrap(), request);
}

#[test]
fn test_encode_decode_unicode_payload() {
    let request = Request::Publish {
        channel: "__keyspace@0__:account_ü".into(),
        message: "set ✓".into(),
    };
    let encoded = encode_request(&request).unwrap();
    assert_eq!(decode_request(&encoded).unwrap(), request);
}

// =============================================================================
// Response Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_response_status_byte() {
    let ok = encode_response(&Response::Values(vec![Some("v".into()), None])).unwrap();
    assert_eq!(ok[0], Status::Ok as u8);

    let err = encode_response(&Response::error(ErrorKind::BusyLoading, "LOADING")).unwrap();
    assert_eq!(err[0], Status::Error as u8);
    assert!(decode_response(&err).unwrap().into_result().unwrap_err().is_busy());

    let push = encode_response(&Response::Push(PubSubMessage::PMessage {
        pattern: "p*".into(),
        channel: "pa".into(),
        payload: "set".into(),
    }))
    .unwrap();
    assert_eq!(push[0], Status::Push as u8);
}

#[test]
fn test_encode_decode_versioned() {
    let response = Response::Versioned(vec![(Some("x".into()), 3), (None, 0)]);
    let encoded = encode_response(&response).unwrap();
    assert_eq!(decode_response(&encoded).unwrap(), response);
}

// =============================================================================
// Error Cases
// =============================================================================

#[test]
fn test_incomplete_header() {
    assert!(decode_request(&[Opcode::Get as u8, 0, 0]).is_err());
}

#[test]
fn test_incomplete_payload() {
    let encoded = encode_request(&Request::Get { key: "abc".into() }).unwrap();
    assert!(decode_request(&encoded[..encoded.len() - 1]).is_err());
}

#[test]
fn test_unknown_opcode() {
    let mut encoded = encode_request(&Request::Ping).unwrap().to_vec();
    encoded[0] = 0xEE;
    assert!(decode_request(&encoded).is_err());
}

#[test]
fn test_opcode_must_match_payload() {
    let mut encoded = encode_request(&Request::Get { key: "k".into() }).unwrap().to_vec();
    encoded[0] = Opcode::Del as u8;
    assert!(decode_request(&encoded).is_err());
}

#[test]
fn test_unknown_response_status() {
    let mut encoded = encode_response(&Response::Ok).unwrap().to_vec();
    encoded[0] = 0x7F;
    assert!(decode_response(&encoded).is_err());
}

#[test]
fn test_oversized_length_rejected() {
    let mut frame = vec![Opcode::Get as u8];
    frame.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
    assert!(decode_request(&frame).is_err());
    assert!(read_request(&mut Cursor::new(frame)).is_err());
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[test]
fn test_stream_multiple_requests() {
    let requests = vec![
        Request::Ping,
        Request::WatchGet {
            keys: vec!["a".into(), "b".into()],
        },
        Request::PSubscribe {
            patterns: vec!["__keyspace@0__:account_*".into()],
        },
    ];

    let mut buffer = Vec::new();
    for request in &requests {
        write_request(&mut buffer, request).unwrap();
    }

    let mut cursor = Cursor::new(buffer);
    for request in &requests {
        assert_eq!(&read_request(&mut cursor).unwrap(), request);
    }
    assert!(read_request(&mut cursor).is_err());
}

#[test]
fn test_stream_write_read_response() {
    let mut buffer = Vec::new();
    write_response(&mut buffer, &Response::Committed(false)).unwrap();
    write_response(&mut buffer, &Response::Scan { cursor: 0, keys: vec!["k".into()] }).unwrap();

    let mut cursor = Cursor::new(buffer);
    assert_eq!(read_response(&mut cursor).unwrap(), Response::Committed(false));
    assert_eq!(
        read_response(&mut cursor).unwrap(),
        Response::Scan {
            cursor: 0,
            keys: vec!["k".into()]
        }
    );
}

#[test]
fn test_wire_format_header() {
    let encoded = encode_request(&Request::Ping).unwrap();
    let len = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]) as usize;
    assert_eq!(encoded.len(), HEADER_SIZE + len);
    assert_eq!(encoded[0], 0x01);
}
