//! Key codec
//!
//! Namespacing of keys and polymorphic (de)serialization of records.
//!
//! ## Key Layout
//! ```text
//! <namespace>_<id>            record payload (JSON envelope)
//! objset:<namespace>          entity set of the kind
//! objset:<namespace>:<owner>  entity set of an owner-grouped kind
//! ```

use serde_json::{Map, Value};

use super::{EntityKind, Record, RecordTag, StoredObject};
use crate::error::{DecodeError, Result};

/// Field holding the concrete type name
pub const TYPE_FIELD: &str = "_type";

/// Field holding the record body
pub const DATA_FIELD: &str = "_data";

/// Prefix of every entity set key
pub const SET_PREFIX: &str = "objset";

/// Fields left out of content comparisons
const VOLATILE_FIELDS: [&str; 2] = ["created", "updated"];

// =============================================================================
// Keys
// =============================================================================

/// Namespace an id. Idempotent: a value already carrying the
/// `<namespace>_` prefix is returned unchanged.
pub fn format_key(kind: EntityKind, id: &str) -> String {
    let ns = kind.namespace();
    if id.len() > ns.len() && id.starts_with(ns) && id.as_bytes()[ns.len()] == b'_' {
        id.to_string()
    } else {
        format!("{}_{}", ns, id)
    }
}

/// Strip the namespace from a key; ids without it pass through
pub fn key_to_id(kind: EntityKind, key: &str) -> &str {
    key.strip_prefix(kind.namespace())
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(key)
}

/// Entity set holding every key of a kind
pub fn entity_set_key(kind: EntityKind) -> String {
    format!("{}:{}", SET_PREFIX, kind.namespace())
}

/// Entity set of the keys a single owner holds
pub fn owner_set_key(kind: EntityKind, owner: &str) -> String {
    format!("{}:{}:{}", SET_PREFIX, kind.namespace(), owner)
}

// =============================================================================
// Envelopes
// =============================================================================

/// Envelope of a concrete record as a JSON value
pub fn envelope(record: &Record) -> Result<Value> {
    let mut map = Map::with_capacity(2);
    map.insert(TYPE_FIELD.to_string(), Value::String(record.tag().name().to_string()));
    map.insert(DATA_FIELD.to_string(), record.to_data()?);
    Ok(Value::Object(map))
}

/// Serialize a record into its stored envelope string
pub fn encode<T: StoredObject>(obj: &T) -> Result<String> {
    let value = envelope(&obj.to_record())?;
    Ok(serde_json::to_string(&value)?)
}

/// Decode a stored payload into any concrete record.
///
/// Flat legacy payloads (no `_type`/`_data`) are decoded with the tag
/// picked by `legacy`. The storage key always overrides any key found in
/// the payload.
pub fn decode_record(
    key: &str,
    raw: &str,
    legacy: impl FnOnce(&Value) -> RecordTag,
) -> std::result::Result<Record, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    let (tag, mut data) = match value {
        Value::Object(mut map) if map.contains_key(TYPE_FIELD) && map.contains_key(DATA_FIELD) => {
            let name = match map.remove(TYPE_FIELD) {
                Some(Value::String(name)) => name,
                other => {
                    return Err(DecodeError::Malformed {
                        key: key.to_string(),
                        reason: format!("type tag is not a string: {:?}", other),
                    })
                }
            };
            let tag = RecordTag::from_name(&name).ok_or_else(|| DecodeError::UnknownType {
                key: key.to_string(),
                tag: name.clone(),
            })?;
            (tag, map.remove(DATA_FIELD).unwrap_or(Value::Null))
        }
        flat @ Value::Object(_) => (legacy(&flat), flat),
        other => {
            return Err(DecodeError::Malformed {
                key: key.to_string(),
                reason: format!("expected an object, found {}", json_kind(&other)),
            })
        }
    };

    match data.as_object_mut() {
        Some(fields) => {
            fields.insert("key".to_string(), Value::String(key.to_string()));
        }
        None => {
            return Err(DecodeError::Malformed {
                key: key.to_string(),
                reason: "record body is not an object".to_string(),
            })
        }
    }

    Record::from_parts(tag, data).map_err(|e| DecodeError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a stored payload as a record of family `T`
pub fn decode<T: StoredObject>(key: &str, raw: &str) -> std::result::Result<T, DecodeError> {
    let record = decode_record(key, raw, T::legacy_tag)?;
    T::from_record(record).map_err(|other| DecodeError::WrongFamily {
        key: key.to_string(),
        tag: other.tag().name().to_string(),
        expected: T::KIND.type_name(),
    })
}

/// Envelope with the volatile timestamps removed.
///
/// Two records with equal canonical forms hold the same content.
pub fn canonical<T: StoredObject>(obj: &T) -> Result<Value> {
    let mut value = envelope(&obj.to_record())?;
    if let Some(data) = value.get_mut(DATA_FIELD).and_then(Value::as_object_mut) {
        for field in VOLATILE_FIELDS {
            data.remove(field);
        }
    }
    Ok(value)
}

/// Content equality ignoring `created`/`updated`
pub fn same_content<T: StoredObject>(a: &T, b: &T) -> Result<bool> {
    Ok(canonical(a)? == canonical(b)?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
