//! Record Module
//!
//! Typed records and the rules for storing them under namespaced keys.
//!
//! ## Responsibilities
//! - Entity kinds and their keyspace namespaces
//! - The `StoredObject` trait every persisted family implements
//! - A closed registry of concrete record types (`RecordTag` / `Record`)
//! - JSON envelope encoding and key formatting (`codec`)
//!
//! ## Wire Format
//! ```text
//! {"_type": "NeonUserAccount", "_data": {"key": "account_a1", ...}}
//! ```
//! A payload without `_type`/`_data` is a legacy flat record and is decoded
//! against the family's default type.

pub mod codec;
mod kinds;
mod registry;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ObjStoreError;

pub use kinds::{
    Account, AkamaiCdnHosting, BrightcoveApiRequest, BrightcoveIntegration, CdnHosting,
    CdnHostingList, CloudinaryCdnHosting, ExperimentState, Integration, JobRequest,
    NeonIntegration, OoyalaApiRequest, OoyalaIntegration, Request, RequestState, S3CdnHosting,
    ThumbnailMetadata, ThumbnailStatus, ThumbnailType, VideoMetadata, VideoStatus,
    YoutubeApiRequest, request_id,
};
pub use registry::{Record, RecordTag};

/// The entity types persisted by the platform.
///
/// Each kind owns a key namespace, an entity set, and (through the
/// connection manager) its own backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Account,
    Integration,
    Request,
    Video,
    Thumbnail,
    ThumbnailStatus,
    VideoStatus,
    CdnHosting,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Account,
        EntityKind::Integration,
        EntityKind::Request,
        EntityKind::Video,
        EntityKind::Thumbnail,
        EntityKind::ThumbnailStatus,
        EntityKind::VideoStatus,
        EntityKind::CdnHosting,
    ];

    /// Key prefix for records of this kind (lowercased type name)
    pub fn namespace(self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Integration => "integration",
            EntityKind::Request => "request",
            EntityKind::Video => "video",
            EntityKind::Thumbnail => "thumbnail",
            EntityKind::ThumbnailStatus => "thumbnailstatus",
            EntityKind::VideoStatus => "videostatus",
            EntityKind::CdnHosting => "cdnhosting",
        }
    }

    /// Family name used in error messages
    pub fn type_name(self) -> &'static str {
        match self {
            EntityKind::Account => "Account",
            EntityKind::Integration => "Integration",
            EntityKind::Request => "Request",
            EntityKind::Video => "Video",
            EntityKind::Thumbnail => "Thumbnail",
            EntityKind::ThumbnailStatus => "ThumbnailStatus",
            EntityKind::VideoStatus => "VideoStatus",
            EntityKind::CdnHosting => "CdnHosting",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for EntityKind {
    type Err = ObjStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.namespace() == lowered)
            .ok_or_else(|| ObjStoreError::Config(format!("unknown entity kind: {}", s)))
    }
}

/// Fields every stored record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordMeta {
    /// Full namespaced storage key. Never changes once created.
    pub key: String,

    /// When the record was first constructed
    pub created: DateTime<Utc>,

    /// Last time the record was written
    pub updated: DateTime<Utc>,
}

impl RecordMeta {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            created: now,
            updated: now,
        }
    }
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// A record family that can be persisted by the object store.
///
/// A family maps onto one `EntityKind` and one or more concrete record
/// types from the registry. Families with several concrete types
/// (integrations, job requests) are enums over those types.
pub trait StoredObject: Clone + fmt::Debug + Send + Sync + 'static {
    /// Entity kind (namespace, entity set, connection) of this family
    const KIND: EntityKind;

    /// Defaulted families never come back as `None` from a plain get
    const DEFAULTED: bool = false;

    /// Keys live in per-owner sets (`objset:<ns>:<owner>`) instead of the
    /// kind-wide entity set
    const OWNER_GROUPED: bool = false;

    /// Default-constructed record for a full storage key
    fn with_key(key: String) -> Self;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Wrap into the closed registry enum
    fn into_record(self) -> Record;

    /// Unwrap from the registry enum; hands the record back when it
    /// belongs to another family
    fn from_record(record: Record) -> std::result::Result<Self, Record>;

    /// Concrete type used for legacy payloads that carry no type tag
    fn legacy_tag(data: &serde_json::Value) -> RecordTag;

    /// Entity set holding the given key
    fn set_key_for(_key: &str) -> String {
        codec::entity_set_key(Self::KIND)
    }

    /// Whether an id seen on the change bus names a record of this family
    fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
    }

    fn key(&self) -> &str {
        &self.meta().key
    }

    /// Non-namespaced id
    fn id(&self) -> &str {
        codec::key_to_id(Self::KIND, &self.meta().key)
    }

    fn to_record(&self) -> Record {
        self.clone().into_record()
    }
}
