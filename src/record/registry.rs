//! Closed registry of concrete record types
//!
//! Every `_type` tag that may appear in the backend is listed here.
//! Decoding is an exhaustive match on the tag; an unlisted tag is a
//! schema error, never a silent skip.

use serde_json::Value;

use super::kinds::{
    Account, BrightcoveApiRequest, BrightcoveIntegration, CdnHostingList, JobRequest,
    NeonIntegration, OoyalaApiRequest, OoyalaIntegration, ThumbnailMetadata, ThumbnailStatus,
    VideoMetadata, VideoStatus, YoutubeApiRequest,
};
use super::{EntityKind, RecordMeta};

/// Type tag written into the `_type` field of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTag {
    NeonUserAccount,
    BrightcoveIntegration,
    OoyalaIntegration,
    NeonIntegration,
    NeonApiRequest,
    BrightcoveApiRequest,
    OoyalaApiRequest,
    YoutubeApiRequest,
    VideoMetadata,
    ThumbnailMetadata,
    ThumbnailStatus,
    VideoStatus,
    CdnHostingMetadataList,
}

impl RecordTag {
    pub const ALL: [RecordTag; 13] = [
        RecordTag::NeonUserAccount,
        RecordTag::BrightcoveIntegration,
        RecordTag::OoyalaIntegration,
        RecordTag::NeonIntegration,
        RecordTag::NeonApiRequest,
        RecordTag::BrightcoveApiRequest,
        RecordTag::OoyalaApiRequest,
        RecordTag::YoutubeApiRequest,
        RecordTag::VideoMetadata,
        RecordTag::ThumbnailMetadata,
        RecordTag::ThumbnailStatus,
        RecordTag::VideoStatus,
        RecordTag::CdnHostingMetadataList,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RecordTag::NeonUserAccount => "NeonUserAccount",
            RecordTag::BrightcoveIntegration => "BrightcoveIntegration",
            RecordTag::OoyalaIntegration => "OoyalaIntegration",
            RecordTag::NeonIntegration => "NeonIntegration",
            RecordTag::NeonApiRequest => "NeonApiRequest",
            RecordTag::BrightcoveApiRequest => "BrightcoveApiRequest",
            RecordTag::OoyalaApiRequest => "OoyalaApiRequest",
            RecordTag::YoutubeApiRequest => "YoutubeApiRequest",
            RecordTag::VideoMetadata => "VideoMetadata",
            RecordTag::ThumbnailMetadata => "ThumbnailMetadata",
            RecordTag::ThumbnailStatus => "ThumbnailStatus",
            RecordTag::VideoStatus => "VideoStatus",
            RecordTag::CdnHostingMetadataList => "CdnHostingMetadataList",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        RecordTag::ALL.into_iter().find(|tag| tag.name() == name)
    }

    /// Entity family the concrete type belongs to
    pub fn kind(self) -> EntityKind {
        match self {
            RecordTag::NeonUserAccount => EntityKind::Account,
            RecordTag::BrightcoveIntegration
            | RecordTag::OoyalaIntegration
            | RecordTag::NeonIntegration => EntityKind::Integration,
            RecordTag::NeonApiRequest
            | RecordTag::BrightcoveApiRequest
            | RecordTag::OoyalaApiRequest
            | RecordTag::YoutubeApiRequest => EntityKind::Request,
            RecordTag::VideoMetadata => EntityKind::Video,
            RecordTag::ThumbnailMetadata => EntityKind::Thumbnail,
            RecordTag::ThumbnailStatus => EntityKind::ThumbnailStatus,
            RecordTag::VideoStatus => EntityKind::VideoStatus,
            RecordTag::CdnHostingMetadataList => EntityKind::CdnHosting,
        }
    }
}

/// Any concrete record, one variant per tag
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    NeonUserAccount(Account),
    BrightcoveIntegration(BrightcoveIntegration),
    OoyalaIntegration(OoyalaIntegration),
    NeonIntegration(NeonIntegration),
    NeonApiRequest(JobRequest),
    BrightcoveApiRequest(BrightcoveApiRequest),
    OoyalaApiRequest(OoyalaApiRequest),
    YoutubeApiRequest(YoutubeApiRequest),
    VideoMetadata(VideoMetadata),
    ThumbnailMetadata(ThumbnailMetadata),
    ThumbnailStatus(ThumbnailStatus),
    VideoStatus(VideoStatus),
    CdnHostingMetadataList(CdnHostingList),
}

impl Record {
    pub fn tag(&self) -> RecordTag {
        match self {
            Record::NeonUserAccount(_) => RecordTag::NeonUserAccount,
            Record::BrightcoveIntegration(_) => RecordTag::BrightcoveIntegration,
            Record::OoyalaIntegration(_) => RecordTag::OoyalaIntegration,
            Record::NeonIntegration(_) => RecordTag::NeonIntegration,
            Record::NeonApiRequest(_) => RecordTag::NeonApiRequest,
            Record::BrightcoveApiRequest(_) => RecordTag::BrightcoveApiRequest,
            Record::OoyalaApiRequest(_) => RecordTag::OoyalaApiRequest,
            Record::YoutubeApiRequest(_) => RecordTag::YoutubeApiRequest,
            Record::VideoMetadata(_) => RecordTag::VideoMetadata,
            Record::ThumbnailMetadata(_) => RecordTag::ThumbnailMetadata,
            Record::ThumbnailStatus(_) => RecordTag::ThumbnailStatus,
            Record::VideoStatus(_) => RecordTag::VideoStatus,
            Record::CdnHostingMetadataList(_) => RecordTag::CdnHostingMetadataList,
        }
    }

    pub fn meta(&self) -> &RecordMeta {
        match self {
            Record::NeonUserAccount(r) => &r.meta,
            Record::BrightcoveIntegration(r) => &r.meta,
            Record::OoyalaIntegration(r) => &r.meta,
            Record::NeonIntegration(r) => &r.meta,
            Record::NeonApiRequest(r) => &r.meta,
            Record::BrightcoveApiRequest(r) => &r.job.meta,
            Record::OoyalaApiRequest(r) => &r.job.meta,
            Record::YoutubeApiRequest(r) => &r.job.meta,
            Record::VideoMetadata(r) => &r.meta,
            Record::ThumbnailMetadata(r) => &r.meta,
            Record::ThumbnailStatus(r) => &r.meta,
            Record::VideoStatus(r) => &r.meta,
            Record::CdnHostingMetadataList(r) => &r.meta,
        }
    }

    /// The `_data` half of the envelope
    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Record::NeonUserAccount(r) => serde_json::to_value(r),
            Record::BrightcoveIntegration(r) => serde_json::to_value(r),
            Record::OoyalaIntegration(r) => serde_json::to_value(r),
            Record::NeonIntegration(r) => serde_json::to_value(r),
            Record::NeonApiRequest(r) => serde_json::to_value(r),
            Record::BrightcoveApiRequest(r) => serde_json::to_value(r),
            Record::OoyalaApiRequest(r) => serde_json::to_value(r),
            Record::YoutubeApiRequest(r) => serde_json::to_value(r),
            Record::VideoMetadata(r) => serde_json::to_value(r),
            Record::ThumbnailMetadata(r) => serde_json::to_value(r),
            Record::ThumbnailStatus(r) => serde_json::to_value(r),
            Record::VideoStatus(r) => serde_json::to_value(r),
            Record::CdnHostingMetadataList(r) => serde_json::to_value(r),
        }
    }

    /// Rebuild a record from its tag and `_data` payload
    pub fn from_parts(tag: RecordTag, data: Value) -> serde_json::Result<Record> {
        Ok(match tag {
            RecordTag::NeonUserAccount => Record::NeonUserAccount(serde_json::from_value(data)?),
            RecordTag::BrightcoveIntegration => {
                Record::BrightcoveIntegration(serde_json::from_value(data)?)
            }
            RecordTag::OoyalaIntegration => Record::OoyalaIntegration(serde_json::from_value(data)?),
            RecordTag::NeonIntegration => Record::NeonIntegration(serde_json::from_value(data)?),
            RecordTag::NeonApiRequest => Record::NeonApiRequest(serde_json::from_value(data)?),
            RecordTag::BrightcoveApiRequest => {
                Record::BrightcoveApiRequest(serde_json::from_value(data)?)
            }
            RecordTag::OoyalaApiRequest => Record::OoyalaApiRequest(serde_json::from_value(data)?),
            RecordTag::YoutubeApiRequest => Record::YoutubeApiRequest(serde_json::from_value(data)?),
            RecordTag::VideoMetadata => Record::VideoMetadata(serde_json::from_value(data)?),
            RecordTag::ThumbnailMetadata => Record::ThumbnailMetadata(serde_json::from_value(data)?),
            RecordTag::ThumbnailStatus => Record::ThumbnailStatus(serde_json::from_value(data)?),
            RecordTag::VideoStatus => Record::VideoStatus(serde_json::from_value(data)?),
            RecordTag::CdnHostingMetadataList => {
                Record::CdnHostingMetadataList(serde_json::from_value(data)?)
            }
        })
    }
}
