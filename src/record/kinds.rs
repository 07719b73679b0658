//! Concrete record types and their families
//!
//! Fields mirror the stored JSON documents. Unknown fields are ignored
//! and missing ones fall back to defaults, so older documents keep
//! decoding as the schema grows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::{format_key, key_to_id, owner_set_key};
use super::{EntityKind, Record, RecordMeta, RecordTag, StoredObject};

/// Number of `_`-separated parts in an id
fn id_parts(id: &str) -> usize {
    id.split('_').count()
}

fn has_parts(id: &str, parts: usize) -> bool {
    !id.is_empty() && id_parts(id) == parts && id.split('_').all(|p| !p.is_empty())
}

/// First `_`-separated segment of a namespaced key's id
fn owner_of(kind: EntityKind, key: &str) -> &str {
    let id = key_to_id(kind, key);
    id.split('_').next().unwrap_or(id)
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub account_id: String,
    pub name: Option<String>,

    /// Integration id -> integration type name
    pub integrations: BTreeMap<String, String>,

    /// Default thumbnail (width, height)
    pub default_size: (u32, u32),
    pub default_thumbnail_id: Option<String>,
    pub processing_priority: u8,
    pub abtest: bool,
    pub serving_enabled: bool,
    pub users: Vec<String>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            account_id: String::new(),
            name: None,
            integrations: BTreeMap::new(),
            default_size: (160, 90),
            default_thumbnail_id: None,
            processing_priority: 1,
            abtest: true,
            serving_enabled: true,
            users: Vec::new(),
        }
    }
}

impl Account {
    pub fn new(account_id: &str) -> Self {
        Self::with_key(format_key(EntityKind::Account, account_id))
    }
}

impl StoredObject for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn with_key(key: String) -> Self {
        Self {
            account_id: key_to_id(Self::KIND, &key).to_string(),
            meta: RecordMeta::new(key),
            ..Default::default()
        }
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn into_record(self) -> Record {
        Record::NeonUserAccount(self)
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::NeonUserAccount(r) => Ok(r),
            other => Err(other),
        }
    }

    fn legacy_tag(_data: &Value) -> RecordTag {
        RecordTag::NeonUserAccount
    }
}

// =============================================================================
// Integrations
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrightcoveIntegration {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub integration_id: String,
    pub account_id: String,
    pub publisher_id: String,
    pub read_token: Option<String>,
    pub write_token: Option<String>,
    pub callback_url: Option<String>,
    pub playlist_feed_ids: Vec<String>,
    /// Unix seconds of the last processed publish date
    pub last_process_date: Option<i64>,
    pub uses_batch_provisioning: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OoyalaIntegration {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub integration_id: String,
    pub account_id: String,
    pub partner_code: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NeonIntegration {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub integration_id: String,
    pub account_id: String,
    pub enabled: bool,
}

/// Any OVP integration
#[derive(Debug, Clone, PartialEq)]
pub enum Integration {
    Brightcove(BrightcoveIntegration),
    Ooyala(OoyalaIntegration),
    Neon(NeonIntegration),
}

impl Integration {
    pub fn integration_id(&self) -> &str {
        match self {
            Integration::Brightcove(i) => &i.integration_id,
            Integration::Ooyala(i) => &i.integration_id,
            Integration::Neon(i) => &i.integration_id,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Integration::Brightcove(i) => &i.account_id,
            Integration::Ooyala(i) => &i.account_id,
            Integration::Neon(i) => &i.account_id,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Integration::Brightcove(i) => i.enabled,
            Integration::Ooyala(i) => i.enabled,
            Integration::Neon(i) => i.enabled,
        }
    }
}

impl StoredObject for Integration {
    const KIND: EntityKind = EntityKind::Integration;

    fn with_key(key: String) -> Self {
        Integration::Neon(NeonIntegration {
            integration_id: key_to_id(Self::KIND, &key).to_string(),
            meta: RecordMeta::new(key),
            enabled: true,
            ..Default::default()
        })
    }

    fn meta(&self) -> &RecordMeta {
        match self {
            Integration::Brightcove(i) => &i.meta,
            Integration::Ooyala(i) => &i.meta,
            Integration::Neon(i) => &i.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        match self {
            Integration::Brightcove(i) => &mut i.meta,
            Integration::Ooyala(i) => &mut i.meta,
            Integration::Neon(i) => &mut i.meta,
        }
    }

    fn into_record(self) -> Record {
        match self {
            Integration::Brightcove(i) => Record::BrightcoveIntegration(i),
            Integration::Ooyala(i) => Record::OoyalaIntegration(i),
            Integration::Neon(i) => Record::NeonIntegration(i),
        }
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::BrightcoveIntegration(i) => Ok(Integration::Brightcove(i)),
            Record::OoyalaIntegration(i) => Ok(Integration::Ooyala(i)),
            Record::NeonIntegration(i) => Ok(Integration::Neon(i)),
            other => Err(other),
        }
    }

    /// Flat documents are recognised by their OVP credentials
    fn legacy_tag(data: &Value) -> RecordTag {
        if data.get("publisher_id").is_some() {
            RecordTag::BrightcoveIntegration
        } else if data.get("partner_code").is_some() {
            RecordTag::OoyalaIntegration
        } else {
            RecordTag::NeonIntegration
        }
    }
}

// =============================================================================
// Job Requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    Submit,
    Processing,
    Finalizing,
    Requeued,
    Reprocess,
    Finished,
    Serving,
    Failed,
    InternalError,
    CustomerError,
    Unknown,
}

/// A video processing job. Stored under `request_<api_key>_<job_id>`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub job_id: String,
    /// Owning account's api key
    pub api_key: String,
    pub video_id: Option<String>,
    pub video_title: Option<String>,
    pub video_url: Option<String>,
    pub callback_url: Option<String>,
    pub state: RequestState,
    pub integration_type: Option<String>,
    pub integration_id: Option<String>,
    /// Concrete job flavour of legacy flat documents
    pub request_type: Option<String>,
    pub publish_date: Option<String>,
    pub default_thumbnail: Option<String>,
    pub fail_count: u32,
    pub response: Option<Value>,
}

impl JobRequest {
    pub fn new(job_id: &str, api_key: &str) -> Self {
        let mut job = Self::for_key(format_key(EntityKind::Request, &request_id(api_key, job_id)));
        job.request_type = Some("neon".to_string());
        job
    }

    fn for_key(key: String) -> Self {
        let id = key_to_id(EntityKind::Request, &key);
        let (api_key, job_id) = id.split_once('_').unwrap_or(("", id));
        Self {
            api_key: api_key.to_string(),
            job_id: job_id.to_string(),
            meta: RecordMeta::new(key),
            ..Default::default()
        }
    }
}

/// Id of a job request: `<api_key>_<job_id>`
pub fn request_id(api_key: &str, job_id: &str) -> String {
    format!("{}_{}", api_key, job_id)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrightcoveApiRequest {
    #[serde(flatten)]
    pub job: JobRequest,

    pub publisher_id: Option<String>,
    pub read_token: Option<String>,
    pub write_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OoyalaApiRequest {
    #[serde(flatten)]
    pub job: JobRequest,

    pub partner_code: Option<String>,
    pub ooyala_api_key: Option<String>,
    pub ooyala_api_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeApiRequest {
    #[serde(flatten)]
    pub job: JobRequest,

    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expiry: Option<String>,
}

/// Any job request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Neon(JobRequest),
    Brightcove(BrightcoveApiRequest),
    Ooyala(OoyalaApiRequest),
    Youtube(YoutubeApiRequest),
}

impl Request {
    pub fn job(&self) -> &JobRequest {
        match self {
            Request::Neon(j) => j,
            Request::Brightcove(r) => &r.job,
            Request::Ooyala(r) => &r.job,
            Request::Youtube(r) => &r.job,
        }
    }

    pub fn job_mut(&mut self) -> &mut JobRequest {
        match self {
            Request::Neon(j) => j,
            Request::Brightcove(r) => &mut r.job,
            Request::Ooyala(r) => &mut r.job,
            Request::Youtube(r) => &mut r.job,
        }
    }
}

impl StoredObject for Request {
    const KIND: EntityKind = EntityKind::Request;
    const OWNER_GROUPED: bool = true;

    fn with_key(key: String) -> Self {
        Request::Neon(JobRequest::for_key(key))
    }

    fn meta(&self) -> &RecordMeta {
        &self.job().meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.job_mut().meta
    }

    fn into_record(self) -> Record {
        match self {
            Request::Neon(j) => Record::NeonApiRequest(j),
            Request::Brightcove(r) => Record::BrightcoveApiRequest(r),
            Request::Ooyala(r) => Record::OoyalaApiRequest(r),
            Request::Youtube(r) => Record::YoutubeApiRequest(r),
        }
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::NeonApiRequest(j) => Ok(Request::Neon(j)),
            Record::BrightcoveApiRequest(r) => Ok(Request::Brightcove(r)),
            Record::OoyalaApiRequest(r) => Ok(Request::Ooyala(r)),
            Record::YoutubeApiRequest(r) => Ok(Request::Youtube(r)),
            other => Err(other),
        }
    }

    fn legacy_tag(data: &Value) -> RecordTag {
        match data.get("request_type").and_then(Value::as_str) {
            Some("brightcove") => RecordTag::BrightcoveApiRequest,
            Some("ooyala") => RecordTag::OoyalaApiRequest,
            Some("youtube") => RecordTag::YoutubeApiRequest,
            _ => RecordTag::NeonApiRequest,
        }
    }

    /// Jobs are grouped per account
    fn set_key_for(key: &str) -> String {
        owner_set_key(Self::KIND, owner_of(Self::KIND, key))
    }

    fn is_valid_id(id: &str) -> bool {
        has_parts(id, 2)
    }
}

// =============================================================================
// Videos and Thumbnails
// =============================================================================

/// Stored under `video_<account>_<video>`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoMetadata {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub thumbnail_ids: Vec<String>,
    pub url: Option<String>,
    /// Seconds
    pub duration: Option<f64>,
    pub job_id: Option<String>,
    pub integration_id: Option<String>,
    pub frame_size: Option<(u32, u32)>,
    pub testing_enabled: bool,
    pub serving_enabled: bool,
    pub serving_url: Option<String>,
    pub publish_date: Option<String>,
    pub custom_data: BTreeMap<String, Value>,
}

impl VideoMetadata {
    /// `video_id` is the internal `<account>_<video>` id
    pub fn new(video_id: &str) -> Self {
        Self::with_key(format_key(EntityKind::Video, video_id))
    }

    pub fn account_id(&self) -> &str {
        owner_of(EntityKind::Video, &self.meta.key)
    }
}

impl StoredObject for VideoMetadata {
    const KIND: EntityKind = EntityKind::Video;
    const OWNER_GROUPED: bool = true;

    fn with_key(key: String) -> Self {
        Self {
            meta: RecordMeta::new(key),
            testing_enabled: true,
            ..Default::default()
        }
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn into_record(self) -> Record {
        Record::VideoMetadata(self)
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::VideoMetadata(r) => Ok(r),
            other => Err(other),
        }
    }

    fn legacy_tag(_data: &Value) -> RecordTag {
        RecordTag::VideoMetadata
    }

    fn set_key_for(key: &str) -> String {
        owner_set_key(Self::KIND, owner_of(Self::KIND, key))
    }

    fn is_valid_id(id: &str) -> bool {
        has_parts(id, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailType {
    Neon,
    Centerframe,
    Brightcove,
    Ooyala,
    Random,
    Filtered,
    Customupload,
    #[default]
    Default,
}

/// Stored under `thumbnail_<account>_<video>_<thumb>`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailMetadata {
    #[serde(flatten)]
    pub meta: RecordMeta,

    /// Internal `<account>_<video>` id of the owning video
    pub video_id: String,
    pub external_id: Option<String>,
    pub urls: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(rename = "type")]
    pub thumbnail_type: ThumbnailType,
    pub rank: i32,
    pub model_score: Option<f64>,
    pub model_version: Option<String>,
    pub frameno: Option<u64>,
    pub phash: Option<u64>,
    pub enabled: bool,
}

impl ThumbnailMetadata {
    /// `thumbnail_id` is the internal `<account>_<video>_<thumb>` id
    pub fn new(thumbnail_id: &str) -> Self {
        Self::with_key(format_key(EntityKind::Thumbnail, thumbnail_id))
    }
}

impl StoredObject for ThumbnailMetadata {
    const KIND: EntityKind = EntityKind::Thumbnail;

    fn with_key(key: String) -> Self {
        let id = key_to_id(Self::KIND, &key);
        let video_id = id.rsplit_once('_').map(|(v, _)| v).unwrap_or_default();
        Self {
            video_id: video_id.to_string(),
            meta: RecordMeta::new(key),
            enabled: true,
            ..Default::default()
        }
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn into_record(self) -> Record {
        Record::ThumbnailMetadata(self)
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::ThumbnailMetadata(r) => Ok(r),
            other => Err(other),
        }
    }

    fn legacy_tag(_data: &Value) -> RecordTag {
        RecordTag::ThumbnailMetadata
    }

    fn is_valid_id(id: &str) -> bool {
        has_parts(id, 3)
    }
}

// =============================================================================
// Serving Status (defaulted)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailStatus {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub serving_frac: Option<f64>,
    /// (timestamp, fraction) pairs, oldest first
    pub serving_history: Vec<(String, f64)>,
    pub ctr: Option<f64>,
    pub imp: Option<u64>,
    pub conv: Option<u64>,
}

impl ThumbnailStatus {
    pub fn new(thumbnail_id: &str) -> Self {
        Self::with_key(format_key(EntityKind::ThumbnailStatus, thumbnail_id))
    }
}

impl StoredObject for ThumbnailStatus {
    const KIND: EntityKind = EntityKind::ThumbnailStatus;
    const DEFAULTED: bool = true;

    fn with_key(key: String) -> Self {
        Self {
            meta: RecordMeta::new(key),
            ..Default::default()
        }
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn into_record(self) -> Record {
        Record::ThumbnailStatus(self)
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::ThumbnailStatus(r) => Ok(r),
            other => Err(other),
        }
    }

    fn legacy_tag(_data: &Value) -> RecordTag {
        RecordTag::ThumbnailStatus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentState {
    Running,
    Complete,
    Disabled,
    Override,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoStatus {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub experiment_state: ExperimentState,
    pub winner_tid: Option<String>,
    pub experiment_value_remaining: Option<f64>,
    /// (timestamp, state) pairs, oldest first
    pub state_history: Vec<(String, ExperimentState)>,
}

impl VideoStatus {
    pub fn new(video_id: &str) -> Self {
        Self::with_key(format_key(EntityKind::VideoStatus, video_id))
    }
}

impl StoredObject for VideoStatus {
    const KIND: EntityKind = EntityKind::VideoStatus;
    const DEFAULTED: bool = true;

    fn with_key(key: String) -> Self {
        Self {
            meta: RecordMeta::new(key),
            ..Default::default()
        }
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn into_record(self) -> Record {
        Record::VideoStatus(self)
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::VideoStatus(r) => Ok(r),
            other => Err(other),
        }
    }

    fn legacy_tag(_data: &Value) -> RecordTag {
        RecordTag::VideoStatus
    }
}

// =============================================================================
// CDN Hosting (defaulted, nested envelopes)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3CdnHosting {
    pub bucket_name: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub cdn_prefixes: Vec<String>,
    pub folder_prefix: Option<String>,
    pub resize: bool,
    pub update_serving_urls: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudinaryCdnHosting {
    pub cdn_prefixes: Vec<String>,
    pub resize: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AkamaiCdnHosting {
    pub host: String,
    pub akamai_key: Option<String>,
    pub akamai_name: Option<String>,
    pub baseurl: String,
    pub cdn_prefixes: Vec<String>,
}

/// One hosting target. Serialized with the same `_type`/`_data`
/// envelope as top-level records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", content = "_data")]
pub enum CdnHosting {
    #[serde(rename = "S3CdnHostingMetadata")]
    S3(S3CdnHosting),
    #[serde(rename = "CloudinaryCdnHostingMetadata")]
    Cloudinary(CloudinaryCdnHosting),
    #[serde(rename = "AkamaiCdnHostingMetadata")]
    Akamai(AkamaiCdnHosting),
}

/// Hosting targets of one integration, stored under
/// `cdnhosting_<account>_<integration>`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnHostingList {
    #[serde(flatten)]
    pub meta: RecordMeta,

    pub cdns: Vec<CdnHosting>,
}

impl CdnHostingList {
    pub fn new(id: &str) -> Self {
        Self::with_key(format_key(EntityKind::CdnHosting, id))
    }
}

impl StoredObject for CdnHostingList {
    const KIND: EntityKind = EntityKind::CdnHosting;
    const DEFAULTED: bool = true;

    fn with_key(key: String) -> Self {
        Self {
            meta: RecordMeta::new(key),
            cdns: Vec::new(),
        }
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn into_record(self) -> Record {
        Record::CdnHostingMetadataList(self)
    }

    fn from_record(record: Record) -> Result<Self, Record> {
        match record {
            Record::CdnHostingMetadataList(r) => Ok(r),
            other => Err(other),
        }
    }

    fn legacy_tag(_data: &Value) -> RecordTag {
        RecordTag::CdnHostingMetadataList
    }
}
