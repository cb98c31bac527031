//! Traits for the external collaborators named in spec §6 — the media
//! engine's control RPC, the studio control API, the upstream access-policy
//! endpoint, and the downstream message bus. Each is a narrow trait with one
//! `reqwest`-backed implementation, grounded on the teacher's pattern of
//! wrapping an HTTP client behind a provider trait (`ferrex-core`'s
//! `TmdbApiProvider`-style providers) so `sidecar-core` tests can substitute
//! a `mockall` mock with no network I/O.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, EngineError, PolicyError, StudioApiError};
use crate::ids::{PlaybackId, StreamId};

/// A studio-known stream record, as returned by `GetStreamByKey` /
/// `GetStreamByPlaybackID`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StudioStream {
    pub stream_id: StreamId,
    pub playback_id: PlaybackId,
    pub user_id: String,
    pub project_id: String,
    pub deleted: bool,
    pub suspended: bool,
    pub multistream_targets: Vec<MultistreamTarget>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MultistreamTarget {
    pub id: String,
    pub name: String,
    pub url: String,
    pub disabled: bool,
    pub profile_name: String,
    pub video_only: bool,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait StudioApi: Send + Sync + std::fmt::Debug {
    async fn get_stream_by_key(&self, stream_key: &str) -> Result<StudioStream, StudioApiError>;
    async fn get_stream_by_playback_id(
        &self,
        id: &PlaybackId,
    ) -> Result<StudioStream, StudioApiError>;
    async fn get_asset_by_playback_id(
        &self,
        id: &PlaybackId,
    ) -> Result<StudioStream, StudioApiError>;
    async fn set_active(
        &self,
        stream_id: &StreamId,
        active: bool,
        started_at_unix_ms: i64,
    ) -> Result<(), StudioApiError>;
    async fn heartbeat(&self, stream_id: &StreamId) -> Result<(), StudioApiError>;
    async fn get_multistream_target(
        &self,
        id: &str,
    ) -> Result<MultistreamTarget, StudioApiError>;
}

/// Result of a policy admission check (spec §4.3/§6).
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allow: bool,
    pub max_age: Duration,
    pub stale: Duration,
    pub user_id: Option<String>,
    pub user_viewer_limit: Option<u32>,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait PolicyClient: Send + Sync + std::fmt::Debug {
    /// `cred` is `accessKey:<value>` or `jwt:<pubkey-der-b64>`, per spec
    /// §4.3 step 4's `credHash` construction.
    async fn check(
        &self,
        stream: &str,
        cred_type: &str,
        cred: &str,
    ) -> Result<PolicyDecision, PolicyError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineStreamSource {
    /// True when the stream originated from ingest (vs internal replication).
    pub is_ingest: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnginePushEntry {
    pub id: String,
    pub stream: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnginePushAutoEntry {
    pub stream: String,
    pub target: String,
    pub stream_params: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineStats {
    pub bytes: u64,
    pub media_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineState {
    pub active_streams: HashMap<String, EngineStreamSource>,
    pub push_list: Vec<EnginePushEntry>,
    pub push_auto_list: Vec<EnginePushAutoEntry>,
    pub streams_stats: HashMap<String, EngineStats>,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait EngineClient: Send + Sync + std::fmt::Debug {
    async fn add_trigger(
        &self,
        events: &[&str],
        name: &str,
        sync: bool,
    ) -> Result<(), EngineError>;
    async fn delete_stream(&self, name: &str) -> Result<(), EngineError>;
    async fn nuke_stream(&self, name: &str) -> Result<(), EngineError>;
    async fn push_start(&self, stream: &str, url: &str) -> Result<String, EngineError>;
    async fn push_stop(&self, id: &str) -> Result<(), EngineError>;
    async fn push_auto_add(&self, stream: &str, url: &str) -> Result<(), EngineError>;
    async fn push_auto_remove(&self, stream_params: &str) -> Result<(), EngineError>;
    async fn get_state(&self) -> Result<EngineState, EngineError>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait BusPublisher: Send + Sync + std::fmt::Debug {
    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BusError>;
}
