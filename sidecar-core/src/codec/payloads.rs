//! Typed payloads for the 12 trigger shapes (spec §4.1).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRewritePayload {
    pub ingest_url: String,
    pub client_host: String,
    pub requested_stream_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutStartPayload {
    pub stream_name: String,
    pub push_target_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PushEndStatus {
    pub active_seconds: u64,
    pub bytes: u64,
    pub media_time: u64,
    pub tracks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushEndPayload {
    pub push_id: String,
    pub stream_name: String,
    pub original_dest: String,
    pub actual_dest: String,
    pub last_log_lines: Vec<String>,
    pub final_status: PushEndStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Full,
    Empty,
    Dry,
    Recover,
}

impl BufferState {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferState::Full => "FULL",
            BufferState::Empty => "EMPTY",
            BufferState::Dry => "DRY",
            BufferState::Recover => "RECOVER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "FULL" => Some(BufferState::Full),
            "EMPTY" => Some(BufferState::Empty),
            "DRY" => Some(BufferState::Dry),
            "RECOVER" => Some(BufferState::Recover),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamBufferPayload {
    pub stream_name: String,
    pub state: BufferState,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSourcePayload {
    pub stream_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrackInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveTrackListPayload {
    pub stream_name: String,
    pub tracks: HashMap<String, TrackInfo>,
}

impl LiveTrackListPayload {
    pub fn video_track_count(&self) -> usize {
        self.tracks
            .values()
            .filter(|t| t.kind.eq_ignore_ascii_case("video"))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNewPayload {
    pub stream_name: String,
    pub client_ip: String,
    pub connection_id: String,
    pub protocol: String,
    pub full_url: String,
    pub session_id: String,
    pub original_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEndPayload {
    pub token: String,
    pub streams: Vec<String>,
    pub protocols: Vec<String>,
    pub ips: Vec<String>,
    pub seconds_active: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub tags: Vec<String>,
    pub conn_start_ms: u64,
    pub conn_end_ms: u64,
    pub per_stream_durations: HashMap<String, u64>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEndPayload {
    pub stream_name: String,
    pub path: String,
    pub protocol: String,
    pub bytes: u64,
    pub writing_duration_ms: u64,
    pub conn_start_ms: u64,
    pub conn_end_ms: u64,
    pub media_duration_ms: u64,
    pub first_ms: u64,
    pub last_ms: u64,
}
