//! TriggerCodec (spec §4.1): parses the 12 newline-delimited trigger bodies
//! into typed payloads, and formats the handler response the engine expects
//! back.
//!
//! Bodies are ASCII, LF-separated, with no guaranteed trailing LF — callers
//! trim exactly one trailing `\n` before splitting.

pub mod payloads;

use crate::error::CodecError;
pub use payloads::*;

/// One of the 12 `X-Trigger` header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    PushRewrite,
    PushOutStart,
    PushEnd,
    StreamBuffer,
    StreamSource,
    LiveTrackList,
    UserNew,
    UserEnd,
    RecordingEnd,
}

impl TriggerKind {
    pub fn header_name(self) -> &'static str {
        match self {
            TriggerKind::PushRewrite => "PUSH_REWRITE",
            TriggerKind::PushOutStart => "PUSH_OUT_START",
            TriggerKind::PushEnd => "PUSH_END",
            TriggerKind::StreamBuffer => "STREAM_BUFFER",
            TriggerKind::StreamSource => "STREAM_SOURCE",
            TriggerKind::LiveTrackList => "LIVE_TRACK_LIST",
            TriggerKind::UserNew => "USER_NEW",
            TriggerKind::UserEnd => "USER_END",
            TriggerKind::RecordingEnd => "RECORDING_END",
        }
    }

    pub fn parse_header(raw: &str) -> Result<Self, CodecError> {
        Ok(match raw {
            "PUSH_REWRITE" => TriggerKind::PushRewrite,
            "PUSH_OUT_START" => TriggerKind::PushOutStart,
            "PUSH_END" => TriggerKind::PushEnd,
            "STREAM_BUFFER" => TriggerKind::StreamBuffer,
            "STREAM_SOURCE" => TriggerKind::StreamSource,
            "LIVE_TRACK_LIST" => TriggerKind::LiveTrackList,
            "USER_NEW" => TriggerKind::UserNew,
            "USER_END" => TriggerKind::UserEnd,
            "RECORDING_END" => TriggerKind::RecordingEnd,
            other => return Err(CodecError::UnknownKind(other.to_string())),
        })
    }

    /// Whether the engine blocks on this trigger's response (spec §4.1 table,
    /// "Blocking?" column). Informs the broker which aggregation rule to use
    /// and whether the HTTP handler can fire-and-forget.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            TriggerKind::PushRewrite
                | TriggerKind::PushOutStart
                | TriggerKind::StreamSource
                | TriggerKind::UserNew
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    PushRewrite(PushRewritePayload),
    PushOutStart(PushOutStartPayload),
    PushEnd(PushEndPayload),
    StreamBuffer(StreamBufferPayload),
    StreamSource(StreamSourcePayload),
    LiveTrackList(LiveTrackListPayload),
    UserNew(UserNewPayload),
    UserEnd(UserEndPayload),
    RecordingEnd(RecordingEndPayload),
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::PushRewrite(_) => TriggerKind::PushRewrite,
            Trigger::PushOutStart(_) => TriggerKind::PushOutStart,
            Trigger::PushEnd(_) => TriggerKind::PushEnd,
            Trigger::StreamBuffer(_) => TriggerKind::StreamBuffer,
            Trigger::StreamSource(_) => TriggerKind::StreamSource,
            Trigger::LiveTrackList(_) => TriggerKind::LiveTrackList,
            Trigger::UserNew(_) => TriggerKind::UserNew,
            Trigger::UserEnd(_) => TriggerKind::UserEnd,
            Trigger::RecordingEnd(_) => TriggerKind::RecordingEnd,
        }
    }
}

/// The value a single-writer/admit-deny trigger's handler(s) may return.
/// Informative-fanout triggers don't return a body at all (see the broker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResponse {
    /// Single-writer response body (possibly empty, meaning "reject").
    Rewrite(String),
    /// Admit/deny response body: `"true"` or `"false"`.
    AdmitDeny(bool),
    /// Informative triggers produce no body.
    Empty,
}

impl TriggerResponse {
    pub fn serialize(&self) -> String {
        match self {
            TriggerResponse::Rewrite(s) => s.clone(),
            TriggerResponse::AdmitDeny(true) => "true".to_string(),
            TriggerResponse::AdmitDeny(false) => "false".to_string(),
            TriggerResponse::Empty => String::new(),
        }
    }
}

/// Split a trigger body into lines, trimming exactly one trailing `\n` (and
/// a possible `\r` before it) if present.
fn split_lines(body: &str) -> Vec<&str> {
    let trimmed = body.strip_suffix('\n').unwrap_or(body);
    let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return vec![""];
    }
    trimmed.split('\n').collect()
}

fn expect_lines<'a>(
    lines: &[&'a str],
    expected: &'static str,
    matches: impl Fn(usize) -> bool,
) -> Result<(), CodecError> {
    if !matches(lines.len()) {
        return Err(CodecError::WrongLineCount {
            expected,
            got: lines.len(),
        });
    }
    Ok(())
}

fn parse_u64(raw: &str) -> Result<u64, CodecError> {
    raw.trim().parse::<u64>().map_err(CodecError::from)
}

fn comma_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

pub struct TriggerCodec;

impl TriggerCodec {
    pub fn parse(kind: TriggerKind, body: &str) -> Result<Trigger, CodecError> {
        let lines = split_lines(body);
        match kind {
            TriggerKind::PushRewrite => {
                expect_lines(&lines, "3", |n| n == 3)?;
                Ok(Trigger::PushRewrite(PushRewritePayload {
                    ingest_url: lines[0].to_string(),
                    client_host: lines[1].to_string(),
                    requested_stream_name: lines[2].to_string(),
                }))
            }
            TriggerKind::PushOutStart => {
                expect_lines(&lines, "2", |n| n == 2)?;
                Ok(Trigger::PushOutStart(PushOutStartPayload {
                    stream_name: lines[0].to_string(),
                    push_target_url: lines[1].to_string(),
                }))
            }
            TriggerKind::PushEnd => {
                expect_lines(&lines, "6", |n| n == 6)?;
                let last_log_lines: Vec<String> = serde_json::from_str(lines[4])?;
                let final_status: PushEndStatus = serde_json::from_str(lines[5])?;
                Ok(Trigger::PushEnd(PushEndPayload {
                    push_id: lines[0].to_string(),
                    stream_name: lines[1].to_string(),
                    original_dest: lines[2].to_string(),
                    actual_dest: lines[3].to_string(),
                    last_log_lines,
                    final_status,
                }))
            }
            TriggerKind::StreamBuffer => {
                expect_lines(&lines, "2 or 3", |n| n == 2 || n == 3)?;
                let state = BufferState::parse(lines[1])
                    .ok_or_else(|| CodecError::BadState(lines[1].to_string()))?;
                if state == BufferState::Empty {
                    expect_lines(&lines, "2", |n| n == 2)?;
                } else {
                    expect_lines(&lines, "3", |n| n == 3)?;
                }
                let details = match lines.get(2) {
                    Some(raw) => Some(serde_json::from_str(raw)?),
                    None => None,
                };
                Ok(Trigger::StreamBuffer(StreamBufferPayload {
                    stream_name: lines[0].to_string(),
                    state,
                    details,
                }))
            }
            TriggerKind::StreamSource => {
                expect_lines(&lines, "1", |n| n == 1)?;
                Ok(Trigger::StreamSource(StreamSourcePayload {
                    stream_name: lines[0].to_string(),
                }))
            }
            TriggerKind::LiveTrackList => {
                expect_lines(&lines, "2", |n| n == 2)?;
                let tracks = serde_json::from_str(lines[1])?;
                Ok(Trigger::LiveTrackList(LiveTrackListPayload {
                    stream_name: lines[0].to_string(),
                    tracks,
                }))
            }
            TriggerKind::UserNew => {
                expect_lines(&lines, "6 or 7", |n| n == 6 || n == 7)?;
                Ok(Trigger::UserNew(UserNewPayload {
                    stream_name: lines[0].to_string(),
                    client_ip: lines[1].to_string(),
                    connection_id: lines[2].to_string(),
                    protocol: lines[3].to_string(),
                    full_url: lines[4].to_string(),
                    session_id: lines[5].to_string(),
                    original_url: lines.get(6).map(|s| s.to_string()),
                }))
            }
            TriggerKind::UserEnd => {
                expect_lines(&lines, "12", |n| n == 12)?;
                Ok(Trigger::UserEnd(UserEndPayload {
                    token: lines[0].to_string(),
                    streams: comma_list(lines[1]),
                    protocols: comma_list(lines[2]),
                    ips: comma_list(lines[3]),
                    seconds_active: parse_u64(lines[4])?,
                    bytes_up: parse_u64(lines[5])?,
                    bytes_down: parse_u64(lines[6])?,
                    tags: comma_list(lines[7]),
                    conn_start_ms: parse_u64(lines[8])?,
                    conn_end_ms: parse_u64(lines[9])?,
                    per_stream_durations: serde_json::from_str(lines[10])?,
                    session_id: lines[11].to_string(),
                }))
            }
            TriggerKind::RecordingEnd => {
                expect_lines(&lines, "10", |n| n == 10)?;
                Ok(Trigger::RecordingEnd(RecordingEndPayload {
                    stream_name: lines[0].to_string(),
                    path: lines[1].to_string(),
                    protocol: lines[2].to_string(),
                    bytes: parse_u64(lines[3])?,
                    writing_duration_ms: parse_u64(lines[4])?,
                    conn_start_ms: parse_u64(lines[5])?,
                    conn_end_ms: parse_u64(lines[6])?,
                    media_duration_ms: parse_u64(lines[7])?,
                    first_ms: parse_u64(lines[8])?,
                    last_ms: parse_u64(lines[9])?,
                }))
            }
        }
    }

    /// Re-serialize a parsed trigger back to the wire body, for the
    /// `parse(serialize(x)) == x` round-trip law (spec §8).
    pub fn serialize(trigger: &Trigger) -> String {
        match trigger {
            Trigger::PushRewrite(p) => format!(
                "{}\n{}\n{}",
                p.ingest_url, p.client_host, p.requested_stream_name
            ),
            Trigger::PushOutStart(p) => format!("{}\n{}", p.stream_name, p.push_target_url),
            Trigger::PushEnd(p) => format!(
                "{}\n{}\n{}\n{}\n{}\n{}",
                p.push_id,
                p.stream_name,
                p.original_dest,
                p.actual_dest,
                serde_json::to_string(&p.last_log_lines).expect("Vec<String> always serializes"),
                serde_json::to_string(&p.final_status).expect("PushEndStatus always serializes"),
            ),
            Trigger::StreamBuffer(p) => match &p.details {
                Some(details) => format!(
                    "{}\n{}\n{}",
                    p.stream_name,
                    p.state.as_str(),
                    serde_json::to_string(details).expect("Value always serializes"),
                ),
                None => format!("{}\n{}", p.stream_name, p.state.as_str()),
            },
            Trigger::StreamSource(p) => p.stream_name.clone(),
            Trigger::LiveTrackList(p) => format!(
                "{}\n{}",
                p.stream_name,
                serde_json::to_string(&p.tracks).expect("track map always serializes"),
            ),
            Trigger::UserNew(p) => {
                let mut body = format!(
                    "{}\n{}\n{}\n{}\n{}\n{}",
                    p.stream_name,
                    p.client_ip,
                    p.connection_id,
                    p.protocol,
                    p.full_url,
                    p.session_id
                );
                if let Some(original) = &p.original_url {
                    body.push('\n');
                    body.push_str(original);
                }
                body
            }
            Trigger::UserEnd(p) => format!(
                "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
                p.token,
                p.streams.join(","),
                p.protocols.join(","),
                p.ips.join(","),
                p.seconds_active,
                p.bytes_up,
                p.bytes_down,
                p.tags.join(","),
                p.conn_start_ms,
                p.conn_end_ms,
                serde_json::to_string(&p.per_stream_durations)
                    .expect("duration map always serializes"),
                p.session_id,
            ),
            Trigger::RecordingEnd(p) => format!(
                "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
                p.stream_name,
                p.path,
                p.protocol,
                p.bytes,
                p.writing_duration_ms,
                p.conn_start_ms,
                p.conn_end_ms,
                p.media_duration_ms,
                p.first_ms,
                p.last_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: TriggerKind, body: &str) {
        let parsed = TriggerCodec::parse(kind, body).expect("parse");
        let serialized = TriggerCodec::serialize(&parsed);
        let reparsed = TriggerCodec::parse(kind, &serialized).expect("reparse");
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn push_rewrite_round_trips() {
        round_trip(
            TriggerKind::PushRewrite,
            "rtmp://ingest/live\nclient.example\nmystream",
        );
    }

    #[test]
    fn push_rewrite_wrong_line_count_fails() {
        let err = TriggerCodec::parse(TriggerKind::PushRewrite, "only one line").unwrap_err();
        assert!(matches!(err, CodecError::WrongLineCount { .. }));
    }

    #[test]
    fn push_end_round_trips() {
        round_trip(
            TriggerKind::PushEnd,
            "push1\nmystream\nrtmp://orig\nrtmp://actual\n[\"line1\",\"line2\"]\n{\"active_seconds\":5,\"bytes\":100,\"media_time\":5000,\"tracks\":[\"video\"]}",
        );
    }

    #[test]
    fn stream_buffer_empty_is_two_lines() {
        let t = TriggerCodec::parse(TriggerKind::StreamBuffer, "mystream\nEMPTY").unwrap();
        match t {
            Trigger::StreamBuffer(p) => {
                assert_eq!(p.state, BufferState::Empty);
                assert!(p.details.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn stream_buffer_empty_rejects_three_lines() {
        let err =
            TriggerCodec::parse(TriggerKind::StreamBuffer, "mystream\nEMPTY\n{}").unwrap_err();
        assert!(matches!(err, CodecError::WrongLineCount { .. }));
    }

    #[test]
    fn stream_buffer_full_requires_details() {
        let err = TriggerCodec::parse(TriggerKind::StreamBuffer, "mystream\nFULL").unwrap_err();
        assert!(matches!(err, CodecError::WrongLineCount { .. }));

        round_trip(TriggerKind::StreamBuffer, "mystream\nFULL\n{\"reason\":\"ok\"}");
    }

    #[test]
    fn user_new_accepts_six_or_seven_lines() {
        let six = "mystream\n1.2.3.4\nconn1\nrtmp\nhttp://full\nsess1";
        round_trip(TriggerKind::UserNew, six);

        let seven = "mystream\n1.2.3.4\nconn1\nrtmp\nhttp://full\nsess1\nhttp://original";
        let parsed = TriggerCodec::parse(TriggerKind::UserNew, seven).unwrap();
        match parsed {
            Trigger::UserNew(p) => assert_eq!(p.original_url.as_deref(), Some("http://original")),
            _ => panic!("wrong variant"),
        }
        round_trip(TriggerKind::UserNew, seven);
    }

    #[test]
    fn user_end_round_trips_twelve_lines() {
        round_trip(
            TriggerKind::UserEnd,
            "tok\ns1,s2\nrtmp,rtmp\n1.1.1.1,2.2.2.2\n120\n1000\n2000\ntagA,tagB\n1000\n121000\n{\"s1\":100}\nsess1",
        );
    }

    #[test]
    fn recording_end_parses_u64_max() {
        let body = format!(
            "mystream\n/rec/path.mp4\nrtmp\n{}\n1000\n0\n120000\n120000\n0\n120000",
            u64::MAX
        );
        let parsed = TriggerCodec::parse(TriggerKind::RecordingEnd, &body).unwrap();
        match parsed {
            Trigger::RecordingEnd(p) => assert_eq!(p.bytes, u64::MAX),
            _ => panic!("wrong variant"),
        }
        round_trip(TriggerKind::RecordingEnd, &body);
    }

    #[test]
    fn live_track_list_counts_video_tracks() {
        let body = "mystream\n{\"t1\":{\"type\":\"video\"},\"t2\":{\"type\":\"video\"},\"t3\":{\"type\":\"audio\"}}";
        let parsed = TriggerCodec::parse(TriggerKind::LiveTrackList, body).unwrap();
        match parsed {
            Trigger::LiveTrackList(p) => assert_eq!(p.video_track_count(), 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_header_rejected() {
        assert!(TriggerKind::parse_header("NOT_A_TRIGGER").is_err());
    }
}
