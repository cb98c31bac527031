//! Opaque identifier newtypes used throughout the sidecar.
//!
//! Stream names the engine hands us are sometimes prefixed with a
//! configured base name (`<base>+<playback-id>`); [`PlaybackId::from_stream_name`]
//! strips that prefix so every internal map is keyed on the bare id.

use std::fmt;

/// Primary key for publisher state. Opaque, alphanumeric, engine- and
/// studio-API-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(String);

impl PlaybackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Strip a `<base>+` prefix from an engine-facing stream name, if present.
    pub fn from_stream_name(stream_name: &str) -> Self {
        match stream_name.split_once('+') {
            Some((_base, id)) => Self(id.to_string()),
            None => Self(stream_name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstruct the engine-facing stream name for this playback id.
    ///
    /// `suffix` is appended after the id (used for the `+rec` audio-record
    /// marker); pass `""` when no suffix applies.
    pub fn to_stream_name(&self, base: &str, suffix: &str) -> String {
        if base.is_empty() {
            format!("{}{}", self.0, suffix)
        } else {
            format!("{base}+{}{suffix}", self.0)
        }
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PlaybackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PlaybackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Studio API identity for a stream (distinct from [`PlaybackId`] — a stream
/// may have multiple playback ids over its life via asset re-linking, but we
/// only need the studio id to call `SetActive`/`Heartbeat`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_base_prefix() {
        assert_eq!(
            PlaybackId::from_stream_name("video+abc123").as_str(),
            "abc123"
        );
    }

    #[test]
    fn passes_through_bare_ids() {
        assert_eq!(PlaybackId::from_stream_name("abc123").as_str(), "abc123");
    }

    #[test]
    fn round_trips_stream_name() {
        let id = PlaybackId::new("abc123");
        assert_eq!(id.to_stream_name("video", ""), "video+abc123");
        assert_eq!(id.to_stream_name("video", "+rec"), "video+abc123+rec");
        assert_eq!(id.to_stream_name("", ""), "abc123");
    }
}
