//! StreamRegistry (spec §4.4): the in-memory map of active publishers. Keyed
//! by [`PlaybackId`], read-mostly, backed by `DashMap` the way the teacher's
//! `MovieBatchesCache`/`SeriesBundlesCache`
//! (`ferrex-server/src/infra/cache/movie_batches_cache.rs`) keys per-entity
//! state behind a concurrent map with an interior per-entry lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};

use crate::ids::PlaybackId;
use crate::ports::MultistreamTarget;

/// One configured multistream destination (spec §3 `PushState.target`).
#[derive(Debug, Clone, PartialEq)]
pub struct PushTarget {
    pub id: String,
    pub name: String,
    pub url: String,
    pub disabled: bool,
    pub profile_name: String,
    pub video_only: bool,
}

impl From<&MultistreamTarget> for PushTarget {
    fn from(target: &MultistreamTarget) -> Self {
        Self {
            id: target.id.clone(),
            name: target.name.clone(),
            url: target.url.clone(),
            disabled: target.disabled,
            profile_name: target.profile_name.clone(),
            video_only: target.video_only,
        }
    }
}

impl PushTarget {
    /// Expanded push URL (spec §3 `desiredPushes`): this target's URL with
    /// `video=<selector>&audio=<selector>` query parameters injected from
    /// its studio-configured profile. A video-only profile carries no audio
    /// track, so its audio selector is `"none"`.
    pub fn expanded_url(&self) -> String {
        let audio_selector = if self.video_only { "none" } else { self.profile_name.as_str() };
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{sep}video={}&audio={}",
            self.url, self.profile_name, audio_selector
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushLifecycle {
    Desired,
    Started,
    Healthy,
    Failed,
    Disconnected,
}

/// One desired push URL's state machine (spec §3/§4.5).
#[derive(Debug, Clone)]
pub struct PushState {
    pub target: PushTarget,
    pub lifecycle: PushLifecycle,
    /// Engine-assigned push id, once `push-start`/observed in `pushList`.
    pub engine_push_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub healthy_announced: bool,
    pub stopped_early: bool,
}

impl PushState {
    pub fn new(target: PushTarget) -> Self {
        Self {
            target,
            lifecycle: PushLifecycle::Desired,
            engine_push_id: None,
            started_at: None,
            healthy_announced: false,
            stopped_early: false,
        }
    }
}

/// One active publisher (spec §3 `PublisherState`). The outer `DashMap`
/// entry gives cheap read access to identity fields; `inner` is the
/// per-record mutex guarding the parts multiple triggers race to mutate.
#[derive(Debug)]
pub struct PublisherRecord {
    pub playback_id: PlaybackId,
    pub stream_id: crate::ids::StreamId,
    pub user_id: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub lazy: bool,
    inner: Mutex<PublisherInner>,
    /// Single-fire signal used to cancel a scheduled grace-period deletion
    /// if the publisher reappears before it fires.
    pub reappeared: Notify,
}

#[derive(Debug, Default)]
pub struct PublisherInner {
    pub desired_pushes: HashMap<String, PushState>,
    pub stopped: bool,
    pub last_seen_bumped_at: Option<DateTime<Utc>>,
    pub multistream_started: bool,
}

impl PublisherRecord {
    pub fn new(
        playback_id: PlaybackId,
        stream_id: crate::ids::StreamId,
        user_id: String,
        project_id: String,
        started_at: DateTime<Utc>,
        lazy: bool,
    ) -> Self {
        Self {
            playback_id,
            stream_id,
            user_id,
            project_id,
            started_at,
            lazy,
            inner: Mutex::new(PublisherInner::default()),
            reappeared: Notify::new(),
        }
    }

    /// Lazily materialized entries (spec §4.4) are pre-seeded so
    /// reconciliation treats them as already settled and never drives
    /// heartbeats or new multistream starts against them.
    pub fn new_lazy(
        playback_id: PlaybackId,
        stream_id: crate::ids::StreamId,
        user_id: String,
        project_id: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        let record = Self::new(playback_id, stream_id, user_id, project_id, started_at, true);
        {
            let mut inner = record
                .inner
                .try_lock()
                .expect("freshly constructed record has no contention");
            inner.multistream_started = true;
        }
        record
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, PublisherInner> {
        self.inner.lock().await
    }
}

/// Thread-safe `playbackID -> PublisherRecord` map (spec §4.4).
#[derive(Debug, Default)]
pub struct StreamRegistry {
    records: DashMap<PlaybackId, Arc<PublisherRecord>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn insert(&self, record: PublisherRecord) -> Arc<PublisherRecord> {
        let arc = Arc::new(record);
        self.records.insert(arc.playback_id.clone(), arc.clone());
        arc
    }

    pub fn get(&self, id: &PlaybackId) -> Option<Arc<PublisherRecord>> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &PlaybackId) -> Option<Arc<PublisherRecord>> {
        self.records.remove(id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: &PlaybackId) -> bool {
        self.records.contains_key(id)
    }

    /// Snapshot of every live record, for the reconciler/metrics tick. Cloned
    /// `Arc`s so the caller never holds the registry's internal shards while
    /// doing I/O (spec §5 lock-discipline rule: registry lock is never held
    /// across outbound calls).
    pub fn snapshot(&self) -> Vec<Arc<PublisherRecord>> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;

    fn sample_record(id: &str) -> PublisherRecord {
        PublisherRecord::new(
            PlaybackId::new(id),
            StreamId::new("stream-1"),
            "user-1".to_string(),
            "proj-1".to_string(),
            Utc::now(),
            false,
        )
    }

    #[test]
    fn insert_and_get_round_trips() {
        let registry = StreamRegistry::new();
        registry.insert(sample_record("pb1"));
        assert!(registry.contains(&PlaybackId::new("pb1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_drops_record() {
        let registry = StreamRegistry::new();
        registry.insert(sample_record("pb1"));
        assert!(registry.remove(&PlaybackId::new("pb1")).is_some());
        assert!(registry.get(&PlaybackId::new("pb1")).is_none());
    }

    #[test]
    fn lazy_record_is_preseeded_settled() {
        let record = PublisherRecord::new_lazy(
            PlaybackId::new("pb2"),
            StreamId::new("stream-2"),
            "user-2".to_string(),
            "proj-2".to_string(),
            Utc::now(),
        );
        assert!(record.lazy);
        let inner = record.inner.try_lock().unwrap();
        assert!(inner.multistream_started);
    }

    #[tokio::test]
    async fn snapshot_returns_independent_arcs() {
        let registry = StreamRegistry::new();
        registry.insert(sample_record("pb1"));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        {
            let mut inner = snapshot[0].lock().await;
            inner.stopped = true;
        }
        let refetched = registry.get(&PlaybackId::new("pb1")).unwrap();
        assert!(refetched.lock().await.stopped);
    }
}
