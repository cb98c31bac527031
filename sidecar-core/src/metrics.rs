//! MetricsCollector (spec §4.6): periodic poll of engine stats, heartbeats
//! to the studio API, and derived per-push byte/time counters forwarded to
//! analytics. Concurrency bounded to 5 outbound calls via
//! `tokio::sync::Semaphore`; a panicking subtask never aborts the tick
//! (joined with `JoinError::is_panic`), matching the teacher's
//! periodic-loop-with-progress-channel shape in
//! `ferrex-server/src/media/scan/scan_manager.rs`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::{AnalyticsEvent, AnalyticsHandle};
use crate::clock::SharedClock;
use crate::ids::PlaybackId;
use crate::ports::{EngineClient, StudioApi};
use crate::registry::{PublisherRecord, StreamRegistry};
use crate::thresholds::Thresholds;

#[derive(Debug, Clone, Copy, Default)]
struct LastObservation {
    bytes: u64,
    media_time_ms: u64,
}

/// Runs the periodic metrics tick. Holds last-observed per-stream byte/time
/// counters so it can emit deltas rather than cumulative totals.
#[derive(Debug)]
pub struct MetricsCollector<E: EngineClient, S: StudioApi> {
    engine: Arc<E>,
    studio: Arc<S>,
    registry: Arc<StreamRegistry>,
    analytics: AnalyticsHandle,
    clock: SharedClock,
    thresholds: Thresholds,
    last_observed: DashMap<String, LastObservation>,
}

impl<E: EngineClient + 'static, S: StudioApi + 'static> MetricsCollector<E, S> {
    pub fn new(
        engine: Arc<E>,
        studio: Arc<S>,
        registry: Arc<StreamRegistry>,
        analytics: AnalyticsHandle,
        clock: SharedClock,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            engine,
            studio,
            registry,
            analytics,
            clock,
            thresholds,
            last_observed: DashMap::new(),
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.thresholds.metrics_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.clone().tick().await;
                    }
                }
            }
        });
    }

    /// One collection pass (spec §4.6). Public so tests can drive it
    /// directly instead of waiting on the ticker.
    pub async fn tick(self: Arc<Self>) {
        let state = match self.engine.get_state().await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "metrics tick: engine state unavailable");
                return;
            }
        };

        self.materialize_unknown_publishers(&state).await;

        let semaphore = Arc::new(Semaphore::new(self.thresholds.metrics_concurrency));
        let mut joins = Vec::new();
        for record in self.registry.snapshot() {
            if record.lazy {
                continue;
            }
            let Some(stats) = state
                .streams_stats
                .get(record.stream_id.as_str())
                .or_else(|| state.streams_stats.get(record.playback_id.as_str()))
                .cloned()
            else {
                continue;
            };
            let this = self.clone();
            let sem = semaphore.clone();
            joins.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.expect("semaphore never closed");
                this.collect_one(record, stats).await;
            }));
        }

        let mut errors = 0;
        for join in joins {
            if let Err(join_err) = join.await {
                if join_err.is_panic() {
                    warn!("metrics subtask panicked, continuing tick");
                }
                errors += 1;
            }
        }
        info!(publishers = self.registry.len(), errors, "metrics tick complete");
    }

    /// Engine-visible ingest streams this node has no `PublisherRecord` for
    /// (spec §4.4 lazy materialization): fetched from the studio API and
    /// inserted with `lazyFlag=true` so reconciliation doesn't tear down
    /// pushes belonging to a publisher this node never saw a trigger for,
    /// and so this tick doesn't re-fetch the same stream forever.
    async fn materialize_unknown_publishers(&self, state: &crate::ports::EngineState) {
        for (name, source) in &state.active_streams {
            if !source.is_ingest {
                continue;
            }
            let playback_id = PlaybackId::from_stream_name(name);
            if self.registry.contains(&playback_id) {
                continue;
            }
            match self.studio.get_stream_by_playback_id(&playback_id).await {
                Ok(stream) => {
                    debug!(%playback_id, "metrics: materializing unknown publisher as lazy");
                    self.registry.insert(PublisherRecord::new_lazy(
                        stream.playback_id,
                        stream.stream_id,
                        stream.user_id,
                        stream.project_id,
                        self.clock.now(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, %playback_id, "metrics: studio lookup failed for unknown publisher");
                }
            }
        }
    }

    async fn collect_one(
        &self,
        record: Arc<crate::registry::PublisherRecord>,
        stats: crate::ports::EngineStats,
    ) {
        let now = self.clock.now();
        let needs_heartbeat = {
            let inner = record.lock().await;
            match inner.last_seen_bumped_at {
                Some(last) => now - last >= chrono::Duration::from_std(self.thresholds.heartbeat_interval).unwrap_or_default(),
                None => true,
            }
        };
        if needs_heartbeat {
            if let Err(err) = self.studio.heartbeat(&record.stream_id).await {
                warn!(error = %err, stream_id = %record.stream_id, "heartbeat failed");
            } else {
                let mut inner = record.lock().await;
                inner.last_seen_bumped_at = Some(now);
            }
        }

        let key = record.stream_id.as_str().to_string();
        let previous = self.last_observed.get(&key).map(|v| *v).unwrap_or_default();
        let delta_bytes = stats.bytes.saturating_sub(previous.bytes);
        let delta_media_time_ms = stats.media_time_ms.saturating_sub(previous.media_time_ms);
        self.last_observed.insert(
            key,
            LastObservation {
                bytes: stats.bytes,
                media_time_ms: stats.media_time_ms,
            },
        );

        if delta_bytes > 0 || delta_media_time_ms > 0 {
            self.analytics.submit(AnalyticsEvent {
                topic: format!("stream.metrics.{}", record.stream_id),
                session_id: record.playback_id.as_str().to_string(),
                event_type: "metrics".to_string(),
                value: serde_json::json!({
                    "bytes": delta_bytes,
                    "mediaTimeMs": delta_media_time_ms,
                }),
            });
        }
        debug!(stream_id = %record.stream_id, delta_bytes, delta_media_time_ms, "metrics collected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::StreamId;
    use crate::ports::{EngineState, MockEngineClient, MockStudioApi};
    use crate::registry::PublisherRecord;
    use tokio::sync::mpsc;

    fn handle_with_counters() -> (AnalyticsHandle, tokio::sync::mpsc::Receiver<AnalyticsEvent>) {
        let (tx, rx) = mpsc::channel(10);
        let counters = Arc::new(crate::analytics::AnalyticsCounters::default());
        (crate::analytics::AnalyticsHandle { sender: tx, counters }, rx)
    }

    #[tokio::test]
    async fn heartbeat_fires_once_per_interval() {
        let mut engine = MockEngineClient::new();
        let mut state = EngineState::default();
        state.streams_stats.insert(
            "stream-1".to_string(),
            crate::ports::EngineStats {
                bytes: 100,
                media_time_ms: 10,
            },
        );
        engine.expect_get_state().returning(move || Ok(state.clone()));

        let mut studio = MockStudioApi::new();
        studio.expect_heartbeat().times(1).returning(|_| Ok(()));

        let registry = Arc::new(StreamRegistry::new());
        registry.insert(PublisherRecord::new(
            PlaybackId::new("pb1"),
            StreamId::new("stream-1"),
            "user-1".to_string(),
            "proj-1".to_string(),
            chrono::Utc::now(),
            false,
        ));

        let (handle, _rx) = handle_with_counters();
        let collector = Arc::new(MetricsCollector::new(
            Arc::new(engine),
            Arc::new(studio),
            registry,
            handle,
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
        ));
        collector.clone().tick().await;
    }

    #[tokio::test]
    async fn unknown_ingest_stream_is_materialized_as_lazy() {
        let mut engine = MockEngineClient::new();
        let mut state = EngineState::default();
        state.active_streams.insert(
            "pb-unknown".to_string(),
            crate::ports::EngineStreamSource { is_ingest: true },
        );
        engine.expect_get_state().returning(move || Ok(state.clone()));

        let mut studio = MockStudioApi::new();
        studio
            .expect_get_stream_by_playback_id()
            .times(1)
            .returning(|id| {
                Ok(crate::ports::StudioStream {
                    playback_id: id.clone(),
                    stream_id: StreamId::new("stream-unknown"),
                    user_id: "user-9".to_string(),
                    project_id: "proj-9".to_string(),
                    deleted: false,
                    suspended: false,
                    multistream_targets: Vec::new(),
                })
            });
        // no heartbeat expectation: a lazy record must never be heartbeat'd
        // in the same tick it's materialized.

        let registry = Arc::new(StreamRegistry::new());
        let (handle, _rx) = handle_with_counters();
        let collector = Arc::new(MetricsCollector::new(
            Arc::new(engine),
            Arc::new(studio),
            registry.clone(),
            handle,
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
        ));
        collector.clone().tick().await;

        let record = registry.get(&PlaybackId::new("pb-unknown")).unwrap();
        assert!(record.lazy);
    }

    #[tokio::test]
    async fn lazy_publishers_are_skipped() {
        let mut engine = MockEngineClient::new();
        engine.expect_get_state().returning(|| Ok(EngineState::default()));
        let studio = MockStudioApi::new(); // no heartbeat expectation set => panics if called

        let registry = Arc::new(StreamRegistry::new());
        registry.insert(PublisherRecord::new_lazy(
            PlaybackId::new("pb1"),
            StreamId::new("stream-1"),
            "user-1".to_string(),
            "proj-1".to_string(),
            chrono::Utc::now(),
        ));

        let (handle, _rx) = handle_with_counters();
        let collector = Arc::new(MetricsCollector::new(
            Arc::new(engine),
            Arc::new(studio),
            registry,
            handle,
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
        ));
        collector.clone().tick().await;
    }
}
