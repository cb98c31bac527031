//! Reconciler (spec §4.5): periodic loop that drives the engine's live push
//! set and stream set into agreement with StreamRegistry + studio API.
//! Tick/cleanup shape mirrors the teacher's periodic orchestration loop
//! (`ferrex-server/src/infra/orchestration/mod.rs`'s `ScanOrchestrator`
//! ticking against an event bus), generalized to a push/stream diff instead
//! of a library scan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::analytics::{AnalyticsEvent, AnalyticsHandle};
use crate::clock::SharedClock;
use crate::ids::StreamId;
use crate::ports::{EngineClient, StudioApi};
use crate::registry::{PushLifecycle, StreamRegistry};
use crate::thresholds::Thresholds;

/// An auto-push entry is a recording push, excluded from multistream
/// reconciliation, when its stream name ends with `+` or its URL begins with
/// `s3+https://` (spec §6 "Push-auto filter").
fn is_recording_push(stream: &str, url: &str) -> bool {
    stream.ends_with('+') || url.starts_with("s3+https://")
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub nuked: usize,
    pub pushes_added: usize,
    pub pushes_removed: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct Reconciler<E: EngineClient, S: StudioApi> {
    engine: Arc<E>,
    studio: Arc<S>,
    registry: Arc<StreamRegistry>,
    analytics: AnalyticsHandle,
    clock: SharedClock,
    thresholds: Thresholds,
    base_stream_name: String,
    audio_suffix: String,
}

impl<E: EngineClient + 'static, S: StudioApi + 'static> Reconciler<E, S> {
    pub fn new(
        engine: Arc<E>,
        studio: Arc<S>,
        registry: Arc<StreamRegistry>,
        analytics: AnalyticsHandle,
        clock: SharedClock,
        thresholds: Thresholds,
        base_stream_name: String,
        audio_suffix: String,
    ) -> Self {
        Self {
            engine,
            studio,
            registry,
            analytics,
            clock,
            thresholds,
            base_stream_name,
            audio_suffix,
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.thresholds.reconcile_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = self.clone().tick().await;
                        info!(
                            nuked = summary.nuked,
                            pushes_added = summary.pushes_added,
                            pushes_removed = summary.pushes_removed,
                            errors = summary.errors,
                            "reconcile tick complete"
                        );
                    }
                }
            }
        });
    }

    /// One reconciliation pass (spec §4.5). Idempotent: re-running against
    /// unchanged engine state produces zero writes.
    #[instrument(skip(self), err)]
    pub async fn tick(self: Arc<Self>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let state = match self.engine.get_state().await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "reconcile tick: engine state unavailable");
                summary.errors += 1;
                return summary;
            }
        };

        self.cleanup_deleted_streams(&state, &mut summary).await;
        self.reconcile_pushes(&state, &mut summary).await;
        summary
    }

    async fn cleanup_deleted_streams(
        &self,
        state: &crate::ports::EngineState,
        summary: &mut ReconcileSummary,
    ) {
        for (name, source) in &state.active_streams {
            if !source.is_ingest {
                continue;
            }
            let playback_id = crate::ids::PlaybackId::from_stream_name(name);
            let studio_stream = match self.studio.get_stream_by_playback_id(&playback_id).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, %name, "reconcile: studio lookup failed, skipping nuke check");
                    summary.errors += 1;
                    continue;
                }
            };
            if studio_stream.deleted || studio_stream.suspended {
                for _ in 0..2 {
                    if let Err(err) = self.engine.nuke_stream(name).await {
                        warn!(error = %err, %name, "reconcile: nuke_stream failed");
                        summary.errors += 1;
                    }
                }
                summary.nuked += 1;
            }
        }
    }

    async fn reconcile_pushes(
        &self,
        state: &crate::ports::EngineState,
        summary: &mut ReconcileSummary,
    ) {
        for record in self.registry.snapshot() {
            if record.lazy {
                continue;
            }
            let stream_name = record
                .playback_id
                .to_stream_name(&self.base_stream_name, &self.audio_suffix);

            let desired: HashSet<String> = {
                let inner = record.lock().await;
                inner
                    .desired_pushes
                    .iter()
                    .filter(|(_, push)| !push.target.disabled)
                    .map(|(url, _)| url.clone())
                    .collect()
            };

            let auto: HashMap<String, String> = state
                .push_auto_list
                .iter()
                .filter(|entry| entry.stream == stream_name)
                .filter(|entry| !is_recording_push(&entry.stream, &entry.target))
                .map(|entry| (entry.target.clone(), entry.stream_params.clone()))
                .collect();

            for url in desired.iter().filter(|url| !auto.contains_key(*url)) {
                if let Err(err) = self.engine.push_auto_add(&stream_name, url).await {
                    warn!(error = %err, %stream_name, %url, "reconcile: push_auto_add failed");
                    summary.errors += 1;
                    continue;
                }
                summary.pushes_added += 1;
            }

            for (url, stream_params) in auto.iter().filter(|(url, _)| !desired.contains(*url)) {
                if let Err(err) = self.engine.push_auto_remove(stream_params).await {
                    warn!(error = %err, %stream_name, %url, "reconcile: push_auto_remove failed");
                    summary.errors += 1;
                    continue;
                }
                if let Some(active) = state
                    .push_list
                    .iter()
                    .find(|p| p.stream == stream_name && &p.original_url == url)
                {
                    if let Err(err) = self.engine.push_stop(&active.id).await {
                        warn!(error = %err, id = %active.id, "reconcile: push_stop failed");
                        summary.errors += 1;
                    }
                }
                summary.pushes_removed += 1;
            }
        }
    }

    /// Advance one push's lifecycle on `PUSH_END` (spec §4.5 state machine).
    /// Called from the `PushEnd` handler, not from the tick loop, since it's
    /// event-driven rather than poll-driven.
    pub async fn on_push_end(&self, stream_id: &StreamId, record: &crate::registry::PublisherRecord, url: &str) {
        let now = self.clock.now();
        let mut inner = record.lock().await;
        let Some(push) = inner.desired_pushes.get_mut(url) else {
            return;
        };
        match push.lifecycle {
            PushLifecycle::Healthy => {
                push.lifecycle = PushLifecycle::Disconnected;
                drop(inner);
                self.analytics.submit(AnalyticsEvent {
                    topic: "events.multistream.disconnected".to_string(),
                    session_id: stream_id.as_str().to_string(),
                    event_type: "multistream.disconnected".to_string(),
                    value: serde_json::json!({"url": url}),
                });
            }
            PushLifecycle::Started | PushLifecycle::Desired => {
                push.lifecycle = PushLifecycle::Failed;
                push.stopped_early = true;
                drop(inner);
                self.analytics.submit(AnalyticsEvent {
                    topic: "events.multistream.error".to_string(),
                    session_id: stream_id.as_str().to_string(),
                    event_type: "multistream.error".to_string(),
                    value: serde_json::json!({"url": url}),
                });
            }
            PushLifecycle::Failed | PushLifecycle::Disconnected => {}
        }
        let _ = now;
    }

    /// Promote a push to healthy after the settle window has elapsed with no
    /// error (spec §4.5). Called by a per-push settle timer spawned from the
    /// `PushOutStart` handler.
    pub async fn settle_push(&self, stream_id: &StreamId, record: &crate::registry::PublisherRecord, url: &str) {
        let mut inner = record.lock().await;
        let Some(push) = inner.desired_pushes.get_mut(url) else {
            return;
        };
        if push.lifecycle == PushLifecycle::Started && !push.stopped_early {
            push.lifecycle = PushLifecycle::Healthy;
            push.healthy_announced = true;
            drop(inner);
            self.analytics.submit(AnalyticsEvent {
                topic: "events.multistream.connected".to_string(),
                session_id: stream_id.as_str().to_string(),
                event_type: "multistream.connected".to_string(),
                value: serde_json::json!({"url": url}),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::{PlaybackId, StreamId as SId};
    use crate::ports::{
        EnginePushAutoEntry, EngineState, EngineStreamSource, MockEngineClient, MockStudioApi,
    };
    use crate::registry::{PublisherRecord, PushState, PushTarget};
    use tokio::sync::mpsc;

    fn handle() -> AnalyticsHandle {
        let (tx, _rx) = mpsc::channel(10);
        AnalyticsHandle {
            sender: tx,
            counters: Arc::new(crate::analytics::AnalyticsCounters::default()),
        }
    }

    fn target(id: &str, url: &str, disabled: bool) -> PushTarget {
        PushTarget {
            id: id.to_string(),
            name: id.to_string(),
            url: url.to_string(),
            disabled,
            profile_name: "default".to_string(),
            video_only: false,
        }
    }

    #[tokio::test]
    async fn reconcile_adds_desired_and_removes_stale_auto_pushes() {
        let mut engine = MockEngineClient::new();
        engine.expect_get_state().returning(|| {
            let mut state = EngineState::default();
            state.push_auto_list = vec![
                EnginePushAutoEntry {
                    stream: "video+pb1".to_string(),
                    target: "url-A".to_string(),
                    stream_params: "params-for-A".to_string(),
                },
                EnginePushAutoEntry {
                    stream: "video+pb1".to_string(),
                    target: "url-D".to_string(),
                    stream_params: "params-for-D".to_string(),
                },
            ];
            Ok(state)
        });
        engine
            .expect_push_auto_add()
            .withf(|stream, url| stream == "video+pb1" && url == "url-C")
            .times(1)
            .returning(|_, _| Ok(()));
        engine
            .expect_push_auto_remove()
            .withf(|stream_params| stream_params == "params-for-D")
            .times(1)
            .returning(|_| Ok(()));

        let mut studio = MockStudioApi::new();
        studio.expect_get_stream_by_playback_id().returning(|_| {
            Err(crate::error::StudioApiError::NotFound)
        });

        let registry = Arc::new(StreamRegistry::new());
        let record = PublisherRecord::new(
            PlaybackId::new("pb1"),
            SId::new("stream-1"),
            "user-1".to_string(),
            "proj-1".to_string(),
            chrono::Utc::now(),
            false,
        );
        {
            let mut inner = record.lock().await;
            inner
                .desired_pushes
                .insert("url-A".to_string(), PushState::new(target("A", "url-A", false)));
            inner
                .desired_pushes
                .insert("url-B".to_string(), PushState::new(target("B", "url-B", true)));
            inner
                .desired_pushes
                .insert("url-C".to_string(), PushState::new(target("C", "url-C", false)));
        }
        registry.insert(record);

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(engine),
            Arc::new(studio),
            registry,
            handle(),
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
            "video".to_string(),
            String::new(),
        ));

        let summary = reconciler.tick().await;
        assert_eq!(summary.pushes_added, 1);
        assert_eq!(summary.pushes_removed, 1);
    }

    #[tokio::test]
    async fn nuke_is_called_twice_for_deleted_stream() {
        let mut engine = MockEngineClient::new();
        engine.expect_get_state().returning(|| {
            let mut state = EngineState::default();
            state
                .active_streams
                .insert("video+pbX".to_string(), EngineStreamSource { is_ingest: true });
            Ok(state)
        });
        engine.expect_nuke_stream().times(2).returning(|_| Ok(()));

        let mut studio = MockStudioApi::new();
        studio.expect_get_stream_by_playback_id().returning(|_| {
            Ok(crate::ports::StudioStream {
                stream_id: SId::new("stream-x"),
                playback_id: PlaybackId::new("pbX"),
                user_id: "u".to_string(),
                project_id: "p".to_string(),
                deleted: true,
                suspended: false,
                multistream_targets: Vec::new(),
            })
        });

        let registry = Arc::new(StreamRegistry::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(engine),
            Arc::new(studio),
            registry,
            handle(),
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
            "video".to_string(),
            String::new(),
        ));
        let summary = reconciler.tick().await;
        assert_eq!(summary.nuked, 1);
    }

    #[tokio::test]
    async fn push_end_before_settle_fails_not_connects() {
        let registry = Arc::new(StreamRegistry::new());
        let reconciler = Reconciler::new(
            Arc::new(MockEngineClient::new()),
            Arc::new(MockStudioApi::new()),
            registry,
            handle(),
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
            "video".to_string(),
            String::new(),
        );
        let record = PublisherRecord::new(
            PlaybackId::new("pb1"),
            SId::new("stream-1"),
            "u".to_string(),
            "p".to_string(),
            chrono::Utc::now(),
            false,
        );
        {
            let mut inner = record.lock().await;
            let mut push = PushState::new(target("A", "url-A", false));
            push.lifecycle = PushLifecycle::Started;
            inner.desired_pushes.insert("url-A".to_string(), push);
        }
        reconciler
            .on_push_end(&SId::new("stream-1"), &record, "url-A")
            .await;
        let inner = record.lock().await;
        assert_eq!(
            inner.desired_pushes.get("url-A").unwrap().lifecycle,
            PushLifecycle::Failed
        );
    }

    #[tokio::test]
    async fn settle_then_push_end_disconnects() {
        let registry = Arc::new(StreamRegistry::new());
        let reconciler = Reconciler::new(
            Arc::new(MockEngineClient::new()),
            Arc::new(MockStudioApi::new()),
            registry,
            handle(),
            Arc::new(FixedClock::new(chrono::Utc::now())),
            Thresholds::default(),
            "video".to_string(),
            String::new(),
        );
        let record = PublisherRecord::new(
            PlaybackId::new("pb1"),
            SId::new("stream-1"),
            "u".to_string(),
            "p".to_string(),
            chrono::Utc::now(),
            false,
        );
        {
            let mut inner = record.lock().await;
            let mut push = PushState::new(target("A", "url-A", false));
            push.lifecycle = PushLifecycle::Started;
            inner.desired_pushes.insert("url-A".to_string(), push);
        }
        reconciler
            .settle_push(&SId::new("stream-1"), &record, "url-A")
            .await;
        assert_eq!(
            record.lock().await.desired_pushes.get("url-A").unwrap().lifecycle,
            PushLifecycle::Healthy
        );
        reconciler
            .on_push_end(&SId::new("stream-1"), &record, "url-A")
            .await;
        assert_eq!(
            record.lock().await.desired_pushes.get("url-A").unwrap().lifecycle,
            PushLifecycle::Disconnected
        );
    }
}
