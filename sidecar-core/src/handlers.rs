//! TriggerHandlers (spec §4.8): the concrete handlers wired into the
//! [`Broker`](crate::broker::Broker), one struct per trigger kind, each
//! holding only the collaborators it needs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::access::AccessGate;
use crate::analytics::{AnalyticsEvent, AnalyticsHandle};
use crate::broker::{DispatchContext, Handler, HandlerOutcome};
use crate::clock::SharedClock;
use crate::codec::{BufferState, Trigger};
use crate::error::HandlerError;
use crate::ids::PlaybackId;
use crate::ports::{EngineClient, PolicyClient, StudioApi};
use crate::reconciler::Reconciler;
use crate::registry::{PublisherRecord, PushState, PushTarget, StreamRegistry};
use crate::thresholds::Thresholds;

/// `PUSH_REWRITE` (spec §4.8): looks up the stream by key; unknown ⇒ empty
/// response (reject). Otherwise inserts `PublisherState` seeded with
/// `desiredPushes` from the stream's studio-configured multistream targets,
/// calls `SetActive(true)`, and returns the playback-id as the rewritten
/// stream name.
#[derive(Debug)]
pub struct PushRewriteHandler<S: StudioApi> {
    studio: Arc<S>,
    registry: Arc<StreamRegistry>,
    clock: SharedClock,
    base_stream_name: String,
    /// Appended to every rewritten stream name (spec §9's `+rec` audio-record
    /// marker); `""` when `audioPolicy` isn't `record`.
    audio_suffix: String,
}

impl<S: StudioApi> PushRewriteHandler<S> {
    pub fn new(
        studio: Arc<S>,
        registry: Arc<StreamRegistry>,
        clock: SharedClock,
        base_stream_name: String,
        audio_suffix: String,
    ) -> Self {
        Self {
            studio,
            registry,
            clock,
            base_stream_name,
            audio_suffix,
        }
    }
}

#[async_trait]
impl<S: StudioApi> Handler for PushRewriteHandler<S> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::PushRewrite(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        let stream = match self
            .studio
            .get_stream_by_key(&payload.requested_stream_name)
            .await
        {
            Ok(stream) => stream,
            Err(crate::error::StudioApiError::NotFound) => {
                debug!(stream = %payload.requested_stream_name, "push_rewrite: unknown stream, rejecting");
                return Ok(HandlerOutcome::Rewrite(String::new()));
            }
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now();
        self.studio
            .set_active(&stream.stream_id, true, now.timestamp_millis())
            .await?;

        if !self.registry.contains(&stream.playback_id) {
            let record = PublisherRecord::new(
                stream.playback_id.clone(),
                stream.stream_id.clone(),
                stream.user_id.clone(),
                stream.project_id.clone(),
                now,
                false,
            );
            {
                let mut inner = record.lock().await;
                for target in &stream.multistream_targets {
                    let push_target = PushTarget::from(target);
                    if push_target.disabled {
                        continue;
                    }
                    let expanded = push_target.expanded_url();
                    inner
                        .desired_pushes
                        .insert(expanded, PushState::new(push_target));
                }
            }
            self.registry.insert(record);
        }

        let rewritten = stream
            .playback_id
            .to_stream_name(&self.base_stream_name, &self.audio_suffix);
        Ok(HandlerOutcome::Rewrite(rewritten))
    }
}

/// `LIVE_TRACK_LIST` (spec §4.8): starts multistream once ≥2 video tracks
/// are present and the publisher has not already started.
#[derive(Debug)]
pub struct LiveTrackListHandler<E: EngineClient> {
    engine: Arc<E>,
    registry: Arc<StreamRegistry>,
    base_stream_name: String,
    audio_suffix: String,
}

impl<E: EngineClient> LiveTrackListHandler<E> {
    pub fn new(
        engine: Arc<E>,
        registry: Arc<StreamRegistry>,
        base_stream_name: String,
        audio_suffix: String,
    ) -> Self {
        Self {
            engine,
            registry,
            base_stream_name,
            audio_suffix,
        }
    }
}

#[async_trait]
impl<E: EngineClient> Handler for LiveTrackListHandler<E> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::LiveTrackList(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        if payload.video_track_count() < 2 {
            return Ok(HandlerOutcome::Ack);
        }
        let playback_id = PlaybackId::from_stream_name(&payload.stream_name);
        let Some(record) = self.registry.get(&playback_id) else {
            return Ok(HandlerOutcome::Ack);
        };

        let targets_to_start: Vec<(String, PushTarget)> = {
            let mut inner = record.lock().await;
            if inner.multistream_started || inner.desired_pushes.is_empty() {
                Vec::new()
            } else {
                inner.multistream_started = true;
                inner
                    .desired_pushes
                    .iter()
                    .filter(|(_, p)| !p.target.disabled)
                    .map(|(url, p)| (url.clone(), p.target.clone()))
                    .collect()
            }
        };

        let stream_name = playback_id.to_stream_name(&self.base_stream_name, &self.audio_suffix);
        for (url, _target) in targets_to_start {
            if let Err(err) = self.engine.push_start(&stream_name, &url).await {
                warn!(error = %err, %url, "live_track_list: push_start failed");
            }
        }
        Ok(HandlerOutcome::Ack)
    }
}

/// `PUSH_OUT_START` (spec §4.8): registers the push into `desiredPushes` and
/// starts the settle timer that promotes it to healthy after `T_settle`.
#[derive(Debug)]
pub struct PushOutStartHandler<E: EngineClient, S: StudioApi> {
    registry: Arc<StreamRegistry>,
    reconciler: Arc<Reconciler<E, S>>,
    thresholds: Thresholds,
}

impl<E: EngineClient + 'static, S: StudioApi + 'static> PushOutStartHandler<E, S> {
    pub fn new(
        registry: Arc<StreamRegistry>,
        reconciler: Arc<Reconciler<E, S>>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            registry,
            reconciler,
            thresholds,
        }
    }
}

#[async_trait]
impl<E: EngineClient + 'static, S: StudioApi + 'static> Handler for PushOutStartHandler<E, S> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::PushOutStart(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        let playback_id = PlaybackId::from_stream_name(&payload.stream_name);
        let Some(record) = self.registry.get(&playback_id) else {
            return Ok(HandlerOutcome::Rewrite(String::new()));
        };

        {
            let mut inner = record.lock().await;
            let push = inner
                .desired_pushes
                .entry(payload.push_target_url.clone())
                .or_insert_with(|| {
                    PushState::new(PushTarget {
                        id: payload.push_target_url.clone(),
                        name: payload.push_target_url.clone(),
                        url: payload.push_target_url.clone(),
                        disabled: false,
                        profile_name: String::new(),
                        video_only: false,
                    })
                });
            push.lifecycle = crate::registry::PushLifecycle::Started;
            push.started_at = Some(chrono::Utc::now());
        }

        let reconciler = self.reconciler.clone();
        let stream_id = record.stream_id.clone();
        let url = payload.push_target_url.clone();
        let settle_delay = self.thresholds.settle_delay;
        let record_for_timer = record.clone();
        tokio::spawn(async move {
            tokio::time::sleep(settle_delay).await;
            reconciler.settle_push(&stream_id, &record_for_timer, &url).await;
        });

        Ok(HandlerOutcome::Rewrite(payload.push_target_url.clone()))
    }
}

/// `PUSH_END` (spec §4.8): finalizes the push state machine.
#[derive(Debug)]
pub struct PushEndHandler<E: EngineClient, S: StudioApi> {
    registry: Arc<StreamRegistry>,
    reconciler: Arc<Reconciler<E, S>>,
}

impl<E: EngineClient + 'static, S: StudioApi + 'static> PushEndHandler<E, S> {
    pub fn new(registry: Arc<StreamRegistry>, reconciler: Arc<Reconciler<E, S>>) -> Self {
        Self {
            registry,
            reconciler,
        }
    }
}

#[async_trait]
impl<E: EngineClient + 'static, S: StudioApi + 'static> Handler for PushEndHandler<E, S> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::PushEnd(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        let playback_id = PlaybackId::from_stream_name(&payload.stream_name);
        let Some(record) = self.registry.get(&playback_id) else {
            return Ok(HandlerOutcome::Ack);
        };
        self.reconciler
            .on_push_end(&record.stream_id.clone(), &record, &payload.original_dest)
            .await;
        Ok(HandlerOutcome::Ack)
    }
}

/// `STREAM_BUFFER` (spec §4.8): `EMPTY` marks the publisher stopped,
/// deactivates it with the studio API, and schedules removal after the
/// grace period, cancellable if the publisher reappears first.
#[derive(Debug)]
pub struct StreamBufferHandler<S: StudioApi> {
    studio: Arc<S>,
    registry: Arc<StreamRegistry>,
    thresholds: Thresholds,
}

impl<S: StudioApi + 'static> StreamBufferHandler<S> {
    pub fn new(studio: Arc<S>, registry: Arc<StreamRegistry>, thresholds: Thresholds) -> Self {
        Self {
            studio,
            registry,
            thresholds,
        }
    }
}

#[async_trait]
impl<S: StudioApi + 'static> Handler for StreamBufferHandler<S> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::StreamBuffer(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        if payload.state != BufferState::Empty {
            return Ok(HandlerOutcome::Ack);
        }
        let playback_id = PlaybackId::from_stream_name(&payload.stream_name);
        let Some(record) = self.registry.get(&playback_id) else {
            return Ok(HandlerOutcome::Ack);
        };

        {
            let mut inner = record.lock().await;
            if inner.stopped {
                return Ok(HandlerOutcome::Ack);
            }
            inner.stopped = true;
        }
        self.studio.set_active(&record.stream_id, false, 0).await?;

        let registry = self.registry.clone();
        let grace = self.thresholds.grace_period;
        let record_for_timer = record.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    registry.remove(&record_for_timer.playback_id);
                }
                _ = record_for_timer.reappeared.notified() => {
                    debug!(playback_id = %record_for_timer.playback_id, "grace-period deletion cancelled, publisher reappeared");
                }
            }
        });

        Ok(HandlerOutcome::Ack)
    }
}

/// `USER_NEW` (spec §4.8): delegates to [`AccessGate`].
#[derive(Debug)]
pub struct UserNewHandler<P: PolicyClient> {
    gate: Arc<AccessGate<P>>,
}

impl<P: PolicyClient + 'static> UserNewHandler<P> {
    pub fn new(gate: Arc<AccessGate<P>>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl<P: PolicyClient + 'static> Handler for UserNewHandler<P> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::UserNew(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        let allow = self
            .gate
            .admit(
                &payload.stream_name,
                &payload.full_url,
                payload.original_url.as_deref(),
                &payload.session_id,
            )
            .await;
        Ok(HandlerOutcome::Admit(allow))
    }
}

/// `USER_END` (spec §4.8): releases the session's `ViewerCounter` slot and
/// forwards a record to [`AnalyticsPipeline`].
#[derive(Debug)]
pub struct UserEndHandler<P: PolicyClient> {
    analytics: AnalyticsHandle,
    topic: String,
    gate: Arc<AccessGate<P>>,
}

impl<P: PolicyClient + 'static> UserEndHandler<P> {
    pub fn new(analytics: AnalyticsHandle, topic: String, gate: Arc<AccessGate<P>>) -> Self {
        Self {
            analytics,
            topic,
            gate,
        }
    }
}

#[async_trait]
impl<P: PolicyClient + 'static> Handler for UserEndHandler<P> {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::UserEnd(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        self.gate.release(&payload.session_id);
        self.analytics.submit(AnalyticsEvent {
            topic: self.topic.clone(),
            session_id: payload.session_id.clone(),
            event_type: "user_end".to_string(),
            value: serde_json::json!({
                "streams": payload.streams,
                "secondsActive": payload.seconds_active,
                "bytesUp": payload.bytes_up,
                "bytesDown": payload.bytes_down,
            }),
        });
        Ok(HandlerOutcome::Ack)
    }
}

/// `STREAM_SOURCE` (spec §4.8): returns the configured upstream pull URL for
/// a known stream.
#[derive(Debug)]
pub struct StreamSourceHandler {
    registry: Arc<StreamRegistry>,
    source_urls: dashmap::DashMap<PlaybackId, String>,
}

impl StreamSourceHandler {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self {
            registry,
            source_urls: dashmap::DashMap::new(),
        }
    }

    pub fn set_source_url(&self, id: PlaybackId, url: String) {
        self.source_urls.insert(id, url);
    }
}

#[async_trait]
impl Handler for StreamSourceHandler {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::StreamSource(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        let playback_id = PlaybackId::from_stream_name(&payload.stream_name);
        if !self.registry.contains(&playback_id) {
            return Ok(HandlerOutcome::Rewrite(String::new()));
        }
        let url = self
            .source_urls
            .get(&playback_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        Ok(HandlerOutcome::Rewrite(url))
    }
}

/// `RECORDING_END` (spec §4.8): forwards a completion record to analytics
/// and emits a one-shot "recording completed" event.
#[derive(Debug)]
pub struct RecordingEndHandler {
    analytics: AnalyticsHandle,
}

impl RecordingEndHandler {
    pub fn new(analytics: AnalyticsHandle) -> Self {
        Self { analytics }
    }
}

#[async_trait]
impl Handler for RecordingEndHandler {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Trigger::RecordingEnd(payload) = trigger else {
            return Err(HandlerError::Other("wrong trigger kind".to_string()));
        };
        let playback_id = PlaybackId::from_stream_name(&payload.stream_name);
        self.analytics.submit(AnalyticsEvent {
            topic: "events.recording.completed".to_string(),
            session_id: playback_id.as_str().to_string(),
            event_type: "recording.completed".to_string(),
            value: serde_json::json!({
                "path": payload.path,
                "bytes": payload.bytes,
                "durationMs": payload.media_duration_ms,
            }),
        });
        Ok(HandlerOutcome::Ack)
    }
}
