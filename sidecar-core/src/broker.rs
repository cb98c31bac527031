//! Broker (spec §4.2): per-trigger-kind handler registries with three
//! aggregation rules. Modeled as one non-generic broker over a tagged-variant
//! enum (spec §9 Design Note: "in languages without generics, use a
//! tagged-variant enum with per-variant handler lists") since the
//! *aggregation rule* — not just the payload type — varies per kind.
//!
//! Cancellation uses `tokio_util::sync::CancellationToken`, already in the
//! teacher's dependency graph, threaded from the HTTP layer down through
//! every handler call and on into outbound client calls.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Trigger, TriggerKind, TriggerResponse};
use crate::error::HandlerError;

/// Ambient per-dispatch context: cancellation plus a correlation id for logs.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub cancel: CancellationToken,
    pub trigger_uuid: Option<String>,
}

impl DispatchContext {
    pub fn new(cancel: CancellationToken, trigger_uuid: Option<String>) -> Self {
        Self {
            cancel,
            trigger_uuid,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            trigger_uuid: self.trigger_uuid.clone(),
        }
    }
}

/// Result of a single handler invocation.
///
/// `Deny` only makes sense for admit/deny triggers; informative and
/// single-writer handlers only ever return `Ok`/`Reject`/`Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Informative: ran fine, nothing to report.
    Ack,
    /// Admit/deny: explicit allow or deny.
    Admit(bool),
    /// Single-writer: a response string; empty means "reject".
    Rewrite(String),
}

#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Boxed-future convenience for tests/ad-hoc handlers that don't want a
/// named type. Mirrors the `fn(ctx, payload) -> result<response, error>`
/// shape from spec §9's Design Note.
pub type HandlerFn = Arc<
    dyn Fn(
            DispatchContext,
            Trigger,
        ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct FnHandler(HandlerFn);

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnHandler(..)")
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        trigger: &Trigger,
    ) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(ctx.clone(), trigger.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregationKind {
    InformativeFanout,
    AdmitDenyFanout,
    SingleWriter,
}

fn aggregation_for(kind: TriggerKind) -> AggregationKind {
    match kind {
        TriggerKind::PushEnd
        | TriggerKind::StreamBuffer
        | TriggerKind::LiveTrackList
        | TriggerKind::UserEnd
        | TriggerKind::RecordingEnd => AggregationKind::InformativeFanout,
        TriggerKind::UserNew => AggregationKind::AdmitDenyFanout,
        TriggerKind::PushRewrite | TriggerKind::PushOutStart | TriggerKind::StreamSource => {
            AggregationKind::SingleWriter
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("dispatch cancelled")]
    Cancelled,
}

/// Per-kind handler registries (spec §4.2). Registration acquires only a
/// write lock on one kind's list; dispatch acquires only a read lock.
#[derive(Debug, Default)]
pub struct Broker {
    registries: HashMap<TriggerKind, Vec<Arc<dyn Handler>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            registries: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: TriggerKind, handler: Arc<dyn Handler>) {
        self.registries.entry(kind).or_default().push(handler);
    }

    pub fn register_fn(&mut self, kind: TriggerKind, f: HandlerFn) {
        self.register(kind, Arc::new(FnHandler(f)));
    }

    /// Dispatch `trigger` to every handler registered for its kind,
    /// aggregating per spec §4.2, and return the response body the engine
    /// expects.
    pub async fn dispatch(
        &self,
        ctx: &DispatchContext,
        trigger: Trigger,
    ) -> Result<TriggerResponse, DispatchError> {
        let kind = trigger.kind();
        let handlers = match self.registries.get(&kind) {
            Some(h) if !h.is_empty() => h,
            _ => {
                debug!(?kind, "no handlers registered for trigger kind");
                return Ok(empty_response(kind));
            }
        };

        match aggregation_for(kind) {
            AggregationKind::InformativeFanout => {
                self.dispatch_informative(ctx, handlers, &trigger).await
            }
            AggregationKind::AdmitDenyFanout => {
                self.dispatch_admit_deny(ctx, handlers, &trigger).await
            }
            AggregationKind::SingleWriter => {
                self.dispatch_single_writer(ctx, handlers, &trigger).await
            }
        }
    }

    async fn dispatch_informative(
        &self,
        ctx: &DispatchContext,
        handlers: &[Arc<dyn Handler>],
        trigger: &Trigger,
    ) -> Result<TriggerResponse, DispatchError> {
        let child = ctx.child();
        let futures = handlers.iter().cloned().map(|h| {
            let child = child.clone();
            let trigger = trigger.clone();
            async move {
                tokio::select! {
                    _ = child.cancel.cancelled() => Err(HandlerError::Cancelled),
                    result = h.handle(&child, &trigger) => result,
                }
            }
        });
        let results = futures::future::join_all(futures).await;
        for result in results {
            if let Err(err) = result {
                warn!(error = %err, kind = ?trigger.kind(), "informative handler failed");
                child.cancel.cancel();
            }
        }
        Ok(TriggerResponse::Empty)
    }

    async fn dispatch_admit_deny(
        &self,
        ctx: &DispatchContext,
        handlers: &[Arc<dyn Handler>],
        trigger: &Trigger,
    ) -> Result<TriggerResponse, DispatchError> {
        let child = ctx.child();
        let futures = handlers.iter().cloned().map(|h| {
            let child = child.clone();
            let trigger = trigger.clone();
            async move { h.handle(&child, &trigger).await }
        });
        let results = futures::future::join_all(futures).await;
        let mut allow = true;
        for result in results {
            match result {
                Ok(HandlerOutcome::Admit(true)) | Ok(HandlerOutcome::Ack) => {}
                Ok(HandlerOutcome::Admit(false)) => allow = false,
                Ok(HandlerOutcome::Rewrite(_)) => {
                    warn!("admit/deny handler returned a rewrite outcome, treating as deny");
                    allow = false;
                }
                Err(err) => {
                    warn!(error = %err, "admit/deny handler errored, treating as deny");
                    allow = false;
                }
            }
        }
        Ok(TriggerResponse::AdmitDeny(allow))
    }

    async fn dispatch_single_writer(
        &self,
        ctx: &DispatchContext,
        handlers: &[Arc<dyn Handler>],
        trigger: &Trigger,
    ) -> Result<TriggerResponse, DispatchError> {
        let child = ctx.child();
        let futures = handlers.iter().cloned().map(|h| {
            let child = child.clone();
            let trigger = trigger.clone();
            async move { h.handle(&child, &trigger).await }
        });
        let results = futures::future::join_all(futures).await;
        let first_registered = results
            .into_iter()
            .next()
            .expect("handlers slice was checked non-empty before dispatch");
        match first_registered {
            Ok(HandlerOutcome::Rewrite(body)) => Ok(TriggerResponse::Rewrite(body)),
            Ok(other) => {
                warn!(?other, "single-writer handler returned non-rewrite outcome");
                Err(DispatchError::Handler(HandlerError::Other(
                    "single-writer handler returned an outcome that is not a rewrite".to_string(),
                )))
            }
            Err(err) => Err(DispatchError::Handler(err)),
        }
    }
}

fn empty_response(kind: TriggerKind) -> TriggerResponse {
    match aggregation_for(kind) {
        AggregationKind::InformativeFanout => TriggerResponse::Empty,
        AggregationKind::AdmitDenyFanout => TriggerResponse::AdmitDeny(false),
        AggregationKind::SingleWriter => TriggerResponse::Rewrite(String::new()),
    }
}
