//! The single trigger-ingress route (spec §6): one POST path, the trigger
//! kind named by the `X-Trigger` header, correlation carried in
//! `X-Trigger-UUID`, session id carried in `X-UUID` for `STREAM_BUFFER`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use sidecar_core::broker::{Broker, DispatchContext};
use sidecar_core::codec::{TriggerCodec, TriggerKind};

use crate::errors::AppError;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/trigger", post(handle_trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

async fn handle_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let raw_kind = header_str(&headers, "X-Trigger")
        .ok_or_else(|| AppError::bad_request("missing X-Trigger header"))?;
    let kind = TriggerKind::parse_header(raw_kind)?;

    let trigger_uuid = header_str(&headers, "X-Trigger-UUID").map(|s| s.to_string());
    let body_str = std::str::from_utf8(&body)
        .map_err(|_| AppError::bad_request("trigger body is not valid UTF-8"))?;

    let trigger = TriggerCodec::parse(kind, body_str)?;

    debug!(kind = ?kind, trigger_uuid = ?trigger_uuid, "dispatching trigger");
    let ctx = DispatchContext::new(state.shutdown.child_token(), trigger_uuid);

    match state.broker.dispatch(&ctx, trigger).await {
        Ok(response) => Ok(response.serialize()),
        Err(err) => {
            error!(error = %err, kind = ?kind, "trigger dispatch failed");
            Err(err.into())
        }
    }
}
