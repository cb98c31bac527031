//! Error taxonomy (spec §7): each variant here maps to exactly one
//! disposition — surfaced to the engine, retried, or silently absorbed.

use thiserror::Error;

/// Failure parsing or serializing a trigger body. Always surfaced to the
/// engine as HTTP 400; handlers are never invoked.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected {expected} line(s), got {got}")]
    WrongLineCount { expected: &'static str, got: usize },
    #[error("malformed URL: {0}")]
    BadUrl(String),
    #[error("malformed JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("malformed integer field: {0}")]
    BadInteger(#[from] std::num::ParseIntError),
    #[error("unknown trigger kind: {0}")]
    UnknownKind(String),
    #[error("invalid state value: {0}")]
    BadState(String),
}

/// The upstream access-policy endpoint.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy denied")]
    Denied,
    #[error("policy endpoint unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("policy endpoint returned malformed response: {0}")]
    MalformedResponse(String),
}

/// The studio control API.
#[derive(Debug, Error)]
pub enum StudioApiError {
    #[error("studio API unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
    #[error("studio API returned malformed response: {0}")]
    MalformedResponse(String),
    #[error("not found")]
    NotFound,
}

/// The media engine's control-plane RPC.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine RPC failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine RPC returned status {0}")]
    BadStatus(u16),
}

/// The downstream analytics/events message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    PublishFailed(#[from] reqwest::Error),
    #[error("bus publish returned status {0}")]
    BadStatus(u16),
}

/// Error surfaced from a single trigger handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    StudioApi(#[from] StudioApiError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("handler panicked")]
    Panicked,
    #[error("dispatch was cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}
