//! Core domain logic for the trigger-broker / stream-reconciler sidecar:
//! codec, broker, access control, stream registry, reconciliation, metrics,
//! and analytics. The binary crate (`sidecar-server`) only wires HTTP and
//! configuration around this.

pub mod access;
pub mod analytics;
pub mod broker;
pub mod clients;
pub mod clock;
pub mod codec;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod metrics;
pub mod ports;
pub mod reconciler;
pub mod registry;
pub mod thresholds;

pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use error::{BusError, CodecError, EngineError, HandlerError, PolicyError, StudioApiError};
pub use ids::{PlaybackId, StreamId};
pub use thresholds::Thresholds;
