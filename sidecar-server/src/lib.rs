//! Library half of the sidecar binary: HTTP routing, configuration, and the
//! HTTP error shim. Split out from `main.rs` so integration tests can build
//! the router directly, the way `ferrex-server` exposes its `routes`/
//! `infra::app_state` modules to its own `tests/`.

pub mod config;
pub mod errors;
pub mod routes;
