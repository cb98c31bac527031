//! Flat environment-derived configuration (spec §2.3/§6), modeled on
//! `ferrex-server`'s `infra::config::Config::from_env()`: every field reads
//! its own env var with an explicit default or `None`, collected into one
//! struct literal. `clap` only overrides the handful of knobs an operator
//! would reasonably want on the command line.

use std::env;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPolicy {
    Always,
    Record,
    Never,
}

impl AudioPolicy {
    fn parse(raw: &str) -> Self {
        match raw {
            "record" => AudioPolicy::Record,
            "never" => AudioPolicy::Never,
            _ => AudioPolicy::Always,
        }
    }
}

/// Everything the sidecar needs to run (spec §6 Environment block, plus the
/// ambient fields from §2.3).
#[derive(Debug, Clone)]
pub struct Config {
    pub media_engine_port: u16,
    pub policy_url: String,
    pub studio_api_url: String,
    pub studio_api_token: String,
    pub bus_bootstrap: String,
    pub bus_user: String,
    pub bus_password: String,
    pub bus_topic_user_end: String,
    pub bus_topic_logs: String,
    pub base_stream_name: String,
    pub audio_policy: AudioPolicy,
    pub own_region: String,
    pub node_id: String,
    pub amqp_url: Option<String>,
    pub metrics_interval: Duration,
    pub reconcile_interval: Duration,
    pub stream_health_hook_url: Option<String>,
    pub blocked_jwts: Vec<String>,

    // Ambient-only (spec §2.3): not part of the original distilled
    // environment record, but every deployment needs them.
    pub log_level: String,
    pub http_bind_addr: String,
    pub shutdown_grace_seconds: u64,
}

impl Config {
    pub fn from_env(args: &Args) -> Self {
        dotenvy::dotenv().ok();

        let media_engine_port = args
            .port
            .or_else(|| env::var("MEDIA_ENGINE_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(4242);

        let reconcile_interval = args
            .reconcile_interval_seconds
            .or_else(|| env::var("RECONCILE_INTERVAL_SECONDS").ok().and_then(|v| v.parse().ok()))
            .map(Duration::from_secs)
            .unwrap_or_else(|| sidecar_core::Thresholds::default().reconcile_interval);

        let metrics_interval = args
            .metrics_interval_seconds
            .or_else(|| env::var("METRICS_INTERVAL_SECONDS").ok().and_then(|v| v.parse().ok()))
            .map(Duration::from_secs)
            .unwrap_or_else(|| sidecar_core::Thresholds::default().metrics_interval);

        Self {
            media_engine_port,
            policy_url: env::var("POLICY_URL").unwrap_or_else(|_| "http://127.0.0.1:8090/policy".to_string()),
            studio_api_url: env::var("STUDIO_API_URL").unwrap_or_else(|_| "https://livepeer.studio".to_string()),
            studio_api_token: env::var("STUDIO_API_TOKEN").unwrap_or_default(),
            bus_bootstrap: env::var("BUS_BOOTSTRAP").unwrap_or_else(|_| "http://127.0.0.1:8091".to_string()),
            bus_user: env::var("BUS_USER").unwrap_or_default(),
            bus_password: env::var("BUS_PASSWORD").unwrap_or_default(),
            bus_topic_user_end: env::var("BUS_TOPIC_USER_END").unwrap_or_else(|_| "stream.user_end".to_string()),
            bus_topic_logs: env::var("BUS_TOPIC_LOGS").unwrap_or_else(|_| "stream.logs".to_string()),
            base_stream_name: env::var("BASE_STREAM_NAME").unwrap_or_else(|_| "video".to_string()),
            audio_policy: env::var("AUDIO_POLICY")
                .ok()
                .as_deref()
                .map(AudioPolicy::parse)
                .unwrap_or(AudioPolicy::Always),
            own_region: env::var("OWN_REGION").unwrap_or_else(|_| "default".to_string()),
            node_id: env::var("NODE_ID").unwrap_or_else(|_| "sidecar-0".to_string()),
            amqp_url: env::var("AMQP_URL").ok(),
            metrics_interval,
            reconcile_interval,
            stream_health_hook_url: env::var("STREAM_HEALTH_HOOK_URL").ok(),
            blocked_jwts: env::var("BLOCKED_JWTS")
                .ok()
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            http_bind_addr: env::var("HTTP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8935".to_string()),
            shutdown_grace_seconds: env::var("SHUTDOWN_GRACE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// CLI overrides for the knobs worth exposing on the command line (spec
/// §2.3/§6). Everything else is environment-only.
#[derive(Debug, Parser)]
#[command(name = "sidecar-server", about = "Trigger broker and stream reconciler sidecar")]
pub struct Args {
    #[arg(short, long, env = "MEDIA_ENGINE_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "RECONCILE_INTERVAL_SECONDS")]
    pub reconcile_interval_seconds: Option<u64>,

    #[arg(long, env = "METRICS_INTERVAL_SECONDS")]
    pub metrics_interval_seconds: Option<u64>,
}
