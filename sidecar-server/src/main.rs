//! Binary entrypoint: wires collaborators, the trigger broker, and the
//! background tickers (reconciler, metrics, analytics) around the HTTP
//! ingress route. Mirrors `ferrex-server`'s `main.rs` shape (args → config →
//! tracing init → `AppState` construction → `create_app`/`axum::serve`),
//! generalized from a media-serving `AppState` to a sidecar one.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sidecar_core::access::AccessGate;
use sidecar_core::analytics::AnalyticsPipeline;
use sidecar_core::broker::Broker;
use sidecar_core::clients::{HttpBusPublisher, HttpEngineClient, HttpPolicyClient, HttpStudioApi};
use sidecar_core::clock::{SharedClock, SystemClock};
use sidecar_core::codec::TriggerKind;
use sidecar_core::handlers::{
    LiveTrackListHandler, PushEndHandler, PushOutStartHandler, PushRewriteHandler,
    RecordingEndHandler, StreamBufferHandler, StreamSourceHandler, UserEndHandler, UserNewHandler,
};
use sidecar_core::metrics::MetricsCollector;
use sidecar_core::reconciler::Reconciler;
use sidecar_core::registry::StreamRegistry;
use sidecar_core::Thresholds;

use sidecar_server::config::{Args, AudioPolicy, Config};
use sidecar_server::routes::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env(&args);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sidecar_server={0},sidecar_core={0}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(port = config.media_engine_port, "sidecar configuration loaded");

    let thresholds = Thresholds {
        reconcile_interval: config.reconcile_interval,
        metrics_interval: config.metrics_interval,
        ..Thresholds::default()
    };
    let clock: SharedClock = Arc::new(SystemClock);
    let audio_suffix = match config.audio_policy {
        AudioPolicy::Record => "+rec".to_string(),
        AudioPolicy::Always | AudioPolicy::Never => String::new(),
    };

    let engine = Arc::new(HttpEngineClient::new(config.media_engine_port, &thresholds));
    let studio = Arc::new(HttpStudioApi::new(
        config.studio_api_url.clone(),
        config.studio_api_token.clone(),
        &thresholds,
    ));
    let policy = Arc::new(HttpPolicyClient::new(config.policy_url.clone(), &thresholds));
    let bus = Arc::new(HttpBusPublisher::new(
        config.bus_bootstrap.clone(),
        config.bus_user.clone(),
        config.bus_password.clone(),
        &thresholds,
    ));

    let registry = Arc::new(StreamRegistry::new());
    let shutdown = CancellationToken::new();

    let analytics = AnalyticsPipeline::spawn(bus.clone(), thresholds, shutdown.child_token());

    let reconciler = Arc::new(Reconciler::new(
        engine.clone(),
        studio.clone(),
        registry.clone(),
        analytics.clone(),
        clock.clone(),
        thresholds,
        config.base_stream_name.clone(),
        audio_suffix.clone(),
    ));
    reconciler.clone().spawn(shutdown.child_token());

    let metrics = Arc::new(MetricsCollector::new(
        engine.clone(),
        studio.clone(),
        registry.clone(),
        analytics.clone(),
        clock.clone(),
        thresholds,
    ));
    metrics.spawn(shutdown.child_token());

    let access_gate = Arc::new(AccessGate::new(
        policy,
        clock.clone(),
        thresholds,
        config.blocked_jwts.clone(),
    ));

    let mut broker = Broker::new();
    broker.register(
        TriggerKind::PushRewrite,
        Arc::new(PushRewriteHandler::new(
            studio.clone(),
            registry.clone(),
            clock.clone(),
            config.base_stream_name.clone(),
            audio_suffix.clone(),
        )),
    );
    broker.register(
        TriggerKind::LiveTrackList,
        Arc::new(LiveTrackListHandler::new(
            engine.clone(),
            registry.clone(),
            config.base_stream_name.clone(),
            audio_suffix.clone(),
        )),
    );
    broker.register(
        TriggerKind::PushOutStart,
        Arc::new(PushOutStartHandler::new(
            registry.clone(),
            reconciler.clone(),
            thresholds,
        )),
    );
    broker.register(
        TriggerKind::PushEnd,
        Arc::new(PushEndHandler::new(registry.clone(), reconciler.clone())),
    );
    broker.register(
        TriggerKind::StreamBuffer,
        Arc::new(StreamBufferHandler::new(studio.clone(), registry.clone(), thresholds)),
    );
    broker.register(
        TriggerKind::UserNew,
        Arc::new(UserNewHandler::new(access_gate.clone())),
    );
    broker.register(
        TriggerKind::UserEnd,
        Arc::new(UserEndHandler::new(
            analytics.clone(),
            config.bus_topic_user_end.clone(),
            access_gate,
        )),
    );
    broker.register(
        TriggerKind::StreamSource,
        Arc::new(StreamSourceHandler::new(registry.clone())),
    );
    broker.register(
        TriggerKind::RecordingEnd,
        Arc::new(RecordingEndHandler::new(analytics)),
    );

    let app = build_router(AppState {
        broker: Arc::new(broker),
        shutdown: shutdown.clone(),
    });

    let addr: SocketAddr = config
        .http_bind_addr
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8935)));
    info!(%addr, "starting sidecar HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let grace = config.shutdown_grace_seconds;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), grace))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken, grace_seconds: u64) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!(grace_seconds, "shutdown signal received, draining background tasks");
    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_secs(grace_seconds)).await;
}
