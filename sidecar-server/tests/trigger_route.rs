//! End-to-end coverage of the `/trigger` ingress route: header parsing,
//! body decoding errors, and dispatch through the real broker against a mix
//! of collaborator-free handlers and `mockall`-backed ones.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use sidecar_core::access::AccessGate;
use sidecar_core::broker::Broker;
use sidecar_core::clock::SystemClock;
use sidecar_core::codec::TriggerKind;
use sidecar_core::handlers::{PushOutStartHandler, StreamSourceHandler, UserNewHandler};
use sidecar_core::ports::{
    MockBusPublisher, MockEngineClient, MockPolicyClient, MockStudioApi, PolicyDecision,
};
use sidecar_core::reconciler::Reconciler;
use sidecar_core::registry::StreamRegistry;
use sidecar_core::Thresholds;
use sidecar_server::routes::{build_router, AppState};
use tokio_util::sync::CancellationToken;

fn empty_broker() -> Broker {
    Broker::new()
}

fn test_server(broker: Broker) -> TestServer {
    let app = build_router(AppState {
        broker: Arc::new(broker),
        shutdown: CancellationToken::new(),
    });
    TestServer::new(app).expect("test server builds")
}

#[tokio::test]
async fn missing_trigger_header_is_bad_request() {
    let server = test_server(empty_broker());
    let response = server.post("/trigger").text("irrelevant").await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_trigger_header_is_bad_request() {
    let server = test_server(empty_broker());
    let response = server
        .post("/trigger")
        .add_header("X-Trigger", "NOT_A_REAL_TRIGGER")
        .text("irrelevant")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_line_count_is_bad_request() {
    let server = test_server(empty_broker());
    // PUSH_OUT_START needs exactly 2 lines.
    let response = server
        .post("/trigger")
        .add_header("X-Trigger", "PUSH_OUT_START")
        .text("only-one-line")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_source_rejects_unknown_stream() {
    let mut broker = empty_broker();
    broker.register(
        TriggerKind::StreamSource,
        Arc::new(StreamSourceHandler::new(Arc::new(StreamRegistry::new()))),
    );
    let server = test_server(broker);

    let response = server
        .post("/trigger")
        .add_header("X-Trigger", "STREAM_SOURCE")
        .text("never-seen-stream")
        .await;
    response.assert_status_ok();
    assert_eq!(response.text(), "");
}

#[tokio::test]
async fn user_new_denies_without_credential() {
    let mut mock = MockPolicyClient::new();
    mock.expect_check().times(0);
    let gate = Arc::new(AccessGate::new(
        Arc::new(mock),
        Arc::new(SystemClock),
        Thresholds::default(),
        Vec::new(),
    ));

    let mut broker = empty_broker();
    broker.register(TriggerKind::UserNew, Arc::new(UserNewHandler::new(gate)));
    let server = test_server(broker);

    let body = "mystream\n1.2.3.4\nconn1\nrtmp\nhttp://no-credential\nsess1";
    let response = server
        .post("/trigger")
        .add_header("X-Trigger", "USER_NEW")
        .text(body)
        .await;
    response.assert_status_ok();
    assert_eq!(response.text(), "false");
}

#[tokio::test]
async fn user_new_admits_with_valid_access_key() {
    let mut mock = MockPolicyClient::new();
    mock.expect_check().times(1).returning(|_, _, _| {
        Ok(PolicyDecision {
            allow: true,
            max_age: std::time::Duration::from_secs(120),
            stale: std::time::Duration::from_secs(300),
            user_id: None,
            user_viewer_limit: None,
        })
    });
    let gate = Arc::new(AccessGate::new(
        Arc::new(mock),
        Arc::new(SystemClock),
        Thresholds::default(),
        Vec::new(),
    ));

    let mut broker = empty_broker();
    broker.register(TriggerKind::UserNew, Arc::new(UserNewHandler::new(gate)));
    let server = test_server(broker);

    let body = "mystream\n1.2.3.4\nconn1\nrtmp\nhttp://x?accessKey=A\nsess1";
    let response = server
        .post("/trigger")
        .add_header("X-Trigger", "USER_NEW")
        .text(body)
        .await;
    response.assert_status_ok();
    assert_eq!(response.text(), "true");
}

#[tokio::test]
async fn push_out_start_rewrites_through_reconciler_stack() {
    // Exercises the handler path that depends on a full Reconciler<E, S>
    // without ever reaching the network: both collaborators are mocks, and
    // the registry starts empty so the handler takes its "unknown publisher"
    // branch.
    let engine = Arc::new(MockEngineClient::new());
    let studio = Arc::new(MockStudioApi::new());
    let registry = Arc::new(StreamRegistry::new());
    let clock: sidecar_core::SharedClock = Arc::new(SystemClock);
    let analytics = sidecar_core::analytics::AnalyticsPipeline::spawn(
        Arc::new(MockBusPublisher::new()),
        Thresholds::default(),
        CancellationToken::new(),
    );
    let reconciler = Arc::new(Reconciler::new(
        engine,
        studio,
        registry.clone(),
        analytics,
        clock,
        Thresholds::default(),
        "stream".to_string(),
        String::new(),
    ));

    let mut broker = empty_broker();
    broker.register(
        TriggerKind::PushOutStart,
        Arc::new(PushOutStartHandler::new(
            registry,
            reconciler,
            Thresholds::default(),
        )),
    );
    let server = test_server(broker);

    let response = server
        .post("/trigger")
        .add_header("X-Trigger", "PUSH_OUT_START")
        .text("never-seen-stream\nrtmp://push-target")
        .await;
    response.assert_status_ok();
}
