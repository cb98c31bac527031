//! `reqwest`-backed implementations of the collaborator traits declared in
//! [`crate::ports`] (spec §6). Each wraps one `reqwest::Client` behind the
//! narrow trait, grounded on the teacher's provider-trait pattern
//! (`ferrex-core`'s `TmdbApiProvider`-style wrappers around an HTTP client).
//! Per-collaborator timeouts come from [`Thresholds`] (spec §5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{BusError, EngineError, PolicyError, StudioApiError};
use crate::ids::{PlaybackId, StreamId};
use crate::ports::{
    BusPublisher, EngineClient, EngineState, MultistreamTarget, PolicyClient, PolicyDecision,
    StudioApi, StudioStream,
};
use crate::thresholds::Thresholds;

/// The media engine's JSON control-plane RPC, reached over loopback HTTP at
/// `mediaEnginePort` (spec §6).
#[derive(Debug)]
pub struct HttpEngineClient {
    client: Client,
    base_url: String,
}

impl HttpEngineClient {
    pub fn new(port: u16, thresholds: &Thresholds) -> Self {
        let client = Client::builder()
            .timeout(thresholds.engine_rpc_timeout)
            .build()
            .expect("engine RPC client builds with static config");
        Self {
            client,
            base_url: format!("http://127.0.0.1:{port}/api"),
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::BadStatus(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn add_trigger(&self, events: &[&str], name: &str, sync: bool) -> Result<(), EngineError> {
        self.post("triggers/add", &json!({"events": events, "name": name, "sync": sync}))
            .await
    }

    async fn delete_stream(&self, name: &str) -> Result<(), EngineError> {
        self.post("streams/delete", &json!({"name": name})).await
    }

    async fn nuke_stream(&self, name: &str) -> Result<(), EngineError> {
        self.post("streams/nuke", &json!({"name": name})).await
    }

    async fn push_start(&self, stream: &str, url: &str) -> Result<String, EngineError> {
        #[derive(Deserialize)]
        struct Resp {
            id: String,
        }
        let resp: Resp = self
            .client
            .post(format!("{}/push/start", self.base_url))
            .json(&json!({"stream": stream, "url": url}))
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.id)
    }

    async fn push_stop(&self, id: &str) -> Result<(), EngineError> {
        self.post("push/stop", &json!({"id": id})).await
    }

    async fn push_auto_add(&self, stream: &str, url: &str) -> Result<(), EngineError> {
        self.post("push/auto/add", &json!({"stream": stream, "url": url}))
            .await
    }

    async fn push_auto_remove(&self, stream_params: &str) -> Result<(), EngineError> {
        self.post("push/auto/remove", &json!({"streamParams": stream_params}))
            .await
    }

    async fn get_state(&self) -> Result<EngineState, EngineError> {
        let resp = self
            .client
            .get(format!("{}/state", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::BadStatus(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}

/// The studio control API (spec §6), reached with Bearer auth.
#[derive(Debug)]
pub struct HttpStudioApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpStudioApi {
    pub fn new(base_url: String, token: String, thresholds: &Thresholds) -> Self {
        let client = Client::builder()
            .timeout(thresholds.studio_api_timeout)
            .build()
            .expect("studio API client builds with static config");
        Self {
            client,
            base_url,
            token,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    async fn fetch_stream(&self, path: &str) -> Result<StudioStream, StudioApiError> {
        let resp = self.get(path).send().await?;
        match resp.status() {
            status if status == reqwest::StatusCode::NOT_FOUND => Err(StudioApiError::NotFound),
            status if status.is_success() => Ok(resp.json().await?),
            status => Err(StudioApiError::MalformedResponse(format!(
                "unexpected status {status}"
            ))),
        }
    }
}

#[async_trait]
impl StudioApi for HttpStudioApi {
    async fn get_stream_by_key(&self, stream_key: &str) -> Result<StudioStream, StudioApiError> {
        self.fetch_stream(&format!("/api/stream/key/{stream_key}")).await
    }

    async fn get_stream_by_playback_id(&self, id: &PlaybackId) -> Result<StudioStream, StudioApiError> {
        self.fetch_stream(&format!("/api/stream/{id}")).await
    }

    async fn get_asset_by_playback_id(&self, id: &PlaybackId) -> Result<StudioStream, StudioApiError> {
        self.fetch_stream(&format!("/api/asset/{id}")).await
    }

    async fn set_active(
        &self,
        stream_id: &StreamId,
        active: bool,
        started_at_unix_ms: i64,
    ) -> Result<(), StudioApiError> {
        let resp = self
            .client
            .post(format!("{}/api/stream/{stream_id}/setactive", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({"active": active, "startedAt": started_at_unix_ms}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StudioApiError::MalformedResponse(format!(
                "unexpected status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn heartbeat(&self, stream_id: &StreamId) -> Result<(), StudioApiError> {
        let resp = self
            .client
            .post(format!("{}/api/stream/{stream_id}/heartbeat", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StudioApiError::MalformedResponse(format!(
                "unexpected status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get_multistream_target(&self, id: &str) -> Result<MultistreamTarget, StudioApiError> {
        let resp = self.get(&format!("/api/multistream/target/{id}")).send().await?;
        if !resp.status().is_success() {
            return Err(StudioApiError::MalformedResponse(format!(
                "unexpected status {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

/// The upstream access-policy endpoint (spec §4.3/§6). Admission is carried
/// by the HTTP status; cache lifetime comes from the `Cache-Control` header.
#[derive(Debug)]
pub struct HttpPolicyClient {
    client: Client,
    url: String,
}

impl HttpPolicyClient {
    pub fn new(url: String, thresholds: &Thresholds) -> Self {
        let client = Client::builder()
            .timeout(thresholds.policy_timeout)
            .build()
            .expect("policy client builds with static config");
        Self { client, url }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PolicyBody {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "userViewerLimit")]
    user_viewer_limit: Option<u32>,
}

fn parse_cache_control(raw: &str) -> (Duration, Duration) {
    let mut max_age = Duration::from_secs(0);
    let mut stale = Duration::from_secs(0);
    for directive in raw.split(',') {
        let directive = directive.trim();
        if let Some(value) = directive.strip_prefix("max-age=") {
            max_age = value.trim().parse().map(Duration::from_secs).unwrap_or(max_age);
        } else if let Some(value) = directive.strip_prefix("stale-while-revalidate=") {
            stale = value.trim().parse().map(Duration::from_secs).unwrap_or(stale);
        }
    }
    (max_age, max_age + stale)
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn check(
        &self,
        stream: &str,
        cred_type: &str,
        cred: &str,
    ) -> Result<PolicyDecision, PolicyError> {
        // `cred_type` is already "accessKey" or "pub" (AccessGate's naming),
        // which doubles as both the `type` value and the credential field
        // name in the wire body (spec §6).
        let mut body = json!({"type": cred_type, "stream": stream});
        body[cred_type] = json!(cred);

        let resp = self.client.post(&self.url).json(&body).send().await?;
        let allow = resp.status().is_success();

        let (max_age, stale) = resp
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(parse_cache_control)
            .ok_or_else(|| PolicyError::MalformedResponse("missing Cache-Control header".to_string()))?;

        let parsed: PolicyBody = resp.json().await.unwrap_or_default();

        Ok(PolicyDecision {
            allow,
            max_age,
            stale,
            user_id: parsed.user_id,
            user_viewer_limit: parsed.user_viewer_limit,
        })
    }
}

/// Publishes to the downstream analytics/events bus. The bus itself is
/// reached through an HTTP gateway in front of the real broker (spec's
/// `busBootstrap` names the gateway host); keyed publish is a JSON POST with
/// HTTP Basic auth from `busUser`/`busPassword`.
#[derive(Debug)]
pub struct HttpBusPublisher {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl HttpBusPublisher {
    pub fn new(base_url: String, user: String, password: String, thresholds: &Thresholds) -> Self {
        let client = Client::builder()
            .timeout(thresholds.bus_publish_timeout)
            .build()
            .expect("bus publish client builds with static config");
        Self {
            client,
            base_url,
            user,
            password,
        }
    }
}

#[async_trait]
impl BusPublisher for HttpBusPublisher {
    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BusError> {
        let resp = self
            .client
            .post(format!("{}/publish/{topic}", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .header("X-Message-Key", key)
            .body(value.to_vec())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(%topic, %status, "bus publish returned non-success status");
            return Err(BusError::BadStatus(status.as_u16()));
        }
        Ok(())
    }
}

/// Convenience alias used by `sidecar-server` to name the concrete stack
/// wired at startup, mirroring how `ferrex-server` names its concrete
/// `AppState` fields after their trait-object counterparts.
pub type DefaultEngineClient = Arc<HttpEngineClient>;
pub type DefaultStudioApi = Arc<HttpStudioApi>;
pub type DefaultPolicyClient = Arc<HttpPolicyClient>;
pub type DefaultBusPublisher = Arc<HttpBusPublisher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cache_control_max_age_and_stale() {
        let (max_age, stale) = parse_cache_control("max-age=120, stale-while-revalidate=300");
        assert_eq!(max_age, Duration::from_secs(120));
        assert_eq!(stale, Duration::from_secs(420));
    }

    #[test]
    fn missing_directives_default_to_zero() {
        let (max_age, stale) = parse_cache_control("no-store");
        assert_eq!(max_age, Duration::from_secs(0));
        assert_eq!(stale, Duration::from_secs(0));
    }
}
