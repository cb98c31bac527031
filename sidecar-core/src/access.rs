//! AccessGate (spec §4.3): per-viewer admission with stale-while-revalidate
//! caching and a per-publisher viewer cap.
//!
//! Cache shape and coalesced-refresh discipline follow the teacher's
//! TTL/version cache (`ferrex-server/src/infra/cache/movie_batches_cache.rs`):
//! a `DashMap` of cache entries, each behind its own state, with an
//! additional `DashMap<key, ()>`-style in-flight set so concurrent misses on
//! the same key don't fan out into duplicate upstream calls.

use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::clock::SharedClock;
use crate::error::PolicyError;
use crate::ids::PlaybackId;
use crate::ports::PolicyClient;
use crate::thresholds::Thresholds;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    playback_id: String,
    cred_hash: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    allow: bool,
    max_age: chrono::DateTime<chrono::Utc>,
    stale: chrono::DateTime<chrono::Utc>,
    user_id: Option<String>,
    user_viewer_limit: Option<u32>,
}

/// Claims embedded in the self-certifying capability token. `pub_key` carries
/// the base64-encoded DER `SubjectPublicKeyInfo` the token is verified
/// against — the verification key travels with the token rather than living
/// on the server (spec §4.3 JWT detail).
#[derive(Debug, Clone, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(rename = "pub")]
    pub_key: String,
    exp: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct UnverifiedClaims {
    #[serde(rename = "pub")]
    pub_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Credential {
    AccessKey(String),
    Jwt(String),
}

impl Credential {
    fn hash(&self) -> String {
        match self {
            Credential::AccessKey(key) => format!("accessKey:{key}"),
            Credential::Jwt(pub_key) => format!("jwt:{pub_key}"),
        }
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Extract the playback-id and credential per spec §4.3 steps 1-2.
///
/// `original_url` is the `USER_NEW` 7th line, when present; its query
/// parameters take priority over `full_url`'s, per spec §9's open-question
/// resolution.
fn extract_credential(
    stream_name: &str,
    full_url: &str,
    original_url: Option<&str>,
) -> (PlaybackId, Option<Credential>) {
    let playback_id = PlaybackId::from_stream_name(stream_name);

    let mut urls = Vec::new();
    if let Some(original) = original_url {
        if let Ok(parsed) = Url::parse(original) {
            urls.push(parsed);
        }
    }
    if let Ok(parsed) = Url::parse(full_url) {
        urls.push(parsed);
    }

    for url in &urls {
        if let Some(key) = query_param(url, "accessKey") {
            return (playback_id, Some(Credential::AccessKey(key)));
        }
    }
    for url in &urls {
        if let Some(jwt) = query_param(url, "jwt") {
            return (playback_id, Some(Credential::Jwt(jwt)));
        }
    }
    (playback_id, None)
}

/// Read the `pub` claim from a JWT without verifying its signature, so we
/// know which key to verify *against* before running the real check.
fn peek_pub_claim(token: &str) -> Option<String> {
    let payload_segment = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_segment)
        .ok()?;
    let claims: UnverifiedClaims = serde_json::from_slice(&bytes).ok()?;
    claims.pub_key
}

/// Verify `token`'s ES256 signature against its own embedded `pub` claim and
/// check `sub`/`pub`/`exp` per spec §4.3 step 3. Returns the verified claims'
/// public key (used as the cache key and as the `jwt:<key>` credential hash).
fn verify_self_certifying_jwt(
    token: &str,
    playback_id: &PlaybackId,
    max_exp_days: i64,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<String> {
    let claimed_pub = peek_pub_claim(token)?;
    if claimed_pub.is_empty() {
        return None;
    }
    let der = base64::engine::general_purpose::STANDARD
        .decode(&claimed_pub)
        .ok()?;
    let decoding_key = DecodingKey::from_ec_der(&der);
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false; // checked manually below against the 7-day ceiling
    validation.set_required_spec_claims(&["sub", "exp"]);

    let data = jsonwebtoken::decode::<TokenClaims>(token, &decoding_key, &validation).ok()?;
    let claims = data.claims;

    if claims.sub != playback_id.as_str() {
        return None;
    }
    if claims.pub_key.is_empty() {
        return None;
    }
    let exp = chrono::DateTime::from_timestamp(claims.exp, 0)?;
    if exp < now {
        return None;
    }
    if exp > now + chrono::Duration::days(max_exp_days) {
        return None;
    }
    Some(claims.pub_key)
}

/// Viewer counters per spec §3 `ViewerCounter` / §4.3 step 5.
///
/// Tracked per concurrently-admitted session rather than per cache entry:
/// `counts` holds the live per-user viewer count, `sessions` maps each
/// admitted `sessionId` back to the user it was counted against so a later
/// `USER_END` can release exactly the slot it took.
#[derive(Debug, Default)]
struct ViewerCounters {
    counts: DashMap<String, u32>,
    sessions: DashMap<String, String>,
}

impl ViewerCounters {
    fn get(&self, user_id: &str) -> u32 {
        self.counts.get(user_id).map(|v| *v).unwrap_or(0)
    }

    fn increment(&self, session_id: &str, user_id: &str) {
        self.sessions
            .insert(session_id.to_string(), user_id.to_string());
        *self.counts.entry(user_id.to_string()).or_insert(0) += 1;
    }

    fn release(&self, session_id: &str) {
        if let Some((_, user_id)) = self.sessions.remove(session_id) {
            if let Some(mut count) = self.counts.get_mut(&user_id) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Evaluates admission for `USER_NEW` triggers (spec §4.3).
#[derive(Debug)]
pub struct AccessGate<P: PolicyClient> {
    policy: Arc<P>,
    clock: SharedClock,
    thresholds: Thresholds,
    deny_list: Arc<Vec<String>>,
    cache: Arc<DashMap<CacheKey, CacheEntry>>,
    in_flight_refresh: Arc<DashMap<CacheKey, ()>>,
    viewers: ViewerCounters,
}

impl<P: PolicyClient + 'static> AccessGate<P> {
    pub fn new(
        policy: Arc<P>,
        clock: SharedClock,
        thresholds: Thresholds,
        deny_list: Vec<String>,
    ) -> Self {
        Self {
            policy,
            clock,
            thresholds,
            deny_list: Arc::new(deny_list),
            cache: Arc::new(DashMap::new()),
            in_flight_refresh: Arc::new(DashMap::new()),
            viewers: ViewerCounters::default(),
        }
    }

    /// Run the full admission algorithm (spec §4.3 steps 1-6).
    pub async fn admit(
        &self,
        stream_name: &str,
        full_url: &str,
        original_url: Option<&str>,
        session_id: &str,
    ) -> bool {
        let (playback_id, credential) = extract_credential(stream_name, full_url, original_url);
        let Some(credential) = credential else {
            debug!(%playback_id, "user_new with no credential, denying");
            return false;
        };

        let now = self.clock.now();

        let (cred_hash, policy_cred_type, policy_cred) = match &credential {
            Credential::AccessKey(key) => {
                if self.deny_list.iter().any(|d| d == key) {
                    return false;
                }
                (credential.hash(), "accessKey".to_string(), key.clone())
            }
            Credential::Jwt(token) => {
                if self.deny_list.iter().any(|d| d == token) {
                    return false;
                }
                let Some(verified_pub) = verify_self_certifying_jwt(
                    token,
                    &playback_id,
                    self.thresholds.jwt_max_exp_days,
                    now,
                ) else {
                    debug!(%playback_id, "jwt failed verification, denying");
                    return false;
                };
                (
                    format!("jwt:{verified_pub}"),
                    "pub".to_string(),
                    verified_pub,
                )
            }
        };

        let key = CacheKey {
            playback_id: playback_id.as_str().to_string(),
            cred_hash,
        };

        let decision = self
            .lookup_or_refresh(&key, stream_name, &policy_cred_type, &policy_cred, now)
            .await;
        let Some(decision) = decision else {
            return false;
        };

        if !decision.allow {
            return false;
        }

        if let (Some(user_id), Some(limit)) = (&decision.user_id, decision.user_viewer_limit) {
            // admit-first, deny-subsequent (spec §9 open-question resolution):
            // a session is only ever denied against the count already
            // recorded from prior admissions, never against itself.
            if self.viewers.get(user_id) >= limit {
                return false;
            }
            self.viewers.increment(session_id, user_id);
        }

        true
    }

    /// Release the viewer slot a `USER_END` session was counted against, if
    /// any (spec §3 `ViewerCounter`: the count must fall as sessions end, not
    /// just rise as they're admitted).
    pub fn release(&self, session_id: &str) {
        self.viewers.release(session_id);
    }

    async fn lookup_or_refresh(
        &self,
        key: &CacheKey,
        stream: &str,
        cred_type: &str,
        cred: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<CacheEntry> {
        if let Some(entry) = self.cache.get(key) {
            if now < entry.stale {
                if now >= entry.max_age {
                    self.maybe_background_refresh(key.clone(), stream.to_string(), cred_type.to_string(), cred.to_string());
                }
                return Some(entry.clone());
            }
        }
        self.refresh_sync(key, stream, cred_type, cred, now).await
    }

    async fn refresh_sync(
        &self,
        key: &CacheKey,
        stream: &str,
        cred_type: &str,
        cred: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<CacheEntry> {
        match self.policy.check(stream, cred_type, cred).await {
            Ok(decision) => {
                let entry = CacheEntry {
                    allow: decision.allow,
                    max_age: now + chrono::Duration::from_std(decision.max_age).unwrap_or_default(),
                    stale: now + chrono::Duration::from_std(decision.stale).unwrap_or_default(),
                    user_id: decision.user_id.clone(),
                    user_viewer_limit: decision.user_viewer_limit,
                };
                self.cache.insert(key.clone(), entry.clone());
                Some(entry)
            }
            Err(err) => {
                // spec §7: PolicyUnreachable => deny, log+metric, no cache
                // entry (so the next admission retries rather than being
                // stuck denying for a full TTL window).
                warn!(error = %err, "policy endpoint unreachable, denying");
                None
            }
        }
    }

    fn maybe_background_refresh(&self, key: CacheKey, stream: String, cred_type: String, cred: String) {
        if self.in_flight_refresh.contains_key(&key) {
            return;
        }
        self.in_flight_refresh.insert(key.clone(), ());
        let policy = self.policy.clone();
        let cache = self.cache.clone();
        let in_flight = self.in_flight_refresh.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let now = clock.now();
            if let Ok(decision) = policy.check(&stream, &cred_type, &cred).await {
                let entry = CacheEntry {
                    allow: decision.allow,
                    max_age: now + chrono::Duration::from_std(decision.max_age).unwrap_or_default(),
                    stale: now + chrono::Duration::from_std(decision.stale).unwrap_or_default(),
                    user_id: decision.user_id,
                    user_viewer_limit: decision.user_viewer_limit,
                };
                cache.insert(key.clone(), entry);
            }
            in_flight.remove(&key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ports::{MockPolicyClient, PolicyDecision};
    use std::time::Duration as StdDuration;

    fn clock_at(ts: chrono::DateTime<chrono::Utc>) -> SharedClock {
        Arc::new(FixedClock::new(ts))
    }

    #[tokio::test]
    async fn happy_admission_caches_across_calls_within_max_age() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check().times(1).returning(|_, _, _| {
            Ok(PolicyDecision {
                allow: true,
                max_age: StdDuration::from_secs(120),
                stale: StdDuration::from_secs(300),
                user_id: None,
                user_viewer_limit: None,
            })
        });
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            Vec::new(),
        );

        let first = gate
            .admit("pb1", "http://x?accessKey=A", None, "sess1")
            .await;
        assert!(first);
        let second = gate
            .admit("pb1", "http://x?accessKey=A", None, "sess1")
            .await;
        assert!(second);
    }

    #[tokio::test]
    async fn invalid_jwt_sub_mismatch_denies_without_policy_call() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check().times(0);
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            Vec::new(),
        );
        // malformed JWT (not a real ES256 token) is rejected at the
        // verification step, never reaching the policy endpoint.
        let allow = gate
            .admit("pb1", "http://x?jwt=not.a.valid.jwt", None, "sess1")
            .await;
        assert!(!allow);
    }

    #[tokio::test]
    async fn missing_credential_denies_without_policy_call() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check().times(0);
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            Vec::new(),
        );
        let allow = gate.admit("pb1", "http://x", None, "sess1").await;
        assert!(!allow);
    }

    #[tokio::test]
    async fn denied_access_key_from_deny_list_skips_policy_call() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check().times(0);
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            vec!["A".to_string()],
        );
        let allow = gate
            .admit("pb1", "http://x?accessKey=A", None, "sess1")
            .await;
        assert!(!allow);
    }

    #[tokio::test]
    async fn policy_deny_response_is_cached() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check().times(1).returning(|_, _, _| {
            Ok(PolicyDecision {
                allow: false,
                max_age: StdDuration::from_secs(120),
                stale: StdDuration::from_secs(300),
                user_id: None,
                user_viewer_limit: None,
            })
        });
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            Vec::new(),
        );
        assert!(!gate.admit("pb1", "http://x?accessKey=B", None, "sess1").await);
        assert!(!gate.admit("pb1", "http://x?accessKey=B", None, "sess2").await);
    }

    #[tokio::test]
    async fn unreachable_policy_denies_without_caching() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check()
            .times(2)
            .returning(|_, _, _| Err(PolicyError::MalformedResponse("no Cache-Control header".to_string())));
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            Vec::new(),
        );
        assert!(!gate.admit("pb1", "http://x?accessKey=C", None, "sess1").await);
        assert!(!gate.admit("pb1", "http://x?accessKey=C", None, "sess2").await);
    }

    #[tokio::test]
    async fn viewer_cap_denies_once_limit_reached_then_admits_after_release() {
        let mut mock = MockPolicyClient::new();
        mock.expect_check().returning(|_, _, _| {
            Ok(PolicyDecision {
                allow: true,
                max_age: StdDuration::from_secs(0),
                stale: StdDuration::from_secs(0),
                user_id: Some("userA".to_string()),
                user_viewer_limit: Some(2),
            })
        });
        let gate = AccessGate::new(
            Arc::new(mock),
            clock_at(chrono::Utc::now()),
            Thresholds::default(),
            Vec::new(),
        );

        // each call uses a distinct accessKey, so every one misses the
        // cache and re-checks the policy; only the viewer count gates
        // admission from here.
        assert!(
            gate.admit("pb1", "http://x?accessKey=s1", None, "sess1")
                .await
        );
        assert!(
            gate.admit("pb1", "http://x?accessKey=s2", None, "sess2")
                .await
        );
        assert!(
            !gate
                .admit("pb1", "http://x?accessKey=s3", None, "sess3")
                .await
        );

        gate.release("sess1");
        assert!(
            gate.admit("pb1", "http://x?accessKey=s4", None, "sess4")
                .await
        );
    }

    #[test]
    fn original_url_credentials_take_priority_over_full_url() {
        let (_, cred) = extract_credential(
            "pb1",
            "http://x?accessKey=from-full-url",
            Some("http://x?accessKey=from-original-url"),
        );
        assert_eq!(
            cred,
            Some(Credential::AccessKey("from-original-url".to_string()))
        );
    }

    #[test]
    fn playback_id_strips_base_prefix() {
        let (id, _) = extract_credential("base+pb1", "http://x", None);
        assert_eq!(id.as_str(), "pb1");
    }
}
