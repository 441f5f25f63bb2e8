//! Resilient HTTP transport for Git provider APIs.
//!
//! [`Transport`] wraps an [`HttpSend`] implementation with the recovery
//! machinery the providers rely on: retry with capped exponential backoff
//! and jitter, rate-limit-aware waits on 429, circuit-breaker admission per
//! named resource, and token-aware auth with a single refresh-and-retry on
//! 401/403.
//!
//! The wire itself sits behind the object-safe [`HttpSend`] trait so the
//! whole retry/auth/breaker stack is exercised in tests with scripted
//! senders and no network.

pub mod backoff;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::error::classify::{self, NetworkErrorKind};
use crate::token::{TokenError, TokenManager};

use backoff::BackoffPolicy;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A request at the wire boundary. Rebuilt from the [`ApiRequest`] on every
/// attempt so the body is always re-sendable.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    /// Header name/value pairs; names are sent as given.
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// A response at the wire boundary. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A classified failure below the HTTP layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WireError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

/// The wire seam: one attempt, no retries, no policy.
#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, WireError>;
}

/// Production [`HttpSend`] backed by a pooled [`reqwest::Client`].
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new(request_timeout: Duration, max_idle_per_host: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .user_agent("synclone")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpSend for ReqwestSender {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, WireError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            WireError {
                kind: NetworkErrorKind::Permanent,
                message: format!("invalid method {:?}: {e}", request.method),
            }
        })?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| WireError {
            kind: classify::classify_reqwest(&e),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| WireError {
            kind: classify::classify_reqwest(&e),
            message: e.to_string(),
        })?;

        Ok(WireResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

/// A provider API request, above the wire: service-relative auth and a
/// JSON-serializable body.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Service name used for token lookup and breaker keying (`github`,
    /// `gitlab`, `gitea`).
    pub service: String,
    pub method: String,
    pub url: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(service: &str, url: impl Into<String>) -> Self {
        Self {
            service: service.to_owned(),
            method: "GET".to_owned(),
            url: url.into(),
            body: None,
        }
    }

    pub fn post(service: &str, url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            service: service.to_owned(),
            method: "POST".to_owned(),
            url: url.into(),
            body: Some(body),
        }
    }
}

/// Outcome of evaluating a single attempt.
#[derive(Debug)]
pub enum Outcome {
    Success(WireResponse),
    Transient {
        kind: NetworkErrorKind,
        message: String,
        /// Rate-limit hint from Retry-After or a reset header.
        retry_after: Option<Duration>,
    },
    Permanent {
        kind: NetworkErrorKind,
        message: String,
    },
}

/// Failures surfaced by [`Transport::execute`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    CircuitOpen(#[from] BreakerError),

    #[error("request cancelled")]
    Cancelled,

    #[error("retries exhausted after {attempts} attempts ({kind}): {message}")]
    Exhausted {
        attempts: u32,
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("permanent {kind} failure: {message}")]
    Permanent {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("HTTP {status} from {service}: {message}")]
    HttpStatus {
        service: String,
        status: u16,
        message: String,
    },

    #[error("authentication failed for {service} (HTTP {status})")]
    AuthFailed { service: String, status: u16 },

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl TransportError {
    /// Whether a caller-side retry loop could still make progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen(_) | Self::Exhausted { .. } => true,
            Self::Cancelled
            | Self::Permanent { .. }
            | Self::HttpStatus { .. }
            | Self::AuthFailed { .. }
            | Self::Token(_) => false,
        }
    }
}

/// Last observed rate-limit telemetry for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: Option<u64>,
    pub reset_epoch: Option<u64>,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The resilient HTTP client used by every provider adapter.
pub struct Transport {
    sender: Arc<dyn HttpSend>,
    tokens: Arc<TokenManager>,
    breakers: Arc<BreakerRegistry>,
    config: TransportConfig,
    rate_limits: std::sync::Mutex<HashMap<String, RateLimitStatus>>,
}

impl Transport {
    pub fn new(
        sender: Arc<dyn HttpSend>,
        tokens: Arc<TokenManager>,
        breakers: Arc<BreakerRegistry>,
        config: TransportConfig,
    ) -> Self {
        Self {
            sender,
            tokens,
            breakers,
            config,
            rate_limits: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Last observed rate-limit values for a service, if any response
    /// carried them.
    pub fn rate_limit(&self, service: &str) -> Option<RateLimitStatus> {
        self.rate_limits
            .lock()
            .expect("rate limit lock poisoned")
            .get(service)
            .copied()
    }

    /// Perform a request with the full recovery stack.
    ///
    /// The request is rebuilt per attempt; cancellation is honored between
    /// attempts, during backoff sleeps, and mid-flight.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ApiRequest,
    ) -> Result<WireResponse, TransportError> {
        let request_id = Uuid::new_v4();
        let breaker = self
            .breakers
            .get_or_create(&format!("{}-api", request.service));

        let mut attempt: u32 = 0;
        let mut auth_refreshed = false;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            breaker.try_acquire()?;
            let authorization = self.tokens.authorization(&request.service).await?;
            let wire = build_wire(request, authorization.as_deref(), request_id);

            let started = Instant::now();
            let result = tokio::select! {
                result = self.sender.send(wire) => result,
                _ = cancel.cancelled() => {
                    breaker.record_discard();
                    return Err(TransportError::Cancelled);
                }
            };
            let elapsed = started.elapsed();

            let outcome = match result {
                Ok(response) => {
                    self.note_rate_limit(&request.service, &response);

                    if response.is_success() {
                        breaker.record_success(elapsed);
                        return Ok(response);
                    }

                    breaker.record_failure(elapsed);

                    if response.status == 401 || response.status == 403 {
                        if !auth_refreshed {
                            auth_refreshed = true;
                            tracing::info!(
                                service = %request.service,
                                status = response.status,
                                request_id = %request_id,
                                "auth rejected, refreshing token and retrying once"
                            );
                            match self.tokens.handle_auth_failure(&request.service).await {
                                Ok(()) => continue,
                                Err(e) => {
                                    tracing::warn!(
                                        service = %request.service,
                                        error = %e,
                                        "no token recovery available"
                                    );
                                }
                            }
                        }
                        return Err(TransportError::AuthFailed {
                            service: request.service.clone(),
                            status: response.status,
                        });
                    }

                    let message = body_snippet(&response);
                    if classify::is_retryable_status(response.status) {
                        Outcome::Transient {
                            kind: NetworkErrorKind::TemporaryNetwork,
                            message,
                            retry_after: rate_limit_wait(&response),
                        }
                    } else {
                        return Err(TransportError::HttpStatus {
                            service: request.service.clone(),
                            status: response.status,
                            message,
                        });
                    }
                }
                Err(wire_err) => {
                    breaker.record_failure(elapsed);
                    if wire_err.kind.is_retryable() {
                        Outcome::Transient {
                            kind: wire_err.kind,
                            message: wire_err.message,
                            retry_after: None,
                        }
                    } else {
                        Outcome::Permanent {
                            kind: wire_err.kind,
                            message: wire_err.message,
                        }
                    }
                }
            };

            let (kind, message, retry_after) = match outcome {
                Outcome::Success(response) => return Ok(response),
                Outcome::Permanent { kind, message } => {
                    return Err(TransportError::Permanent { kind, message });
                }
                Outcome::Transient {
                    kind,
                    message,
                    retry_after,
                } => (kind, message, retry_after),
            };

            if attempt >= self.config.max_retries {
                return Err(TransportError::Exhausted {
                    attempts: attempt + 1,
                    kind,
                    message,
                });
            }

            let mut delay = self.config.backoff.delay(attempt);
            if let Some(hinted) = retry_after {
                delay = delay.max(hinted);
            }
            tracing::debug!(
                service = %request.service,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                kind = %kind,
                request_id = %request_id,
                "transient failure, backing off"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
            attempt += 1;
        }
    }

    fn note_rate_limit(&self, service: &str, response: &WireResponse) {
        let remaining = response
            .header("x-ratelimit-remaining")
            .or_else(|| response.header("ratelimit-remaining"))
            .and_then(|v| v.parse().ok());
        let reset_epoch = response
            .header("x-ratelimit-reset")
            .or_else(|| response.header("ratelimit-reset"))
            .and_then(|v| v.parse().ok());
        if remaining.is_none() && reset_epoch.is_none() {
            return;
        }
        self.rate_limits
            .lock()
            .expect("rate limit lock poisoned")
            .insert(
                service.to_owned(),
                RateLimitStatus {
                    remaining,
                    reset_epoch,
                },
            );
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .finish()
    }
}

fn build_wire(request: &ApiRequest, authorization: Option<&str>, request_id: Uuid) -> WireRequest {
    let mut headers = vec![
        ("Accept".to_owned(), "application/json".to_owned()),
        ("X-Request-Id".to_owned(), request_id.to_string()),
    ];
    if let Some(auth) = authorization {
        headers.push(("Authorization".to_owned(), auth.to_owned()));
    }
    WireRequest {
        method: request.method.clone(),
        url: request.url.clone(),
        headers,
        body: request.body.clone(),
    }
}

fn body_snippet(response: &WireResponse) -> String {
    format!(
        "HTTP {}: {}",
        response.status,
        String::from_utf8_lossy(&response.body[..response.body.len().min(200)])
    )
}

/// Extract the provider's wait hint from a 429/503 response: `Retry-After`
/// in seconds, or a rate-limit reset expressed as a unix timestamp.
fn rate_limit_wait(response: &WireResponse) -> Option<Duration> {
    if let Some(seconds) = response
        .header("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Some(Duration::from_secs(seconds));
    }
    let reset: u64 = response
        .header("x-ratelimit-reset")
        .or_else(|| response.header("ratelimit-reset"))?
        .parse()
        .ok()?;
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    Some(Duration::from_secs(reset.saturating_sub(now)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::token::{AuthScheme, ServiceAuth};
    use std::sync::Mutex;

    /// Scripted sender: pops one canned result per attempt and records the
    /// requests it saw.
    struct ScriptedSender {
        script: Mutex<Vec<Result<WireResponse, WireError>>>,
        seen: Mutex<Vec<WireRequest>>,
    }

    impl ScriptedSender {
        fn new(mut script: Vec<Result<WireResponse, WireError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn request(&self, index: usize) -> WireRequest {
            self.seen.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl HttpSend for ScriptedSender {
        async fn send(&self, request: WireRequest) -> Result<WireResponse, WireError> {
            self.seen.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop()
                .expect("scripted sender ran out of responses")
        }
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> WireResponse {
        WireResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: b"{}".to_vec(),
        }
    }

    fn wire_error(kind: NetworkErrorKind) -> WireError {
        WireError {
            kind,
            message: "scripted failure".to_string(),
        }
    }

    async fn transport_over(sender: Arc<ScriptedSender>) -> Transport {
        let tokens = TokenManager::new(sender.clone(), Default::default());
        tokens
            .register_service(ServiceAuth {
                name: "github".into(),
                auth_scheme: AuthScheme::Token,
                validate_url: "https://api.github.com/user".into(),
                refresh_url: None,
            })
            .await;
        Transport::new(
            sender,
            tokens,
            Arc::new(BreakerRegistry::default()),
            TransportConfig {
                max_retries: 3,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                    jitter_factor: 0.0,
                    ..Default::default()
                },
            },
        )
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let sender = ScriptedSender::new(vec![Ok(response(200, &[]))]);
        let transport = transport_over(sender.clone()).await;

        let result = transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(sender.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_success_waits_for_hint() {
        let sender = ScriptedSender::new(vec![
            Ok(response(429, &[("retry-after", "2")])),
            Ok(response(200, &[])),
        ]);
        let transport = transport_over(sender.clone()).await;

        let started = tokio::time::Instant::now();
        let result = transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(sender.attempts(), 2, "exactly two HTTP attempts");
        assert!(
            started.elapsed() >= Duration::from_secs(2),
            "waited at least the hinted two seconds"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_network_errors_up_to_cap() {
        let sender = ScriptedSender::new(vec![
            Err(wire_error(NetworkErrorKind::ConnectionReset)),
            Err(wire_error(NetworkErrorKind::Timeout)),
            Err(wire_error(NetworkErrorKind::ConnectionRefused)),
            Err(wire_error(NetworkErrorKind::Timeout)),
        ]);
        let transport = transport_over(sender.clone()).await;

        let result = transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await;

        // max_retries = 3 means 1 + 3 attempts total.
        assert_eq!(sender.attempts(), 4);
        assert!(matches!(
            result,
            Err(TransportError::Exhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test]
    async fn dns_failure_is_not_retried() {
        let sender = ScriptedSender::new(vec![Err(wire_error(NetworkErrorKind::DnsFailure))]);
        let transport = transport_over(sender.clone()).await;

        let result = transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await;

        assert_eq!(sender.attempts(), 1);
        assert!(matches!(
            result,
            Err(TransportError::Permanent {
                kind: NetworkErrorKind::DnsFailure,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn non_retryable_status_surfaces_immediately() {
        let sender = ScriptedSender::new(vec![Ok(response(404, &[]))]);
        let transport = transport_over(sender.clone()).await;

        let result = transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await;

        assert_eq!(sender.attempts(), 1);
        assert!(matches!(
            result,
            Err(TransportError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn request_carries_request_id_and_accept() {
        let sender = ScriptedSender::new(vec![Ok(response(200, &[]))]);
        let transport = transport_over(sender.clone()).await;

        transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await
            .unwrap();

        let seen = sender.request(0);
        assert!(seen.headers.iter().any(|(k, _)| k == "X-Request-Id"));
        assert!(
            seen.headers
                .iter()
                .any(|(k, v)| k == "Accept" && v == "application/json")
        );
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_sending() {
        let sender = ScriptedSender::new(vec![]);
        let transport = transport_over(sender.clone()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport
            .execute(
                &cancel,
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await;

        assert_eq!(sender.attempts(), 0);
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_io() {
        let sender = ScriptedSender::new(vec![]);
        let tokens = TokenManager::new(sender.clone(), Default::default());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(60),
            ..Default::default()
        }));

        // Trip the breaker directly.
        let breaker = breakers.get_or_create("github-api");
        breaker.try_acquire().unwrap();
        breaker.record_failure(Duration::from_millis(1));

        let transport = Transport::new(
            sender.clone(),
            tokens,
            breakers,
            TransportConfig::default(),
        );
        let result = transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await;

        assert_eq!(sender.attempts(), 0, "the rejected call never reached the wire");
        assert!(matches!(result, Err(TransportError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn records_rate_limit_telemetry() {
        let sender = ScriptedSender::new(vec![Ok(response(
            200,
            &[
                ("x-ratelimit-remaining", "41"),
                ("x-ratelimit-reset", "1893456000"),
            ],
        ))]);
        let transport = transport_over(sender.clone()).await;

        transport
            .execute(
                &CancellationToken::new(),
                &ApiRequest::get("github", "https://api.github.com/orgs/acme/repos"),
            )
            .await
            .unwrap();

        let status = transport.rate_limit("github").unwrap();
        assert_eq!(status.remaining, Some(41));
        assert_eq!(status.reset_epoch, Some(1893456000));
    }
}
