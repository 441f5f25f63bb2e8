//! Token lifecycle: validation, expiry detection, OAuth2 refresh, and
//! fallback rotation.
//!
//! One [`TokenManager`] is shared process-wide (via `CoreServices`). Each
//! registered service carries its auth scheme and identity endpoint; tokens
//! are validated on registration and re-checked on use. An OAuth2 token
//! with a stored `refresh_token` is the only shape that is refreshable
//! without a fallback list.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;

use crate::transport::{HttpSend, WireRequest};

/// Shape of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Classic,
    FineGrained,
    Oauth2,
}

/// How the Authorization header is spelled for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: token <t>` (GitHub, Gitea).
    Token,
    /// `Authorization: Bearer <t>` (GitLab, OAuth2).
    Bearer,
}

impl AuthScheme {
    pub fn header_value(&self, token: &str) -> String {
        match self {
            Self::Token => format!("token {token}"),
            Self::Bearer => format!("Bearer {token}"),
        }
    }
}

/// Auth description for one registered service.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    pub name: String,
    pub auth_scheme: AuthScheme,
    /// Lightweight identity endpoint used to validate tokens.
    pub validate_url: String,
    /// OAuth2 token endpoint, when the service supports refresh.
    pub refresh_url: Option<String>,
}

/// A validated credential and what we learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub service: String,
    pub token_type: TokenType,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub last_valid_at: DateTime<Utc>,
    /// Extra key/values; `refresh_token` here makes an OAuth2 token
    /// refreshable.
    pub metadata: BTreeMap<String, String>,
}

impl TokenInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expires_at.is_some_and(|at| {
            now + chrono::Duration::from_std(threshold).unwrap_or_default() > at
        })
    }

    /// Refreshable without a fallback list: OAuth2 with a refresh token.
    pub fn is_refreshable(&self) -> bool {
        self.token_type == TokenType::Oauth2
            && self
                .metadata
                .get("refresh_token")
                .is_some_and(|t| !t.is_empty())
    }
}

/// When refresh happens relative to expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshStrategy {
    /// Refresh as soon as the token enters the expiration threshold.
    Proactive,
    /// Refresh only when an expired token is requested.
    #[default]
    OnDemand,
    /// Never refresh; rotate through fallbacks only.
    FallbackOnly,
}

/// Lifecycle notifications published on the manager's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Expiring {
        service: String,
        expires_at: DateTime<Utc>,
    },
    Expired {
        service: String,
    },
    Refreshed {
        service: String,
    },
}

/// Token manager failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no token registered for service {0}")]
    NoToken(String),

    #[error("service {0} is not registered")]
    UnknownService(String),

    #[error("token for {service} failed validation (HTTP {status})")]
    ValidationFailed { service: String, status: u16 },

    #[error("token validation request for {service} failed: {message}")]
    ValidationUnreachable { service: String, message: String },

    #[error("token for {service} expired and no refresh or fallback is available")]
    Expired { service: String },

    #[error("token refresh for {service} failed: {message}")]
    RefreshFailed { service: String, message: String },
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    /// Background monitor wake interval.
    pub check_interval: Duration,
    /// Lead time before expiry at which `expiring` fires (and Proactive
    /// refreshes).
    pub expiration_threshold: Duration,
    pub refresh_strategy: RefreshStrategy,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            expiration_threshold: Duration::from_secs(300),
            refresh_strategy: RefreshStrategy::OnDemand,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyState {
    None,
    Expiring,
    Expired,
}

struct ServiceEntry {
    auth: ServiceAuth,
    current: Option<TokenInfo>,
    fallbacks: VecDeque<String>,
    notified: NotifyState,
}

/// Process-wide token registry and refresher.
pub struct TokenManager {
    sender: Arc<dyn HttpSend>,
    config: TokenManagerConfig,
    services: RwLock<HashMap<String, ServiceEntry>>,
    events: broadcast::Sender<TokenEvent>,
}

impl TokenManager {
    pub fn new(sender: Arc<dyn HttpSend>, config: TokenManagerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            sender,
            config,
            services: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    /// Register a service. Idempotent; re-registering replaces the auth
    /// description but keeps any stored tokens.
    pub async fn register_service(&self, auth: ServiceAuth) {
        let mut services = self.services.write().await;
        match services.get_mut(&auth.name) {
            Some(entry) => entry.auth = auth,
            None => {
                services.insert(
                    auth.name.clone(),
                    ServiceEntry {
                        auth,
                        current: None,
                        fallbacks: VecDeque::new(),
                        notified: NotifyState::None,
                    },
                );
            }
        }
    }

    /// Validate a token against the service's identity endpoint and store
    /// it as the current credential.
    pub async fn add_token(&self, service: &str, token: &str) -> Result<TokenInfo, TokenError> {
        let auth = self.auth_for(service).await?;
        let info = self.validate(&auth, token).await?;
        let mut services = self.services.write().await;
        let entry = services
            .get_mut(service)
            .ok_or_else(|| TokenError::UnknownService(service.to_owned()))?;
        entry.current = Some(info.clone());
        entry.notified = NotifyState::None;
        tracing::info!(
            service = %service,
            token_type = ?info.token_type,
            scopes = info.scopes.len(),
            "token registered"
        );
        Ok(info)
    }

    /// Validate and store an OAuth2 credential with its refresh token.
    ///
    /// This is the only registration path that produces a refreshable
    /// token; `expires_in` is the grant lifetime in seconds when the
    /// identity endpoint does not report one.
    pub async fn add_oauth2_token(
        &self,
        service: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: Option<i64>,
    ) -> Result<TokenInfo, TokenError> {
        let auth = self.auth_for(service).await?;
        let mut info = self.validate(&auth, access_token).await?;
        info.token_type = TokenType::Oauth2;
        info.metadata
            .insert("refresh_token".to_owned(), refresh_token.to_owned());
        if info.expires_at.is_none() {
            info.expires_at = expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        }

        let mut services = self.services.write().await;
        let entry = services
            .get_mut(service)
            .ok_or_else(|| TokenError::UnknownService(service.to_owned()))?;
        entry.current = Some(info.clone());
        entry.notified = NotifyState::None;
        tracing::info!(service = %service, "oauth2 token registered");
        Ok(info)
    }

    /// Append a fallback token, rotated to when the current one expires and
    /// cannot be refreshed. Fallbacks are validated lazily at rotation time.
    pub async fn add_fallback(&self, service: &str, token: &str) -> Result<(), TokenError> {
        let mut services = self.services.write().await;
        let entry = services
            .get_mut(service)
            .ok_or_else(|| TokenError::UnknownService(service.to_owned()))?;
        entry.fallbacks.push_back(token.to_owned());
        Ok(())
    }

    /// The current valid token, refreshing or rotating first if needed.
    pub async fn get_token(&self, service: &str) -> Result<TokenInfo, TokenError> {
        let (auth, current, has_fallbacks) = {
            let services = self.services.read().await;
            let entry = services
                .get(service)
                .ok_or_else(|| TokenError::UnknownService(service.to_owned()))?;
            (
                entry.auth.clone(),
                entry.current.clone(),
                !entry.fallbacks.is_empty(),
            )
        };
        let info = current.ok_or_else(|| TokenError::NoToken(service.to_owned()))?;

        let now = Utc::now();
        let use_refresh = info.is_refreshable()
            && self.config.refresh_strategy != RefreshStrategy::FallbackOnly;

        if info.is_expired(now) {
            let _ = self.events.send(TokenEvent::Expired {
                service: service.to_owned(),
            });
            if use_refresh {
                return self.refresh(&auth, &info).await;
            }
            if has_fallbacks {
                return self.rotate(&auth).await;
            }
            return Err(TokenError::Expired {
                service: service.to_owned(),
            });
        }

        // Proactive: refresh inside the threshold even while still valid.
        if self.config.refresh_strategy == RefreshStrategy::Proactive
            && use_refresh
            && info.expires_within(now, self.config.expiration_threshold)
        {
            match self.refresh(&auth, &info).await {
                Ok(fresh) => return Ok(fresh),
                Err(e) => {
                    // Still valid; keep using it and let the next call retry.
                    tracing::warn!(service = %service, error = %e, "proactive refresh failed");
                }
            }
        }

        Ok(info)
    }

    /// The ready-to-send Authorization header value for a service.
    ///
    /// `Ok(None)` means anonymous: the service is unknown or has no token
    /// registered. Errors mean a token exists but cannot be made valid.
    pub async fn authorization(&self, service: &str) -> Result<Option<String>, TokenError> {
        let scheme = {
            let services = self.services.read().await;
            match services.get(service) {
                Some(entry) => entry.auth.auth_scheme,
                None => return Ok(None),
            }
        };
        match self.get_token(service).await {
            Ok(info) => Ok(Some(scheme.header_value(&info.token))),
            Err(TokenError::NoToken(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Called by transport after a 401/403: force one refresh or rotation
    /// so the retried request uses a different credential.
    pub async fn handle_auth_failure(&self, service: &str) -> Result<(), TokenError> {
        let (auth, current, has_fallbacks) = {
            let services = self.services.read().await;
            let entry = services
                .get(service)
                .ok_or_else(|| TokenError::UnknownService(service.to_owned()))?;
            (
                entry.auth.clone(),
                entry.current.clone(),
                !entry.fallbacks.is_empty(),
            )
        };
        let info = current.ok_or_else(|| TokenError::NoToken(service.to_owned()))?;

        if info.is_refreshable() && self.config.refresh_strategy != RefreshStrategy::FallbackOnly {
            self.refresh(&auth, &info).await?;
            return Ok(());
        }
        if has_fallbacks {
            self.rotate(&auth).await?;
            return Ok(());
        }
        Err(TokenError::Expired {
            service: service.to_owned(),
        })
    }

    /// Spawn the background monitor. It emits `expiring` when a token
    /// enters the threshold window, `expired` on crossing expiry, and (for
    /// the Proactive strategy) refreshes ahead of time.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.check_all().await,
                    _ = cancel.cancelled() => {
                        tracing::debug!("token monitor stopped");
                        return;
                    }
                }
            }
        })
    }

    // -- internals ---------------------------------------------------------

    async fn check_all(&self) {
        let now = Utc::now();
        let snapshot: Vec<(String, ServiceAuth, TokenInfo, NotifyState)> = {
            let services = self.services.read().await;
            services
                .iter()
                .filter_map(|(name, entry)| {
                    entry
                        .current
                        .clone()
                        .map(|info| (name.clone(), entry.auth.clone(), info, entry.notified))
                })
                .collect()
        };

        for (name, auth, info, notified) in snapshot {
            if info.is_expired(now) {
                if notified != NotifyState::Expired {
                    let _ = self.events.send(TokenEvent::Expired {
                        service: name.clone(),
                    });
                    self.set_notified(&name, NotifyState::Expired).await;
                }
            } else if info.expires_within(now, self.config.expiration_threshold) {
                if notified == NotifyState::None {
                    let _ = self.events.send(TokenEvent::Expiring {
                        service: name.clone(),
                        expires_at: info.expires_at.expect("threshold implies expiry"),
                    });
                    self.set_notified(&name, NotifyState::Expiring).await;
                }
                if self.config.refresh_strategy == RefreshStrategy::Proactive
                    && info.is_refreshable()
                {
                    if let Err(e) = self.refresh(&auth, &info).await {
                        tracing::warn!(service = %name, error = %e, "background refresh failed");
                    }
                }
            }
        }
    }

    async fn set_notified(&self, service: &str, state: NotifyState) {
        if let Some(entry) = self.services.write().await.get_mut(service) {
            entry.notified = state;
        }
    }

    async fn auth_for(&self, service: &str) -> Result<ServiceAuth, TokenError> {
        self.services
            .read()
            .await
            .get(service)
            .map(|e| e.auth.clone())
            .ok_or_else(|| TokenError::UnknownService(service.to_owned()))
    }

    /// Validate a raw token against the identity endpoint and build its
    /// [`TokenInfo`] from what the response reveals.
    async fn validate(&self, auth: &ServiceAuth, token: &str) -> Result<TokenInfo, TokenError> {
        let request = WireRequest {
            method: "GET".to_owned(),
            url: auth.validate_url.clone(),
            headers: vec![
                ("Accept".to_owned(), "application/json".to_owned()),
                (
                    "Authorization".to_owned(),
                    auth.auth_scheme.header_value(token),
                ),
            ],
            body: None,
        };

        let response = self.sender.send(request).await.map_err(|e| {
            TokenError::ValidationUnreachable {
                service: auth.name.clone(),
                message: e.to_string(),
            }
        })?;

        if !response.is_success() {
            return Err(TokenError::ValidationFailed {
                service: auth.name.clone(),
                status: response.status,
            });
        }

        let scopes = response
            .header("x-oauth-scopes")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        // GitHub reports fine-grained token expiry in a dedicated header.
        let expires_at = response
            .header("github-authentication-token-expiration")
            .and_then(parse_expiration_header);

        Ok(TokenInfo {
            token: token.to_owned(),
            service: auth.name.clone(),
            token_type: infer_token_type(token),
            expires_at,
            scopes,
            last_valid_at: Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    /// OAuth2 refresh: exchange the stored refresh token for a new access
    /// token at the service's token endpoint.
    async fn refresh(&self, auth: &ServiceAuth, info: &TokenInfo) -> Result<TokenInfo, TokenError> {
        let refresh_url = auth.refresh_url.clone().ok_or_else(|| {
            TokenError::RefreshFailed {
                service: auth.name.clone(),
                message: "service has no refresh endpoint".to_owned(),
            }
        })?;
        let refresh_token = info.metadata.get("refresh_token").cloned().unwrap_or_default();

        let request = WireRequest {
            method: "POST".to_owned(),
            url: refresh_url,
            headers: vec![("Accept".to_owned(), "application/json".to_owned())],
            body: Some(serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            })),
        };

        let response =
            self.sender
                .send(request)
                .await
                .map_err(|e| TokenError::RefreshFailed {
                    service: auth.name.clone(),
                    message: e.to_string(),
                })?;
        if !response.is_success() {
            return Err(TokenError::RefreshFailed {
                service: auth.name.clone(),
                message: format!("token endpoint returned HTTP {}", response.status),
            });
        }

        let grant: RefreshGrant = response.json().map_err(|e| TokenError::RefreshFailed {
            service: auth.name.clone(),
            message: format!("malformed token response: {e}"),
        })?;

        let mut metadata = info.metadata.clone();
        if let Some(next_refresh) = grant.refresh_token {
            metadata.insert("refresh_token".to_owned(), next_refresh);
        }
        let fresh = TokenInfo {
            token: grant.access_token,
            service: info.service.clone(),
            token_type: TokenType::Oauth2,
            expires_at: grant
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes: info.scopes.clone(),
            last_valid_at: Utc::now(),
            metadata,
        };

        if let Some(entry) = self.services.write().await.get_mut(&auth.name) {
            entry.current = Some(fresh.clone());
            entry.notified = NotifyState::None;
        }
        let _ = self.events.send(TokenEvent::Refreshed {
            service: auth.name.clone(),
        });
        tracing::info!(service = %auth.name, "token refreshed");
        Ok(fresh)
    }

    /// Rotate to the next fallback token, validating it first.
    async fn rotate(&self, auth: &ServiceAuth) -> Result<TokenInfo, TokenError> {
        loop {
            let candidate = {
                let mut services = self.services.write().await;
                let entry = services
                    .get_mut(&auth.name)
                    .ok_or_else(|| TokenError::UnknownService(auth.name.clone()))?;
                entry.fallbacks.pop_front()
            };
            let Some(candidate) = candidate else {
                return Err(TokenError::Expired {
                    service: auth.name.clone(),
                });
            };

            match self.validate(auth, &candidate).await {
                Ok(info) => {
                    if let Some(entry) = self.services.write().await.get_mut(&auth.name) {
                        entry.current = Some(info.clone());
                        entry.notified = NotifyState::None;
                    }
                    let _ = self.events.send(TokenEvent::Refreshed {
                        service: auth.name.clone(),
                    });
                    tracing::info!(service = %auth.name, "rotated to fallback token");
                    return Ok(info);
                }
                Err(e) => {
                    tracing::warn!(service = %auth.name, error = %e, "fallback token rejected, trying next");
                }
            }
        }
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RefreshGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// GitHub's expiration header: RFC3339 or `YYYY-MM-DD HH:MM:SS UTC`.
fn parse_expiration_header(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw.trim_end_matches(" UTC"), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Infer the credential shape from its prefix.
fn infer_token_type(token: &str) -> TokenType {
    if token.starts_with("github_pat_") {
        TokenType::FineGrained
    } else if token.starts_with("gho_") || token.starts_with("glo-") {
        TokenType::Oauth2
    } else {
        TokenType::Classic
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
