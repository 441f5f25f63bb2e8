//! `CoreServices`: the shared service bundle constructed once at startup
//! and threaded through constructors. There is no global mutable state;
//! everything a component shares, it borrows from here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::error::solutions::SolutionEngine;
use crate::events::EventBus;
use crate::recovery::RecoveryOrchestrator;
use crate::session::SessionManager;
use crate::token::{AuthScheme, ServiceAuth, TokenManager, TokenManagerConfig};
use crate::transport::{HttpSend, ReqwestSender, Transport, TransportConfig};

use synclone_state::SessionStore;

/// Configuration for the service bundle.
#[derive(Debug, Clone)]
pub struct CoreServicesConfig {
    pub transport: TransportConfig,
    pub breaker: BreakerConfig,
    pub token: TokenManagerConfig,
    /// State directory override; `None` uses the default location.
    pub state_dir: Option<PathBuf>,
    /// Per-request timeout for the underlying HTTP client.
    pub request_timeout: Duration,
    /// Connection pool bound per host.
    pub max_idle_conns_per_host: usize,
}

impl Default for CoreServicesConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            breaker: BreakerConfig::default(),
            token: TokenManagerConfig::default(),
            state_dir: None,
            request_timeout: Duration::from_secs(30),
            max_idle_conns_per_host: 8,
        }
    }
}

/// The shared services: transport stack, token manager, breakers, event
/// bus, solution engine, recovery orchestrator, and session manager.
#[derive(Debug)]
pub struct CoreServices {
    pub tokens: Arc<TokenManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub transport: Arc<Transport>,
    pub events: Arc<EventBus>,
    pub solutions: SolutionEngine,
    pub recovery: Arc<RecoveryOrchestrator>,
    pub sessions: Arc<SessionManager>,
}

impl CoreServices {
    /// Build the production bundle over a pooled reqwest client.
    pub fn new(config: CoreServicesConfig) -> Result<Self, reqwest::Error> {
        let sender: Arc<dyn HttpSend> = Arc::new(ReqwestSender::new(
            config.request_timeout,
            config.max_idle_conns_per_host,
        )?);
        Ok(Self::with_sender(sender, config))
    }

    /// Build the bundle over an injected wire (tests use scripted senders).
    pub fn with_sender(sender: Arc<dyn HttpSend>, config: CoreServicesConfig) -> Self {
        let tokens = TokenManager::new(sender.clone(), config.token.clone());
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let transport = Arc::new(Transport::new(
            sender,
            tokens.clone(),
            breakers.clone(),
            config.transport.clone(),
        ));
        let solutions = SolutionEngine::new();
        let recovery = Arc::new(RecoveryOrchestrator::new(
            RecoveryOrchestrator::default_rules(),
            breakers.clone(),
            solutions.clone(),
        ));
        let store = Arc::new(SessionStore::new(config.state_dir.clone()));
        let sessions = SessionManager::new(store);

        Self {
            tokens,
            breakers,
            transport,
            events: Arc::new(EventBus::new()),
            solutions,
            recovery,
            sessions,
        }
    }

    /// Register the hosted providers' auth envelopes. Gitea instances are
    /// self-hosted, so theirs is registered separately with its base URL.
    pub async fn register_default_services(&self) {
        self.tokens
            .register_service(ServiceAuth {
                name: "github".to_owned(),
                auth_scheme: AuthScheme::Token,
                validate_url: "https://api.github.com/user".to_owned(),
                refresh_url: None,
            })
            .await;
        self.tokens
            .register_service(ServiceAuth {
                name: "gitlab".to_owned(),
                auth_scheme: AuthScheme::Bearer,
                validate_url: "https://gitlab.com/api/v4/user".to_owned(),
                refresh_url: Some("https://gitlab.com/oauth/token".to_owned()),
            })
            .await;
    }

    /// Register a Gitea instance's auth envelope.
    pub async fn register_gitea(&self, base_url: &str) {
        let base = base_url.trim_end_matches('/');
        self.tokens
            .register_service(ServiceAuth {
                name: "gitea".to_owned(),
                auth_scheme: AuthScheme::Token,
                validate_url: format!("{base}/api/v1/user"),
                refresh_url: None,
            })
            .await;
    }
}
