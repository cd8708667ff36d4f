pub mod clock;
pub mod config;
pub mod google;
pub mod handlers;
pub mod oauth;
pub mod session;

use anyhow::Result;
use clock::{Clock, SystemClock};
use config::AppConfig;
use google::{GoogleApi, GoogleClient};
use oauth::TokenManager;
use session::storage::SessionStore;
use session::SessionManager;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub google: Arc<dyn GoogleApi>,
    pub sessions: Arc<SessionManager>,
    pub tokens: TokenManager,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let google = Arc::new(GoogleClient::from_config(&config.google)?);
        Ok(Self::with_collaborators(
            config,
            store,
            google,
            Arc::new(SystemClock),
        ))
    }

    /// Wires the managers around explicit collaborators.
    pub fn with_collaborators(
        config: AppConfig,
        store: Arc<dyn SessionStore>,
        google: Arc<dyn GoogleApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            store,
            clock.clone(),
            config.mode().is_release(),
        ));
        let tokens = TokenManager::new(google.clone(), sessions.clone(), clock.clone());

        Self {
            config,
            clock,
            google,
            sessions,
            tokens,
        }
    }
}
