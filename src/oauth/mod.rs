use crate::clock::Clock;
use crate::google::{GoogleApi, GoogleError};
use crate::session::storage::StoreError;
use crate::session::{Session, SessionCookie, SessionManager};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Refresh this long before Google's stated expiry.
pub const EXPIRY_SKEW_MINUTES: i64 = 5;

/// The most recent token payload Google issued for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoogleTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Stamped by this server when the access token was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl GoogleTokenResponse {
    /// True when `now + skew` has reached the end of the token's lifetime.
    /// `issued_fallback` stands in when `created_at` was never stamped.
    pub fn is_expired(&self, now: DateTime<Utc>, issued_fallback: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() || self.expires_in <= 0 {
            return true;
        }

        let issued = self.created_at.unwrap_or(issued_fallback);
        let expires_at = issued + Duration::seconds(self.expires_in);
        now + Duration::minutes(EXPIRY_SKEW_MINUTES) >= expires_at
    }

    /// Folds a refresh response into this token. A refresh response without a
    /// refresh token keeps the one from the original grant.
    pub fn apply_refresh(&mut self, fresh: GoogleTokenResponse, now: DateTime<Utc>) {
        self.access_token = fresh.access_token;
        self.expires_in = fresh.expires_in;
        self.token_type = fresh.token_type;
        self.created_at = Some(now);

        if let Some(refresh_token) = fresh.refresh_token.filter(|token| !token.is_empty()) {
            self.refresh_token = Some(refresh_token);
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid request format: {0}")]
    BadRequest(#[from] serde_json::Error),
    #[error("authorization required: {0}")]
    AuthRequired(&'static str),
    #[error(transparent)]
    Google(#[from] GoogleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The session was deleted because of the wrapped failure.
    #[error("session discarded: {0}")]
    Discarded(#[source] Box<TokenError>),
}

impl TokenError {
    /// Errors after which the session can no longer produce a usable token.
    pub fn discards_session(&self) -> bool {
        match self {
            TokenError::AuthRequired(_) => true,
            TokenError::Google(err) => err.is_rejection(),
            _ => false,
        }
    }

    /// True when the session behind the request no longer exists.
    pub fn session_discarded(&self) -> bool {
        matches!(self, TokenError::Discarded(_))
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            TokenError::Google(err) => err.details(),
            TokenError::Discarded(inner) => inner.details(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    code: String,
    #[serde(rename = "redirectUri")]
    redirect_uri: String,
}

/// A session whose access token was checked, and refreshed when stale.
#[derive(Debug, Clone)]
pub struct ValidSession {
    pub session: Session,
    /// Set when a refresh happened and the cookie should be re-issued.
    pub cookie: Option<SessionCookie>,
}

#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: GoogleTokenResponse,
    /// The caller's existing session, when the token came from it.
    pub session: Option<Session>,
    pub cookie: Option<SessionCookie>,
}

#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub session: Session,
    pub cookie: Option<SessionCookie>,
}

pub struct TokenManager {
    google: Arc<dyn GoogleApi>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(
        google: Arc<dyn GoogleApi>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            google,
            sessions,
            clock,
        }
    }

    /// Token for the login endpoint: reuse the caller's session when it holds
    /// one, otherwise exchange the `{code, redirectUri}` body.
    pub async fn token_from_request(
        &self,
        current: Option<Session>,
        body: &[u8],
    ) -> Result<LoginGrant, TokenError> {
        if let Some(session) = current.filter(|session| session.access_token().is_some()) {
            let valid = self.ensure_valid_or_discard(session).await?;
            let token = valid
                .session
                .data
                .token_response
                .clone()
                .ok_or(TokenError::AuthRequired("session holds no token"))?;
            return Ok(LoginGrant {
                token,
                session: Some(valid.session),
                cookie: valid.cookie,
            });
        }

        let request: LoginRequest = serde_json::from_slice(body)?;
        let mut token = self
            .google
            .exchange_code(&request.code, &request.redirect_uri)
            .await?;
        token.created_at = Some(self.clock.now());

        Ok(LoginGrant {
            token,
            session: None,
            cookie: None,
        })
    }

    /// Bare access token for resource endpoints, refreshing when stale.
    pub async fn access_token(&self, session: Session) -> Result<AccessGrant, TokenError> {
        let valid = self.ensure_valid_or_discard(session).await?;
        let access_token = valid
            .session
            .access_token()
            .map(str::to_owned)
            .ok_or(TokenError::AuthRequired("access token not found in session"))?;

        Ok(AccessGrant {
            access_token,
            session: valid.session,
            cookie: valid.cookie,
        })
    }

    pub async fn ensure_valid(&self, mut session: Session) -> Result<ValidSession, TokenError> {
        if !session.is_token_expired(self.clock.now()) {
            return Ok(ValidSession {
                session,
                cookie: None,
            });
        }

        tracing::info!(
            session_id = %session.session_id,
            "access token is expired or about to expire, refreshing"
        );

        let refresh_token = session
            .refresh_token()
            .map(str::to_owned)
            .ok_or(TokenError::AuthRequired("refresh token not found in session"))?;

        let fresh = self.google.refresh_token(&refresh_token).await?;
        let now = self.clock.now();
        if let Some(token) = session.data.token_response.as_mut() {
            token.apply_refresh(fresh, now);
        }
        session.update_date = now;
        self.sessions.touch(&mut session).await?;

        tracing::info!(session_id = %session.session_id, "access token refreshed");

        let cookie = SessionCookie::issue(&session.session_id);
        Ok(ValidSession {
            session,
            cookie: Some(cookie),
        })
    }

    async fn ensure_valid_or_discard(&self, session: Session) -> Result<ValidSession, TokenError> {
        let session_id = session.session_id.clone();
        match self.ensure_valid(session).await {
            Err(err) if err.discards_session() => {
                tracing::warn!(session_id = %session_id, error = %err, "token refresh failed, discarding session");
                if let Err(store_err) = self.sessions.destroy(&session_id).await {
                    tracing::error!(session_id = %session_id, error = ?store_err, "failed to delete session");
                    return Err(err);
                }
                Err(TokenError::Discarded(Box::new(err)))
            }
            other => other,
        }
    }
}
