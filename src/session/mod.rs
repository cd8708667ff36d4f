pub mod cookie;
#[cfg(feature = "aws")]
pub mod dynamodb;
pub mod storage;

pub use cookie::{SessionCookie, SESSION_COOKIE};

use crate::clock::Clock;
use crate::google::GoogleUserInfo;
use crate::oauth::GoogleTokenResponse;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{SessionStore, StoreError};

/// Sliding window applied on login and on every authenticated request.
pub const SESSION_LIFETIME_SECS: i64 = 24 * 60 * 60;

pub fn session_lifetime() -> Duration {
    Duration::seconds(SESSION_LIFETIME_SECS)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionData {
    #[serde(default)]
    pub token_response: Option<GoogleTokenResponse>,
    #[serde(default)]
    pub user_info: Option<GoogleUserInfo>,
}

/// Server-side record behind a `session_id` cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub data: SessionData,
    pub create_date: DateTime<Utc>,
    pub update_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    /// `expiry_date` in epoch seconds; drives store-side eviction.
    pub ttl: i64,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry_date
    }

    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.data.token_response {
            Some(token) => token.is_expired(now, self.create_date),
            None => true,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.data
            .token_response
            .as_ref()
            .map(|token| token.access_token.as_str())
            .filter(|token| !token.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.data
            .token_response
            .as_ref()
            .and_then(|token| token.refresh_token.as_deref())
            .filter(|token| !token.is_empty())
    }

    fn roll_forward(&mut self, now: DateTime<Utc>) {
        self.update_date = now;
        self.expiry_date = now + session_lifetime();
        self.ttl = self.expiry_date.timestamp();
    }
}

/// Outcome of looking up the caller's session.
#[derive(Debug, Clone)]
pub enum SessionLookup {
    Active(Session),
    NoCookie,
    /// The cookie names a session the store does not know.
    Unknown,
    /// The session had expired and has been deleted.
    Expired,
}

impl SessionLookup {
    pub fn into_active(self) -> Option<Session> {
        match self {
            SessionLookup::Active(session) => Some(session),
            _ => None,
        }
    }
}

/// 128 random bits as lowercase hex.
fn new_session_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    secure_cookies: bool,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, secure_cookies: bool) -> Self {
        Self {
            store,
            clock,
            secure_cookies,
        }
    }

    /// The non-empty `session_id` cookie value, if the client sent one.
    pub fn session_id_from(jar: &CookieJar) -> Option<String> {
        jar.get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_owned())
            .filter(|value| !value.is_empty())
    }

    /// Finds the caller's session: the one the session gate already validated
    /// for this request, else the one named by the cookie. Expired sessions
    /// are deleted on sight; unknown ids never create a record.
    pub async fn resolve(
        &self,
        validated: Option<Session>,
        jar: &CookieJar,
    ) -> Result<SessionLookup, StoreError> {
        if let Some(session) = validated {
            return Ok(SessionLookup::Active(session));
        }

        let Some(session_id) = Self::session_id_from(jar) else {
            return Ok(SessionLookup::NoCookie);
        };

        let Some(session) = self.store.get(&session_id).await? else {
            tracing::debug!(session_id = %session_id, "cookie names an unknown session");
            return Ok(SessionLookup::Unknown);
        };

        if session.is_expired(self.clock.now()) {
            tracing::info!(
                session_id = %session_id,
                expiry_date = %session.expiry_date,
                "session expired"
            );
            self.destroy(&session_id).await?;
            return Ok(SessionLookup::Expired);
        }

        Ok(SessionLookup::Active(session))
    }

    pub async fn save(
        &self,
        user_id: &str,
        data: SessionData,
        lifetime: Duration,
    ) -> Result<String, StoreError> {
        let now = self.clock.now();
        let expiry_date = now + lifetime;
        let session = Session {
            session_id: new_session_id(),
            user_id: user_id.to_owned(),
            data,
            create_date: now,
            update_date: now,
            expiry_date,
            ttl: expiry_date.timestamp(),
        };

        self.store.put(&session).await?;
        tracing::info!(session_id = %session.session_id, user_id = %user_id, "session created");
        Ok(session.session_id)
    }

    pub async fn touch(&self, session: &mut Session) -> Result<(), StoreError> {
        session.roll_forward(self.clock.now());
        self.store.put(session).await?;
        tracing::debug!(session_id = %session.session_id, "session renewed");
        Ok(())
    }

    /// Deletes the record. The caller clears the cookie with
    /// [`SessionCookie::removal`].
    pub async fn destroy(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.delete(session_id).await?;
        tracing::info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    /// Renders a cookie, forcing `Secure` and `HttpOnly` in release mode.
    pub fn cookie(&self, cookie: SessionCookie) -> Cookie<'static> {
        cookie.render(self.secure_cookies)
    }

    pub fn set_cookie(&self, jar: CookieJar, cookie: SessionCookie) -> CookieJar {
        jar.add(self.cookie(cookie))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::storage::InMemorySessionStore;

    fn manager() -> (Arc<ManualClock>, Arc<InMemorySessionStore>, SessionManager) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), clock.clone(), false);
        (clock, store, manager)
    }

    fn jar_with(session_id: &str) -> CookieJar {
        CookieJar::new().add(Cookie::new(SESSION_COOKIE, session_id.to_owned()))
    }

    #[test]
    fn session_ids_are_128_bit_hex() {
        let id = new_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }

    #[tokio::test]
    async fn save_sets_dates_and_ttl() {
        let (clock, store, manager) = manager();
        let now = clock.now();
        let id = manager
            .save("U", SessionData::default(), session_lifetime())
            .await
            .unwrap();

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.user_id, "U");
        assert_eq!(stored.create_date, now);
        assert_eq!(stored.update_date, now);
        assert_eq!(stored.expiry_date, now + Duration::hours(24));
        assert_eq!(stored.ttl, stored.expiry_date.timestamp());
    }

    #[tokio::test]
    async fn touch_rolls_the_window_forward() {
        let (clock, store, manager) = manager();
        let id = manager
            .save("U", SessionData::default(), session_lifetime())
            .await
            .unwrap();
        let mut session = store.get(&id).await.unwrap().unwrap();

        clock.advance(Duration::hours(5));
        manager.touch(&mut session).await.unwrap();

        let now = clock.now();
        assert_eq!(session.update_date, now);
        assert_eq!(session.expiry_date, now + Duration::hours(24));
        assert_eq!(session.ttl, session.expiry_date.timestamp());
        assert!(session.expiry_date >= session.update_date);
        assert!(session.update_date >= session.create_date);
        assert_eq!(store.get(&id).await.unwrap().unwrap(), session);
    }

    #[tokio::test]
    async fn resolve_prefers_the_validated_session() {
        let (_, _, manager) = manager();
        let validated = Session {
            session_id: "scratch".into(),
            user_id: "U".into(),
            data: SessionData::default(),
            create_date: Utc::now(),
            update_date: Utc::now(),
            expiry_date: Utc::now(),
            ttl: 0,
        };

        let found = manager
            .resolve(Some(validated), &CookieJar::new())
            .await
            .unwrap()
            .into_active()
            .unwrap();
        assert_eq!(found.session_id, "scratch");
    }

    #[tokio::test]
    async fn resolve_without_cookie_or_with_empty_cookie() {
        let (_, _, manager) = manager();
        let lookup = manager.resolve(None, &CookieJar::new()).await.unwrap();
        assert!(matches!(lookup, SessionLookup::NoCookie));

        let lookup = manager.resolve(None, &jar_with("")).await.unwrap();
        assert!(matches!(lookup, SessionLookup::NoCookie));
    }

    #[tokio::test]
    async fn resolve_unknown_id_creates_nothing() {
        let (_, store, manager) = manager();
        let lookup = manager.resolve(None, &jar_with("deadbeef")).await.unwrap();

        assert!(matches!(lookup, SessionLookup::Unknown));
        assert!(store.get("deadbeef").await.unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn resolve_deletes_expired_sessions() {
        let (clock, store, manager) = manager();
        let id = manager
            .save("U", SessionData::default(), session_lifetime())
            .await
            .unwrap();

        clock.advance(Duration::hours(25));
        let lookup = manager.resolve(None, &jar_with(&id)).await.unwrap();

        assert!(matches!(lookup, SessionLookup::Expired));
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[test]
    fn token_staleness_without_token_is_stale() {
        let now = Utc::now();
        let session = Session {
            session_id: "s".into(),
            user_id: "U".into(),
            data: SessionData::default(),
            create_date: now,
            update_date: now,
            expiry_date: now + session_lifetime(),
            ttl: 0,
        };
        assert!(session.is_token_expired(now));
        assert!(session.access_token().is_none());
        assert!(session.refresh_token().is_none());
    }
}
