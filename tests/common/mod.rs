#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use calendar_session_gateway::clock::ManualClock;
use calendar_session_gateway::config::{
    AllowConfig, AppConfig, DynamoDbConfig, GinConfig, GoogleConfig, GoogleEndpoints, LogConfig,
    OAuth2Credentials, RunMode, ServerConfig, SessionConfig, SsmConfig,
};
use calendar_session_gateway::google::{
    CalendarEvent, CalendarQuery, CalendarResponse, GoogleApi, GoogleError, GoogleUserInfo,
};
use calendar_session_gateway::handlers::build_router;
use calendar_session_gateway::oauth::GoogleTokenResponse;
use calendar_session_gateway::session::storage::InMemorySessionStore;
use calendar_session_gateway::AppState;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub const ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Outbound calls recorded by [`ScriptedGoogle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exchange { code: String, redirect_uri: String },
    Refresh(String),
    UserInfo(String),
    Phones(String),
    Events { access_token: String, query: CalendarQuery },
}

/// Google stand-in that replies from scripted values and records every call.
/// An unscripted reply fails like a 400 from Google.
#[derive(Default)]
pub struct ScriptedGoogle {
    pub exchange_reply: Mutex<Option<GoogleTokenResponse>>,
    pub refresh_reply: Mutex<Option<GoogleTokenResponse>>,
    pub user: Mutex<Option<GoogleUserInfo>>,
    pub phones: Mutex<Option<Vec<String>>>,
    pub calendar: Mutex<Option<CalendarResponse>>,
    pub calendar_error: Mutex<Option<Value>>,
    pub calls: Mutex<Vec<Call>>,
}

fn scripted_failure() -> GoogleError {
    GoogleError::Status {
        status: 400,
        body: "not scripted".into(),
    }
}

impl ScriptedGoogle {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn refresh_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Refresh(token) => Some(token),
                _ => None,
            })
            .collect()
    }

    pub fn event_calls(&self) -> Vec<(String, CalendarQuery)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Events {
                    access_token,
                    query,
                } => Some((access_token, query)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GoogleApi for ScriptedGoogle {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<GoogleTokenResponse, GoogleError> {
        self.calls.lock().push(Call::Exchange {
            code: code.to_owned(),
            redirect_uri: redirect_uri.to_owned(),
        });
        self.exchange_reply.lock().clone().ok_or_else(scripted_failure)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<GoogleTokenResponse, GoogleError> {
        self.calls.lock().push(Call::Refresh(refresh_token.to_owned()));
        self.refresh_reply.lock().clone().ok_or_else(scripted_failure)
    }

    async fn user_info(&self, access_token: &str) -> Result<GoogleUserInfo, GoogleError> {
        self.calls.lock().push(Call::UserInfo(access_token.to_owned()));
        self.user.lock().clone().ok_or_else(scripted_failure)
    }

    async fn phone_numbers(&self, access_token: &str) -> Result<Vec<String>, GoogleError> {
        self.calls.lock().push(Call::Phones(access_token.to_owned()));
        self.phones.lock().clone().ok_or_else(scripted_failure)
    }

    async fn list_events(
        &self,
        access_token: &str,
        query: &CalendarQuery,
    ) -> Result<CalendarResponse, GoogleError> {
        self.calls.lock().push(Call::Events {
            access_token: access_token.to_owned(),
            query: query.clone(),
        });
        if let Some(details) = self.calendar_error.lock().clone() {
            return Err(GoogleError::Api {
                status: 403,
                details,
            });
        }
        self.calendar.lock().clone().ok_or_else(scripted_failure)
    }
}

pub fn token(access: &str, refresh: Option<&str>) -> GoogleTokenResponse {
    GoogleTokenResponse {
        access_token: access.into(),
        expires_in: 3600,
        token_type: "Bearer".into(),
        refresh_token: refresh.map(str::to_owned),
        refresh_token_expires_in: None,
        scope: None,
        id_token: None,
        created_at: None,
    }
}

pub fn user() -> GoogleUserInfo {
    GoogleUserInfo {
        id: "U".into(),
        email: "u@x".into(),
        verified_email: true,
        name: "User".into(),
        given_name: "U".into(),
        family_name: "Ser".into(),
        picture: String::new(),
    }
}

pub fn calendar() -> CalendarResponse {
    CalendarResponse {
        kind: "calendar#events".into(),
        summary: "u@x".into(),
        time_zone: "Asia/Taipei".into(),
        items: vec![CalendarEvent {
            id: "e1".into(),
            summary: "Standup".into(),
            ..CalendarEvent::default()
        }],
        ..CalendarResponse::default()
    }
}

pub fn config(mode: RunMode) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        gin: GinConfig { mode: Some(mode) },
        session: SessionConfig::default(),
        dynamodb: DynamoDbConfig::default(),
        google: GoogleConfig {
            oauth2: OAuth2Credentials {
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            endpoints: GoogleEndpoints::default(),
        },
        allow: AllowConfig {
            origins: vec![ALLOWED_ORIGIN.to_owned()],
        },
        log: LogConfig::default(),
        ssm: SsmConfig::default(),
    }
}

pub struct TestApp {
    pub router: Router,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemorySessionStore>,
    pub google: Arc<ScriptedGoogle>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn set_cookie(&self) -> Option<String> {
        self.headers
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    /// Value of the `session_id` cookie being set, if any.
    pub fn session_id(&self) -> Option<String> {
        let set_cookie = self.set_cookie()?;
        let pair = set_cookie.split(';').next()?;
        pair.strip_prefix("session_id=").map(str::to_owned)
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_mode(RunMode::Debug)
    }

    pub fn with_mode(mode: RunMode) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::new());
        let google = Arc::new(ScriptedGoogle::default());
        *google.exchange_reply.lock() = Some(token("A", Some("RT")));
        *google.user.lock() = Some(user());
        *google.calendar.lock() = Some(calendar());

        let state = AppState::with_collaborators(
            config(mode),
            store.clone(),
            google.clone(),
            clock.clone(),
        );
        Self {
            router: build_router(Arc::new(state)),
            clock,
            store,
            google,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn call(&self, method: &str, uri: &str, session_id: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(id) = session_id {
            builder = builder.header(header::COOKIE, format!("session_id={id}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn login_with(&self, body: &str, session_id: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/authorize/googleLogin")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = session_id {
            builder = builder.header(header::COOKIE, format!("session_id={id}"));
        }
        self.send(builder.body(Body::from(body.to_owned())).unwrap())
            .await
    }

    /// Logs in with `{code: "C", redirectUri: "R"}` and returns the session id.
    pub async fn login(&self) -> String {
        let response = self
            .login_with(r#"{"code":"C","redirectUri":"R"}"#, None)
            .await;
        assert_eq!(response.status, StatusCode::OK, "{:?}", response.body);
        response.session_id().expect("login sets the session cookie")
    }
}
