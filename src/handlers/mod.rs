mod authorize;
mod calendar;
mod health;
mod user;

use crate::oauth::{AccessGrant, TokenError};
use crate::session::{Session, SessionCookie};
use crate::AppState;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

pub fn build_router(state: Arc<AppState>) -> Router {
    let gated = Router::new()
        .route("/calendar/events", get(calendar::events))
        .route("/user/userProfile", post(user::user_profile))
        .route_layer(middleware::from_fn(authorize::require_session));

    let api = Router::new()
        .route("/authorize/googleLogin", post(authorize::google_login))
        .route("/authorize/googleSignOut", post(authorize::google_sign_out))
        .route("/authorize/validate", get(authorize::validate))
        .route("/health/ping", get(health::ping))
        .merge(gated)
        .layer(middleware::from_fn(log_request));

    let cors = cors_layer(&state.config.allow.origins);

    Router::new()
        .nest("/api", api)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
        .layer(Extension(state))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    tracing::info!(origins = %origins.join(", "), "allowed CORS origins");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static("x-requested-with"),
            header::COOKIE,
        ])
        .expose_headers([header::CONTENT_LENGTH, header::SET_COOKIE])
        .allow_credentials(true)
        .max_age(PREFLIGHT_MAX_AGE)
}

async fn log_request(request: Request, next: Next) -> Response {
    tracing::info!(
        method = %request.method(),
        path = %request.uri().path(),
        "api request"
    );
    next.run(request).await
}

async fn not_found(method: Method, uri: Uri) -> impl IntoResponse {
    tracing::error!(method = %method, path = %uri.path(), "no route found");
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "recovered from panic");
    ApiError::internal("Internal server error").into_response()
}

/// `{"message": "Success" | "Fail", "data": ...}`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    message: &'static str,
    data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            message: "Success",
            data,
        })
    }

    pub fn fail(data: T) -> Json<Self> {
        Json(Self {
            message: "Fail",
            data,
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    code: StatusCode,
    message: String,
    details: Option<serde_json::Value>,
    cookie: Option<Cookie<'static>>,
    source: Option<anyhow::Error>,
}

impl ApiError {
    fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            cookie: None,
            source: None,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    fn with_details(mut self, details: Option<serde_json::Value>) -> Self {
        self.details = details;
        self
    }

    fn with_cookie(mut self, cookie: Cookie<'static>) -> Self {
        self.cookie = Some(cookie);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.source {
            Some(source) => {
                tracing::error!(status = %self.code, error = ?source, "handler error: {}", self.message)
            }
            None => tracing::error!(status = %self.code, "handler error: {}", self.message),
        }

        let mut data = json!({ "error": self.message });
        if let Some(details) = self.details {
            data["details"] = details;
        }

        let body = Envelope::fail(data);
        match self.cookie {
            Some(cookie) => (self.code, CookieJar::new().add(cookie), body).into_response(),
            None => (self.code, body).into_response(),
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(value: E) -> Self {
        ApiError::internal("Internal server error").with_source(value)
    }
}

/// Maps a token failure onto a response. The cookie is cleared only when the
/// session behind it was actually deleted.
fn token_failure(state: &AppState, err: TokenError, message: &'static str) -> ApiError {
    let api = match &err {
        TokenError::BadRequest(_) => ApiError::bad_request("Invalid request format"),
        _ => ApiError::internal(message),
    };
    let api = api.with_details(err.details());
    let api = if err.session_discarded() {
        api.with_cookie(state.sessions.cookie(SessionCookie::removal()))
    } else {
        api
    };
    api.with_source(err)
}

/// Usable access token for a gated resource handler.
async fn access_grant(
    state: &AppState,
    jar: &CookieJar,
    validated: Option<Extension<Session>>,
) -> Result<AccessGrant, ApiError> {
    const MESSAGE: &str = "Failed to get access token";

    let lookup = state
        .sessions
        .resolve(validated.map(|Extension(session)| session), jar)
        .await
        .map_err(|err| ApiError::internal(MESSAGE).with_source(err))?;
    let Some(session) = lookup.into_active() else {
        return Err(ApiError::internal(MESSAGE)
            .with_source(anyhow::anyhow!("no active session for request")));
    };

    state
        .tokens
        .access_token(session)
        .await
        .map_err(|err| token_failure(state, err, MESSAGE))
}

/// Adds the session cookie re-issued by a token refresh, if any.
fn reissue(state: &AppState, jar: CookieJar, cookie: Option<SessionCookie>) -> CookieJar {
    match cookie {
        Some(cookie) => state.sessions.set_cookie(jar, cookie),
        None => jar,
    }
}
