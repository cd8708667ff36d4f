use super::{token_failure, ApiError, Envelope};
use crate::google::GoogleUserInfo;
use crate::session::{session_lifetime, Session, SessionCookie, SessionData, SessionLookup, SessionManager};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Resolves and renews the caller's session, or explains why it cannot.
pub(super) async fn validate_session(state: &AppState, jar: &CookieJar) -> Result<Session, ApiError> {
    match state.sessions.resolve(None, jar).await? {
        SessionLookup::NoCookie => Err(ApiError::unauthorized("Please login first")),
        SessionLookup::Unknown => Err(ApiError::unauthorized("Invalid session")),
        SessionLookup::Expired => Err(ApiError::unauthorized("Session expired, please login again")
            .with_cookie(state.sessions.cookie(SessionCookie::removal()))),
        SessionLookup::Active(mut session) => {
            state.sessions.touch(&mut session).await?;
            Ok(session)
        }
    }
}

/// Gate for resource routes: the validated session rides along in the request
/// extensions so handlers do not read the store again.
pub(super) async fn require_session(
    Extension(state): Extension<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let session = validate_session(&state, &jar).await?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

pub(super) async fn google_login(
    Extension(state): Extension<Arc<AppState>>,
    jar: CookieJar,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let current = state.sessions.resolve(None, &jar).await?.into_active();

    let grant = state
        .tokens
        .token_from_request(current, &body)
        .await
        .map_err(|err| token_failure(&state, err, "Failed to get token"))?;

    let user_info = state
        .google
        .user_info(&grant.token.access_token)
        .await
        .map_err(|err| ApiError::internal("Failed to get user information").with_source(err))?;

    let session_id = match grant.session {
        Some(mut session) => {
            session.data.user_info = Some(user_info.clone());
            state
                .sessions
                .touch(&mut session)
                .await
                .map_err(|err| ApiError::internal("Failed to update session").with_source(err))?;
            session.session_id
        }
        None => {
            let data = SessionData {
                token_response: Some(grant.token),
                user_info: Some(user_info.clone()),
            };
            state
                .sessions
                .save(&user_info.id, data, session_lifetime())
                .await
                .map_err(|err| ApiError::internal("Failed to save session").with_source(err))?
        }
    };

    let jar = state.sessions.set_cookie(jar, SessionCookie::issue(&session_id));
    Ok((jar, Envelope::success(user_info)))
}

pub(super) async fn google_sign_out(
    Extension(state): Extension<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    let Some(session_id) = SessionManager::session_id_from(&jar) else {
        return Ok((jar, Envelope::success(json!({ "message": "Already signed out" }))));
    };

    state
        .sessions
        .destroy(&session_id)
        .await
        .map_err(|err| ApiError::internal("Failed to sign out").with_source(err))?;

    let jar = state.sessions.set_cookie(jar, SessionCookie::removal());
    Ok((jar, Envelope::success(json!({ "message": "Successfully signed out" }))))
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    user_id: String,
    user_info: Option<GoogleUserInfo>,
    expiry_date: DateTime<Utc>,
}

pub(super) async fn validate(
    Extension(state): Extension<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    let session = validate_session(&state, &jar).await?;
    Ok(Envelope::success(SessionSummary {
        user_id: session.user_id,
        user_info: session.data.user_info,
        expiry_date: session.expiry_date,
    }))
}
