use super::{access_grant, reissue, ApiError, Envelope};
use crate::google::GoogleUserInfo;
use crate::session::Session;
use crate::AppState;
use axum::response::IntoResponse;
use axum::Extension;
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use std::sync::Arc;

const PHONE_UNAVAILABLE: &str = "Unable to fetch phone numbers, the phone scope may be missing";

#[derive(Debug, Serialize)]
struct UserProfile {
    #[serde(flatten)]
    user_info: GoogleUserInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_numbers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_numbers_error: Option<&'static str>,
}

pub(super) async fn user_profile(
    Extension(state): Extension<Arc<AppState>>,
    validated: Option<Extension<Session>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    let grant = access_grant(&state, &jar, validated).await?;

    let user_info = state
        .google
        .user_info(&grant.access_token)
        .await
        .map_err(|err| ApiError::internal("Failed to get user info").with_source(err))?;

    let mut profile = UserProfile {
        user_info,
        phone_numbers: None,
        phone_numbers_error: None,
    };
    match state.google.phone_numbers(&grant.access_token).await {
        Ok(numbers) if !numbers.is_empty() => profile.phone_numbers = Some(numbers),
        Ok(_) => profile.phone_numbers_error = Some(PHONE_UNAVAILABLE),
        Err(err) => {
            tracing::warn!(error = %err, "phone numbers unavailable");
            profile.phone_numbers_error = Some(PHONE_UNAVAILABLE);
        }
    }

    let jar = reissue(&state, jar, grant.cookie);
    Ok((jar, Envelope::success(profile)))
}
