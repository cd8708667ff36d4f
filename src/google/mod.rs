mod model;

pub use model::{CalendarEvent, CalendarQuery, CalendarResponse, EventTime, GoogleUserInfo, Person};

use crate::config::GoogleConfig;
use crate::oauth::GoogleTokenResponse;
use anyhow::Context;
use async_trait::async_trait;
use model::{PhoneInfo, TokenErrorBody};
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
const CALENDAR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GoogleError {
    #[error("request to google failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint rejected the request ({status}): {error}")]
    TokenRejected {
        status: u16,
        error: String,
        description: Option<String>,
    },
    #[error("google returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("google api returned status {status}")]
    Api {
        status: u16,
        details: serde_json::Value,
    },
    #[error("unexpected google payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token response carried no access token")]
    EmptyAccessToken,
    #[error("invalid google endpoint: {0}")]
    Url(#[from] url::ParseError),
}

impl GoogleError {
    /// Google answered and refused; retrying with the same grant will not help.
    /// Transport and decode failures are not rejections.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GoogleError::TokenRejected { .. }
                | GoogleError::Status { .. }
                | GoogleError::EmptyAccessToken
        )
    }

    /// Upstream error body worth echoing to the client.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GoogleError::Api { details, .. } => Some(details.clone()),
            GoogleError::TokenRejected {
                error, description, ..
            } => Some(serde_json::json!({
                "error": error,
                "error_description": description,
            })),
            _ => None,
        }
    }
}

/// Every outbound call the broker makes to Google.
#[async_trait]
pub trait GoogleApi: Send + Sync + 'static {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<GoogleTokenResponse, GoogleError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<GoogleTokenResponse, GoogleError>;

    async fn user_info(&self, access_token: &str) -> Result<GoogleUserInfo, GoogleError>;

    /// Phone numbers from the People API. Needs an extra scope, so callers
    /// treat failure as non-fatal.
    async fn phone_numbers(&self, access_token: &str) -> Result<Vec<String>, GoogleError>;

    async fn list_events(
        &self,
        access_token: &str,
        query: &CalendarQuery,
    ) -> Result<CalendarResponse, GoogleError>;
}

#[derive(Serialize)]
struct CodeExchange<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    grant_type: &'static str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
}

#[derive(Clone)]
pub struct GoogleClient {
    http: Client,
    client_id: String,
    client_secret: String,
    token_url: Url,
    userinfo_url: Url,
    people_url: Url,
    calendar_api_base: Url,
}

impl GoogleClient {
    pub fn from_config(cfg: &GoogleConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("calendar-session-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;

        let endpoints = &cfg.endpoints;
        let mut api_base = endpoints.calendar_api_base.trim().to_owned();
        if !api_base.ends_with('/') {
            api_base.push('/');
        }

        Ok(Self {
            http,
            client_id: cfg.oauth2.client_id.clone(),
            client_secret: cfg.oauth2.client_secret.clone(),
            token_url: Url::parse(&endpoints.token_url).context("invalid google token url")?,
            userinfo_url: Url::parse(&endpoints.userinfo_url)
                .context("invalid google userinfo url")?,
            people_url: Url::parse(&endpoints.people_url).context("invalid google people url")?,
            calendar_api_base: Url::parse(&api_base).context("invalid calendar api base")?,
        })
    }

    fn calendar_url(&self, calendar_id: &str) -> Result<Url, GoogleError> {
        let encoded_calendar = urlencoding::encode(calendar_id);
        Ok(self
            .calendar_api_base
            .join(&format!("calendars/{encoded_calendar}/events"))?)
    }

    async fn post_token<B: Serialize + Sync>(&self, body: &B) -> Result<GoogleTokenResponse, GoogleError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .timeout(TOKEN_TIMEOUT)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<TokenErrorBody>(&text) {
                Ok(rejected) => GoogleError::TokenRejected {
                    status: status.as_u16(),
                    error: rejected.error,
                    description: rejected.error_description,
                },
                Err(_) => GoogleError::Status {
                    status: status.as_u16(),
                    body: text,
                },
            });
        }

        let token: GoogleTokenResponse = serde_json::from_str(&text)?;
        if token.access_token.is_empty() {
            return Err(GoogleError::EmptyAccessToken);
        }
        Ok(token)
    }

    /// Reads the body of a non-success response into a `Status` error.
    async fn status_error(response: Response) -> GoogleError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        GoogleError::Status { status, body }
    }
}

#[async_trait]
impl GoogleApi for GoogleClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<GoogleTokenResponse, GoogleError> {
        tracing::debug!(redirect_uri = %redirect_uri, "exchanging authorization code");
        self.post_token(&CodeExchange {
            code,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            redirect_uri,
            grant_type: "authorization_code",
        })
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<GoogleTokenResponse, GoogleError> {
        self.post_token(&RefreshGrant {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            refresh_token,
            grant_type: "refresh_token",
        })
        .await
    }

    async fn user_info(&self, access_token: &str) -> Result<GoogleUserInfo, GoogleError> {
        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn phone_numbers(&self, access_token: &str) -> Result<Vec<String>, GoogleError> {
        let response = self
            .http
            .get(self.people_url.clone())
            .query(&[("personFields", "phoneNumbers")])
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let text = response.text().await?;
        let info: PhoneInfo = serde_json::from_str(&text)?;
        Ok(info
            .phone_numbers
            .into_iter()
            .map(|phone| phone.value)
            .filter(|value| !value.is_empty())
            .collect())
    }

    async fn list_events(
        &self,
        access_token: &str,
        query: &CalendarQuery,
    ) -> Result<CalendarResponse, GoogleError> {
        let url = self.calendar_url(&query.calendar_id)?;
        let response = self
            .http
            .get(url)
            .timeout(CALENDAR_TIMEOUT)
            .bearer_auth(access_token)
            .query(&query.params())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(details) => GoogleError::Api {
                    status: status.as_u16(),
                    details,
                },
                Err(_) => GoogleError::Status {
                    status: status.as_u16(),
                    body: text,
                },
            });
        }

        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GoogleEndpoints, OAuth2Credentials};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    fn config(base: &str) -> GoogleConfig {
        GoogleConfig {
            oauth2: OAuth2Credentials {
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            endpoints: GoogleEndpoints {
                token_url: format!("{base}/token"),
                userinfo_url: format!("{base}/userinfo"),
                people_url: format!("{base}/people/me"),
                calendar_api_base: format!("{base}/calendar/v3"),
            },
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn calendar_ids_are_path_encoded() {
        let client = GoogleClient::from_config(&config("https://example.test")).unwrap();
        let url = client.calendar_url("team#1@group.calendar.google.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/calendar/v3/calendars/team%231%40group.calendar.google.com/events"
        );
    }

    #[test]
    fn api_errors_expose_details() {
        let err = GoogleError::Api {
            status: 404,
            details: json!({"error": {"code": 404}}),
        };
        assert_eq!(err.details(), Some(json!({"error": {"code": 404}})));
        assert!(GoogleError::EmptyAccessToken.details().is_none());
    }

    #[tokio::test]
    async fn token_exchange_posts_json_grant() {
        let router = Router::new().route(
            "/token",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["grant_type"], "authorization_code");
                assert_eq!(body["code"], "C");
                assert_eq!(body["redirect_uri"], "R");
                assert_eq!(body["client_id"], "client");
                Json(json!({
                    "access_token": "A",
                    "expires_in": 3599,
                    "token_type": "Bearer",
                    "refresh_token": "RT"
                }))
            }),
        );
        let base = serve(router).await;
        let client = GoogleClient::from_config(&config(&base)).unwrap();

        let token = client.exchange_code("C", "R").await.unwrap();
        assert_eq!(token.access_token, "A");
        assert_eq!(token.expires_in, 3599);
        assert_eq!(token.refresh_token.as_deref(), Some("RT"));
    }

    #[tokio::test]
    async fn token_rejections_and_empty_tokens_are_errors() {
        let router = Router::new().route(
            "/token",
            post(|Json(body): Json<serde_json::Value>| async move {
                if body["grant_type"] == "refresh_token" {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": "invalid_grant", "error_description": "Token has been expired or revoked."})),
                    )
                } else {
                    (StatusCode::OK, Json(json!({"access_token": "", "expires_in": 3600})))
                }
            }),
        );
        let base = serve(router).await;
        let client = GoogleClient::from_config(&config(&base)).unwrap();

        let err = client.refresh_token("RT").await.unwrap_err();
        assert!(matches!(
            err,
            GoogleError::TokenRejected { status: 400, ref error, .. } if error == "invalid_grant"
        ));

        let err = client.exchange_code("C", "R").await.unwrap_err();
        assert!(matches!(err, GoogleError::EmptyAccessToken));
    }

    #[tokio::test]
    async fn calendar_failures_carry_decoded_details() {
        let router = Router::new()
            .route(
                "/calendar/v3/calendars/primary/events",
                get(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        Json(json!({"error": {"code": 403, "message": "insufficient scope"}})),
                    )
                }),
            )
            .route(
                "/people/me",
                get(|| async { Json(json!({"phoneNumbers": [{"value": "+886 912"}, {"value": ""}]})) }),
            );
        let base = serve(router).await;
        let client = GoogleClient::from_config(&config(&base)).unwrap();

        let query = CalendarQuery {
            calendar_id: "primary".into(),
            time_min: "2026-10-17T00:00:00Z".into(),
            time_max: "2026-11-17T00:00:00Z".into(),
            max_results: "100".into(),
            single_events: "true".into(),
            order_by: "startTime".into(),
        };
        let err = client.list_events("A", &query).await.unwrap_err();
        assert!(matches!(err, GoogleError::Api { status: 403, .. }));
        assert_eq!(
            err.details().unwrap()["error"]["message"],
            "insufficient scope"
        );

        let phones = client.phone_numbers("A").await.unwrap();
        assert_eq!(phones, vec!["+886 912".to_owned()]);
    }
}
