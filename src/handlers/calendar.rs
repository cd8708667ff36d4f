use super::{access_grant, reissue, ApiError, Envelope};
use crate::google::{CalendarEvent, CalendarQuery};
use crate::session::Session;
use crate::AppState;
use axum::extract::Query;
use axum::response::IntoResponse;
use axum::Extension;
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Duration, Months, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EventsParams {
    time_min: Option<String>,
    time_max: Option<String>,
    max_results: Option<String>,
    single_events: Option<String>,
    order_by: Option<String>,
    calendar_id: Option<String>,
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn or_default(value: Option<String>, default: impl FnOnce() -> String) -> String {
    value.filter(|v| !v.is_empty()).unwrap_or_else(default)
}

impl EventsParams {
    /// Fills the window `[now, now + 1 month]` and the listing defaults.
    fn into_query(self, now: DateTime<Utc>) -> CalendarQuery {
        let month_later = now
            .checked_add_months(Months::new(1))
            .unwrap_or(now + Duration::days(30));

        CalendarQuery {
            calendar_id: or_default(self.calendar_id, || "primary".to_owned()),
            time_min: or_default(self.time_min, || rfc3339(now)),
            time_max: or_default(self.time_max, || rfc3339(month_later)),
            max_results: or_default(self.max_results, || "100".to_owned()),
            single_events: or_default(self.single_events, || "true".to_owned()),
            order_by: or_default(self.order_by, || "startTime".to_owned()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsPayload {
    events: Vec<CalendarEvent>,
    time_zone: String,
    summary: String,
}

pub(super) async fn events(
    Extension(state): Extension<Arc<AppState>>,
    validated: Option<Extension<Session>>,
    jar: CookieJar,
    Query(params): Query<EventsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let grant = access_grant(&state, &jar, validated).await?;
    let query = params.into_query(state.clock.now());

    let calendar = state
        .google
        .list_events(&grant.access_token, &query)
        .await
        .map_err(|err| {
            ApiError::internal("Failed to fetch calendar data")
                .with_details(err.details())
                .with_source(err)
        })?;

    tracing::debug!(
        calendar_id = %query.calendar_id,
        events = calendar.items.len(),
        "calendar events fetched"
    );

    let jar = reissue(&state, jar, grant.cookie);
    Ok((
        jar,
        Envelope::success(EventsPayload {
            events: calendar.items,
            time_zone: calendar.time_zone,
            summary: calendar.summary,
        }),
    ))
}
