use super::SESSION_LIFETIME_SECS;
use axum_extra::extract::cookie::Cookie;
use time::Duration;

pub const SESSION_COOKIE: &str = "session_id";

/// Client-side handle of a session, before environment flags are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: &'static str,
    pub value: String,
    /// Seconds; negative deletes the cookie.
    pub max_age: i64,
    pub path: &'static str,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl SessionCookie {
    pub fn issue(session_id: &str) -> Self {
        Self {
            name: SESSION_COOKIE,
            value: session_id.to_owned(),
            max_age: SESSION_LIFETIME_SECS,
            path: "/",
            domain: None,
            secure: false,
            http_only: true,
        }
    }

    /// Empty value with a negative max-age: the logged-out marker.
    pub fn removal() -> Self {
        Self {
            value: String::new(),
            max_age: -1,
            ..Self::issue("")
        }
    }

    pub(super) fn render(self, production: bool) -> Cookie<'static> {
        let (secure, http_only) = if production {
            (true, true)
        } else {
            (self.secure, self.http_only)
        };

        let mut cookie = Cookie::build((self.name, self.value))
            .path(self.path)
            .max_age(Duration::seconds(self.max_age))
            .secure(secure)
            .http_only(http_only)
            .build();
        if let Some(domain) = self.domain {
            cookie.set_domain(domain);
        }
        cookie
    }
}
