//! Response cookie construction for cookie-borne sessions.

use tower_cookies::cookie::SameSite;
use tower_cookies::cookie::time::{Duration, OffsetDateTime};
use tower_cookies::{Cookie, Cookies};

/// A pending change to the response's session cookie.
pub enum CookieUpdate {
    Set(Cookie<'static>),
    Clear(Cookie<'static>),
}

impl CookieUpdate {
    /// Applies the update to the response's cookie jar.
    pub fn apply(self, cookies: &Cookies) {
        match self {
            CookieUpdate::Set(cookie) => cookies.add(cookie),
            CookieUpdate::Clear(cookie) => cookies.remove(cookie),
        }
    }

    /// The cookie the update carries.
    pub fn cookie(&self) -> &Cookie<'static> {
        match self {
            CookieUpdate::Set(cookie) | CookieUpdate::Clear(cookie) => cookie,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, CookieUpdate::Set(_))
    }
}

/// Builds the session cookie: HttpOnly, SameSite=Lax, Path "/", with
/// Expires and Max-Age pinned to the session deadline.
pub fn session_cookie(
    name: &str,
    session_id: &str,
    deadline_secs: f64,
    secure: bool,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_owned(), session_id.to_owned());
    cookie.set_http_only(true);
    if secure {
        cookie.set_secure(true);
    }
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");

    let expires = OffsetDateTime::from_unix_timestamp(deadline_secs as i64)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    cookie.set_expires(expires);
    let remaining = expires - OffsetDateTime::now_utc();
    cookie.set_max_age(remaining.max(Duration::ZERO));

    cookie
}

/// Builds the removal cookie for a session that no longer exists.
pub fn removal_cookie(name: &str) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_owned(), "");
    cookie.set_path("/");
    cookie
}
