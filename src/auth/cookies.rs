/// Admin cookie construction
use crate::auth::csrf::CSRF_COOKIE;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

pub const SESSION_COOKIE: &str = "admin_session";
pub const TRUSTED_DEVICE_COOKIE: &str = "admin_trusted_device";

const SESSION_COOKIE_HOURS: i64 = 24;

/// Session cookie: HttpOnly, strict same-site
pub fn session_cookie(session_id: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::hours(SESSION_COOKIE_HOURS))
        .build()
}

/// CSRF cookie: readable by the admin UI so it can echo it in a header
pub fn csrf_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((CSRF_COOKIE, token))
        .path("/")
        .http_only(false)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::hours(SESSION_COOKIE_HOURS))
        .build()
}

pub fn trusted_device_cookie(
    token: String,
    secure: bool,
    ttl: chrono::Duration,
) -> Cookie<'static> {
    Cookie::build((TRUSTED_DEVICE_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::seconds(ttl.num_seconds()))
        .build()
}

/// Drop session and CSRF cookies; the trusted device cookie survives sign-out
pub fn clear_session_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
        .remove(Cookie::build(CSRF_COOKIE).path("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("abc".into(), true);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.path(), Some("/"));
    }

    #[test]
    fn test_csrf_cookie_is_script_readable() {
        let cookie = csrf_cookie("tok".into(), false);
        assert_eq!(cookie.http_only(), Some(false));
        assert_eq!(cookie.secure(), Some(false));
    }

    #[test]
    fn test_trusted_device_lifetime() {
        let cookie = trusted_device_cookie("t".into(), true, chrono::Duration::days(30));
        assert_eq!(cookie.max_age(), Some(time::Duration::days(30)));
    }
}
