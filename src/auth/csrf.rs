/// Session-bound CSRF tokens
///
/// The token is an HMAC of the session id, so it is deterministic per session
/// and useless with any other session. Requests carry it twice: in the
/// `admin_csrf` cookie and the `x-csrf-token` header.
use crate::{
    crypto::{hmac_hex, secure_compare},
    error::HoleResult,
};
use axum::http::Method;
use secrecy::{ExposeSecret, SecretString};

pub const CSRF_COOKIE: &str = "admin_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Clone)]
pub struct CsrfGuard {
    key: SecretString,
}

impl CsrfGuard {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    /// Token for a session
    pub fn issue_token(&self, session_id: &str) -> HoleResult<String> {
        hmac_hex(self.key.expose_secret().as_bytes(), session_id.as_bytes())
    }

    /// Check a supplied token against the session's token
    pub fn verify(&self, session_id: &str, supplied: &str) -> bool {
        match self.issue_token(session_id) {
            Ok(expected) => secure_compare(&expected, supplied),
            Err(_) => false,
        }
    }

    /// Double-submit check: cookie and header both present, equal, and valid
    /// for the session
    pub fn verify_double_submit(
        &self,
        session_id: &str,
        cookie: Option<&str>,
        header: Option<&str>,
    ) -> bool {
        let (Some(cookie), Some(header)) = (cookie, header) else {
            return false;
        };
        if cookie.is_empty() || !secure_compare(cookie, header) {
            return false;
        }
        self.verify(session_id, header)
    }

    /// State-changing methods need a token
    pub fn requires_check(method: &Method) -> bool {
        !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}
