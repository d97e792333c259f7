/// Admin authentication
///
/// Sessions, CSRF tokens, multi-factor authentication, attempt throttling
/// and the request gate that ties them together for the admin API.

pub mod attempts;
pub mod client;
pub mod cookies;
pub mod csrf;
pub mod gate;
pub mod mfa;
pub mod session;
pub mod totp;

pub use attempts::{AttemptType, AuthAttempt, AuthAttemptLog};
pub use client::{ClientInfo, UNKNOWN_CLIENT};
pub use csrf::CsrfGuard;
pub use gate::{
    AdminAuth, AuthenticatedAdmin, RequestGate, RequireAdmin, RequireEditor, RequireViewer,
};
pub use mfa::{MfaService, MfaVerified, TotpEnrollment};
pub use session::{AdminSession, SessionStore, TimeoutReason};
