/// Admin account flows
///
/// Sign-in (with the MFA step), invite-based signup, first-admin bootstrap,
/// sign-out and password changes.

mod manager;

pub use manager::{AccountManager, LoginOutcome, MfaSignIn, SignedIn};

use crate::error::{HoleError, HoleResult};
use serde::Deserialize;
use validator::Validate;

pub const MIN_PASSWORD_LEN: usize = 12;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Login request
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Second-factor request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaVerifyRequest {
    pub mfa_token: String,
    pub code: String,
    #[serde(default)]
    pub remember_device: bool,
}

/// Invite signup request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[validate(length(min = 1, max = 64))]
    pub invite_code: String,
    #[validate(email)]
    pub email: String,
    pub password: String,
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
}

/// First-admin request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub secret: String,
    #[validate(email)]
    pub email: String,
    pub password: String,
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
}

/// Password change request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Run derive-based field validation
pub fn validate_fields<T: Validate>(request: &T) -> HoleResult<()> {
    request
        .validate()
        .map_err(|e| HoleError::Validation(e.to_string()))
}

/// Length plus upper, lower, digit and special character
pub fn validate_password_strength(password: &str) -> HoleResult<()> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(HoleError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(HoleError::Validation(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LEN
        )));
    }

    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    if !(has_upper && has_lower && has_digit && has_special) {
        return Err(HoleError::Validation(
            "Password must contain upper and lower case letters, a digit and a special character"
                .to_string(),
        ));
    }
    Ok(())
}
