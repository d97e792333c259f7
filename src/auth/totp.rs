/// Time-based one-time passwords (RFC 6238: SHA-1, 6 digits, 30 s step)
use crate::error::{HoleError, HoleResult};
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
/// Accept one step either side of the current one
const SKEW: u8 = 1;
const STEP_SECS: u64 = 30;

/// New random secret, base32 encoded
pub fn generate_secret() -> String {
    Secret::generate_secret().to_encoded().to_string()
}

fn build(secret_base32: &str, issuer: &str, account: &str) -> HoleResult<TOTP> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| HoleError::Internal(format!("Invalid TOTP secret: {:?}", e)))?;

    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECS,
        secret,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| HoleError::Internal(format!("TOTP init error: {}", e)))
}

/// `otpauth://` URI for authenticator apps
pub fn provisioning_uri(secret_base32: &str, issuer: &str, account: &str) -> HoleResult<String> {
    Ok(build(secret_base32, issuer, account)?.get_url())
}

/// Strip spaces; a well-formed code is exactly six digits
pub fn normalize_code(code: &str) -> Option<String> {
    let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    (code.len() == DIGITS && code.bytes().all(|b| b.is_ascii_digit())).then_some(code)
}

/// Check a code at a unix time
pub fn verify_code(secret_base32: &str, code: &str, unix_secs: u64) -> HoleResult<bool> {
    let Some(code) = normalize_code(code) else {
        return Ok(false);
    };
    Ok(build(secret_base32, "verify", "account")?.check(&code, unix_secs))
}

/// Code for a unix time
pub fn generate_code(secret_base32: &str, unix_secs: u64) -> HoleResult<String> {
    Ok(build(secret_base32, "verify", "account")?.generate(unix_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u64 = 1_700_000_000;

    #[test]
    fn test_generated_code_verifies_within_skew() {
        let secret = generate_secret();
        let code = generate_code(&secret, T).unwrap();

        assert!(verify_code(&secret, &code, T).unwrap());
        assert!(verify_code(&secret, &code, T + STEP_SECS).unwrap());
        assert!(!verify_code(&secret, &code, T + 3 * STEP_SECS).unwrap());
    }

    #[test]
    fn test_malformed_codes_rejected() {
        let secret = generate_secret();
        assert!(!verify_code(&secret, "12345", T).unwrap());
        assert!(!verify_code(&secret, "abcdef", T).unwrap());
        assert_eq!(normalize_code("123 456").as_deref(), Some("123456"));
    }

    #[test]
    fn test_provisioning_uri() {
        let secret = generate_secret();
        let uri = provisioning_uri(&secret, "FillTheHole", "ada@example.com").unwrap();
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains(&secret));
    }
}
