/// Multi-factor authentication: login challenges, TOTP verification with
/// replay suppression, backup codes, trusted devices and enrollment.
use crate::{
    admin::{AdminUser, AdminUserManager},
    auth::{
        attempts::{AttemptType, AuthAttempt, AuthAttemptLog},
        client::fingerprint_matches,
        totp,
    },
    config::SessionConfig,
    crypto::{random_token, CredentialVault},
    db,
    error::{HoleError, HoleResult},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// A TOTP code may not be reused within this window
const TOTP_REPLAY_WINDOW_SECS: i64 = 90;

const INVALID_CHALLENGE: &str = "Invalid or expired MFA challenge";
const INVALID_CODE: &str = "Invalid verification code";

/// Successful second factor
#[derive(Debug, Clone)]
pub struct MfaVerified {
    pub user: AdminUser,
    pub used_backup_code: bool,
    /// Backup codes left, when one was consumed
    pub remaining_backup_codes: Option<usize>,
}

/// Pending TOTP enrollment handed to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpEnrollment {
    pub secret: String,
    pub otpauth_uri: String,
    /// Sent back on confirmation; the plaintext secret is never stored unconfirmed
    pub encrypted_secret: String,
}

enum SecondFactor {
    Totp(String),
    BackupCode { previous: Option<String>, remaining: Vec<String> },
}

/// MFA service
#[derive(Clone)]
pub struct MfaService {
    db: SqlitePool,
    vault: Arc<CredentialVault>,
    attempts: AuthAttemptLog,
    users: AdminUserManager,
    config: SessionConfig,
    issuer: String,
}

impl MfaService {
    pub fn new(
        db: SqlitePool,
        vault: Arc<CredentialVault>,
        attempts: AuthAttemptLog,
        config: SessionConfig,
        issuer: String,
    ) -> Self {
        Self {
            users: AdminUserManager::new(db.clone()),
            db,
            vault,
            attempts,
            config,
            issuer,
        }
    }

    // ========== Challenges ==========

    /// Issue a short-lived challenge bound to the client fingerprint
    pub async fn issue_challenge(
        &self,
        user_id: &str,
        ip_hash: &str,
        user_agent: &str,
    ) -> HoleResult<String> {
        let now = Utc::now();
        let token = random_token();

        sqlx::query(
            "DELETE FROM admin_mfa_challenges WHERE user_id = ? AND expires_at <= ?",
        )
        .bind(user_id)
        .bind(db::timestamp(now))
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO admin_mfa_challenges (token, user_id, ip_address, user_agent, created_at, expires_at, used)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&token)
        .bind(user_id)
        .bind(ip_hash)
        .bind(user_agent)
        .bind(db::timestamp(now))
        .bind(db::timestamp(now + self.config.mfa_challenge_ttl))
        .execute(&self.db)
        .await?;

        Ok(token)
    }

    /// Verify a code against a challenge and consume it
    ///
    /// The challenge flips to used exactly once; a second submission of the
    /// same token is a conflict even when the code is correct.
    pub async fn verify_challenge(
        &self,
        token: &str,
        code: &str,
        ip_hash: &str,
        user_agent: &str,
    ) -> HoleResult<MfaVerified> {
        let now = Utc::now();

        let row = sqlx::query(
            "SELECT user_id, ip_address, user_agent, expires_at, used FROM admin_mfa_challenges WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            self.record_failure(None, None, ip_hash, user_agent, "unknown_challenge").await;
            return Err(HoleError::Authentication(INVALID_CHALLENGE.to_string()));
        };

        let user_id: String = row.get("user_id");
        let expires_at: String = row.get("expires_at");
        let used: bool = row.get("used");
        let bound_ip: Option<String> = row.get("ip_address");
        let bound_ua: Option<String> = row.get("user_agent");

        if used {
            return Err(HoleError::Conflict("MFA challenge already used".to_string()));
        }
        if db::parse_timestamp(&expires_at)? <= now {
            self.record_failure(Some(&user_id), None, ip_hash, user_agent, "expired_challenge")
                .await;
            return Err(HoleError::Authentication(INVALID_CHALLENGE.to_string()));
        }
        if !fingerprint_matches(bound_ip.as_deref(), ip_hash)
            || !fingerprint_matches(bound_ua.as_deref(), user_agent)
        {
            tracing::warn!("MFA challenge presented from a different client");
            self.record_failure(Some(&user_id), None, ip_hash, user_agent, "fingerprint_mismatch")
                .await;
            return Err(HoleError::Authentication(INVALID_CHALLENGE.to_string()));
        }

        let user = match self.users.find_by_id(&user_id).await? {
            Some(user) if user.can_sign_in() && user.totp_enabled => user,
            _ => {
                self.record_failure(
                    Some(&user_id),
                    None,
                    ip_hash,
                    user_agent,
                    "account_unavailable",
                )
                .await;
                return Err(HoleError::Authentication(INVALID_CHALLENGE.to_string()));
            }
        };

        self.attempts
            .check(Some(&user.email), ip_hash, AttemptType::Mfa)
            .await?;

        let factor = match self.check_second_factor(&user, code, now).await? {
            Some(factor) => factor,
            None => {
                self.record_failure(
                    Some(&user.id),
                    Some(&user.email),
                    ip_hash,
                    user_agent,
                    "invalid_code",
                )
                .await;
                return Err(HoleError::Authentication(INVALID_CODE.to_string()));
            }
        };

        let mut tx = self.db.begin().await?;

        let consumed = sqlx::query(
            "UPDATE admin_mfa_challenges SET used = 1, used_at = ? WHERE token = ? AND used = 0",
        )
        .bind(db::timestamp(now))
        .bind(token)
        .execute(&mut *tx)
        .await?;

        if consumed.rows_affected() == 0 {
            return Err(HoleError::Conflict("MFA challenge already used".to_string()));
        }

        let used_backup_code = matches!(factor, SecondFactor::BackupCode { .. });
        let mut remaining_backup_codes = None;

        let accepted = match factor {
            SecondFactor::Totp(code) => {
                let cutoff = now - Duration::seconds(TOTP_REPLAY_WINDOW_SECS);
                sqlx::query(
                    r#"
                    UPDATE admin_users
                    SET last_used_totp_code = ?, last_used_totp_at = ?
                    WHERE id = ?
                      AND (last_used_totp_code IS NULL OR last_used_totp_code != ?
                           OR last_used_totp_at IS NULL OR last_used_totp_at <= ?)
                    "#,
                )
                .bind(&code)
                .bind(db::timestamp(now))
                .bind(&user.id)
                .bind(&code)
                .bind(db::timestamp(cutoff))
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    == 1
            }
            SecondFactor::BackupCode {
                previous,
                remaining,
            } => {
                remaining_backup_codes = Some(remaining.len());
                let encoded = serde_json::to_string(&remaining).map_err(|e| {
                    HoleError::Internal(format!("Failed to encode backup codes: {}", e))
                })?;
                sqlx::query(
                    "UPDATE admin_users SET backup_codes = ? WHERE id = ? AND backup_codes IS ?",
                )
                .bind(encoded)
                .bind(&user.id)
                .bind(previous)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    == 1
            }
        };

        if !accepted {
            drop(tx);
            self.record_failure(
                Some(&user.id),
                Some(&user.email),
                ip_hash,
                user_agent,
                "code_already_used",
            )
            .await;
            return Err(HoleError::Authentication(INVALID_CODE.to_string()));
        }

        tx.commit().await?;

        self.attempts
            .record(AuthAttempt {
                attempt_type: AttemptType::Mfa,
                user_id: Some(&user.id),
                email: Some(&user.email),
                ip_hash,
                user_agent,
                success: true,
                failure_reason: None,
            })
            .await;

        if used_backup_code {
            tracing::info!("Backup code used for MFA sign-in");
        }

        Ok(MfaVerified {
            user,
            used_backup_code,
            remaining_backup_codes,
        })
    }

    /// TOTP first, backup codes only when TOTP fails
    async fn check_second_factor(
        &self,
        user: &AdminUser,
        code: &str,
        now: DateTime<Utc>,
    ) -> HoleResult<Option<SecondFactor>> {
        if let Some(normalized) = totp::normalize_code(code) {
            let secret = self.decrypted_secret(user)?;
            if totp::verify_code(&secret, &normalized, now.timestamp() as u64)? {
                if is_replay(user, &normalized, now) {
                    return Ok(None);
                }
                return Ok(Some(SecondFactor::Totp(normalized)));
            }
        }

        let hashes = user.backup_code_hashes();
        if hashes.is_empty() {
            return Ok(None);
        }

        let matched = self.vault.verify_backup_code(code, &hashes).await;
        Ok(matched.valid.then(|| SecondFactor::BackupCode {
            previous: user.backup_codes.clone(),
            remaining: matched.remaining,
        }))
    }

    fn decrypted_secret(&self, user: &AdminUser) -> HoleResult<String> {
        let stored = user
            .totp_secret
            .as_deref()
            .ok_or_else(|| HoleError::Internal("TOTP enabled without a secret".to_string()))?;
        self.vault.decrypt_totp_secret(stored)
    }

    async fn record_failure(
        &self,
        user_id: Option<&str>,
        email: Option<&str>,
        ip_hash: &str,
        user_agent: &str,
        reason: &str,
    ) {
        self.attempts
            .record(AuthAttempt {
                attempt_type: AttemptType::Mfa,
                user_id,
                email,
                ip_hash,
                user_agent,
                success: false,
                failure_reason: Some(reason),
            })
            .await;
    }

    // ========== Trusted devices ==========

    /// Remember a device so future logins skip the challenge
    pub async fn trust_device(
        &self,
        user_id: &str,
        ip_hash: &str,
        user_agent: &str,
    ) -> HoleResult<String> {
        let now = Utc::now();
        let token = random_token();

        sqlx::query(
            r#"
            INSERT INTO admin_trusted_devices (token, user_id, ip_address, user_agent, expires_at, last_used_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token)
        .bind(user_id)
        .bind(ip_hash)
        .bind(user_agent)
        .bind(db::timestamp(now + self.config.trusted_device_ttl))
        .bind(db::timestamp(now))
        .bind(db::timestamp(now))
        .execute(&self.db)
        .await?;

        Ok(token)
    }

    /// Whether a device token is live for this user; bumps its last use
    pub async fn is_trusted(&self, token: &str, user_id: &str) -> HoleResult<bool> {
        let now = db::now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE admin_trusted_devices
            SET last_used_at = ?
            WHERE token = ? AND user_id = ? AND expires_at > ?
            "#,
        )
        .bind(&now)
        .bind(token)
        .bind(user_id)
        .bind(&now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn forget_devices(&self, user_id: &str) -> HoleResult<u64> {
        let result = sqlx::query("DELETE FROM admin_trusted_devices WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    // ========== Enrollment ==========

    /// Start TOTP enrollment
    pub fn begin_enrollment(&self, user: &AdminUser) -> HoleResult<TotpEnrollment> {
        if user.totp_enabled {
            return Err(HoleError::Conflict("MFA is already enabled".to_string()));
        }

        let secret = totp::generate_secret();
        let otpauth_uri = totp::provisioning_uri(&secret, &self.issuer, &user.email)?;
        let encrypted_secret = self.vault.encrypt_totp_secret(&secret)?;

        Ok(TotpEnrollment {
            secret,
            otpauth_uri,
            encrypted_secret,
        })
    }

    /// Finish enrollment with a first code; returns plaintext backup codes
    pub async fn confirm_enrollment(
        &self,
        user: &AdminUser,
        encrypted_secret: &str,
        code: &str,
    ) -> HoleResult<Vec<String>> {
        let secret = self
            .vault
            .decrypt_totp_secret(encrypted_secret)
            .map_err(|_| HoleError::Validation("Enrollment has expired, start again".to_string()))?;

        let now = Utc::now();
        let Some(normalized) = totp::normalize_code(code) else {
            return Err(HoleError::Validation(INVALID_CODE.to_string()));
        };
        if !totp::verify_code(&secret, &normalized, now.timestamp() as u64)? {
            return Err(HoleError::Validation(INVALID_CODE.to_string()));
        }

        let codes = CredentialVault::generate_backup_codes();
        let hashes = self.vault.hash_backup_codes(&codes).await?;
        let encoded = serde_json::to_string(&hashes)
            .map_err(|e| HoleError::Internal(format!("Failed to encode backup codes: {}", e)))?;

        let result = sqlx::query(
            r#"
            UPDATE admin_users
            SET totp_enabled = 1, totp_secret = ?, backup_codes = ?,
                last_used_totp_code = ?, last_used_totp_at = ?
            WHERE id = ? AND totp_enabled = 0
            "#,
        )
        .bind(encrypted_secret)
        .bind(encoded)
        .bind(&normalized)
        .bind(db::timestamp(now))
        .bind(&user.id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::Conflict("MFA is already enabled".to_string()));
        }

        Ok(codes)
    }

    /// Turn MFA off after re-verifying a code
    ///
    /// Clears all MFA state, forgets trusted devices and revokes every other
    /// session. Returns the number of sessions revoked.
    pub async fn disable(
        &self,
        user: &AdminUser,
        code: &str,
        current_session: &str,
    ) -> HoleResult<u64> {
        if !user.totp_enabled {
            return Err(HoleError::Validation("MFA is not enabled".to_string()));
        }
        if self.check_second_factor(user, code, Utc::now()).await?.is_none() {
            return Err(HoleError::Validation(INVALID_CODE.to_string()));
        }

        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            UPDATE admin_users
            SET totp_enabled = 0, totp_secret = NULL, backup_codes = NULL,
                last_used_totp_code = NULL, last_used_totp_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(&user.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM admin_trusted_devices WHERE user_id = ?")
            .bind(&user.id)
            .execute(&mut *tx)
            .await?;

        let revoked = sqlx::query("DELETE FROM admin_sessions WHERE user_id = ? AND id != ?")
            .bind(&user.id)
            .bind(current_session)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(revoked)
    }

    /// Replace backup codes; needs a current TOTP code
    pub async fn regenerate_backup_codes(
        &self,
        user: &AdminUser,
        code: &str,
    ) -> HoleResult<Vec<String>> {
        if !user.totp_enabled {
            return Err(HoleError::Validation("MFA is not enabled".to_string()));
        }

        let now = Utc::now();
        let secret = self.decrypted_secret(user)?;
        let valid = match totp::normalize_code(code) {
            Some(normalized) => {
                totp::verify_code(&secret, &normalized, now.timestamp() as u64)?
                    && !is_replay(user, &normalized, now)
            }
            None => false,
        };
        if !valid {
            return Err(HoleError::Validation(INVALID_CODE.to_string()));
        }

        let codes = CredentialVault::generate_backup_codes();
        let hashes = self.vault.hash_backup_codes(&codes).await?;
        let encoded = serde_json::to_string(&hashes)
            .map_err(|e| HoleError::Internal(format!("Failed to encode backup codes: {}", e)))?;

        sqlx::query("UPDATE admin_users SET backup_codes = ? WHERE id = ? AND totp_enabled = 1")
            .bind(encoded)
            .bind(&user.id)
            .execute(&self.db)
            .await?;

        Ok(codes)
    }

    // ========== Housekeeping ==========

    /// Delete expired challenges and trusted devices
    ///
    /// Used challenges stay until they expire so a replayed token is still
    /// reported as already used.
    pub async fn purge_expired(&self) -> HoleResult<u64> {
        let now = db::now_timestamp();

        let challenges = sqlx::query("DELETE FROM admin_mfa_challenges WHERE expires_at <= ?")
        .bind(&now)
        .execute(&self.db)
        .await?
        .rows_affected();

        let devices = sqlx::query("DELETE FROM admin_trusted_devices WHERE expires_at <= ?")
            .bind(&now)
            .execute(&self.db)
            .await?
            .rows_affected();

        Ok(challenges + devices)
    }
}

fn is_replay(user: &AdminUser, code: &str, now: DateTime<Utc>) -> bool {
    match (&user.last_used_totp_code, user.last_used_totp_at) {
        (Some(last_code), Some(last_at)) => {
            last_code == code && now - last_at < Duration::seconds(TOTP_REPLAY_WINDOW_SECS)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{NewAdminUser, Role};
    use crate::auth::UNKNOWN_CLIENT;
    use secrecy::SecretString;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    struct Fixture {
        pool: SqlitePool,
        mfa: MfaService,
        users: AdminUserManager,
        user_id: String,
        secret: String,
        backup_codes: Vec<String>,
    }

    async fn fixture() -> Fixture {
        fixture_over(db::connect_in_memory().await.unwrap()).await
    }

    async fn fixture_over(pool: SqlitePool) -> Fixture {
        let vault = Arc::new(CredentialVault::new(
            SecretString::from(KEY_HEX.to_string()),
            SecretString::from("ip-hash-secret-value".to_string()),
        ));
        let attempts = AuthAttemptLog::new(pool.clone(), 5, Duration::minutes(10));
        let mfa = MfaService::new(
            pool.clone(),
            vault,
            attempts,
            SessionConfig::default(),
            "FillTheHole".to_string(),
        );

        let mut conn = pool.acquire().await.unwrap();
        let user_id = AdminUserManager::insert(
            &mut conn,
            NewAdminUser {
                email: "mfa@example.com",
                password_hash: "1:00:00",
                first_name: "M",
                last_name: "F",
                role: Role::Admin,
                activated: true,
            },
        )
        .await
        .unwrap();
        drop(conn);

        let users = AdminUserManager::new(pool.clone());
        let user = users.get(&user_id).await.unwrap();
        let enrollment = mfa.begin_enrollment(&user).unwrap();
        let code = totp::generate_code(&enrollment.secret, Utc::now().timestamp() as u64).unwrap();
        let backup_codes = mfa
            .confirm_enrollment(&user, &enrollment.encrypted_secret, &code)
            .await
            .unwrap();

        // Clear the enrollment code so the tests can reuse the current step
        sqlx::query("UPDATE admin_users SET last_used_totp_code = NULL, last_used_totp_at = NULL")
            .execute(&pool)
            .await
            .unwrap();

        Fixture {
            pool,
            mfa,
            users,
            user_id,
            secret: enrollment.secret,
            backup_codes,
        }
    }

    fn current_code(secret: &str) -> String {
        totp::generate_code(secret, Utc::now().timestamp() as u64).unwrap()
    }

    #[tokio::test]
    async fn test_enrollment_enables_mfa() {
        let f = fixture().await;
        let user = f.users.get(&f.user_id).await.unwrap();
        assert!(user.totp_enabled);
        assert_eq!(f.backup_codes.len(), 8);
        assert_eq!(user.backup_code_hashes().len(), 8);
        assert!(f.mfa.begin_enrollment(&user).is_err());
    }

    #[tokio::test]
    async fn test_challenge_is_single_use() {
        let f = fixture().await;
        let token = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();

        let ok = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip", "ua")
            .await
            .unwrap();
        assert!(!ok.used_backup_code);

        let again = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip", "ua")
            .await;
        match again {
            Err(HoleError::Conflict(msg)) => assert!(msg.contains("already used")),
            other => panic!("expected conflict, got {:?}", other.map(|v| v.used_backup_code)),
        }
    }

    #[tokio::test]
    async fn test_totp_replay_rejected_on_new_challenge() {
        let f = fixture().await;
        let code = current_code(&f.secret);

        let first = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        f.mfa.verify_challenge(&first, &code, "ip", "ua").await.unwrap();

        let second = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        let replay = f.mfa.verify_challenge(&second, &code, "ip", "ua").await;
        assert!(matches!(replay, Err(HoleError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_rejected() {
        let f = fixture().await;
        let token = f.mfa.issue_challenge(&f.user_id, "ip-a", "ua").await.unwrap();

        let hijack = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip-b", "ua")
            .await;
        assert!(matches!(hijack, Err(HoleError::Authentication(_))));

        let other_agent = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip-a", "other-ua")
            .await;
        assert!(matches!(other_agent, Err(HoleError::Authentication(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_verification_consumes_challenge_once() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_over(crate::test_support::file_pool(dir.path()).await).await;
        let token = f.mfa.issue_challenge(&f.user_id, "ip", "agent").await.unwrap();
        let code = current_code(&f.secret);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let mfa = f.mfa.clone();
                let token = token.clone();
                let code = code.clone();
                tokio::spawn(
                    async move { mfa.verify_challenge(&token, &code, "ip", "agent").await },
                )
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(verified) => {
                    assert_eq!(verified.user.id, f.user_id);
                    accepted += 1;
                }
                // Late callers may already see the code as replayed
                Err(e) => assert!(
                    matches!(e, HoleError::Conflict(_) | HoleError::Authentication(_)),
                    "unexpected {:?}",
                    e
                ),
            }
        }
        assert_eq!(accepted, 1);

        let (used,): (bool,) =
            sqlx::query_as("SELECT used FROM admin_mfa_challenges WHERE token = ?")
                .bind(&token)
                .fetch_one(&f.pool)
                .await
                .unwrap();
        assert!(used);
    }

    #[tokio::test]
    async fn test_used_challenge_survives_new_login_and_purge() {
        let f = fixture().await;
        let token = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        f.mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip", "ua")
            .await
            .unwrap();

        f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        f.mfa.purge_expired().await.unwrap();

        let replay = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip", "ua")
            .await;
        match replay {
            Err(HoleError::Conflict(msg)) => assert!(msg.contains("already used")),
            other => panic!("expected conflict, got {:?}", other.map(|v| v.used_backup_code)),
        }
    }

    #[tokio::test]
    async fn test_omitted_user_agent_does_not_match_bound_challenge() {
        let f = fixture().await;
        let token = f
            .mfa
            .issue_challenge(&f.user_id, "ip", "Mozilla/5.0 (X11; Linux x86_64)")
            .await
            .unwrap();

        let stripped = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip", UNKNOWN_CLIENT)
            .await;
        assert!(matches!(stripped, Err(HoleError::Authentication(_))));

        let unknown_ip = f
            .mfa
            .verify_challenge(
                &token,
                &current_code(&f.secret),
                UNKNOWN_CLIENT,
                "Mozilla/5.0 (X11; Linux x86_64)",
            )
            .await;
        assert!(matches!(unknown_ip, Err(HoleError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_unknown_client_skips_fingerprint() {
        let f = fixture().await;
        let token = f.mfa.issue_challenge(&f.user_id, "unknown", "ua").await.unwrap();
        assert!(f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip-b", "ua")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_expired_challenge_rejected() {
        let f = fixture().await;
        let token = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        sqlx::query("UPDATE admin_mfa_challenges SET expires_at = ?")
            .bind(db::timestamp(Utc::now() - Duration::seconds(1)))
            .execute(&f.pool)
            .await
            .unwrap();

        let result = f
            .mfa
            .verify_challenge(&token, &current_code(&f.secret), "ip", "ua")
            .await;
        assert!(matches!(result, Err(HoleError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_backup_code_fallback_is_single_use() {
        let f = fixture().await;
        let backup = f.backup_codes[0].clone();

        let first = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        let verified = f.mfa.verify_challenge(&first, &backup, "ip", "ua").await.unwrap();
        assert!(verified.used_backup_code);
        assert_eq!(verified.remaining_backup_codes, Some(7));

        let second = f.mfa.issue_challenge(&f.user_id, "ip", "ua").await.unwrap();
        let reuse = f.mfa.verify_challenge(&second, &backup, "ip", "ua").await;
        assert!(matches!(reuse, Err(HoleError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_trusted_device() {
        let f = fixture().await;
        let token = f.mfa.trust_device(&f.user_id, "ip", "ua").await.unwrap();

        assert!(f.mfa.is_trusted(&token, &f.user_id).await.unwrap());
        assert!(!f.mfa.is_trusted(&token, "someone-else").await.unwrap());
        assert!(!f.mfa.is_trusted("bogus", &f.user_id).await.unwrap());

        f.mfa.forget_devices(&f.user_id).await.unwrap();
        assert!(!f.mfa.is_trusted(&token, &f.user_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_clears_state() {
        let f = fixture().await;
        let user = f.users.get(&f.user_id).await.unwrap();

        assert!(f.mfa.disable(&user, "000000", "current").await.is_err());
        f.mfa
            .disable(&user, &f.backup_codes[1], "current")
            .await
            .unwrap();

        let user = f.users.get(&f.user_id).await.unwrap();
        assert!(!user.totp_enabled);
        assert!(user.totp_secret.is_none());
        assert!(user.backup_code_hashes().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_backup_codes_requires_totp() {
        let f = fixture().await;
        let user = f.users.get(&f.user_id).await.unwrap();

        assert!(f
            .mfa
            .regenerate_backup_codes(&user, &f.backup_codes[0])
            .await
            .is_err());

        let fresh = f
            .mfa
            .regenerate_backup_codes(&user, &current_code(&f.secret))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 8);
        assert_ne!(fresh, f.backup_codes);
    }
}
