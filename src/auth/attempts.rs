/// Authentication attempt log and failure-based throttling
use crate::{
    db,
    error::{HoleError, HoleResult},
    metrics,
};
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// Kind of authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptType {
    Login,
    Mfa,
    Signup,
    Bootstrap,
}

impl AttemptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptType::Login => "login",
            AttemptType::Mfa => "mfa",
            AttemptType::Signup => "signup",
            AttemptType::Bootstrap => "bootstrap",
        }
    }
}

/// One attempt to record
#[derive(Debug, Clone)]
pub struct AuthAttempt<'a> {
    pub attempt_type: AttemptType,
    pub user_id: Option<&'a str>,
    pub email: Option<&'a str>,
    pub ip_hash: &'a str,
    pub user_agent: &'a str,
    pub success: bool,
    /// Internal reason; never shown to the client
    pub failure_reason: Option<&'a str>,
}

/// Attempt log
#[derive(Clone)]
pub struct AuthAttemptLog {
    db: SqlitePool,
    max_failures: i64,
    window: Duration,
}

impl AuthAttemptLog {
    pub fn new(db: SqlitePool, max_failures: i64, window: Duration) -> Self {
        Self {
            db,
            max_failures,
            window,
        }
    }

    /// Record an attempt; best-effort
    pub async fn record(&self, attempt: AuthAttempt<'_>) {
        metrics::AUTH_ATTEMPTS_TOTAL
            .with_label_values(&[
                attempt.attempt_type.as_str(),
                if attempt.success { "success" } else { "failure" },
            ])
            .inc();

        let result = sqlx::query(
            r#"
            INSERT INTO admin_auth_attempts
                (user_id, email, ip_address, user_agent, attempt_type, success, failure_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.user_id)
        .bind(attempt.email.map(|e| e.trim().to_lowercase()))
        .bind(attempt.ip_hash)
        .bind(attempt.user_agent)
        .bind(attempt.attempt_type.as_str())
        .bind(attempt.success)
        .bind(attempt.failure_reason)
        .bind(db::now_timestamp())
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            tracing::error!(
                "Failed to record {} attempt: {}",
                attempt.attempt_type.as_str(),
                e
            );
        }
    }

    /// Fail when either the email or the client has too many recent failures
    ///
    /// A failed lookup lets the request through.
    pub async fn check(
        &self,
        email: Option<&str>,
        ip_hash: &str,
        attempt_type: AttemptType,
    ) -> HoleResult<()> {
        let since = Utc::now() - self.window;

        let mut keys: Vec<(&str, String)> = vec![("ip_address", ip_hash.to_string())];
        if let Some(email) = email {
            keys.push(("email", email.trim().to_lowercase()));
        }

        for (column, value) in keys {
            match self.failures_since(column, &value, attempt_type, since).await {
                Ok((count, oldest)) if count >= self.max_failures => {
                    let retry_after = oldest
                        .map(|oldest| oldest + self.window - Utc::now())
                        .and_then(|d| d.to_std().ok())
                        .unwrap_or_else(|| std::time::Duration::from_secs(60));

                    tracing::warn!(
                        "Too many failed {} attempts by {}",
                        attempt_type.as_str(),
                        column
                    );
                    metrics::RATE_LIMIT_REJECTIONS_TOTAL
                        .with_label_values(&[attempt_type.as_str()])
                        .inc();
                    return Err(HoleError::RateLimitExceeded { retry_after });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Auth rate limit lookup failed, allowing request: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn failures_since(
        &self,
        column: &str,
        value: &str,
        attempt_type: AttemptType,
        since: chrono::DateTime<Utc>,
    ) -> HoleResult<(i64, Option<chrono::DateTime<Utc>>)> {
        let (count, oldest): (i64, Option<String>) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM admin_auth_attempts
            WHERE {} = ? AND attempt_type = ? AND success = 0 AND created_at > ?
            "#,
            column
        ))
        .bind(value)
        .bind(attempt_type.as_str())
        .bind(db::timestamp(since))
        .fetch_one(&self.db)
        .await?;

        Ok((count, db::parse_optional_timestamp(oldest)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure<'a>(email: &'a str, ip: &'a str) -> AuthAttempt<'a> {
        AuthAttempt {
            attempt_type: AttemptType::Login,
            user_id: None,
            email: Some(email),
            ip_hash: ip,
            user_agent: "test",
            success: false,
            failure_reason: Some("invalid_password"),
        }
    }

    #[tokio::test]
    async fn test_email_lockout_after_five_failures() {
        let pool = db::connect_in_memory().await.unwrap();
        let log = AuthAttemptLog::new(pool, 5, Duration::minutes(10));

        for i in 0..4 {
            log.record(failure("victim@example.com", &format!("ip-{}", i))).await;
        }
        assert!(log
            .check(Some("victim@example.com"), "ip-new", AttemptType::Login)
            .await
            .is_ok());

        log.record(failure("Victim@Example.com", "ip-4")).await;
        let err = log
            .check(Some("victim@example.com"), "ip-new", AttemptType::Login)
            .await
            .unwrap_err();
        assert!(matches!(err, HoleError::RateLimitExceeded { .. }));

        // Other attempt types are counted separately
        assert!(log
            .check(Some("victim@example.com"), "ip-new", AttemptType::Mfa)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ip_lockout_across_emails() {
        let pool = db::connect_in_memory().await.unwrap();
        let log = AuthAttemptLog::new(pool, 5, Duration::minutes(10));

        for i in 0..5 {
            log.record(failure(&format!("user{}@example.com", i), "same-ip")).await;
        }
        assert!(log
            .check(Some("fresh@example.com"), "same-ip", AttemptType::Login)
            .await
            .is_err());
        assert!(log
            .check(Some("fresh@example.com"), "other-ip", AttemptType::Login)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_open() {
        let pool = db::connect_in_memory().await.unwrap();
        sqlx::query("DROP TABLE admin_auth_attempts")
            .execute(&pool)
            .await
            .unwrap();
        let log = AuthAttemptLog::new(pool, 5, Duration::minutes(10));

        assert!(log.check(Some("a@example.com"), "ip", AttemptType::Login).await.is_ok());
    }
}
