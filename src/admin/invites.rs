/// Invite Code Management System
use crate::{
    admin::Role,
    crypto::random_token,
    db,
    error::{HoleError, HoleResult},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

const INVITE_COLUMNS: &str =
    "id, code, email, role, created_by, created_at, expires_at, is_active, used_by, used_at";

/// Invite code
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteCode {
    pub id: String,
    pub code: String,
    /// When set, only this address may redeem the invite
    pub email: Option<String>,
    pub role: Role,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub used_by: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
}

impl InviteCode {
    fn from_row(row: &SqliteRow) -> HoleResult<Self> {
        let role: String = row.get("role");
        let created_at: String = row.get("created_at");
        let expires_at: String = row.get("expires_at");

        Ok(Self {
            id: row.get("id"),
            code: row.get("code"),
            email: row.get("email"),
            role: role.parse()?,
            created_by: row.get("created_by"),
            created_at: db::parse_timestamp(&created_at)?,
            expires_at: db::parse_timestamp(&expires_at)?,
            is_active: row.get("is_active"),
            used_by: row.get("used_by"),
            used_at: db::parse_optional_timestamp(row.get("used_at"))?,
        })
    }

    /// Check the invite can be redeemed by `email` at `now`
    pub fn check_redeemable(&self, email: &str, now: DateTime<Utc>) -> HoleResult<()> {
        if !self.is_active || self.used_at.is_some() {
            return Err(HoleError::Validation(
                "Invite code is no longer valid".to_string(),
            ));
        }
        if self.expires_at <= now {
            return Err(HoleError::Validation("Invite code has expired".to_string()));
        }
        if let Some(restricted) = &self.email {
            if !restricted.eq_ignore_ascii_case(email.trim()) {
                return Err(HoleError::Validation(
                    "This invite code was issued for a different email address".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Invite code manager
#[derive(Clone)]
pub struct InviteCodeManager {
    db: SqlitePool,
    ttl: Duration,
}

impl InviteCodeManager {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Create invite code
    pub async fn create_invite(
        &self,
        created_by: &str,
        role: Role,
        email: Option<&str>,
    ) -> HoleResult<InviteCode> {
        let now = Utc::now();
        let invite = InviteCode {
            id: Uuid::new_v4().to_string(),
            code: random_token(),
            email: email
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty()),
            role,
            created_by: Some(created_by.to_string()),
            created_at: now,
            expires_at: now + self.ttl,
            is_active: true,
            used_by: None,
            used_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO admin_invite_codes (id, code, email, role, created_by, created_at, expires_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&invite.id)
        .bind(&invite.code)
        .bind(&invite.email)
        .bind(role.as_str())
        .bind(created_by)
        .bind(db::timestamp(invite.created_at))
        .bind(db::timestamp(invite.expires_at))
        .execute(&self.db)
        .await?;

        Ok(invite)
    }

    pub async fn find_by_code(&self, code: &str) -> HoleResult<Option<InviteCode>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM admin_invite_codes WHERE code = ?",
            INVITE_COLUMNS
        ))
        .bind(code.trim())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(InviteCode::from_row).transpose()
    }

    /// List invite codes, newest first
    pub async fn list_codes(&self) -> HoleResult<Vec<InviteCode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM admin_invite_codes ORDER BY created_at DESC",
            INVITE_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(InviteCode::from_row).collect()
    }

    /// Disable an unused invite
    pub async fn deactivate(&self, id: &str) -> HoleResult<()> {
        let result = sqlx::query(
            "UPDATE admin_invite_codes SET is_active = 0 WHERE id = ? AND used_at IS NULL",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::NotFound(
                "No unused invite with that id".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark an invite used, first writer wins
    ///
    /// Runs on the caller's transaction so a lost race rolls back the
    /// account created alongside it.
    pub async fn redeem(
        conn: &mut SqliteConnection,
        invite_id: &str,
        user_id: &str,
    ) -> HoleResult<()> {
        let now = db::now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE admin_invite_codes
            SET used_by = ?, used_at = ?
            WHERE id = ? AND used_at IS NULL AND is_active = 1 AND expires_at > ?
            "#,
        )
        .bind(user_id)
        .bind(&now)
        .bind(invite_id)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::Conflict(
                "Invite code has already been used".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (SqlitePool, InviteCodeManager, String) {
        let pool = db::connect_in_memory().await.unwrap();
        let now = db::now_timestamp();
        sqlx::query(
            "INSERT INTO admin_users (id, email, password_hash, first_name, last_name, role, is_active, activated_at, created_at) \
             VALUES ('admin-1', 'a@example.com', 'x', 'A', 'B', 'admin', 1, ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        let manager = InviteCodeManager::new(pool.clone(), Duration::days(7));
        (pool, manager, "admin-1".to_string())
    }

    #[tokio::test]
    async fn test_create_invite_has_seven_day_expiry() {
        let (_pool, invites, admin) = setup().await;
        let invite = invites
            .create_invite(&admin, Role::Editor, Some(" New@Example.com "))
            .await
            .unwrap();

        assert_eq!(invite.expires_at - invite.created_at, Duration::days(7));
        assert_eq!(invite.email.as_deref(), Some("new@example.com"));

        let stored = invites.find_by_code(&invite.code).await.unwrap().unwrap();
        assert_eq!(stored.role, Role::Editor);
        assert!(stored.check_redeemable("NEW@example.com", Utc::now()).is_ok());
        assert!(stored.check_redeemable("other@example.com", Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_redeem_is_first_writer_wins() {
        let (pool, invites, admin) = setup().await;
        let invite = invites.create_invite(&admin, Role::Viewer, None).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        InviteCodeManager::redeem(&mut conn, &invite.id, &admin).await.unwrap();
        let second = InviteCodeManager::redeem(&mut conn, &invite.id, &admin).await;
        assert!(matches!(second, Err(HoleError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_deactivated_invite_not_redeemable() {
        let (_pool, invites, admin) = setup().await;
        let invite = invites.create_invite(&admin, Role::Viewer, None).await.unwrap();
        invites.deactivate(&invite.id).await.unwrap();

        let stored = invites.find_by_code(&invite.code).await.unwrap().unwrap();
        assert!(stored.check_redeemable("x@example.com", Utc::now()).is_err());
    }

    #[test]
    fn test_expired_invite_rejected() {
        let now = Utc::now();
        let invite = InviteCode {
            id: "i".into(),
            code: "c".into(),
            email: None,
            role: Role::Viewer,
            created_by: None,
            created_at: now - Duration::days(8),
            expires_at: now - Duration::days(1),
            is_active: true,
            used_by: None,
            used_at: None,
        };
        assert!(invite.check_redeemable("x@example.com", now).is_err());
    }
}
