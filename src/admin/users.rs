/// Admin user accounts and lifecycle management
use crate::{
    admin::Role,
    db,
    error::{HoleError, HoleResult},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

pub(crate) const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, role, \
    is_active, activated_at, totp_enabled, totp_secret, backup_codes, last_used_totp_code, \
    last_used_totp_at, last_login_at, created_at";

/// Back-office account
///
/// Credential material is never serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub totp_enabled: bool,
    #[serde(skip)]
    pub totp_secret: Option<String>,
    /// Raw JSON array of backup-code hashes, compared verbatim on swap
    #[serde(skip)]
    pub backup_codes: Option<String>,
    #[serde(skip)]
    pub last_used_totp_code: Option<String>,
    #[serde(skip)]
    pub last_used_totp_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AdminUser {
    pub(crate) fn from_row(row: &SqliteRow) -> HoleResult<Self> {
        let role: String = row.get("role");
        let created_at: String = row.get("created_at");

        Ok(Self {
            id: row.get("id"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            role: role.parse()?,
            is_active: row.get("is_active"),
            activated_at: db::parse_optional_timestamp(row.get("activated_at"))?,
            totp_enabled: row.get("totp_enabled"),
            totp_secret: row.get("totp_secret"),
            backup_codes: row.get("backup_codes"),
            last_used_totp_code: row.get("last_used_totp_code"),
            last_used_totp_at: db::parse_optional_timestamp(row.get("last_used_totp_at"))?,
            last_login_at: db::parse_optional_timestamp(row.get("last_login_at"))?,
            created_at: db::parse_timestamp(&created_at)?,
        })
    }

    /// Active and activated; anything else may not sign in
    pub fn can_sign_in(&self) -> bool {
        self.is_active && self.activated_at.is_some()
    }

    /// Stored backup-code hashes
    pub fn backup_code_hashes(&self) -> Vec<String> {
        self.backup_codes
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Fields for a new account
#[derive(Debug, Clone)]
pub struct NewAdminUser<'a> {
    pub email: &'a str,
    pub password_hash: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub role: Role,
    /// Bootstrap accounts start active; invited accounts wait for an admin
    pub activated: bool,
}

/// Admin user manager
#[derive(Clone)]
pub struct AdminUserManager {
    db: SqlitePool,
}

impl AdminUserManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert an account on an open connection or transaction
    ///
    /// Emails are stored lower-case; a duplicate maps to a conflict.
    pub async fn insert(conn: &mut SqliteConnection, user: NewAdminUser<'_>) -> HoleResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = db::now_timestamp();
        let activated_at = user.activated.then(|| now.clone());

        sqlx::query(
            r#"
            INSERT INTO admin_users
                (id, email, password_hash, first_name, last_name, role, is_active, activated_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user.email.trim().to_lowercase())
        .bind(user.password_hash)
        .bind(user.first_name.trim())
        .bind(user.last_name.trim())
        .bind(user.role.as_str())
        .bind(user.activated)
        .bind(activated_at)
        .bind(&now)
        .execute(&mut *conn)
        .await
        .map_err(map_unique_email)?;

        Ok(id)
    }

    /// Insert an active admin only while no admin exists
    ///
    /// A single statement, so of two concurrent callers exactly one inserts.
    /// `None` means an admin already existed.
    pub async fn insert_first_admin(&self, user: NewAdminUser<'_>) -> HoleResult<Option<String>> {
        let id = Uuid::new_v4().to_string();
        let now = db::now_timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO admin_users
                (id, email, password_hash, first_name, last_name, role, is_active, activated_at, created_at)
            SELECT ?, ?, ?, ?, ?, 'admin', 1, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM admin_users WHERE role = 'admin')
            "#,
        )
        .bind(&id)
        .bind(user.email.trim().to_lowercase())
        .bind(user.password_hash)
        .bind(user.first_name.trim())
        .bind(user.last_name.trim())
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await
        .map_err(map_unique_email)?;

        Ok((result.rows_affected() == 1).then_some(id))
    }

    pub async fn find_by_id(&self, id: &str) -> HoleResult<Option<AdminUser>> {
        let row = sqlx::query(&format!("SELECT {} FROM admin_users WHERE id = ?", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(AdminUser::from_row).transpose()
    }

    pub async fn find_by_email(&self, email: &str) -> HoleResult<Option<AdminUser>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM admin_users WHERE email = ?",
            USER_COLUMNS
        ))
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(AdminUser::from_row).transpose()
    }

    /// Fetch or fail with 404
    pub async fn get(&self, id: &str) -> HoleResult<AdminUser> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| HoleError::NotFound("User not found".to_string()))
    }

    pub async fn list(&self) -> HoleResult<Vec<AdminUser>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM admin_users ORDER BY created_at DESC",
            USER_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(AdminUser::from_row).collect()
    }

    pub async fn count(&self) -> HoleResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admin_users")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    /// Change another user's role
    pub async fn change_role(
        &self,
        actor_id: &str,
        target_id: &str,
        role: Role,
    ) -> HoleResult<AdminUser> {
        if actor_id == target_id {
            return Err(HoleError::Validation("You cannot change your own role".to_string()));
        }

        let result = sqlx::query("UPDATE admin_users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(target_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::NotFound("User not found".to_string()));
        }

        self.get(target_id).await
    }

    /// Activate an account; the first activation time is kept
    pub async fn activate(&self, target_id: &str) -> HoleResult<AdminUser> {
        let result = sqlx::query(
            r#"
            UPDATE admin_users
            SET is_active = 1, activated_at = COALESCE(activated_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(db::now_timestamp())
        .bind(target_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::NotFound("User not found".to_string()));
        }

        self.get(target_id).await
    }

    /// Deactivate another user and revoke every session they hold
    ///
    /// Returns the number of sessions revoked.
    pub async fn deactivate(&self, actor_id: &str, target_id: &str) -> HoleResult<u64> {
        if actor_id == target_id {
            return Err(HoleError::Validation("You cannot deactivate yourself".to_string()));
        }

        let mut tx = self.db.begin().await?;

        let result = sqlx::query("UPDATE admin_users SET is_active = 0 WHERE id = ?")
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::NotFound("User not found".to_string()));
        }

        let revoked = sqlx::query("DELETE FROM admin_sessions WHERE user_id = ?")
            .bind(target_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(revoked)
    }

    pub async fn record_login(&self, user_id: &str) -> HoleResult<()> {
        sqlx::query("UPDATE admin_users SET last_login_at = ? WHERE id = ?")
            .bind(db::now_timestamp())
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_password_hash(&self, user_id: &str, password_hash: &str) -> HoleResult<()> {
        sqlx::query("UPDATE admin_users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

fn map_unique_email(e: sqlx::Error) -> HoleError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            HoleError::Conflict("An account with this email already exists".to_string())
        }
        other => HoleError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (SqlitePool, AdminUserManager) {
        let pool = db::connect_in_memory().await.unwrap();
        (pool.clone(), AdminUserManager::new(pool))
    }

    async fn insert(pool: &SqlitePool, email: &str, role: Role, activated: bool) -> String {
        let mut conn = pool.acquire().await.unwrap();
        AdminUserManager::insert(
            &mut conn,
            NewAdminUser {
                email,
                password_hash: "1:00:00",
                first_name: "Test",
                last_name: "User",
                role,
                activated,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_lowercases_and_rejects_duplicates() {
        let (pool, users) = setup().await;
        let id = insert(&pool, "Ada@Example.COM", Role::Viewer, false).await;

        let user = users.find_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(user.id, id);
        assert!(!user.can_sign_in());

        let mut conn = pool.acquire().await.unwrap();
        let dup = AdminUserManager::insert(
            &mut conn,
            NewAdminUser {
                email: "ADA@example.com",
                password_hash: "1:00:00",
                first_name: "Ada",
                last_name: "Again",
                role: Role::Viewer,
                activated: false,
            },
        )
        .await;
        assert!(matches!(dup, Err(HoleError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_cannot_change_own_role() {
        let (pool, users) = setup().await;
        let admin = insert(&pool, "admin@example.com", Role::Admin, true).await;
        let other = insert(&pool, "ed@example.com", Role::Viewer, true).await;

        assert!(users.change_role(&admin, &admin, Role::Viewer).await.is_err());

        let updated = users.change_role(&admin, &other, Role::Editor).await.unwrap();
        assert_eq!(updated.role, Role::Editor);
    }

    #[tokio::test]
    async fn test_activate_then_deactivate_revokes_sessions() {
        let (pool, users) = setup().await;
        let admin = insert(&pool, "admin@example.com", Role::Admin, true).await;
        let target = insert(&pool, "new@example.com", Role::Viewer, false).await;

        let activated = users.activate(&target).await.unwrap();
        assert!(activated.can_sign_in());

        let now = db::now_timestamp();
        sqlx::query(
            "INSERT INTO admin_sessions (id, user_id, created_at, last_activity_at, expires_at) VALUES ('s1', ?, ?, ?, ?)",
        )
        .bind(&target)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();

        assert!(users.deactivate(&admin, &admin).await.is_err());
        assert_eq!(users.deactivate(&admin, &target).await.unwrap(), 1);
        assert!(!users.get(&target).await.unwrap().can_sign_in());
    }

    #[tokio::test]
    async fn test_first_admin_only_once() {
        let (pool, users) = setup().await;
        insert(&pool, "viewer@example.com", Role::Viewer, true).await;

        let first = NewAdminUser {
            email: "root@example.com",
            password_hash: "1:00:00",
            first_name: "Root",
            last_name: "Admin",
            role: Role::Admin,
            activated: true,
        };
        let id = users.insert_first_admin(first.clone()).await.unwrap().unwrap();
        assert!(users.get(&id).await.unwrap().can_sign_in());

        let second = NewAdminUser {
            email: "other@example.com",
            ..first
        };
        assert!(users.insert_first_admin(second).await.unwrap().is_none());
    }
}
