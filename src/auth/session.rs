/// Admin session storage and timeout policy
use crate::{
    admin::{users::USER_COLUMNS, AdminUser, Role},
    config::SessionConfig,
    crypto::random_token,
    db,
    error::HoleResult,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

/// Server-side session record
///
/// The id is the bearer credential carried in the session cookie.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSession {
    #[serde(skip)]
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AdminSession {
    fn from_row(row: &SqliteRow) -> HoleResult<Self> {
        let created_at: String = row.get("s_created_at");
        let last_activity_at: String = row.get("s_last_activity_at");
        let expires_at: String = row.get("s_expires_at");

        Ok(Self {
            id: row.get("s_id"),
            user_id: row.get("s_user_id"),
            created_at: db::parse_timestamp(&created_at)?,
            last_activity_at: db::parse_timestamp(&last_activity_at)?,
            expires_at: db::parse_timestamp(&expires_at)?,
            ip_address: row.get("s_ip_address"),
            user_agent: row.get("s_user_agent"),
        })
    }
}

/// Which soft limit a session breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutReason {
    Idle,
    Absolute,
}

impl TimeoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutReason::Idle => "idle",
            TimeoutReason::Absolute => "absolute",
        }
    }
}

const SESSION_COLUMNS: &str = "s.id AS s_id, s.user_id AS s_user_id, s.created_at AS s_created_at, \
    s.last_activity_at AS s_last_activity_at, s.expires_at AS s_expires_at, \
    s.ip_address AS s_ip_address, s.user_agent AS s_user_agent";

/// Session store
#[derive(Clone)]
pub struct SessionStore {
    db: SqlitePool,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(db: SqlitePool, config: SessionConfig) -> Self {
        Self { db, config }
    }

    /// Create a session with the configured hard expiry
    pub async fn create_session(
        &self,
        user_id: &str,
        ip_hash: &str,
        user_agent: &str,
    ) -> HoleResult<AdminSession> {
        let now = Utc::now();
        let session = AdminSession {
            id: random_token(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.config.hard_expiry,
            ip_address: Some(ip_hash.to_string()),
            user_agent: Some(user_agent.to_string()),
        };

        sqlx::query(
            r#"
            INSERT INTO admin_sessions (id, user_id, created_at, last_activity_at, expires_at, ip_address, user_agent)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(db::timestamp(now))
        .bind(db::timestamp(now))
        .bind(db::timestamp(session.expires_at))
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .execute(&self.db)
        .await?;

        Ok(session)
    }

    /// Resolve a session token to its live session and user
    ///
    /// `None` when the session is unknown or hard-expired, or when the user is
    /// inactive or not yet activated.
    pub async fn validate_session(
        &self,
        session_id: &str,
    ) -> HoleResult<Option<(AdminUser, AdminSession)>> {
        let user_columns = USER_COLUMNS
            .split(", ")
            .map(|c| format!("u.{0} AS {0}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let row = sqlx::query(&format!(
            r#"
            SELECT {}, {}
            FROM admin_sessions s
            JOIN admin_users u ON u.id = s.user_id
            WHERE s.id = ? AND s.expires_at > ?
            "#,
            SESSION_COLUMNS, user_columns
        ))
        .bind(session_id)
        .bind(db::now_timestamp())
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let user = AdminUser::from_row(&row)?;
        if !user.can_sign_in() {
            return Ok(None);
        }

        Ok(Some((user, AdminSession::from_row(&row)?)))
    }

    /// Idle and absolute limits for a role
    pub fn limits_for(&self, role: Role) -> (Duration, Duration) {
        match role {
            Role::Admin => (self.config.admin_idle, self.config.admin_absolute),
            Role::Editor | Role::Viewer => (self.config.staff_idle, self.config.staff_absolute),
        }
    }

    /// Check the role's soft timeouts against `now`
    pub fn check_soft_timeout(
        &self,
        session: &AdminSession,
        role: Role,
        now: DateTime<Utc>,
    ) -> Option<TimeoutReason> {
        let (idle, absolute) = self.limits_for(role);

        if now - session.created_at > absolute {
            Some(TimeoutReason::Absolute)
        } else if now - session.last_activity_at > idle {
            Some(TimeoutReason::Idle)
        } else {
            None
        }
    }

    /// Record activity on a session
    pub async fn touch(&self, session_id: &str) -> HoleResult<()> {
        sqlx::query("UPDATE admin_sessions SET last_activity_at = ? WHERE id = ?")
            .bind(db::now_timestamp())
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn invalidate(&self, session_id: &str) -> HoleResult<()> {
        sqlx::query("DELETE FROM admin_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Remove all of a user's sessions, optionally keeping one
    pub async fn invalidate_all_for_user(
        &self,
        user_id: &str,
        except: Option<&str>,
    ) -> HoleResult<u64> {
        let result = sqlx::query(
            "DELETE FROM admin_sessions WHERE user_id = ? AND (? IS NULL OR id != ?)",
        )
        .bind(user_id)
        .bind(except)
        .bind(except)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Live sessions for a user, most recently active first
    pub async fn list_for_user(&self, user_id: &str) -> HoleResult<Vec<AdminSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM admin_sessions s
            WHERE s.user_id = ? AND s.expires_at > ?
            ORDER BY s.last_activity_at DESC
            "#,
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(db::now_timestamp())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(AdminSession::from_row).collect()
    }

    /// Delete hard-expired sessions
    pub async fn purge_expired(&self) -> HoleResult<u64> {
        let result = sqlx::query("DELETE FROM admin_sessions WHERE expires_at <= ?")
            .bind(db::now_timestamp())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminUserManager, NewAdminUser};

    async fn setup(activated: bool) -> (SqlitePool, SessionStore, String) {
        let pool = db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let user_id = AdminUserManager::insert(
            &mut conn,
            NewAdminUser {
                email: "staff@example.com",
                password_hash: "1:00:00",
                first_name: "Staff",
                last_name: "Member",
                role: Role::Editor,
                activated,
            },
        )
        .await
        .unwrap();
        drop(conn);

        let store = SessionStore::new(pool.clone(), SessionConfig::default());
        (pool, store, user_id)
    }

    fn session_at(created: DateTime<Utc>, last: DateTime<Utc>) -> AdminSession {
        AdminSession {
            id: "s".into(),
            user_id: "u".into(),
            created_at: created,
            last_activity_at: last,
            expires_at: created + Duration::hours(24),
            ip_address: None,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let (_pool, store, user_id) = setup(true).await;
        let session = store.create_session(&user_id, "iphash", "test-agent").await.unwrap();
        assert_eq!(session.id.len(), 64);
        assert_eq!(session.expires_at - session.created_at, Duration::hours(24));

        let (user, found) = store.validate_session(&session.id).await.unwrap().unwrap();
        assert_eq!(user.id, user_id);
        assert_eq!(found.user_agent.as_deref(), Some("test-agent"));

        assert!(store.validate_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unactivated_user_has_no_session() {
        let (_pool, store, user_id) = setup(false).await;
        let session = store.create_session(&user_id, "iphash", "ua").await.unwrap();
        assert!(store.validate_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hard_expired_session_rejected() {
        let (pool, store, user_id) = setup(true).await;
        let session = store.create_session(&user_id, "iphash", "ua").await.unwrap();

        sqlx::query("UPDATE admin_sessions SET expires_at = ? WHERE id = ?")
            .bind(db::timestamp(Utc::now() - Duration::seconds(1)))
            .bind(&session.id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(store.validate_session(&session.id).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_soft_timeout_boundaries() {
        let (_pool, store, _) = setup(true).await;
        let now = Utc::now();
        let eps = Duration::seconds(1);

        // Admin idle: 15 minutes
        let admin_idle = Duration::minutes(15);
        let fresh = session_at(now - Duration::hours(1), now - (admin_idle - eps));
        assert_eq!(store.check_soft_timeout(&fresh, Role::Admin, now), None);
        let stale = session_at(now - Duration::hours(1), now - (admin_idle + eps));
        assert_eq!(
            store.check_soft_timeout(&stale, Role::Admin, now),
            Some(TimeoutReason::Idle)
        );

        // Same idle gap is fine for an editor (30 minutes)
        assert_eq!(store.check_soft_timeout(&stale, Role::Editor, now), None);

        // Absolute: 4 hours admin, 8 hours editor
        let old = session_at(now - (Duration::hours(4) + eps), now);
        assert_eq!(
            store.check_soft_timeout(&old, Role::Admin, now),
            Some(TimeoutReason::Absolute)
        );
        assert_eq!(store.check_soft_timeout(&old, Role::Viewer, now), None);
        let older = session_at(now - (Duration::hours(8) + eps), now);
        assert_eq!(
            store.check_soft_timeout(&older, Role::Viewer, now),
            Some(TimeoutReason::Absolute)
        );
    }

    #[tokio::test]
    async fn test_invalidate_all_except_current() {
        let (_pool, store, user_id) = setup(true).await;
        let keep = store.create_session(&user_id, "ip", "ua").await.unwrap();
        store.create_session(&user_id, "ip", "ua").await.unwrap();
        store.create_session(&user_id, "ip", "ua").await.unwrap();

        let revoked = store
            .invalidate_all_for_user(&user_id, Some(&keep.id))
            .await
            .unwrap();
        assert_eq!(revoked, 2);

        let remaining = store.list_for_user(&user_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, keep.id);

        assert_eq!(store.invalidate_all_for_user(&user_id, None).await.unwrap(), 1);
    }
}
