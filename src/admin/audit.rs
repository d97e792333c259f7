/// Append-only audit trail for back-office actions
use crate::{
    db,
    error::HoleResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Stored audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub user_id: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit event to record
#[derive(Debug, Clone, Default)]
pub struct AuditEvent<'a> {
    pub user_id: Option<&'a str>,
    pub action: &'a str,
    pub resource_type: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub details: Option<serde_json::Value>,
    pub ip_hash: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    pub fn new(action: &'a str) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn by(mut self, user_id: &'a str) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn on(mut self, resource_type: &'a str, resource_id: &'a str) -> Self {
        self.resource_type = Some(resource_type);
        self.resource_id = Some(resource_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn from_ip(mut self, ip_hash: &'a str) -> Self {
        self.ip_hash = Some(ip_hash);
        self
    }
}

/// Audit log writer and reader
#[derive(Clone)]
pub struct AuditLog {
    db: SqlitePool,
}

impl AuditLog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Record an event
    ///
    /// Best-effort: a failed write is logged and never fails the caller.
    pub async fn record(&self, event: AuditEvent<'_>) {
        let details = event.details.as_ref().map(|d| d.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO admin_audit_log
                (user_id, action, resource_type, resource_id, details, ip_address, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.user_id)
        .bind(event.action)
        .bind(event.resource_type)
        .bind(event.resource_id)
        .bind(details)
        .bind(event.ip_hash)
        .bind(db::now_timestamp())
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            tracing::error!("Failed to write audit log entry {}: {}", event.action, e);
        }
    }

    /// Most recent entries first
    pub async fn list(&self, limit: i64, offset: i64) -> HoleResult<Vec<AuditLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, action, resource_type, resource_id, details, ip_address, created_at
            FROM admin_audit_log
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                let details: Option<String> = row.get("details");
                let created_at: String = row.get("created_at");
                Ok(AuditLogEntry {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    action: row.get("action"),
                    resource_type: row.get("resource_type"),
                    resource_id: row.get("resource_id"),
                    details: details.and_then(|d| serde_json::from_str(&d).ok()),
                    ip_address: row.get("ip_address"),
                    created_at: db::parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }
}
