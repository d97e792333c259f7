/// Pothole reports
///
/// Citizen reports start `pending`, become `reported` once enough distinct
/// clients confirm them, and end `filled` or `expired`.

pub mod dedup;
pub mod geo;

pub use dedup::{FillOutcome, ReportDeduplicator, ReportOutcome, ReportSubmission};
pub use geo::GeoBounds;

use crate::{
    db,
    error::{HoleError, HoleResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Pothole lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PotholeStatus {
    Pending,
    Reported,
    Filled,
    Expired,
}

impl PotholeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PotholeStatus::Pending => "pending",
            PotholeStatus::Reported => "reported",
            PotholeStatus::Filled => "filled",
            PotholeStatus::Expired => "expired",
        }
    }

    /// Legal transitions: pending to reported to filled, and pending or
    /// reported to expired
    pub fn can_transition_to(&self, next: PotholeStatus) -> bool {
        matches!(
            (self, next),
            (PotholeStatus::Pending, PotholeStatus::Reported)
                | (PotholeStatus::Reported, PotholeStatus::Filled)
                | (PotholeStatus::Pending, PotholeStatus::Expired)
                | (PotholeStatus::Reported, PotholeStatus::Expired)
        )
    }
}

impl FromStr for PotholeStatus {
    type Err = HoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PotholeStatus::Pending),
            "reported" => Ok(PotholeStatus::Reported),
            "filled" => Ok(PotholeStatus::Filled),
            "expired" => Ok(PotholeStatus::Expired),
            other => Err(HoleError::Validation(format!("Unknown status: {}", other))),
        }
    }
}

impl fmt::Display for PotholeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored pothole
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pothole {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub description: Option<String>,
    pub status: PotholeStatus,
    pub confirmed_count: i64,
    pub filled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Most ids one watchlist lookup may name
pub const MAX_WATCHLIST_IDS: usize = 50;

/// Public view of a pothole a citizen is following
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedPothole {
    pub id: String,
    pub address: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub status: PotholeStatus,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl From<Pothole> for WatchedPothole {
    fn from(p: Pothole) -> Self {
        Self {
            id: p.id,
            address: p.address,
            lat: p.lat,
            lng: p.lng,
            status: p.status,
            created_at: p.created_at,
            filled_at: p.filled_at,
        }
    }
}

/// Parse `?ids=` as 1 to [`MAX_WATCHLIST_IDS`] comma-separated UUIDs
///
/// Ids come back in canonical hyphenated form, first occurrence kept.
pub fn parse_watchlist_ids(raw: &str) -> HoleResult<Vec<String>> {
    let invalid = || {
        HoleError::Validation(format!(
            "Provide 1 to {} comma-separated UUIDs in ?ids=",
            MAX_WATCHLIST_IDS
        ))
    };

    let parts: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if parts.is_empty() || parts.len() > MAX_WATCHLIST_IDS {
        return Err(invalid());
    }

    let mut ids: Vec<String> = Vec::with_capacity(parts.len());
    for part in parts {
        let id = Uuid::parse_str(part).map_err(|_| invalid())?.to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

pub(crate) const POTHOLE_COLUMNS: &str =
    "id, created_at, lat, lng, address, description, status, confirmed_count, filled_at, expired_at";

impl Pothole {
    pub(crate) fn from_row(row: &SqliteRow) -> HoleResult<Self> {
        let created_at: String = row.get("created_at");
        let status: String = row.get("status");

        Ok(Self {
            id: row.get("id"),
            created_at: db::parse_timestamp(&created_at)?,
            lat: row.get("lat"),
            lng: row.get("lng"),
            address: row.get("address"),
            description: row.get("description"),
            status: status.parse()?,
            confirmed_count: row.get("confirmed_count"),
            filled_at: db::parse_optional_timestamp(row.get("filled_at"))?,
            expired_at: db::parse_optional_timestamp(row.get("expired_at"))?,
        })
    }
}

/// Back-office access to potholes
#[derive(Clone)]
pub struct PotholeManager {
    db: SqlitePool,
}

impl PotholeManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> HoleResult<Option<Pothole>> {
        let row = sqlx::query(&format!("SELECT {} FROM potholes WHERE id = ?", POTHOLE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(Pothole::from_row).transpose()
    }

    /// Newest first, optionally filtered by status
    pub async fn list(
        &self,
        status: Option<PotholeStatus>,
        limit: i64,
        offset: i64,
    ) -> HoleResult<Vec<Pothole>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM potholes
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
            POTHOLE_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(Pothole::from_row).collect()
    }

    /// Public map feed: everything past `pending`, newest first
    pub async fn public_feed(&self) -> HoleResult<Vec<Pothole>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM potholes WHERE status != 'pending' ORDER BY created_at DESC",
            POTHOLE_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(Pothole::from_row).collect()
    }

    /// Current state of the named potholes; unknown ids are left out
    pub async fn watchlist(&self, ids: &[String]) -> HoleResult<Vec<WatchedPothole>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM potholes WHERE id IN ({}) ORDER BY created_at DESC",
            POTHOLE_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.db).await?;

        rows.iter()
            .map(|row| Pothole::from_row(row).map(WatchedPothole::from))
            .collect()
    }

    /// Move a pothole to a new status if the transition is legal
    ///
    /// The update is conditional on the status read, so a concurrent change
    /// turns into a conflict rather than an illegal jump.
    pub async fn set_status(&self, id: &str, next: PotholeStatus) -> HoleResult<Pothole> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| HoleError::NotFound("Pothole not found".to_string()))?;

        if !current.status.can_transition_to(next) {
            return Err(HoleError::Validation(format!(
                "Cannot move a {} pothole to {}",
                current.status, next
            )));
        }

        let now = db::now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE potholes
            SET status = ?,
                filled_at = CASE WHEN ? = 'filled' THEN ? ELSE filled_at END,
                expired_at = CASE WHEN ? = 'expired' THEN ? ELSE expired_at END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(next.as_str())
        .bind(&now)
        .bind(next.as_str())
        .bind(&now)
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HoleError::Conflict(
                "Pothole status changed concurrently".to_string(),
            ));
        }

        self.get(id)
            .await?
            .ok_or_else(|| HoleError::NotFound("Pothole not found".to_string()))
    }

    /// Delete a pothole with its confirmations, actions and photo rows
    ///
    /// Returns the storage paths of the deleted photos.
    pub async fn delete(&self, id: &str) -> HoleResult<Vec<String>> {
        let mut conn = db::begin_immediate(&self.db).await?;
        let result = delete_with_photos(&mut conn, id).await;
        db::finish_transaction(&mut conn, result).await
    }

    pub async fn count_by_status(&self) -> HoleResult<Vec<(PotholeStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM potholes GROUP BY status ORDER BY status")
                .fetch_all(&self.db)
                .await?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, count)))
            .collect()
    }
}

async fn delete_with_photos(conn: &mut SqliteConnection, id: &str) -> HoleResult<Vec<String>> {
    let paths: Vec<String> =
        sqlx::query_scalar("SELECT storage_path FROM pothole_photos WHERE pothole_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;

    let result = sqlx::query("DELETE FROM potholes WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(HoleError::NotFound("Pothole not found".to_string()));
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn insert(pool: &SqlitePool, id: &str, status: PotholeStatus) {
        sqlx::query(
            "INSERT INTO potholes (id, created_at, lat, lng, status, confirmed_count) VALUES (?, ?, 43.45, -80.5, ?, 1)",
        )
        .bind(id)
        .bind(db::now_timestamp())
        .bind(status.as_str())
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn test_transition_table() {
        use PotholeStatus::*;
        assert!(Pending.can_transition_to(Reported));
        assert!(Reported.can_transition_to(Filled));
        assert!(Pending.can_transition_to(Expired));
        assert!(Reported.can_transition_to(Expired));

        assert!(!Pending.can_transition_to(Filled));
        assert!(!Filled.can_transition_to(Reported));
        assert!(!Expired.can_transition_to(Pending));
        assert!(!Filled.can_transition_to(Filled));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("reported".parse::<PotholeStatus>().unwrap(), PotholeStatus::Reported);
        assert!("flagged".parse::<PotholeStatus>().is_err());
    }

    #[tokio::test]
    async fn test_set_status_enforces_transitions() {
        let pool = db::connect_in_memory().await.unwrap();
        let manager = PotholeManager::new(pool.clone());
        insert(&pool, "p1", PotholeStatus::Pending).await;

        assert!(manager.set_status("p1", PotholeStatus::Filled).await.is_err());

        let reported = manager.set_status("p1", PotholeStatus::Reported).await.unwrap();
        assert_eq!(reported.status, PotholeStatus::Reported);

        let filled = manager.set_status("p1", PotholeStatus::Filled).await.unwrap();
        assert!(filled.filled_at.is_some());

        assert!(matches!(
            manager.set_status("missing", PotholeStatus::Expired).await,
            Err(HoleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let pool = db::connect_in_memory().await.unwrap();
        let manager = PotholeManager::new(pool.clone());
        insert(&pool, "a", PotholeStatus::Pending).await;
        insert(&pool, "b", PotholeStatus::Reported).await;

        assert_eq!(manager.list(None, 50, 0).await.unwrap().len(), 2);
        let reported = manager
            .list(Some(PotholeStatus::Reported), 50, 0)
            .await
            .unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].id, "b");

        let feed = manager.public_feed().await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id, "b");

        manager.delete("a").await.unwrap();
        assert!(manager.get("a").await.unwrap().is_none());
        assert!(matches!(manager.delete("a").await, Err(HoleError::NotFound(_))));
    }

    #[test]
    fn test_parse_watchlist_ids() {
        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();

        let raw = format!(" {} ,{},,{}", a.to_uppercase(), b, a);
        let parsed = parse_watchlist_ids(&raw).unwrap();
        assert_eq!(parsed, vec![a.clone(), b]);

        assert!(parse_watchlist_ids("").is_err());
        assert!(parse_watchlist_ids(" , ").is_err());
        assert!(parse_watchlist_ids(&format!("{},not-a-uuid", a)).is_err());

        let too_many = vec![a; MAX_WATCHLIST_IDS + 1].join(",");
        assert!(matches!(parse_watchlist_ids(&too_many), Err(HoleError::Validation(_))));
    }

    #[tokio::test]
    async fn test_watchlist_returns_known_ids_only() {
        let pool = db::connect_in_memory().await.unwrap();
        let manager = PotholeManager::new(pool.clone());
        let pending = Uuid::new_v4().to_string();
        let filled = Uuid::new_v4().to_string();
        insert(&pool, &pending, PotholeStatus::Pending).await;
        insert(&pool, &filled, PotholeStatus::Reported).await;
        manager.set_status(&filled, PotholeStatus::Filled).await.unwrap();

        let ids = vec![pending.clone(), filled.clone(), Uuid::new_v4().to_string()];
        let watched = manager.watchlist(&ids).await.unwrap();
        assert_eq!(watched.len(), 2);

        let filled_entry = watched.iter().find(|p| p.id == filled).unwrap();
        assert_eq!(filled_entry.status, PotholeStatus::Filled);
        assert!(filled_entry.filled_at.is_some());

        let json = serde_json::to_value(&watched[0]).unwrap();
        assert!(json.get("confirmedCount").is_none());
        assert!(json.get("description").is_none());

        assert!(manager.watchlist(&[]).await.unwrap().is_empty());
    }
}
