/// Report deduplication and confirmation
///
/// A report near an existing pending pothole confirms it instead of creating
/// a new row. Each client counts once per pothole; enough distinct
/// confirmations promote it to `reported`.
use crate::{
    config::ReportConfig,
    db,
    error::{HoleError, HoleResult},
    metrics,
    potholes::{
        geo::{bounding_deltas, haversine_m, validate_coordinates},
        PotholeStatus,
    },
    rate_limit::{enforce, RateLimitScope, RateLimiter},
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_ADDRESS_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Citizen report
#[derive(Debug, Clone, Deserialize)]
pub struct ReportSubmission {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// What a report did
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// New pending pothole
    Created { id: String, status: PotholeStatus },
    /// Counted against an existing pothole
    Confirmed {
        id: String,
        count: i64,
        became_reported: bool,
    },
    /// This client already confirmed the nearby pothole
    Duplicate {
        id: String,
        count: i64,
        status: PotholeStatus,
    },
}

impl ReportOutcome {
    pub fn id(&self) -> &str {
        match self {
            ReportOutcome::Created { id, .. }
            | ReportOutcome::Confirmed { id, .. }
            | ReportOutcome::Duplicate { id, .. } => id,
        }
    }

    pub fn confirmed_count(&self) -> i64 {
        match self {
            ReportOutcome::Created { .. } => 1,
            ReportOutcome::Confirmed { count, .. } | ReportOutcome::Duplicate { count, .. } => {
                *count
            }
        }
    }

    pub fn status(&self) -> PotholeStatus {
        match self {
            ReportOutcome::Created { status, .. } | ReportOutcome::Duplicate { status, .. } => {
                *status
            }
            ReportOutcome::Confirmed {
                became_reported, ..
            } => {
                if *became_reported {
                    PotholeStatus::Reported
                } else {
                    PotholeStatus::Pending
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportOutcome::Created { .. } => "created",
            ReportOutcome::Confirmed { .. } => "confirmed",
            ReportOutcome::Duplicate { .. } => "duplicate",
        }
    }
}

/// What a "filled" action did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Filled,
    /// Someone else marked it first
    AlreadyFilled,
    /// This client already marked it
    AlreadyDone,
}

impl FillOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FillOutcome::Filled => "filled",
            FillOutcome::AlreadyFilled => "already_filled",
            FillOutcome::AlreadyDone => "already_done",
        }
    }
}

#[derive(Clone)]
pub struct ReportDeduplicator {
    db: SqlitePool,
    config: ReportConfig,
    limiter: Arc<dyn RateLimiter>,
}

impl ReportDeduplicator {
    pub fn new(db: SqlitePool, config: ReportConfig, limiter: Arc<dyn RateLimiter>) -> Self {
        Self { db, config, limiter }
    }

    /// Validate, throttle, then confirm a nearby pothole or create one
    pub async fn submit_report(
        &self,
        submission: &ReportSubmission,
        ip_hash: &str,
    ) -> HoleResult<ReportOutcome> {
        let (lat, lng) = (submission.lat, submission.lng);
        validate_coordinates(lat, lng)?;
        let address = clean_text(submission.address.as_deref(), MAX_ADDRESS_LEN, "Address")?;
        let description =
            clean_text(submission.description.as_deref(), MAX_DESCRIPTION_LEN, "Description")?;

        if !self.config.geofence.contains(lat, lng) {
            return Err(HoleError::OutOfRegion);
        }

        enforce(self.limiter.as_ref(), RateLimitScope::Report, ip_hash).await?;

        // Write-locked from the first read so two nearby reports cannot both
        // miss each other and insert twice
        let mut conn = db::begin_immediate(&self.db).await?;

        let result = self
            .merge_or_insert(&mut conn, lat, lng, address, description, ip_hash)
            .await;
        let outcome = db::finish_transaction(&mut conn, result).await?;

        metrics::REPORT_OUTCOMES_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        tracing::info!(
            "Report {} for pothole {} (count {})",
            outcome.label(),
            outcome.id(),
            outcome.confirmed_count()
        );

        Ok(outcome)
    }

    async fn merge_or_insert(
        &self,
        conn: &mut SqliteConnection,
        lat: f64,
        lng: f64,
        address: Option<String>,
        description: Option<String>,
        ip_hash: &str,
    ) -> HoleResult<ReportOutcome> {
        let now = db::now_timestamp();
        let radius = self.config.merge_radius_m;
        let (dlat, dlng) = bounding_deltas(lat, radius);

        let candidates: Vec<(String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT id, lat, lng FROM potholes
            WHERE status = 'pending'
              AND lat BETWEEN ? AND ?
              AND lng BETWEEN ? AND ?
            "#,
        )
        .bind(lat - dlat)
        .bind(lat + dlat)
        .bind(lng - dlng)
        .bind(lng + dlng)
        .fetch_all(&mut *conn)
        .await?;

        let nearest = candidates
            .into_iter()
            .map(|(id, plat, plng)| (id, haversine_m(lat, lng, plat, plng)))
            .filter(|(_, distance)| *distance <= radius)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((id, _)) = nearest {
            let inserted = sqlx::query(
                r#"
                INSERT INTO pothole_confirmations (pothole_id, ip_hash, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT (pothole_id, ip_hash) DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(ip_hash)
            .bind(&now)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if inserted == 0 {
                let (count, status): (i64, String) =
                    sqlx::query_as("SELECT confirmed_count, status FROM potholes WHERE id = ?")
                        .bind(&id)
                        .fetch_one(&mut *conn)
                        .await?;
                return Ok(ReportOutcome::Duplicate {
                    id,
                    count,
                    status: status.parse()?,
                });
            }

            let (count, status): (i64, String) = sqlx::query_as(
                r#"
                UPDATE potholes
                SET confirmed_count = confirmed_count + 1,
                    status = CASE
                        WHEN status = 'pending' AND confirmed_count + 1 >= ? THEN 'reported'
                        ELSE status
                    END
                WHERE id = ?
                RETURNING confirmed_count, status
                "#,
            )
            .bind(self.config.confirmation_threshold)
            .bind(&id)
            .fetch_one(&mut *conn)
            .await?;

            return Ok(ReportOutcome::Confirmed {
                id,
                count,
                became_reported: status.parse::<PotholeStatus>()? == PotholeStatus::Reported,
            });
        }

        let id = Uuid::new_v4().to_string();
        let status = if self.config.confirmation_threshold <= 1 {
            PotholeStatus::Reported
        } else {
            PotholeStatus::Pending
        };

        sqlx::query(
            r#"
            INSERT INTO potholes (id, created_at, lat, lng, address, description, status, confirmed_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&id)
        .bind(&now)
        .bind(lat)
        .bind(lng)
        .bind(address)
        .bind(description)
        .bind(status.as_str())
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO pothole_confirmations (pothole_id, ip_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(&id)
        .bind(ip_hash)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        Ok(ReportOutcome::Created { id, status })
    }

    /// Record that a client saw the pothole filled
    ///
    /// Only a `reported` pothole can be filled. The action row makes repeats
    /// from the same client a no-op.
    pub async fn mark_filled(&self, pothole_id: &str, ip_hash: &str) -> HoleResult<FillOutcome> {
        enforce(self.limiter.as_ref(), RateLimitScope::Fill, ip_hash).await?;

        // Write-locked up front; concurrent fills queue on the busy timeout
        // instead of failing a read-to-write upgrade
        let mut conn = db::begin_immediate(&self.db).await?;
        let result = record_fill(&mut conn, pothole_id, ip_hash).await;
        let outcome = db::finish_transaction(&mut conn, result).await?;

        if outcome == FillOutcome::Filled {
            tracing::info!("Pothole {} marked filled", pothole_id);
        }
        Ok(outcome)
    }

    /// Expire pending reports created before `now - older_than`
    pub async fn expire_stale(&self, older_than: Duration) -> HoleResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE potholes SET status = 'expired', expired_at = ? WHERE status = 'pending' AND created_at < ?",
        )
        .bind(db::timestamp(now))
        .bind(db::timestamp(now - older_than))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    pub fn pending_expiry(&self) -> Duration {
        self.config.pending_expiry
    }
}

/// Commit on success, roll back on failure
///
/// A connection whose transaction state is unknown is closed rather than
/// returned to the pool.
async fn record_fill(
    conn: &mut SqliteConnection,
    pothole_id: &str,
    ip_hash: &str,
) -> HoleResult<FillOutcome> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM potholes WHERE id = ?")
        .bind(pothole_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(status) = status else {
        return Err(HoleError::NotFound("Pothole not found".to_string()));
    };

    let now = db::now_timestamp();
    let recorded = sqlx::query(
        r#"
        INSERT INTO pothole_actions (pothole_id, ip_hash, action, created_at)
        VALUES (?, ?, 'filled', ?)
        ON CONFLICT (pothole_id, ip_hash, action) DO NOTHING
        "#,
    )
    .bind(pothole_id)
    .bind(ip_hash)
    .bind(&now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if recorded == 0 {
        return Ok(FillOutcome::AlreadyDone);
    }

    match status.parse::<PotholeStatus>()? {
        PotholeStatus::Reported => {
            sqlx::query(
                "UPDATE potholes SET status = 'filled', filled_at = ? WHERE id = ? AND status = 'reported'",
            )
            .bind(&now)
            .bind(pothole_id)
            .execute(&mut *conn)
            .await?;
            Ok(FillOutcome::Filled)
        }
        PotholeStatus::Filled => Ok(FillOutcome::AlreadyFilled),
        // Rolled back with the action row, so the client may retry later
        other => Err(HoleError::Conflict(format!(
            "A {} pothole cannot be marked filled",
            other
        ))),
    }
}

fn clean_text(value: Option<&str>, max: usize, field: &str) -> HoleResult<Option<String>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.chars().count() > max {
        return Err(HoleError::Validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(Some(value.to_string()))
}
