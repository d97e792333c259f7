/// Pothole photos
///
/// Uploads are checked for type and size, scored by the moderator, stored,
/// and then wait in `pending` until an editor approves or rejects them.

pub mod moderation;
pub mod storage;

pub use moderation::{ImageModerator, ManualReviewOnly, SightEngineModerator};
pub use storage::{DiskPhotoBackend, PhotoBackend};

use crate::{
    config::{ModerationConfig, PhotoConfig},
    db,
    error::{HoleError, HoleResult},
    metrics,
    rate_limit::{enforce, RateLimitScope, RateLimiter},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};
use uuid::Uuid;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// Most photos one bulk review may touch
pub const MAX_BULK_REVIEW: usize = 50;

/// Review state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoStatus {
    Pending,
    Approved,
    Rejected,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Pending => "pending",
            PhotoStatus::Approved => "approved",
            PhotoStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for PhotoStatus {
    type Err = HoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhotoStatus::Pending),
            "approved" => Ok(PhotoStatus::Approved),
            "rejected" => Ok(PhotoStatus::Rejected),
            other => Err(HoleError::Validation(format!("Unknown photo status: {}", other))),
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored photo record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PotholePhoto {
    pub id: String,
    pub pothole_id: String,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub moderation_score: Option<f64>,
    pub status: PhotoStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

const PHOTO_COLUMNS: &str = "id, pothole_id, storage_path, content_type, size_bytes, moderation_score, status, created_at, reviewed_by, reviewed_at";

impl PotholePhoto {
    fn from_row(row: &SqliteRow) -> HoleResult<Self> {
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");

        Ok(Self {
            id: row.get("id"),
            pothole_id: row.get("pothole_id"),
            storage_path: row.get("storage_path"),
            content_type: row.get("content_type"),
            size_bytes: row.get("size_bytes"),
            moderation_score: row.get("moderation_score"),
            status: status.parse()?,
            created_at: db::parse_timestamp(&created_at)?,
            reviewed_by: row.get("reviewed_by"),
            reviewed_at: db::parse_optional_timestamp(row.get("reviewed_at"))?,
        })
    }
}

/// Outcome of a bulk review
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReview {
    pub updated: Vec<String>,
    /// Unknown or already reviewed
    pub skipped: Vec<String>,
}

/// File extension for an accepted content type
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

/// Content type from the leading bytes, for accepted formats only
pub fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Upload and review of photos
#[derive(Clone)]
pub struct PhotoManager {
    db: SqlitePool,
    backend: Arc<dyn PhotoBackend>,
    moderator: Arc<dyn ImageModerator>,
    limiter: Arc<dyn RateLimiter>,
    max_bytes: usize,
    reject_threshold: f64,
}

impl PhotoManager {
    pub fn new(
        db: SqlitePool,
        backend: Arc<dyn PhotoBackend>,
        moderator: Arc<dyn ImageModerator>,
        limiter: Arc<dyn RateLimiter>,
        photos: &PhotoConfig,
        moderation: &ModerationConfig,
    ) -> Self {
        Self {
            db,
            backend,
            moderator,
            limiter,
            max_bytes: photos.max_bytes,
            reject_threshold: moderation.reject_threshold,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Accept a citizen photo for a pothole
    ///
    /// The declared type must be accepted and match the file's leading bytes.
    /// A moderation score above the threshold rejects the upload outright.
    pub async fn upload(
        &self,
        pothole_id: &str,
        declared_type: &str,
        data: Vec<u8>,
        ip_hash: &str,
    ) -> HoleResult<PotholePhoto> {
        enforce(self.limiter.as_ref(), RateLimitScope::Photo, ip_hash).await?;

        Uuid::parse_str(pothole_id)
            .map_err(|_| HoleError::Validation("Invalid pothole ID".to_string()))?;

        if !ALLOWED_CONTENT_TYPES.contains(&declared_type) {
            return Err(HoleError::Validation(
                "Invalid file type; JPEG, PNG or WebP only".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(HoleError::Validation("No photo provided".to_string()));
        }
        if data.len() > self.max_bytes {
            return Err(HoleError::PayloadTooLarge(format!(
                "Photo too large (max {} MB)",
                self.max_bytes / (1024 * 1024)
            )));
        }
        if sniff_content_type(&data) != Some(declared_type) {
            return Err(HoleError::Validation(
                "File contents do not match the declared type".to_string(),
            ));
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM potholes WHERE id = ?")
            .bind(pothole_id)
            .fetch_optional(&self.db)
            .await?;
        if exists.is_none() {
            return Err(HoleError::NotFound("Pothole not found".to_string()));
        }

        let moderation_score = self.moderator.score(&data, declared_type).await;
        if let Some(score) = moderation_score {
            if score > self.reject_threshold {
                metrics::PHOTO_UPLOADS_TOTAL.with_label_values(&["rejected"]).inc();
                tracing::info!("Photo for pothole {} rejected by moderation", pothole_id);
                return Err(HoleError::Rejected(
                    "Photo rejected by content moderation".to_string(),
                ));
            }
        }

        let id = Uuid::new_v4().to_string();
        let storage_path = format!("{}/{}.{}", pothole_id, id, extension_for(declared_type));
        self.backend.put(&storage_path, &data).await?;

        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO pothole_photos
                (id, pothole_id, storage_path, content_type, size_bytes, moderation_score, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(pothole_id)
        .bind(&storage_path)
        .bind(declared_type)
        .bind(data.len() as i64)
        .bind(moderation_score)
        .bind(db::timestamp(now))
        .execute(&self.db)
        .await;

        if let Err(e) = inserted {
            tracing::error!("Failed to save photo record, removing stored file: {}", e);
            if let Err(cleanup) = self.backend.delete(&storage_path).await {
                tracing::error!("Failed to remove orphaned photo {}: {}", storage_path, cleanup);
            }
            return Err(e.into());
        }

        metrics::PHOTO_UPLOADS_TOTAL
            .with_label_values(&[if moderation_score.is_some() { "accepted" } else { "unscored" }])
            .inc();

        Ok(PotholePhoto {
            id,
            pothole_id: pothole_id.to_string(),
            storage_path,
            content_type: declared_type.to_string(),
            size_bytes: data.len() as i64,
            moderation_score,
            status: PhotoStatus::Pending,
            created_at: now,
            reviewed_by: None,
            reviewed_at: None,
        })
    }

    pub async fn get(&self, id: &str) -> HoleResult<Option<PotholePhoto>> {
        let row = sqlx::query(&format!("SELECT {} FROM pothole_photos WHERE id = ?", PHOTO_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(PotholePhoto::from_row).transpose()
    }

    /// Oldest first, so the review queue drains in order
    pub async fn list(
        &self,
        status: Option<PhotoStatus>,
        limit: i64,
        offset: i64,
    ) -> HoleResult<Vec<PotholePhoto>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM pothole_photos
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at ASC
            LIMIT ? OFFSET ?
            "#,
            PHOTO_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(PotholePhoto::from_row).collect()
    }

    /// Photo record and bytes; `approved_only` hides anything not yet approved
    pub async fn open(&self, id: &str, approved_only: bool) -> HoleResult<(PotholePhoto, Vec<u8>)> {
        let photo = self
            .get(id)
            .await?
            .filter(|p| !approved_only || p.status == PhotoStatus::Approved)
            .ok_or_else(|| HoleError::NotFound("Photo not found".to_string()))?;

        let data = self
            .backend
            .get(&photo.storage_path)
            .await?
            .ok_or_else(|| HoleError::NotFound("Photo not found".to_string()))?;

        Ok((photo, data))
    }

    /// Approve or reject a pending photo; rejected files are deleted
    pub async fn review(
        &self,
        id: &str,
        decision: PhotoStatus,
        reviewer_id: &str,
    ) -> HoleResult<PotholePhoto> {
        if decision == PhotoStatus::Pending {
            return Err(HoleError::Validation(
                "A review must approve or reject".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE pothole_photos
            SET status = ?, reviewed_by = ?, reviewed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(decision.as_str())
        .bind(reviewer_id)
        .bind(db::now_timestamp())
        .bind(id)
        .execute(&self.db)
        .await?;

        let photo = self
            .get(id)
            .await?
            .ok_or_else(|| HoleError::NotFound("Photo not found".to_string()))?;

        if result.rows_affected() == 0 {
            return Err(HoleError::Conflict(format!(
                "Photo has already been {}",
                photo.status
            )));
        }

        if decision == PhotoStatus::Rejected {
            self.remove_files(std::slice::from_ref(&photo.storage_path))
                .await;
        }

        Ok(photo)
    }

    /// Apply one decision to a batch of photos
    ///
    /// Each id is reviewed on its own; unknown and already reviewed photos are
    /// skipped rather than failing the batch.
    pub async fn review_many(
        &self,
        ids: &[String],
        decision: PhotoStatus,
        reviewer_id: &str,
    ) -> HoleResult<BulkReview> {
        if ids.is_empty() || ids.len() > MAX_BULK_REVIEW {
            return Err(HoleError::Validation(format!(
                "Provide between 1 and {} photo ids",
                MAX_BULK_REVIEW
            )));
        }

        let mut seen = HashSet::new();
        let mut outcome = BulkReview::default();
        for id in ids.iter().filter(|id| seen.insert(*id)) {
            match self.review(id, decision, reviewer_id).await {
                Ok(photo) => outcome.updated.push(photo.id),
                Err(HoleError::Conflict(_) | HoleError::NotFound(_)) => {
                    outcome.skipped.push(id.clone())
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            "Bulk {} of {} photos by {} ({} skipped)",
            decision,
            outcome.updated.len(),
            reviewer_id,
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    /// Best-effort removal of stored files
    pub async fn remove_files(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.backend.delete(path).await {
                tracing::error!("Failed to delete photo file {}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{PersistentRateLimiter, RateLimitRule};
    use std::collections::HashMap;
    use tempfile::TempDir;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    struct FixedScore(Option<f64>);

    #[async_trait::async_trait]
    impl ImageModerator for FixedScore {
        async fn score(&self, _image: &[u8], _content_type: &str) -> Option<f64> {
            self.0
        }
    }

    async fn setup(score: Option<f64>) -> (SqlitePool, PhotoManager, TempDir, String) {
        let pool = db::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let limiter = PersistentRateLimiter::new(
            pool.clone(),
            HashMap::from([(RateLimitScope::Photo, RateLimitRule::per_hour(5))]),
        );
        let manager = PhotoManager::new(
            pool.clone(),
            Arc::new(DiskPhotoBackend::new(dir.path().to_path_buf())),
            Arc::new(FixedScore(score)),
            Arc::new(limiter),
            &PhotoConfig::default(),
            &ModerationConfig::default(),
        );

        let pothole_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO potholes (id, created_at, lat, lng, status, confirmed_count) VALUES (?, ?, 43.45, -80.5, 'pending', 1)",
        )
        .bind(&pothole_id)
        .bind(db::now_timestamp())
        .execute(&pool)
        .await
        .unwrap();

        (pool, manager, dir, pothole_id)
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff_content_type(JPEG), Some("image/jpeg"));
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\nrest"), Some("image/png"));
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_content_type(b"GIF89a"), None);
    }

    #[tokio::test]
    async fn test_upload_goes_to_review_queue() {
        let (_pool, manager, dir, pothole_id) = setup(Some(0.1)).await;
        let photo = manager
            .upload(&pothole_id, "image/jpeg", JPEG.to_vec(), "ip")
            .await
            .unwrap();

        assert_eq!(photo.status, PhotoStatus::Pending);
        assert_eq!(photo.moderation_score, Some(0.1));
        assert!(dir.path().join(&photo.storage_path).exists());
        assert!(matches!(
            manager.open(&photo.id, true).await,
            Err(HoleError::NotFound(_))
        ));

        let queue = manager.list(Some(PhotoStatus::Pending), 50, 0).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_moderation_rejects_above_threshold() {
        let (pool, manager, _dir, pothole_id) = setup(Some(0.8)).await;
        let err = manager
            .upload(&pothole_id, "image/jpeg", JPEG.to_vec(), "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, HoleError::Rejected(_)));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pothole_photos")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_undecided_moderation_still_accepts() {
        let (_pool, manager, _dir, pothole_id) = setup(None).await;
        let photo = manager
            .upload(&pothole_id, "image/jpeg", JPEG.to_vec(), "ip")
            .await
            .unwrap();
        assert_eq!(photo.moderation_score, None);
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let (_pool, manager, _dir, pothole_id) = setup(None).await;

        let wrong_type = manager.upload(&pothole_id, "image/gif", JPEG.to_vec(), "ip").await;
        assert!(matches!(wrong_type, Err(HoleError::Validation(_))));

        let mismatch = manager.upload(&pothole_id, "image/png", JPEG.to_vec(), "ip").await;
        assert!(matches!(mismatch, Err(HoleError::Validation(_))));

        let mut big = JPEG.to_vec();
        big.resize(5 * 1024 * 1024 + 1, 0);
        let too_big = manager.upload(&pothole_id, "image/jpeg", big, "ip").await;
        assert!(matches!(too_big, Err(HoleError::PayloadTooLarge(_))));

        let missing = manager
            .upload(&Uuid::new_v4().to_string(), "image/jpeg", JPEG.to_vec(), "ip")
            .await;
        assert!(matches!(missing, Err(HoleError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_approved_photo_is_public() {
        let (_pool, manager, _dir, pothole_id) = setup(None).await;
        let photo = manager
            .upload(&pothole_id, "image/jpeg", JPEG.to_vec(), "ip")
            .await
            .unwrap();

        manager
            .review(&photo.id, PhotoStatus::Approved, "editor-1")
            .await
            .unwrap();
        let (record, data) = manager.open(&photo.id, true).await.unwrap();
        assert_eq!(record.status, PhotoStatus::Approved);
        assert_eq!(data, JPEG);
    }

    #[tokio::test]
    async fn test_review_once() {
        let (_pool, manager, dir, pothole_id) = setup(None).await;
        let photo = manager
            .upload(&pothole_id, "image/jpeg", JPEG.to_vec(), "ip")
            .await
            .unwrap();

        let rejected = manager
            .review(&photo.id, PhotoStatus::Rejected, "editor-1")
            .await
            .unwrap();
        assert_eq!(rejected.status, PhotoStatus::Rejected);
        assert_eq!(rejected.reviewed_by.as_deref(), Some("editor-1"));
        assert!(!dir.path().join(&photo.storage_path).exists());

        let again = manager
            .review(&photo.id, PhotoStatus::Approved, "editor-2")
            .await;
        assert!(matches!(again, Err(HoleError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_review_many_skips_reviewed_and_unknown() {
        let (_pool, manager, _dir, pothole_id) = setup(None).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let photo = manager
                .upload(&pothole_id, "image/jpeg", JPEG.to_vec(), "ip")
                .await
                .unwrap();
            ids.push(photo.id);
        }
        manager
            .review(&ids[0], PhotoStatus::Rejected, "editor-1")
            .await
            .unwrap();

        let missing = Uuid::new_v4().to_string();
        let batch = vec![
            ids[0].clone(),
            ids[1].clone(),
            ids[2].clone(),
            ids[1].clone(),
            missing.clone(),
        ];
        let outcome = manager
            .review_many(&batch, PhotoStatus::Approved, "editor-2")
            .await
            .unwrap();

        assert_eq!(outcome.updated, vec![ids[1].clone(), ids[2].clone()]);
        assert_eq!(outcome.skipped, vec![ids[0].clone(), missing]);
        for id in &ids[1..] {
            assert_eq!(manager.get(id).await.unwrap().unwrap().status, PhotoStatus::Approved);
        }
    }

    #[tokio::test]
    async fn test_review_many_bounds() {
        let (_pool, manager, _dir, _) = setup(None).await;
        assert!(matches!(
            manager.review_many(&[], PhotoStatus::Approved, "e").await,
            Err(HoleError::Validation(_))
        ));

        let too_many: Vec<String> = (0..=MAX_BULK_REVIEW)
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        assert!(matches!(
            manager.review_many(&too_many, PhotoStatus::Approved, "e").await,
            Err(HoleError::Validation(_))
        ));
    }
}
