/// Application context and dependency injection
use crate::{
    account::AccountManager,
    admin::{AdminUserManager, AuditLog, InviteCodeManager},
    auth::{AuthAttemptLog, CsrfGuard, MfaService, RequestGate, SessionStore},
    config::ServerConfig,
    crypto::CredentialVault,
    db,
    error::{HoleError, HoleResult},
    photos::{
        DiskPhotoBackend, ImageModerator, ManualReviewOnly, PhotoManager, SightEngineModerator,
    },
    potholes::{PotholeManager, ReportDeduplicator},
    rate_limit::{
        rules_from_config, LayeredRateLimiter, MemoryRateLimiter, PersistentRateLimiter,
        RateLimitScope, RateLimiter,
    },
};
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc, time::Instant};

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub vault: Arc<CredentialVault>,
    // Admin authentication
    pub gate: RequestGate,
    pub sessions: Arc<SessionStore>,
    pub mfa: Arc<MfaService>,
    pub accounts: Arc<AccountManager>,
    // Back office
    pub users: Arc<AdminUserManager>,
    pub invites: Arc<InviteCodeManager>,
    pub audit: Arc<AuditLog>,
    // Public reports
    pub reports: Arc<ReportDeduplicator>,
    pub potholes: Arc<PotholeManager>,
    pub photos: Arc<PhotoManager>,
    // Rate limiting
    pub api_limiter: Arc<dyn RateLimiter>,
    pub memory_limiter: Arc<MemoryRateLimiter>,
    pub action_limiter: Arc<PersistentRateLimiter>,
    pub started_at: Instant,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> HoleResult<Self> {
        // Validate configuration
        config.validate()?;

        // Create data directories if they don't exist
        Self::ensure_directories(&config).await?;

        let db = db::create_pool(
            &config.storage.database,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                ..db::DatabaseOptions::default()
            },
        )
        .await?;

        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        Self::with_pool(config, db)
    }

    /// Wire services over an existing, migrated pool
    pub fn with_pool(config: ServerConfig, db: SqlitePool) -> HoleResult<Self> {
        config.validate()?;

        let security = &config.security;
        let vault = Arc::new(CredentialVault::new(
            security.totp_encryption_key.clone(),
            security.ip_hash_secret.clone(),
        ));

        // Auth services
        let sessions = SessionStore::new(db.clone(), config.sessions.clone());
        let csrf = CsrfGuard::new(security.session_secret.clone());
        let attempts = AuthAttemptLog::new(
            db.clone(),
            config.rate_limit.auth_max_failures,
            config.rate_limit.auth_window,
        );
        let mfa = MfaService::new(
            db.clone(),
            vault.clone(),
            attempts.clone(),
            config.sessions.clone(),
            security.totp_issuer.clone(),
        );
        let invites = InviteCodeManager::new(db.clone(), config.sessions.invite_ttl);
        let audit = AuditLog::new(db.clone());
        let accounts = AccountManager::new(
            db.clone(),
            vault.clone(),
            sessions.clone(),
            csrf.clone(),
            mfa.clone(),
            attempts,
            invites.clone(),
            audit.clone(),
            security.bootstrap_secret.clone(),
        );
        let gate = RequestGate::new(sessions.clone(), csrf);

        // Rate limiters
        let rules = if config.rate_limit.enabled {
            rules_from_config(&config.rate_limit)
        } else {
            HashMap::new()
        };
        let scoped = |scopes: &[RateLimitScope]| -> HashMap<_, _> {
            rules
                .iter()
                .filter(|(scope, _)| scopes.contains(scope))
                .map(|(scope, rule)| (*scope, *rule))
                .collect()
        };

        let memory_limiter = Arc::new(MemoryRateLimiter::new(&scoped(&[RateLimitScope::Api])));
        let action_limiter = Arc::new(PersistentRateLimiter::new(
            db.clone(),
            scoped(&[
                RateLimitScope::Report,
                RateLimitScope::Photo,
                RateLimitScope::Fill,
            ]),
        ));
        let durable_api = config.rate_limit.persistent_api_limit.then(|| {
            PersistentRateLimiter::new(db.clone(), scoped(&[RateLimitScope::Api]))
        });
        let api_limiter: Arc<dyn RateLimiter> =
            Arc::new(LayeredRateLimiter::new(memory_limiter.clone(), durable_api));

        // Reports and photos
        let reports = ReportDeduplicator::new(
            db.clone(),
            config.reports.clone(),
            action_limiter.clone(),
        );
        let moderator: Arc<dyn ImageModerator> =
            match SightEngineModerator::from_config(&config.moderation) {
                Some(moderator) => Arc::new(moderator),
                None => {
                    tracing::warn!("Image moderation not configured; photos go to manual review");
                    Arc::new(ManualReviewOnly)
                }
            };
        let photos = PhotoManager::new(
            db.clone(),
            Arc::new(DiskPhotoBackend::new(config.storage.photo_directory.clone())),
            moderator,
            action_limiter.clone(),
            &config.photos,
            &config.moderation,
        );

        Ok(Self {
            users: Arc::new(AdminUserManager::new(db.clone())),
            potholes: Arc::new(PotholeManager::new(db.clone())),
            config: Arc::new(config),
            db,
            vault,
            gate,
            sessions: Arc::new(sessions),
            mfa: Arc::new(mfa),
            accounts: Arc::new(accounts),
            invites: Arc::new(invites),
            audit: Arc::new(audit),
            reports: Arc::new(reports),
            photos: Arc::new(photos),
            api_limiter,
            memory_limiter,
            action_limiter,
            started_at: Instant::now(),
        })
    }

    /// Ensure required directories exist
    async fn ensure_directories(config: &ServerConfig) -> HoleResult<()> {
        let dirs = vec![
            &config.storage.data_directory,
            &config.storage.photo_directory,
        ];

        for dir in dirs {
            if !dir.exists() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    HoleError::Internal(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
