/// FillTheHole - crowd-sourced pothole reporting
///
/// Citizens report and confirm potholes on a public map; staff manage
/// reports, photos and each other through a role-gated back office.

pub mod account;
pub mod admin;
pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod photos;
pub mod potholes;
pub mod rate_limit;
pub mod server;

pub use context::AppContext;
pub use error::{HoleError, HoleResult};

use config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "fillthehole={level},tower_http={level}",
            level = logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{
        config::{SecurityConfig, ServerConfig},
        context::AppContext,
        db,
    };
    use tempfile::TempDir;

    pub const TOTP_KEY_HEX: &str =
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    pub fn config(photo_dir: &std::path::Path) -> ServerConfig {
        let mut security = SecurityConfig::new(
            "test-session-secret-that-is-long-enough-0123456789",
            TOTP_KEY_HEX,
            "test-ip-hash-secret-that-is-long-enough-0123456789",
        );
        security.secure_cookies = false;

        let mut config = ServerConfig::with_security(security);
        config.storage.data_directory = photo_dir.to_path_buf();
        config.storage.photo_directory = photo_dir.join("photos");
        config
    }

    /// Context over an in-memory database and a temporary photo directory
    pub async fn context() -> (AppContext, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("photos")).unwrap();
        let pool = db::connect_in_memory().await.unwrap();
        let ctx = AppContext::with_pool(config(dir.path()), pool).unwrap();
        (ctx, dir)
    }

    /// Migrated WAL database file with a multi-connection pool
    pub async fn file_pool(dir: &std::path::Path) -> sqlx::SqlitePool {
        let pool = db::create_pool(&dir.join("fillthehole.db"), db::DatabaseOptions::default())
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    /// Context over a file database so concurrent callers get separate connections
    pub async fn file_context() -> (AppContext, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("photos")).unwrap();
        let pool = file_pool(dir.path()).await;
        let ctx = AppContext::with_pool(config(dir.path()), pool).unwrap();
        (ctx, dir)
    }
}
