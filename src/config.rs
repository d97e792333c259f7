/// Configuration management for FillTheHole
use crate::error::{HoleError, HoleResult};
use crate::potholes::geo::GeoBounds;
use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub sessions: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub reports: ReportConfig,
    pub photos: PhotoConfig,
    pub moderation: ModerationConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    /// Origins allowed to call the public report API from a browser
    pub allowed_origins: Vec<String>,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
    pub photo_directory: PathBuf,
    pub max_connections: u32,
}

/// Secrets and cookie policy
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// HMAC key for CSRF tokens
    pub session_secret: SecretString,
    /// 32-byte AES key, hex encoded
    pub totp_encryption_key: SecretString,
    /// HMAC key for client IP hashing
    pub ip_hash_secret: SecretString,
    /// Shared secret for creating the first admin; endpoint disabled when unset
    pub bootstrap_secret: Option<SecretString>,
    pub secure_cookies: bool,
    /// Honour X-Forwarded-For from a fronting proxy
    pub trust_forwarded_for: bool,
    pub totp_issuer: String,
}

/// Session lifetimes
///
/// Idle and absolute limits are soft timeouts enforced per request;
/// `hard_expiry` is the stored expiry of the session row.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub admin_idle: Duration,
    pub admin_absolute: Duration,
    pub staff_idle: Duration,
    pub staff_absolute: Duration,
    pub hard_expiry: Duration,
    pub mfa_challenge_ttl: Duration,
    pub trusted_device_ttl: Duration,
    pub invite_ttl: Duration,
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Coarse per-IP budget on `/api/*`
    pub api_requests_per_minute: u32,
    /// Also count `/api/*` requests in the database so limits hold across instances
    pub persistent_api_limit: bool,
    pub auth_max_failures: i64,
    pub auth_window: Duration,
    pub reports_per_hour: i64,
    pub photos_per_hour: i64,
    pub fills_per_hour: i64,
}

/// Report deduplication tunables
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub geofence: GeoBounds,
    pub merge_radius_m: f64,
    pub confirmation_threshold: i64,
    /// Pending reports older than this become expired
    pub pending_expiry: Duration,
}

/// Photo upload limits
#[derive(Debug, Clone)]
pub struct PhotoConfig {
    pub max_bytes: usize,
}

/// External image moderation
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub endpoint: String,
    pub api_user: Option<String>,
    pub api_secret: Option<SecretString>,
    pub timeout: std::time::Duration,
    pub reject_threshold: f64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 3000,
            version: env!("CARGO_PKG_VERSION").to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_directory = PathBuf::from("./data");
        Self {
            database: data_directory.join("fillthehole.sqlite"),
            photo_directory: data_directory.join("photos"),
            data_directory,
            max_connections: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            admin_idle: Duration::minutes(15),
            admin_absolute: Duration::hours(4),
            staff_idle: Duration::minutes(30),
            staff_absolute: Duration::hours(8),
            hard_expiry: Duration::hours(24),
            mfa_challenge_ttl: Duration::minutes(5),
            trusted_device_ttl: Duration::days(30),
            invite_ttl: Duration::days(7),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_minute: 10,
            persistent_api_limit: false,
            auth_max_failures: 5,
            auth_window: Duration::minutes(10),
            reports_per_hour: 10,
            photos_per_hour: 5,
            fills_per_hour: 20,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            geofence: GeoBounds::waterloo_region(),
            merge_radius_m: 50.0,
            confirmation_threshold: 3,
            pending_expiry: Duration::days(90),
        }
    }
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.sightengine.com/1.0/check.json".to_string(),
            api_user: None,
            api_secret: None,
            timeout: std::time::Duration::from_secs(5),
            reject_threshold: 0.5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            json: false,
        }
    }
}

impl SecurityConfig {
    /// Security section with default cookie policy
    pub fn new(
        session_secret: impl Into<String>,
        totp_encryption_key_hex: impl Into<String>,
        ip_hash_secret: impl Into<String>,
    ) -> Self {
        Self {
            session_secret: SecretString::from(session_secret.into()),
            totp_encryption_key: SecretString::from(totp_encryption_key_hex.into()),
            ip_hash_secret: SecretString::from(ip_hash_secret.into()),
            bootstrap_secret: None,
            secure_cookies: true,
            trust_forwarded_for: false,
            totp_issuer: "FillTheHole".to_string(),
        }
    }
}

impl ServerConfig {
    /// Configuration with the given secrets and defaults everywhere else
    pub fn with_security(security: SecurityConfig) -> Self {
        Self {
            service: ServiceConfig::default(),
            storage: StorageConfig::default(),
            security,
            sessions: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            reports: ReportConfig::default(),
            photos: PhotoConfig::default(),
            moderation: ModerationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> HoleResult<Self> {
        dotenv::dotenv().ok();

        let mut service = ServiceConfig::default();
        service.hostname = env::var("FTH_HOSTNAME").unwrap_or(service.hostname);
        service.port = env_parse("FTH_PORT", service.port)?;
        service.allowed_origins = env::var("FTH_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let data_directory: PathBuf = env::var("FTH_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let storage = StorageConfig {
            database: env::var("FTH_DATABASE_LOCATION")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("fillthehole.sqlite")),
            photo_directory: env::var("FTH_PHOTO_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("photos")),
            max_connections: env_parse("FTH_DB_MAX_CONNECTIONS", 10)?,
            data_directory,
        };

        let session_secret = env::var("ADMIN_SESSION_SECRET")
            .map_err(|_| HoleError::Validation("ADMIN_SESSION_SECRET required".to_string()))?;
        let totp_key = env::var("TOTP_ENCRYPTION_KEY")
            .map_err(|_| HoleError::Validation("TOTP_ENCRYPTION_KEY required".to_string()))?;
        let ip_secret = env::var("IP_HASH_SECRET")
            .map_err(|_| HoleError::Validation("IP_HASH_SECRET required".to_string()))?;

        let mut security = SecurityConfig::new(session_secret, totp_key, ip_secret);
        security.bootstrap_secret = env::var("ADMIN_BOOTSTRAP_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        security.secure_cookies = env_parse("FTH_SECURE_COOKIES", true)?;
        security.trust_forwarded_for = env_parse("FTH_TRUST_FORWARDED_FOR", false)?;
        if let Ok(issuer) = env::var("FTH_TOTP_ISSUER") {
            security.totp_issuer = issuer;
        }

        let mut sessions = SessionConfig::default();
        sessions.admin_idle = env_minutes("FTH_ADMIN_IDLE_MINUTES", sessions.admin_idle)?;
        sessions.admin_absolute =
            env_minutes("FTH_ADMIN_ABSOLUTE_MINUTES", sessions.admin_absolute)?;
        sessions.staff_idle = env_minutes("FTH_STAFF_IDLE_MINUTES", sessions.staff_idle)?;
        sessions.staff_absolute =
            env_minutes("FTH_STAFF_ABSOLUTE_MINUTES", sessions.staff_absolute)?;

        let mut rate_limit = RateLimitConfig::default();
        rate_limit.enabled = env_parse("FTH_RATE_LIMIT_ENABLED", rate_limit.enabled)?;
        rate_limit.api_requests_per_minute =
            env_parse("FTH_API_REQUESTS_PER_MINUTE", rate_limit.api_requests_per_minute)?;
        rate_limit.persistent_api_limit =
            env_parse("FTH_PERSISTENT_API_LIMIT", rate_limit.persistent_api_limit)?;
        rate_limit.reports_per_hour =
            env_parse("FTH_REPORTS_PER_HOUR", rate_limit.reports_per_hour)?;
        rate_limit.photos_per_hour = env_parse("FTH_PHOTOS_PER_HOUR", rate_limit.photos_per_hour)?;
        rate_limit.fills_per_hour = env_parse("FTH_FILLS_PER_HOUR", rate_limit.fills_per_hour)?;

        let mut reports = ReportConfig::default();
        reports.merge_radius_m = env_parse("FTH_MERGE_RADIUS_METERS", reports.merge_radius_m)?;
        reports.confirmation_threshold =
            env_parse("FTH_CONFIRMATION_THRESHOLD", reports.confirmation_threshold)?;
        reports.pending_expiry = Duration::days(env_parse("FTH_PENDING_EXPIRY_DAYS", 90)?);
        if let Ok(raw) = env::var("FTH_GEOFENCE") {
            reports.geofence = GeoBounds::from_str(&raw)?;
        }

        let mut photos = PhotoConfig::default();
        photos.max_bytes = env_parse("FTH_PHOTO_MAX_BYTES", photos.max_bytes)?;

        let mut moderation = ModerationConfig::default();
        moderation.api_user = env::var("SIGHTENGINE_API_USER").ok();
        moderation.api_secret = env::var("SIGHTENGINE_API_SECRET")
            .ok()
            .map(SecretString::from);
        moderation.timeout = std::time::Duration::from_secs(env_parse(
            "FTH_MODERATION_TIMEOUT_SECS",
            moderation.timeout.as_secs(),
        )?);

        let logging = LoggingConfig {
            level: env::var("FTH_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string()),
            json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };

        Ok(Self {
            service,
            storage,
            security,
            sessions,
            rate_limit,
            reports,
            photos,
            moderation,
            logging,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> HoleResult<()> {
        if self.security.session_secret.expose_secret().len() < 32 {
            return Err(HoleError::Validation(
                "ADMIN_SESSION_SECRET must be at least 32 characters".to_string(),
            ));
        }

        let key = self.security.totp_encryption_key.expose_secret();
        if key.len() != 64 || hex::decode(key).is_err() {
            return Err(HoleError::Validation(
                "TOTP_ENCRYPTION_KEY must be 64 hex characters (32 bytes)".to_string(),
            ));
        }

        if self.security.ip_hash_secret.expose_secret().len() < 16 {
            return Err(HoleError::Validation(
                "IP_HASH_SECRET must be at least 16 characters".to_string(),
            ));
        }

        if let Some(secret) = &self.security.bootstrap_secret {
            if secret.expose_secret().len() < 16 {
                return Err(HoleError::Validation(
                    "ADMIN_BOOTSTRAP_SECRET must be at least 16 characters".to_string(),
                ));
            }
        }

        let s = &self.sessions;
        if s.admin_idle >= s.staff_idle || s.admin_absolute >= s.staff_absolute {
            return Err(HoleError::Validation(
                "Admin session timeouts must be shorter than editor/viewer timeouts".to_string(),
            ));
        }
        if s.admin_idle > s.admin_absolute || s.staff_idle > s.staff_absolute {
            return Err(HoleError::Validation(
                "Idle timeout cannot exceed absolute timeout".to_string(),
            ));
        }

        if self.reports.confirmation_threshold < 1 {
            return Err(HoleError::Validation(
                "Confirmation threshold must be at least 1".to_string(),
            ));
        }
        if self.reports.merge_radius_m.is_nan() || self.reports.merge_radius_m <= 0.0 {
            return Err(HoleError::Validation(
                "Merge radius must be positive".to_string(),
            ));
        }

        if self.rate_limit.api_requests_per_minute == 0 {
            return Err(HoleError::Validation(
                "API rate limit must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> HoleResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| HoleError::Validation(format!("Invalid value for {}", key))),
        Err(_) => Ok(default),
    }
}

fn env_minutes(key: &str, default: Duration) -> HoleResult<Duration> {
    env_parse(key, default.num_minutes()).map(Duration::minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn config() -> ServerConfig {
        ServerConfig::with_security(SecurityConfig::new(
            "a-session-secret-that-is-long-enough!!",
            KEY_HEX,
            "ip-hash-secret-value",
        ))
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_moderation_call_is_bounded() {
        let moderation = ModerationConfig::default();
        assert_eq!(moderation.timeout, std::time::Duration::from_secs(5));
        assert!(moderation.api_user.is_none());
    }

    #[test]
    fn test_short_session_secret_rejected() {
        let mut cfg = config();
        cfg.security.session_secret = SecretString::from("short".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_totp_key_rejected() {
        let mut cfg = config();
        cfg.security.totp_encryption_key = SecretString::from("zz".repeat(32));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_admin_timeouts_must_be_stricter() {
        let mut cfg = config();
        cfg.sessions.admin_idle = Duration::minutes(30);
        assert!(cfg.validate().is_err());
    }
}
