/// Rate Limiting System
///
/// A [`RateLimiter`] decides per scope and client key. The in-memory limiter
/// is a per-process fast path; the persistent limiter counts events in the
/// database so budgets hold across restarts and instances.
use crate::{
    auth::ClientInfo,
    config::RateLimitConfig,
    context::AppContext,
    db,
    error::{HoleError, HoleResult},
    metrics,
};
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter,
};
use sqlx::SqlitePool;
use std::{collections::HashMap, num::NonZeroU32, sync::Arc, time::Duration};

/// What is being limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// Any request under `/api/`
    Api,
    Report,
    Photo,
    Fill,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Api => "api",
            RateLimitScope::Report => "report",
            RateLimitScope::Photo => "photo",
            RateLimitScope::Fill => "fill",
        }
    }
}

/// `max` events per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn per_minute(max: u32) -> Self {
        Self {
            max,
            window: Duration::from_secs(60),
        }
    }

    pub fn per_hour(max: u32) -> Self {
        Self {
            max,
            window: Duration::from_secs(3600),
        }
    }
}

/// Limiter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    /// Turn a denial into a 429 and count it
    pub fn into_result(self, scope: RateLimitScope) -> HoleResult<()> {
        match self {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited { retry_after } => {
                metrics::RATE_LIMIT_REJECTIONS_TOTAL
                    .with_label_values(&[scope.as_str()])
                    .inc();
                Err(HoleError::RateLimitExceeded { retry_after })
            }
        }
    }
}

/// Pluggable limiter
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one event for `key` in `scope` and decide whether it may proceed
    async fn check(&self, scope: RateLimitScope, key: &str) -> HoleResult<RateLimitDecision>;
}

/// Check and convert to an error in one step
pub async fn enforce(
    limiter: &dyn RateLimiter,
    scope: RateLimitScope,
    key: &str,
) -> HoleResult<()> {
    limiter.check(scope, key).await?.into_result(scope)
}

/// Rules for the action scopes and the coarse API budget
pub fn rules_from_config(config: &RateLimitConfig) -> HashMap<RateLimitScope, RateLimitRule> {
    let per_hour = |n: i64| RateLimitRule::per_hour(u32::try_from(n.max(1)).unwrap_or(u32::MAX));

    HashMap::from([
        (
            RateLimitScope::Api,
            RateLimitRule::per_minute(config.api_requests_per_minute.max(1)),
        ),
        (RateLimitScope::Report, per_hour(config.reports_per_hour)),
        (RateLimitScope::Photo, per_hour(config.photos_per_hour)),
        (RateLimitScope::Fill, per_hour(config.fills_per_hour)),
    ])
}

// ========== In-memory ==========

/// Keyed `governor` limiters, one per scope
pub struct MemoryRateLimiter {
    limiters: HashMap<RateLimitScope, DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl MemoryRateLimiter {
    pub fn new(rules: &HashMap<RateLimitScope, RateLimitRule>) -> Self {
        let limiters = rules
            .iter()
            .filter_map(|(scope, rule)| {
                let burst = NonZeroU32::new(rule.max)?;
                let quota = Quota::with_period(rule.window / rule.max)?.allow_burst(burst);
                Some((*scope, GovernorLimiter::keyed(quota)))
            })
            .collect();

        Self {
            limiters,
            clock: DefaultClock::default(),
        }
    }

    /// Drop state for keys whose budget has fully replenished
    pub fn sweep(&self) -> usize {
        let mut tracked = 0;
        for limiter in self.limiters.values() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
            tracked += limiter.len();
        }
        tracked
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, scope: RateLimitScope, key: &str) -> HoleResult<RateLimitDecision> {
        let Some(limiter) = self.limiters.get(&scope) else {
            return Ok(RateLimitDecision::Allowed);
        };

        match limiter.check_key(&key.to_string()) {
            Ok(()) => Ok(RateLimitDecision::Allowed),
            Err(not_until) => Ok(RateLimitDecision::Limited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            }),
        }
    }
}

// ========== Persistent ==========

/// Event-counting limiter over `api_rate_limit_events`
///
/// The count and the insert are one statement, so concurrent requests cannot
/// both take the last slot.
#[derive(Clone)]
pub struct PersistentRateLimiter {
    db: SqlitePool,
    rules: HashMap<RateLimitScope, RateLimitRule>,
}

impl PersistentRateLimiter {
    pub fn new(db: SqlitePool, rules: HashMap<RateLimitScope, RateLimitRule>) -> Self {
        Self { db, rules }
    }

    async fn try_record(
        &self,
        scope: RateLimitScope,
        key: &str,
        rule: RateLimitRule,
    ) -> HoleResult<RateLimitDecision> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(rule.window)
            .map_err(|e| HoleError::Internal(format!("Invalid rate limit window: {}", e)))?;
        let since = db::timestamp(now - window);

        let inserted = sqlx::query(
            r#"
            INSERT INTO api_rate_limit_events (ip_hash, scope, created_at)
            SELECT ?, ?, ?
            WHERE (
                SELECT COUNT(*) FROM api_rate_limit_events
                WHERE ip_hash = ? AND scope = ? AND created_at > ?
            ) < ?
            "#,
        )
        .bind(key)
        .bind(scope.as_str())
        .bind(db::timestamp(now))
        .bind(key)
        .bind(scope.as_str())
        .bind(&since)
        .bind(i64::from(rule.max))
        .execute(&self.db)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(RateLimitDecision::Allowed);
        }

        let oldest: Option<String> = sqlx::query_scalar(
            "SELECT MIN(created_at) FROM api_rate_limit_events WHERE ip_hash = ? AND scope = ? AND created_at > ?",
        )
        .bind(key)
        .bind(scope.as_str())
        .bind(&since)
        .fetch_one(&self.db)
        .await?;

        let retry_after = db::parse_optional_timestamp(oldest)?
            .and_then(|oldest| (oldest + window - now).to_std().ok())
            .unwrap_or(rule.window);

        Ok(RateLimitDecision::Limited { retry_after })
    }

    /// Delete events older than the longest window
    pub async fn purge_expired(&self) -> HoleResult<u64> {
        let longest = self
            .rules
            .values()
            .map(|r| r.window)
            .max()
            .unwrap_or(Duration::from_secs(3600));
        let window = chrono::Duration::from_std(longest)
            .map_err(|e| HoleError::Internal(format!("Invalid rate limit window: {}", e)))?;

        let result = sqlx::query("DELETE FROM api_rate_limit_events WHERE created_at <= ?")
            .bind(db::timestamp(Utc::now() - window))
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLimiter for PersistentRateLimiter {
    /// A failed lookup lets the request through
    async fn check(&self, scope: RateLimitScope, key: &str) -> HoleResult<RateLimitDecision> {
        let Some(rule) = self.rules.get(&scope).copied() else {
            return Ok(RateLimitDecision::Allowed);
        };

        match self.try_record(scope, key, rule).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                tracing::warn!(
                    "Persistent rate limit for {} unavailable, allowing request: {}",
                    scope.as_str(),
                    e
                );
                Ok(RateLimitDecision::Allowed)
            }
        }
    }
}

// ========== Layered ==========

/// Memory first, then the database when configured
pub struct LayeredRateLimiter {
    fast: Arc<MemoryRateLimiter>,
    durable: Option<PersistentRateLimiter>,
}

impl LayeredRateLimiter {
    pub fn new(fast: Arc<MemoryRateLimiter>, durable: Option<PersistentRateLimiter>) -> Self {
        Self { fast, durable }
    }
}

#[async_trait]
impl RateLimiter for LayeredRateLimiter {
    async fn check(&self, scope: RateLimitScope, key: &str) -> HoleResult<RateLimitDecision> {
        let decision = self.fast.check(scope, key).await?;
        if decision != RateLimitDecision::Allowed {
            return Ok(decision);
        }

        match &self.durable {
            Some(durable) => durable.check(scope, key).await,
            None => Ok(decision),
        }
    }
}

/// Coarse per-client budget on `/api/*`
pub async fn api_rate_limit_middleware(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, HoleError> {
    if !ctx.config.rate_limit.enabled || !request.uri().path().starts_with("/api/") {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let client =
        ClientInfo::from_parts(&parts, &ctx.vault, ctx.config.security.trust_forwarded_for)?;

    if let Err(e) = enforce(ctx.api_limiter.as_ref(), RateLimitScope::Api, &client.ip_hash).await {
        tracing::debug!("API rate limit hit on {}", parts.uri.path());
        return Err(e);
    }

    Ok(next.run(Request::from_parts(parts, body)).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(max: u32) -> HashMap<RateLimitScope, RateLimitRule> {
        HashMap::from([
            (RateLimitScope::Api, RateLimitRule::per_minute(max)),
            (RateLimitScope::Report, RateLimitRule::per_hour(max)),
        ])
    }

    #[tokio::test]
    async fn test_memory_limiter_burst_then_limit() {
        let limiter = MemoryRateLimiter::new(&rules(3));

        for _ in 0..3 {
            assert_eq!(
                limiter.check(RateLimitScope::Api, "client").await.unwrap(),
                RateLimitDecision::Allowed
            );
        }
        assert!(matches!(
            limiter.check(RateLimitScope::Api, "client").await.unwrap(),
            RateLimitDecision::Limited { .. }
        ));

        // Keys and scopes are independent
        assert_eq!(
            limiter.check(RateLimitScope::Api, "other").await.unwrap(),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check(RateLimitScope::Report, "client").await.unwrap(),
            RateLimitDecision::Allowed
        );
        // Unconfigured scopes pass
        assert_eq!(
            limiter.check(RateLimitScope::Fill, "client").await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_memory_sweep_keeps_active_keys() {
        let limiter = MemoryRateLimiter::new(&rules(3));
        limiter.check(RateLimitScope::Api, "a").await.unwrap();
        assert!(limiter.sweep() <= 1);
    }

    #[tokio::test]
    async fn test_persistent_limiter_counts_in_database() {
        let pool = db::connect_in_memory().await.unwrap();
        let limiter = PersistentRateLimiter::new(pool.clone(), rules(2));

        assert_eq!(
            limiter.check(RateLimitScope::Report, "ip").await.unwrap(),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check(RateLimitScope::Report, "ip").await.unwrap(),
            RateLimitDecision::Allowed
        );
        match limiter.check(RateLimitScope::Report, "ip").await.unwrap() {
            RateLimitDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(3600));
                assert!(retry_after > Duration::from_secs(3500));
            }
            RateLimitDecision::Allowed => panic!("third event should be limited"),
        }

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_rate_limit_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_persistent_limiter_fails_open() {
        let pool = db::connect_in_memory().await.unwrap();
        sqlx::query("DROP TABLE api_rate_limit_events")
            .execute(&pool)
            .await
            .unwrap();
        let limiter = PersistentRateLimiter::new(pool, rules(1));

        for _ in 0..3 {
            assert_eq!(
                limiter.check(RateLimitScope::Report, "ip").await.unwrap(),
                RateLimitDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn test_layered_consults_both() {
        let pool = db::connect_in_memory().await.unwrap();
        let fast = Arc::new(MemoryRateLimiter::new(&rules(5)));
        let durable = PersistentRateLimiter::new(pool, rules(1));
        let layered = LayeredRateLimiter::new(fast, Some(durable));

        assert!(enforce(&layered, RateLimitScope::Api, "ip").await.is_ok());
        let err = enforce(&layered, RateLimitScope::Api, "ip").await.unwrap_err();
        assert!(matches!(err, HoleError::RateLimitExceeded { .. }));
    }
}
