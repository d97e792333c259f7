/// Background task implementations
use crate::{context::AppContext, error::HoleResult};

/// Drop replenished in-memory limiter keys, returning how many remain
pub fn sweep_rate_limiter(ctx: &AppContext) -> usize {
    ctx.memory_limiter.sweep()
}

/// Delete expired sessions, MFA challenges, trusted devices and old throttle events
pub async fn purge_expired_state(ctx: &AppContext) -> HoleResult<u64> {
    let sessions = ctx.sessions.purge_expired().await?;
    let mfa = ctx.mfa.purge_expired().await?;
    let events = ctx.action_limiter.purge_expired().await?;

    Ok(sessions + mfa + events)
}

/// Expire pending reports nobody confirmed in time
pub async fn expire_pending_reports(ctx: &AppContext) -> HoleResult<u64> {
    ctx.reports.expire_stale(ctx.reports.pending_expiry()).await
}
