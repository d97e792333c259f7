use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::metrics;

pub mod tasks;

/// Job scheduler for housekeeping tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::limiter_sweep_job(Arc::clone(&self)));
        tokio::spawn(Self::expired_state_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::pending_report_expiry_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Forget idle in-memory limiter keys (runs every 5 minutes)
    async fn limiter_sweep_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            let tracked = tasks::sweep_rate_limiter(&scheduler.context);
            metrics::record_background_job("limiter_sweep", true);
            tracing::debug!("Rate limiter sweep: {} keys still tracked", tracked);
        }
    }

    /// Purge expired sessions, challenges, devices and throttle events (runs every hour)
    async fn expired_state_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;
            info!("Running expired state cleanup");

            match tasks::purge_expired_state(&scheduler.context).await {
                Ok(count) => {
                    metrics::record_background_job("expired_state_cleanup", true);
                    if count > 0 {
                        info!("Purged {} expired rows", count);
                    } else {
                        info!("Expired state cleanup: nothing to purge");
                    }
                }
                Err(e) => {
                    metrics::record_background_job("expired_state_cleanup", false);
                    error!("Failed to purge expired state: {}", e);
                }
            }
        }
    }

    /// Expire stale pending reports (runs daily)
    async fn pending_report_expiry_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(86400));

        loop {
            interval.tick().await;
            info!("Running pending report expiry");

            match tasks::expire_pending_reports(&scheduler.context).await {
                Ok(count) => {
                    metrics::record_background_job("pending_report_expiry", true);
                    if count > 0 {
                        info!("Expired {} stale pending reports", count);
                    }
                }
                Err(e) => {
                    metrics::record_background_job("pending_report_expiry", false);
                    error!("Failed to expire pending reports: {}", e);
                }
            }
        }
    }
}
