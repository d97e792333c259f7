/// Health check and metrics endpoints
///
/// Two kinds of check:
/// - Liveness: Is the process alive? (restart if not)
/// - Readiness: Can it serve traffic? (database reachable, photo directory present)

use crate::{context::AppContext, error::HoleResult, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::time::Instant;

/// Health of one dependency
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,

    /// "healthy" or "unhealthy"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics_endpoint))
}

/// Basic health check
pub async fn health_basic(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let uptime = ctx.started_at.elapsed().as_secs_f64();
    metrics::UPTIME_SECONDS.set(uptime);

    Json(serde_json::json!({
        "status": "ok",
        "version": ctx.config.service.version,
        "uptimeSeconds": uptime,
    }))
}

/// Liveness check
pub async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check
///
/// Returns 503 with the failing checks when a dependency is unavailable.
pub async fn readiness(State(ctx): State<AppContext>) -> (StatusCode, Json<serde_json::Value>) {
    let checks = vec![
        timed("database", check_database(&ctx)).await,
        timed("photo_storage", check_photo_storage(&ctx)).await,
    ];

    let ready = checks.iter().all(|c| c.status == "healthy");
    if !ready {
        tracing::warn!("readiness_check_failed");
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "unavailable" },
            "checks": checks,
        })),
    )
}

/// Prometheus text exposition
pub async fn metrics_endpoint() -> Response {
    match metrics::render_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn timed<F>(name: &str, check: F) -> ComponentHealth
where
    F: std::future::Future<Output = HoleResult<()>>,
{
    let start = Instant::now();
    let result = check.await;
    let response_time_ms = Some(start.elapsed().as_millis() as u64);

    match result {
        Ok(()) => ComponentHealth {
            name: name.to_string(),
            status: "healthy".to_string(),
            response_time_ms,
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "{} check failed", name);
            ComponentHealth {
                name: name.to_string(),
                status: "unhealthy".to_string(),
                response_time_ms,
                error: Some("check failed".to_string()),
            }
        }
    }
}

async fn check_database(ctx: &AppContext) -> HoleResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;
    Ok(())
}

async fn check_photo_storage(ctx: &AppContext) -> HoleResult<()> {
    let metadata = tokio::fs::metadata(&ctx.config.storage.photo_directory).await?;
    if !metadata.is_dir() {
        return Err(crate::error::HoleError::Internal(
            "Photo directory is not a directory".to_string(),
        ));
    }
    Ok(())
}
