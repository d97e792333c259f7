/// Public report endpoints
///
/// Citizens report potholes, confirm them by reporting again, mark them
/// filled and attach photos. No account is involved; clients are told apart
/// by their keyed IP hash.
use crate::{
    api::JsonBody,
    auth::ClientInfo,
    context::AppContext,
    error::{HoleError, HoleResult},
    metrics,
    potholes::{parse_watchlist_ids, FillOutcome, PotholeStatus, ReportOutcome, ReportSubmission},
};
use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Multipart framing allowance on top of the photo itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build public routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/report", post(submit_report))
        .route("/api/filled", post(mark_filled))
        .route("/api/photos", post(upload_photo).layer(DefaultBodyLimit::disable()))
        .route("/api/photos/:id", get(get_photo))
        .route("/api/feed.json", get(feed))
        .route("/api/watchlist", get(watchlist))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportResponse {
    id: String,
    confirmed: bool,
    status: PotholeStatus,
    confirmed_count: i64,
    outcome: &'static str,
    message: String,
}

fn report_message(outcome: &ReportOutcome, threshold: i64) -> String {
    match outcome {
        ReportOutcome::Created { status, .. } if *status == PotholeStatus::Reported => {
            "Reported. The pothole is now live on the map.".to_string()
        }
        ReportOutcome::Created { .. } => format!(
            "Report received. It goes live once {} people confirm it.",
            threshold
        ),
        ReportOutcome::Confirmed {
            became_reported: true,
            ..
        } => "Confirmed. The pothole is now live on the map.".to_string(),
        ReportOutcome::Confirmed { count, .. } => {
            format!("Confirmation noted ({}/{} needed).", count, threshold)
        }
        ReportOutcome::Duplicate { .. } => {
            "You've already reported this one. Thanks though!".to_string()
        }
    }
}

/// Report a pothole or confirm a nearby one
async fn submit_report(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    JsonBody(submission): JsonBody<ReportSubmission>,
) -> HoleResult<Json<ReportResponse>> {
    let outcome = ctx
        .reports
        .submit_report(&submission, &client.ip_hash)
        .await?;

    let message = report_message(&outcome, ctx.config.reports.confirmation_threshold);
    Ok(Json(ReportResponse {
        id: outcome.id().to_string(),
        confirmed: outcome.status() == PotholeStatus::Reported,
        status: outcome.status(),
        confirmed_count: outcome.confirmed_count(),
        outcome: outcome.label(),
        message,
    }))
}

#[derive(Debug, Deserialize)]
struct FilledRequest {
    id: String,
}

/// Mark a reported pothole as filled
async fn mark_filled(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    JsonBody(request): JsonBody<FilledRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let id = request.id.trim();
    if id.is_empty() {
        return Err(HoleError::Validation("Missing pothole id".to_string()));
    }

    let outcome = ctx.reports.mark_filled(id, &client.ip_hash).await?;
    metrics::FILL_OUTCOMES_TOTAL
        .with_label_values(&[outcome.label()])
        .inc();

    Ok(Json(json!({
        "ok": true,
        "outcome": outcome.label(),
        "alreadyFilled": outcome != FillOutcome::Filled,
    })))
}

/// Photo upload: multipart fields `photo` and `pothole_id`
///
/// Fields are read in chunks so an oversized upload is refused before it is
/// buffered in full.
async fn upload_photo(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    mut multipart: Multipart,
) -> HoleResult<Json<serde_json::Value>> {
    let mut budget = ctx.photos.max_bytes() + MULTIPART_OVERHEAD;
    let mut pothole_id: Option<String> = None;
    let mut photo: Option<(String, Vec<u8>)> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let data = read_field(&mut field, &mut budget, ctx.photos.max_bytes()).await?;

        match name.as_str() {
            "pothole_id" => {
                pothole_id = Some(String::from_utf8_lossy(&data).trim().to_string());
            }
            "photo" => photo = Some((content_type, data)),
            _ => {}
        }
    }

    let pothole_id = pothole_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HoleError::Validation("Missing pothole_id".to_string()))?;
    let (content_type, data) =
        photo.ok_or_else(|| HoleError::Validation("No photo provided".to_string()))?;

    let stored = ctx
        .photos
        .upload(&pothole_id, &content_type, data, &client.ip_hash)
        .await?;

    Ok(Json(json!({ "ok": true, "id": stored.id })))
}

async fn read_field(
    field: &mut Field<'_>,
    budget: &mut usize,
    max_bytes: usize,
) -> HoleResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        *budget = budget.checked_sub(chunk.len()).ok_or_else(|| {
            let max_mb = max_bytes / (1024 * 1024);
            HoleError::PayloadTooLarge(format!("Photo too large (max {} MB)", max_mb))
        })?;
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> HoleError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        HoleError::PayloadTooLarge(e.body_text())
    } else {
        HoleError::Validation(e.body_text())
    }
}

/// Serve an approved photo
async fn get_photo(State(ctx): State<AppContext>, Path(id): Path<String>) -> HoleResult<Response> {
    let (photo, data) = ctx.photos.open(&id, true).await?;
    Ok((
        [
            (header::CONTENT_TYPE, photo.content_type),
            (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
        ],
        data,
    )
        .into_response())
}

/// Public feed of potholes past the confirmation stage
async fn feed(State(ctx): State<AppContext>) -> HoleResult<Response> {
    let potholes = ctx.potholes.public_feed().await?;
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=60")],
        Json(json!({
            "generated": Utc::now(),
            "source": ctx.config.service.hostname,
            "potholes": potholes,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct WatchlistQuery {
    ids: Option<String>,
}

/// Current status of the potholes a citizen is following
async fn watchlist(
    State(ctx): State<AppContext>,
    Query(query): Query<WatchlistQuery>,
) -> HoleResult<Response> {
    let ids = parse_watchlist_ids(query.ids.as_deref().unwrap_or_default())?;
    let potholes = ctx.potholes.watchlist(&ids).await?;
    Ok((
        [(header::CACHE_CONTROL, "private, max-age=30")],
        Json(potholes),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_messages() {
        let created = ReportOutcome::Created {
            id: "a".into(),
            status: PotholeStatus::Pending,
        };
        assert!(report_message(&created, 3).contains("3 people"));

        let confirmed = ReportOutcome::Confirmed {
            id: "a".into(),
            count: 2,
            became_reported: false,
        };
        assert_eq!(report_message(&confirmed, 3), "Confirmation noted (2/3 needed).");

        let live = ReportOutcome::Confirmed {
            id: "a".into(),
            count: 3,
            became_reported: true,
        };
        assert!(report_message(&live, 3).contains("live on the map"));
    }
}
