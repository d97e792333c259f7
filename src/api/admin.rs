/// Admin back-office endpoints
///
/// Every handler takes an [`AdminAuth`] extractor, which has already checked
/// the session, the soft timeouts, the role and (for writes) the CSRF token.
use crate::{
    account::ChangePasswordRequest,
    admin::{AuditEvent, Role},
    api::{JsonBody, Pagination},
    auth::{AdminAuth, RequireAdmin, RequireEditor},
    context::AppContext,
    error::{HoleError, HoleResult},
    photos::PhotoStatus,
    potholes::PotholeStatus,
};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Build admin API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        // Own account
        .route("/api/admin/me", get(me))
        .route("/api/admin/sessions", get(list_sessions))
        .route("/api/admin/sessions/revoke-others", post(revoke_other_sessions))
        .route("/api/admin/password", post(change_password))
        .route("/api/admin/mfa/init", post(mfa_init))
        .route("/api/admin/mfa/confirm", post(mfa_confirm))
        .route("/api/admin/mfa/disable", post(mfa_disable))
        .route("/api/admin/mfa/backup-codes", post(mfa_backup_codes))
        // Reports and photos
        .route("/api/admin/potholes", get(list_potholes))
        .route("/api/admin/potholes/:id", delete(delete_pothole))
        .route("/api/admin/potholes/:id/status", post(set_pothole_status))
        .route("/api/admin/photos", get(list_photos))
        .route("/api/admin/photos/bulk", post(bulk_review_photos))
        .route("/api/admin/photos/:id/file", get(photo_file))
        .route("/api/admin/photos/:id/approve", post(approve_photo))
        .route("/api/admin/photos/:id/reject", post(reject_photo))
        // User management
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/users/:id/role", post(change_role))
        .route("/api/admin/users/:id/activate", post(activate_user))
        .route("/api/admin/users/:id/deactivate", post(deactivate_user))
        .route("/api/admin/users/:id/revoke-sessions", post(revoke_user_sessions))
        // Invites and audit
        .route("/api/admin/invites", get(list_invites).post(create_invite))
        .route("/api/admin/invites/:id/deactivate", post(deactivate_invite))
        .route("/api/admin/audit", get(list_audit))
}

// ============================================================================
// Own account
// ============================================================================

async fn me(auth: AdminAuth) -> Json<serde_json::Value> {
    Json(json!({
        "user": auth.user,
        "session": auth.session,
    }))
}

async fn list_sessions(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
) -> HoleResult<Json<serde_json::Value>> {
    let sessions: Vec<serde_json::Value> = ctx
        .sessions
        .list_for_user(&auth.user.id)
        .await?
        .into_iter()
        .map(|s| {
            let current = s.id == auth.session.id;
            json!({ "session": s, "current": current })
        })
        .collect();

    Ok(Json(json!({ "sessions": sessions })))
}

async fn revoke_other_sessions(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
) -> HoleResult<Json<serde_json::Value>> {
    let revoked = ctx
        .sessions
        .invalidate_all_for_user(&auth.user.id, Some(&auth.session.id))
        .await?;

    ctx.audit
        .record(
            AuditEvent::new("sessions_revoked")
                .by(&auth.user.id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "revoked": revoked })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "revoked": revoked })))
}

async fn change_password(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
    JsonBody(request): JsonBody<ChangePasswordRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let revoked = ctx
        .accounts
        .change_password(&auth.user, &auth.session.id, &request, &auth.client)
        .await?;

    Ok(Json(json!({ "ok": true, "revokedSessions": revoked })))
}

async fn mfa_init(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
) -> HoleResult<Json<crate::auth::TotpEnrollment>> {
    Ok(Json(ctx.mfa.begin_enrollment(&auth.user)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MfaConfirmRequest {
    encrypted_secret: String,
    code: String,
}

async fn mfa_confirm(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
    JsonBody(request): JsonBody<MfaConfirmRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let backup_codes = ctx
        .mfa
        .confirm_enrollment(&auth.user, &request.encrypted_secret, &request.code)
        .await?;

    ctx.audit
        .record(
            AuditEvent::new("mfa_enabled")
                .by(&auth.user.id)
                .from_ip(&auth.client.ip_hash),
        )
        .await;

    Ok(Json(json!({ "ok": true, "backupCodes": backup_codes })))
}

#[derive(Debug, Deserialize)]
struct MfaCodeRequest {
    code: String,
}

async fn mfa_disable(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
    JsonBody(request): JsonBody<MfaCodeRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let revoked = ctx
        .mfa
        .disable(&auth.user, &request.code, &auth.session.id)
        .await?;

    ctx.audit
        .record(
            AuditEvent::new("mfa_disabled")
                .by(&auth.user.id)
                .from_ip(&auth.client.ip_hash),
        )
        .await;

    Ok(Json(json!({ "ok": true, "revokedSessions": revoked })))
}

async fn mfa_backup_codes(
    State(ctx): State<AppContext>,
    auth: AdminAuth,
    JsonBody(request): JsonBody<MfaCodeRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let backup_codes = ctx
        .mfa
        .regenerate_backup_codes(&auth.user, &request.code)
        .await?;

    ctx.audit
        .record(
            AuditEvent::new("backup_codes_regenerated")
                .by(&auth.user.id)
                .from_ip(&auth.client.ip_hash),
        )
        .await;

    Ok(Json(json!({ "ok": true, "backupCodes": backup_codes })))
}

// ============================================================================
// Potholes and photos
// ============================================================================

#[derive(Debug, Deserialize)]
struct PotholeListQuery {
    status: Option<PotholeStatus>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

#[derive(Debug, Deserialize)]
struct PhotoListQuery {
    status: Option<PhotoStatus>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_potholes(
    State(ctx): State<AppContext>,
    _auth: AdminAuth,
    Query(query): Query<PotholeListQuery>,
) -> HoleResult<Json<serde_json::Value>> {
    let potholes = ctx
        .potholes
        .list(query.status, query.limit, query.offset)
        .await?;
    let counts: serde_json::Map<String, serde_json::Value> = ctx
        .potholes
        .count_by_status()
        .await?
        .into_iter()
        .map(|(status, count)| (status.to_string(), json!(count)))
        .collect();

    Ok(Json(json!({ "potholes": potholes, "counts": counts })))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: PotholeStatus,
}

async fn set_pothole_status(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireEditor>,
    Path(id): Path<String>,
    JsonBody(request): JsonBody<StatusRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let pothole = ctx.potholes.set_status(&id, request.status).await?;

    ctx.audit
        .record(
            AuditEvent::new("pothole_status_changed")
                .by(&auth.user.id)
                .on("pothole", &id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "status": request.status })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "pothole": pothole })))
}

async fn delete_pothole(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    let photo_paths = ctx.potholes.delete(&id).await?;
    ctx.photos.remove_files(&photo_paths).await;

    ctx.audit
        .record(
            AuditEvent::new("pothole_deleted")
                .by(&auth.user.id)
                .on("pothole", &id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "photos": photo_paths.len() })),
        )
        .await;

    Ok(Json(json!({ "ok": true })))
}

async fn list_photos(
    State(ctx): State<AppContext>,
    _auth: AdminAuth,
    Query(query): Query<PhotoListQuery>,
) -> HoleResult<Json<serde_json::Value>> {
    let photos = ctx
        .photos
        .list(query.status, query.limit, query.offset)
        .await?;
    Ok(Json(json!({ "photos": photos })))
}

async fn photo_file(
    State(ctx): State<AppContext>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> HoleResult<Response> {
    let (photo, data) = ctx.photos.open(&id, false).await?;
    Ok((
        [
            (header::CONTENT_TYPE, photo.content_type),
            (header::CACHE_CONTROL, "private, no-store".to_string()),
        ],
        data,
    )
        .into_response())
}

async fn review_photo(
    ctx: &AppContext,
    auth: &AdminAuth<RequireEditor>,
    id: &str,
    decision: PhotoStatus,
) -> HoleResult<Json<serde_json::Value>> {
    let photo = ctx.photos.review(id, decision, &auth.user.id).await?;

    let action = match decision {
        PhotoStatus::Approved => "photo_approved",
        _ => "photo_rejected",
    };
    ctx.audit
        .record(
            AuditEvent::new(action)
                .by(&auth.user.id)
                .on("photo", id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "potholeId": photo.pothole_id })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "photo": photo })))
}

async fn approve_photo(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireEditor>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    review_photo(&ctx, &auth, &id, PhotoStatus::Approved).await
}

async fn reject_photo(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireEditor>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    review_photo(&ctx, &auth, &id, PhotoStatus::Rejected).await
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BulkAction {
    Approve,
    Reject,
}

impl BulkAction {
    fn decision(self) -> PhotoStatus {
        match self {
            BulkAction::Approve => PhotoStatus::Approved,
            BulkAction::Reject => PhotoStatus::Rejected,
        }
    }

    fn audit_action(self) -> &'static str {
        match self {
            BulkAction::Approve => "photo.bulk_approve",
            BulkAction::Reject => "photo.bulk_reject",
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkReviewRequest {
    action: BulkAction,
    ids: Vec<Uuid>,
}

async fn bulk_review_photos(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireEditor>,
    JsonBody(request): JsonBody<BulkReviewRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let ids: Vec<String> = request.ids.iter().map(Uuid::to_string).collect();
    let outcome = ctx
        .photos
        .review_many(&ids, request.action.decision(), &auth.user.id)
        .await?;

    ctx.audit
        .record(
            AuditEvent::new(request.action.audit_action())
                .by(&auth.user.id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({
                    "ids": outcome.updated,
                    "count": outcome.updated.len(),
                    "skipped": outcome.skipped,
                })),
        )
        .await;

    Ok(Json(json!({
        "ok": true,
        "updated": outcome.updated.len(),
        "skipped": outcome.skipped,
    })))
}

// ============================================================================
// User management
// ============================================================================

async fn list_users(
    State(ctx): State<AppContext>,
    _auth: AdminAuth<RequireAdmin>,
) -> HoleResult<Json<serde_json::Value>> {
    let users = ctx.users.list().await?;
    Ok(Json(json!({ "users": users })))
}

#[derive(Debug, Deserialize)]
struct RoleRequest {
    role: Role,
}

async fn change_role(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    Path(id): Path<String>,
    JsonBody(request): JsonBody<RoleRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let user = ctx
        .users
        .change_role(&auth.user.id, &id, request.role)
        .await?;

    ctx.audit
        .record(
            AuditEvent::new("user_role_changed")
                .by(&auth.user.id)
                .on("admin_user", &id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "role": request.role })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "user": user })))
}

async fn activate_user(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    if id == auth.user.id {
        return Err(HoleError::Validation("You cannot activate yourself".to_string()));
    }
    let user = ctx.users.activate(&id).await?;

    ctx.audit
        .record(
            AuditEvent::new("user_activated")
                .by(&auth.user.id)
                .on("admin_user", &id)
                .from_ip(&auth.client.ip_hash),
        )
        .await;

    Ok(Json(json!({ "ok": true, "user": user })))
}

async fn deactivate_user(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    let revoked = ctx.users.deactivate(&auth.user.id, &id).await?;

    ctx.audit
        .record(
            AuditEvent::new("user_deactivated")
                .by(&auth.user.id)
                .on("admin_user", &id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "revokedSessions": revoked })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "revokedSessions": revoked })))
}

async fn revoke_user_sessions(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    if id == auth.user.id {
        return Err(HoleError::Validation(
            "Use revoke-others for your own sessions".to_string(),
        ));
    }
    let revoked = ctx.sessions.invalidate_all_for_user(&id, None).await?;

    ctx.audit
        .record(
            AuditEvent::new("user_sessions_revoked")
                .by(&auth.user.id)
                .on("admin_user", &id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "revoked": revoked })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "revoked": revoked })))
}

// ============================================================================
// Invites and audit
// ============================================================================

async fn list_invites(
    State(ctx): State<AppContext>,
    _auth: AdminAuth<RequireAdmin>,
) -> HoleResult<Json<serde_json::Value>> {
    let invites = ctx.invites.list_codes().await?;
    Ok(Json(json!({ "invites": invites })))
}

#[derive(Debug, Deserialize)]
struct CreateInviteRequest {
    role: Role,
    #[serde(default)]
    email: Option<String>,
}

async fn create_invite(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    JsonBody(request): JsonBody<CreateInviteRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let invite = ctx
        .invites
        .create_invite(&auth.user.id, request.role, request.email.as_deref())
        .await?;

    ctx.audit
        .record(
            AuditEvent::new("invite_created")
                .by(&auth.user.id)
                .on("invite", &invite.id)
                .from_ip(&auth.client.ip_hash)
                .details(json!({ "role": invite.role, "restricted": invite.email.is_some() })),
        )
        .await;

    Ok(Json(json!({ "ok": true, "invite": invite })))
}

async fn deactivate_invite(
    State(ctx): State<AppContext>,
    auth: AdminAuth<RequireAdmin>,
    Path(id): Path<String>,
) -> HoleResult<Json<serde_json::Value>> {
    ctx.invites.deactivate(&id).await?;

    ctx.audit
        .record(
            AuditEvent::new("invite_deactivated")
                .by(&auth.user.id)
                .on("invite", &id)
                .from_ip(&auth.client.ip_hash),
        )
        .await;

    Ok(Json(json!({ "ok": true })))
}

async fn list_audit(
    State(ctx): State<AppContext>,
    _auth: AdminAuth<RequireAdmin>,
    Query(page): Query<Pagination>,
) -> HoleResult<Json<serde_json::Value>> {
    let entries = ctx.audit.list(page.limit, page.offset).await?;
    Ok(Json(json!({ "entries": entries })))
}
