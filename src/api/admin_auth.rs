/// Admin sign-in endpoints
///
/// None of these require a session. Successful sign-in sets the session and
/// CSRF cookies; sign-out clears them.
use crate::{
    account::{
        BootstrapRequest, LoginOutcome, LoginRequest, MfaVerifyRequest, SignedIn, SignupRequest,
    },
    api::JsonBody,
    auth::{
        cookies::{
            clear_session_cookies, csrf_cookie, session_cookie, trusted_device_cookie,
            SESSION_COOKIE, TRUSTED_DEVICE_COOKIE,
        },
        ClientInfo,
    },
    context::AppContext,
    error::HoleResult,
};
use axum::{extract::State, response::Json, routing::post, Router};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;

/// Build admin auth routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/admin/auth/login", post(login))
        .route("/api/admin/auth/mfa/verify", post(verify_mfa))
        .route("/api/admin/auth/signup", post(signup))
        .route("/api/admin/auth/bootstrap", post(bootstrap))
        .route("/api/admin/auth/logout", post(logout))
}

fn with_session_cookies(jar: CookieJar, signed_in: &SignedIn, secure: bool) -> CookieJar {
    jar.add(session_cookie(signed_in.session.id.clone(), secure))
        .add(csrf_cookie(signed_in.csrf_token.clone(), secure))
}

/// Password step
async fn login(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    client: ClientInfo,
    JsonBody(request): JsonBody<LoginRequest>,
) -> HoleResult<(CookieJar, Json<serde_json::Value>)> {
    let trusted_device = jar.get(TRUSTED_DEVICE_COOKIE).map(|c| c.value().to_string());

    let outcome = ctx
        .accounts
        .login(&request, trusted_device.as_deref(), &client)
        .await?;

    match outcome {
        LoginOutcome::SignedIn(signed_in) => {
            let jar = with_session_cookies(jar, &signed_in, ctx.config.security.secure_cookies);
            Ok((jar, Json(json!({ "ok": true, "user": signed_in.user }))))
        }
        LoginOutcome::MfaRequired { mfa_token, user } => Ok((
            jar,
            Json(json!({
                "mfaRequired": true,
                "mfaToken": mfa_token,
                "user": user,
            })),
        )),
    }
}

/// Second-factor step
async fn verify_mfa(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    client: ClientInfo,
    JsonBody(request): JsonBody<MfaVerifyRequest>,
) -> HoleResult<(CookieJar, Json<serde_json::Value>)> {
    let result = ctx.accounts.verify_mfa(&request, &client).await?;
    let secure = ctx.config.security.secure_cookies;

    let mut jar = with_session_cookies(jar, &result.signed_in, secure);
    if let Some(token) = result.trusted_device {
        jar = jar.add(trusted_device_cookie(
            token,
            secure,
            ctx.config.sessions.trusted_device_ttl,
        ));
    }

    Ok((
        jar,
        Json(json!({
            "ok": true,
            "user": result.signed_in.user,
            "usedBackupCode": result.used_backup_code,
        })),
    ))
}

/// Invite signup; the account waits for activation
async fn signup(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    JsonBody(request): JsonBody<SignupRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    ctx.accounts.signup(&request, &client).await?;

    Ok(Json(json!({
        "ok": true,
        "message": "Account created. An administrator must activate it before you can sign in.",
        "requiresActivation": true,
    })))
}

/// First-admin creation
async fn bootstrap(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    JsonBody(request): JsonBody<BootstrapRequest>,
) -> HoleResult<Json<serde_json::Value>> {
    let user = ctx.accounts.bootstrap(&request, &client).await?;
    Ok(Json(json!({ "ok": true, "user": user })))
}

/// Sign out; no CSRF check so a stale page can always sign out
async fn logout(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    client: ClientInfo,
) -> HoleResult<(CookieJar, Json<serde_json::Value>)> {
    if let Some(session_id) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) {
        ctx.accounts.logout(&session_id, &client).await?;
    }

    Ok((clear_session_cookies(jar), Json(json!({ "ok": true }))))
}
