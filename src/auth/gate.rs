/// Request gate for the admin API
///
/// Every admin handler takes an [`AdminAuth`] extractor. Checks run in a
/// fixed order: session lookup, soft timeout, role, CSRF, then activity is
/// recorded. A request that fails any step never reaches the handler.
use crate::{
    admin::{require_role, AdminUser, Role},
    auth::{
        client::ClientInfo,
        cookies::SESSION_COOKIE,
        csrf::{CsrfGuard, CSRF_COOKIE, CSRF_HEADER},
        session::{AdminSession, SessionStore},
    },
    context::AppContext,
    error::{HoleError, HoleResult},
    metrics,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, Method},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use std::{marker::PhantomData, ops::Deref};

/// Minimum role for an extractor
pub trait RoleRequirement: Send + Sync + 'static {
    const ROLE: Role;
}

pub struct RequireViewer;
pub struct RequireEditor;
pub struct RequireAdmin;

impl RoleRequirement for RequireViewer {
    const ROLE: Role = Role::Viewer;
}

impl RoleRequirement for RequireEditor {
    const ROLE: Role = Role::Editor;
}

impl RoleRequirement for RequireAdmin {
    const ROLE: Role = Role::Admin;
}

/// A request that passed the gate
#[derive(Debug, Clone)]
pub struct AuthenticatedAdmin {
    pub user: AdminUser,
    pub session: AdminSession,
    pub client: ClientInfo,
}

#[derive(Clone)]
pub struct RequestGate {
    sessions: SessionStore,
    csrf: CsrfGuard,
}

impl RequestGate {
    pub fn new(sessions: SessionStore, csrf: CsrfGuard) -> Self {
        Self { sessions, csrf }
    }

    pub async fn authorize(
        &self,
        method: &Method,
        jar: &CookieJar,
        headers: &HeaderMap,
        client: ClientInfo,
        required: Role,
    ) -> HoleResult<AuthenticatedAdmin> {
        let session_id = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| HoleError::Authentication("Not signed in".to_string()))?;

        let (user, session) = self
            .sessions
            .validate_session(session_id)
            .await?
            .ok_or_else(|| HoleError::Authentication("Session expired".to_string()))?;

        if let Some(reason) = self.sessions.check_soft_timeout(&session, user.role, Utc::now()) {
            self.sessions.invalidate(&session.id).await?;
            metrics::SESSION_TIMEOUTS_TOTAL
                .with_label_values(&[reason.as_str()])
                .inc();
            tracing::info!(
                "Admin session timed out ({}) for user {}",
                reason.as_str(),
                user.id
            );
            return Err(HoleError::Authentication("Session timed out".to_string()));
        }

        require_role(user.role, required)?;

        if CsrfGuard::requires_check(method) {
            let cookie = jar.get(CSRF_COOKIE).map(|c| c.value());
            let header = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
            if !self.csrf.verify_double_submit(&session.id, cookie, header) {
                tracing::warn!("CSRF check failed for user {}", user.id);
                return Err(HoleError::Authorization("Invalid CSRF token".to_string()));
            }
        }

        self.sessions.touch(&session.id).await?;

        Ok(AuthenticatedAdmin {
            user,
            session,
            client,
        })
    }
}

/// Extractor for an authenticated admin holding at least `R`'s role
pub struct AdminAuth<R: RoleRequirement = RequireViewer> {
    admin: AuthenticatedAdmin,
    _role: PhantomData<fn() -> R>,
}

impl<R: RoleRequirement> AdminAuth<R> {
    pub fn into_inner(self) -> AuthenticatedAdmin {
        self.admin
    }
}

impl<R: RoleRequirement> Deref for AdminAuth<R> {
    type Target = AuthenticatedAdmin;

    fn deref(&self) -> &Self::Target {
        &self.admin
    }
}

#[async_trait]
impl<R: RoleRequirement> FromRequestParts<AppContext> for AdminAuth<R> {
    type Rejection = HoleError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let client = ClientInfo::from_request_parts(parts, state).await?;
        let jar = CookieJar::from_headers(&parts.headers);

        let admin = state
            .gate
            .authorize(&parts.method, &jar, &parts.headers, client, R::ROLE)
            .await?;

        Ok(Self {
            admin,
            _role: PhantomData,
        })
    }
}
