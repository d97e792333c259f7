/// API routes and handlers
pub mod admin;
pub mod admin_auth;
pub mod health;
pub mod public;

use crate::{context::AppContext, error::HoleError};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json, Router,
};
use serde::Deserialize;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(public::routes())
        .merge(admin_auth::routes())
        .merge(admin::routes())
}

/// JSON body whose rejections use the service error format
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = HoleError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(HoleError::Validation(rejection.body_text())),
        }
    }
}

/// `?limit=&offset=` paging
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}
