pub mod balances;
pub mod maker;
pub mod markets;
pub mod orders;

use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::models::User;
use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Admin operations carry the acting user's id; identity itself is
/// established by the external auth layer.
pub async fn require_admin(pool: &PgPool, user_id: i64) -> Result<User, ApiError> {
    let user = User::get(pool, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user not found: {user_id}")))?;
    if !user.is_admin {
        return Err(ApiError::forbidden("admin privileges required"));
    }
    Ok(user)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/orders", orders::order_routes())
        .nest("/markets", markets::market_routes())
        .nest("/mm", maker::maker_routes())
        .merge(balances::account_routes())
        .layer(cors)
        .with_state(state)
}
