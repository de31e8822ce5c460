use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use matching::Side;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::maker;
use crate::models::{BookLevel, Market, MarketError, MarketType, Order, OrderError, ResolveOutcome};
use crate::AppState;

use super::require_admin;

pub fn market_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_market))
        .route("/", get(list_markets))
        .route("/:market_id", get(get_market))
        .route("/:market_id/book", get(get_order_book))
        .route("/:market_id/initiate-resolution", post(initiate_resolution))
        .route("/:market_id/resolve", post(resolve_market))
        .route("/:market_id/cancel", post(cancel_market))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMarketBody {
    pub admin_user_id: i64,
    pub title: String,
    pub market_type: MarketType,
    #[serde(default)]
    pub grandmaster_id: Option<i64>,
    #[serde(default = "default_bot_enabled")]
    pub bot_enabled: bool,
}

fn default_bot_enabled() -> bool {
    true
}

async fn create_market(
    State(state): State<AppState>,
    Json(body): Json<CreateMarketBody>,
) -> Result<(StatusCode, Json<Market>), ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    let market = Market::create(
        &state.pool,
        &body.title,
        body.market_type,
        body.grandmaster_id,
        body.bot_enabled,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(market)))
}

async fn list_markets(State(state): State<AppState>) -> Result<Json<Vec<Market>>, ApiError> {
    Ok(Json(Market::list(&state.pool).await?))
}

async fn get_market(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
) -> Result<Json<Market>, ApiError> {
    let market = Market::get(&state.pool, market_id)
        .await?
        .ok_or(MarketError::NotFound(market_id))?;
    Ok(Json(market))
}

#[derive(Debug, Serialize)]
pub struct OrderBookResponse {
    pub market_id: i64,
    pub yes: Vec<BookLevel>,
    pub no: Vec<BookLevel>,
}

async fn get_order_book(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
) -> Result<Json<OrderBookResponse>, ApiError> {
    Market::get(&state.pool, market_id)
        .await?
        .ok_or(MarketError::NotFound(market_id))?;
    let yes = Order::book_side(&state.pool, market_id, Side::Yes).await?;
    let no = Order::book_side(&state.pool, market_id, Side::No).await?;
    Ok(Json(OrderBookResponse {
        market_id,
        yes,
        no,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolveBody {
    pub admin_user_id: i64,
    pub winning_side: String,
    #[serde(default)]
    pub notes: Option<String>,
}

async fn initiate_resolution(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Market>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    let side = Side::parse(&body.winning_side).ok_or(OrderError::InvalidSide)?;
    let market =
        Market::initiate_resolution(&state.pool, market_id, side, body.notes.as_deref()).await?;
    Ok(Json(market))
}

async fn resolve_market(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolveOutcome>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    let side = Side::parse(&body.winning_side).ok_or(OrderError::InvalidSide)?;
    let outcome = Market::resolve(&state.pool, market_id, side, body.notes.as_deref()).await?;

    // Resolution retires bot bets; keep the exposure snapshot honest.
    if let Err(e) = maker::refresh_exposure(&state.pool).await {
        tracing::error!("exposure refresh after resolution failed: {e}");
    }

    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelMarketBody {
    pub admin_user_id: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

async fn cancel_market(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<CancelMarketBody>,
) -> Result<Json<ResolveOutcome>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    let outcome = Market::cancel(&state.pool, market_id, body.notes.as_deref()).await?;
    if let Err(e) = maker::refresh_exposure(&state.pool).await {
        tracing::error!("exposure refresh after market cancel failed: {e}");
    }
    Ok(Json(outcome))
}
