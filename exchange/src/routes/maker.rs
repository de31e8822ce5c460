use axum::extract::{Path, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use matching::{Sats, Side};
use serde::Deserialize;

use crate::error::ApiError;
use crate::maker::{
    self, BotConfig, DeployOutcome, MakerStatus, MarketOverride, OverrideType, WithdrawOutcome,
};
use crate::models::OrderError;
use crate::AppState;

use super::require_admin;

pub fn maker_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/deploy", post(deploy))
        .route("/withdraw", post(withdraw))
        .route("/config", put(set_config))
        .route("/overrides/:market_id", put(set_override))
        .route("/overrides/:market_id", delete(clear_override))
        .route("/curves/:market_type", put(set_curve))
}

async fn status(State(state): State<AppState>) -> Result<Json<MakerStatus>, ApiError> {
    Ok(Json(maker::status(&state.pool).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminBody {
    pub admin_user_id: i64,
}

async fn deploy(
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<DeployOutcome>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    Ok(Json(maker::deploy(&state.pool).await?))
}

async fn withdraw(
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<WithdrawOutcome>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    Ok(Json(maker::withdraw_all(&state.pool).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetConfigBody {
    pub admin_user_id: i64,
    pub bot_user_id: i64,
    #[serde(default = "default_side")]
    pub side: String,
    pub max_acceptable_loss_sats: Sats,
    pub threshold_percent: i64,
    #[serde(default = "default_multiplier")]
    pub global_multiplier_permille: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_side() -> String {
    "no".to_string()
}

fn default_multiplier() -> i64 {
    1000
}

fn default_active() -> bool {
    true
}

async fn set_config(
    State(state): State<AppState>,
    Json(body): Json<SetConfigBody>,
) -> Result<Json<BotConfig>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    let side = Side::parse(&body.side).ok_or(OrderError::InvalidSide)?;
    if !(1..=100).contains(&body.threshold_percent) {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "threshold_percent must be in 1..=100",
        ));
    }
    let config = maker::set_config(
        &state.pool,
        body.bot_user_id,
        side,
        body.max_acceptable_loss_sats,
        body.threshold_percent,
        body.global_multiplier_permille,
        body.is_active,
    )
    .await?;

    // Configuration changes re-shape every quote.
    maker::reconcile_all(&state.pool).await?;
    Ok(Json(config))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetOverrideBody {
    pub admin_user_id: i64,
    pub override_type: OverrideType,
    #[serde(default = "default_multiplier")]
    pub multiplier_permille: i64,
}

async fn set_override(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<SetOverrideBody>,
) -> Result<Json<MarketOverride>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    let row = maker::set_override(
        &state.pool,
        market_id,
        body.override_type,
        body.multiplier_permille,
    )
    .await?;
    if let Err(e) = maker::reconcile_market(&state.pool, market_id).await {
        tracing::warn!(market_id, "reconcile after override change failed: {e}");
    }
    Ok(Json(row))
}

async fn clear_override(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<AdminBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    maker::clear_override(&state.pool, market_id).await?;
    if let Err(e) = maker::reconcile_market(&state.pool, market_id).await {
        tracing::warn!(market_id, "reconcile after override clear failed: {e}");
    }
    Ok(Json(serde_json::json!({ "cleared": true })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurvePointBody {
    pub price_cents: i16,
    pub weight_sats: Sats,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetCurveBody {
    pub admin_user_id: i64,
    pub points: Vec<CurvePointBody>,
}

async fn set_curve(
    State(state): State<AppState>,
    Path(market_type): Path<String>,
    Json(body): Json<SetCurveBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    for point in &body.points {
        if !matching::valid_price(point.price_cents) {
            return Err(OrderError::InvalidPrice(point.price_cents).into());
        }
        if point.weight_sats < 0 {
            return Err(ApiError::bad_request(
                "INVALID_REQUEST",
                "curve weights must be non-negative",
            ));
        }
    }
    let points: Vec<(i16, Sats)> = body
        .points
        .iter()
        .map(|p| (p.price_cents, p.weight_sats))
        .collect();
    maker::set_curve(&state.pool, &market_type, &points).await?;
    maker::reconcile_all(&state.pool).await?;
    Ok(Json(serde_json::json!({ "points": points.len() })))
}
