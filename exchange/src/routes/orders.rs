use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use matching::{Sats, Side};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::maker;
use crate::models::{AutoSettleOutcome, Order, OrderError, PlaceOrderRequest};
use crate::AppState;

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(place_order))
        .route("/", get(list_orders))
        .route("/", delete(cancel_all_orders))
        .route("/:order_id", get(get_order))
        .route("/:order_id", delete(cancel_order))
}

// Request bodies are strict records: unknown fields are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaceOrderBody {
    pub user_id: i64,
    pub market_id: i64,
    pub side: String,
    pub price_cents: i16,
    pub amount_sats: Sats,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: i64,
    pub market_id: i64,
    pub side: String,
    pub price_cents: i16,
    pub amount_sats: Sats,
    pub filled_sats: Sats,
    pub remaining_sats: Sats,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct PlaceOrderResponse {
    pub order_id: i64,
    pub status: String,
    pub filled_sats: Sats,
    pub remaining_sats: Sats,
    pub matched_count: i64,
    pub cost_sats: Sats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_settled: Option<AutoSettleOutcome>,
}

fn order_to_response(order: &Order) -> OrderResponse {
    OrderResponse {
        order_id: order.id,
        market_id: order.market_id,
        side: order.side.clone(),
        price_cents: order.price_cents,
        amount_sats: order.amount_sats,
        filled_sats: order.filled_sats,
        remaining_sats: order.remaining_sats(),
        status: order.status.clone(),
        created_at: order.created_at.to_rfc3339(),
    }
}

async fn place_order(
    State(state): State<AppState>,
    Json(body): Json<PlaceOrderBody>,
) -> Result<(StatusCode, Json<PlaceOrderResponse>), ApiError> {
    let side = Side::parse(&body.side).ok_or(OrderError::InvalidSide)?;
    let req = PlaceOrderRequest {
        user_id: body.user_id,
        market_id: body.market_id,
        side,
        price_cents: body.price_cents,
        amount_sats: body.amount_sats,
    };
    let outcome = Order::place(&state.pool, &req).await?;

    // A fill that crossed a risk tier pulls the maker's quotes everywhere
    // before the response leaves.
    if let Some(change) = outcome.tier_change {
        if let Err(e) = maker::on_tier_change(&state.pool, change).await {
            tracing::error!("post-fill reconciliation failed: {e}");
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(PlaceOrderResponse {
            order_id: outcome.order.id,
            status: outcome.order.status.clone(),
            filled_sats: outcome.order.filled_sats,
            remaining_sats: outcome.order.remaining_sats(),
            matched_count: outcome.matched_count,
            cost_sats: outcome.cost_sats,
            auto_settled: outcome.auto_settled,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct OrdersListResponse {
    pub orders: Vec<OrderResponse>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<OrdersListResponse>, ApiError> {
    let limit = query.limit.clamp(1, 500);
    let orders = Order::list_for_user(&state.pool, query.user_id, limit).await?;
    Ok(Json(OrdersListResponse {
        orders: orders.iter().map(order_to_response).collect(),
    }))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = Order::get(&state.pool, order_id)
        .await?
        .ok_or(OrderError::NotFound)?;
    Ok(Json(order_to_response(&order)))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CancelOrderResponse {
    pub order_id: i64,
    pub status: String,
    pub refund_sats: Sats,
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelOrderResponse>, ApiError> {
    let outcome = Order::cancel(&state.pool, query.user_id, order_id).await?;
    Ok(Json(CancelOrderResponse {
        order_id: outcome.order.id,
        status: outcome.order.status.clone(),
        refund_sats: outcome.refund_sats,
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelAllResponse {
    pub orders_cancelled: i64,
    pub refund_sats: Sats,
}

async fn cancel_all_orders(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelAllResponse>, ApiError> {
    let outcome = Order::cancel_all(&state.pool, query.user_id).await?;
    Ok(Json(CancelAllResponse {
        orders_cancelled: outcome.orders_cancelled,
        refund_sats: outcome.refund_sats,
    }))
}
