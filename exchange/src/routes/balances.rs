use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use matching::Sats;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::{Bet, LedgerEntry, Position, TxType, User, Withdrawal};
use crate::AppState;

use super::require_admin;

/// Account-facing routes: balances, positions, deposit/withdrawal hooks for
/// the external payment adapters, and the identity upsert.
pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(ensure_user))
        .route("/balances/:user_id", get(get_balance))
        .route("/positions", get(get_positions))
        .route("/deposits", post(credit_deposit))
        .route("/withdrawals", post(request_withdrawal))
        .route("/withdrawals", get(list_withdrawals))
        .route("/withdrawals/:withdrawal_id/approve", post(approve_withdrawal))
        .route("/withdrawals/:withdrawal_id/settle", post(settle_withdrawal))
        .route("/withdrawals/:withdrawal_id/fail", post(fail_withdrawal))
        .route("/admin/adjust", post(admin_adjust))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsureUserBody {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

async fn ensure_user(
    State(state): State<AppState>,
    Json(body): Json<EnsureUserBody>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = User::ensure(
        &state.pool,
        &body.username,
        body.email.as_deref(),
        body.is_admin,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: i64,
    pub balance_sats: Sats,
    pub transactions: Vec<LedgerEntry>,
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user = User::get(&state.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user not found: {user_id}")))?;
    let transactions = LedgerEntry::history(&state.pool, user_id, 50).await?;
    Ok(Json(BalanceResponse {
        user_id: user.id,
        balance_sats: user.balance_sats,
        transactions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    pub user_id: i64,
}

async fn get_positions(
    State(state): State<AppState>,
    Query(query): Query<PositionsQuery>,
) -> Result<Json<Vec<Position>>, ApiError> {
    Ok(Json(Bet::positions(&state.pool, query.user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositBody {
    pub user_id: i64,
    pub amount_sats: Sats,
    #[serde(default)]
    pub reference_id: Option<i64>,
}

async fn credit_deposit(
    State(state): State<AppState>,
    Json(body): Json<DepositBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    if body.amount_sats <= 0 {
        return Err(ApiError::bad_request(
            "INVALID_AMOUNT",
            "deposit amount must be positive",
        ));
    }
    let mut tx = state.pool.begin().await?;
    let entry = LedgerEntry::credit(
        &mut tx,
        body.user_id,
        body.amount_sats,
        TxType::Deposit,
        body.reference_id,
    )
    .await?;
    tx.commit().await.map_err(ApiError::from)?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WithdrawalBody {
    pub user_id: i64,
    pub amount_sats: Sats,
    #[serde(default)]
    pub bolt11: Option<String>,
}

async fn request_withdrawal(
    State(state): State<AppState>,
    Json(body): Json<WithdrawalBody>,
) -> Result<(StatusCode, Json<Withdrawal>), ApiError> {
    let withdrawal = Withdrawal::request(
        &state.pool,
        body.user_id,
        body.amount_sats,
        body.bolt11,
        state.config.withdrawal_instant_max_sats,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(withdrawal)))
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalsQuery {
    pub user_id: i64,
}

async fn list_withdrawals(
    State(state): State<AppState>,
    Query(query): Query<WithdrawalsQuery>,
) -> Result<Json<Vec<Withdrawal>>, ApiError> {
    Ok(Json(
        Withdrawal::list_for_user(&state.pool, query.user_id, 50).await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproveBody {
    pub admin_user_id: i64,
}

async fn approve_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<i64>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<Withdrawal>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    Ok(Json(Withdrawal::approve(&state.pool, withdrawal_id).await?))
}

async fn settle_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<i64>,
) -> Result<Json<Withdrawal>, ApiError> {
    Ok(Json(
        Withdrawal::mark_settled(&state.pool, withdrawal_id).await?,
    ))
}

async fn fail_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<i64>,
) -> Result<Json<Withdrawal>, ApiError> {
    Ok(Json(Withdrawal::fail(&state.pool, withdrawal_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminAdjustBody {
    pub admin_user_id: i64,
    pub user_id: i64,
    /// Signed: positive credits, negative debits.
    pub amount_sats: Sats,
}

async fn admin_adjust(
    State(state): State<AppState>,
    Json(body): Json<AdminAdjustBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    require_admin(&state.pool, body.admin_user_id).await?;
    if body.amount_sats == 0 {
        return Err(ApiError::bad_request(
            "INVALID_AMOUNT",
            "adjustment must be non-zero",
        ));
    }
    let mut tx = state.pool.begin().await?;
    let entry = if body.amount_sats > 0 {
        LedgerEntry::credit(&mut tx, body.user_id, body.amount_sats, TxType::AdminAdjust, None)
            .await?
    } else {
        LedgerEntry::debit(&mut tx, body.user_id, -body.amount_sats, TxType::AdminAdjust, None)
            .await?
    };
    tx.commit().await.map_err(ApiError::from)?;
    Ok(Json(entry))
}
