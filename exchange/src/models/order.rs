use chrono::{DateTime, Utc};
use matching::{cost_sats, RestingOrder, Sats, Side, MIN_ORDER_SATS};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::db;
use crate::maker::{self, TierChange};

use super::{AutoSettleOutcome, Bet, LedgerEntry, LedgerError, TxType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limit order. `cost_reserved_sats` is the exact satoshi amount still
/// locked for this order; cancellation refunds it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub market_id: i64,
    pub side: String,
    pub price_cents: i16,
    pub amount_sats: Sats,
    pub filled_sats: Sats,
    pub cost_reserved_sats: Sats,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_sats(&self) -> Sats {
        self.amount_sats - self.filled_sats
    }

    pub fn is_terminal(&self) -> bool {
        self.status == "filled" || self.status == "cancelled"
    }
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub side: Side,
    pub price_cents: i16,
    pub amount_sats: Sats,
}

#[derive(Debug)]
pub struct PlaceOrderOutcome {
    pub order: Order,
    pub cost_sats: Sats,
    pub matched_count: i64,
    pub auto_settled: Option<AutoSettleOutcome>,
    /// Set when the commit moved the market maker across a risk tier.
    pub tier_change: Option<TierChange>,
}

#[derive(Debug)]
pub struct CancelOutcome {
    pub order: Order,
    pub refund_sats: Sats,
}

#[derive(Debug)]
pub struct CancelAllOutcome {
    pub orders_cancelled: i64,
    pub refund_sats: Sats,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookLevel {
    pub price_cents: i16,
    pub total_sats: Sats,
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("side must be yes or no")]
    InvalidSide,
    #[error("price out of range: {0}")]
    InvalidPrice(i16),
    #[error("amount below minimum lot of {MIN_ORDER_SATS} sats: {0}")]
    AmountTooSmall(Sats),
    #[error("market not found: {0}")]
    MarketNotFound(i64),
    #[error("market is not open for trading (status: {0})")]
    MarketUnavailable(String),
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Sats, required: Sats },
    #[error("order not found")]
    NotFound,
    #[error("order does not belong to caller")]
    NotOwner,
    #[error("order already terminal (status: {0})")]
    OrderTerminal(String),
    #[error("market is busy, try again")]
    Busy,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<LedgerError> for OrderError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                available,
                required,
            } => OrderError::InsufficientFunds {
                available,
                required,
            },
            LedgerError::UserNotFound(_) => OrderError::NotFound,
            LedgerError::Database(e) => OrderError::Database(e),
        }
    }
}

impl Order {
    /// Place a limit order: validate, reserve the cost, match against the
    /// opposite side, net offsetting positions, and rest any remainder — all
    /// under one serializable commit. Colliding commits on the same market
    /// retry a bounded number of times before surfacing `Busy`.
    pub async fn place(
        pool: &PgPool,
        req: &PlaceOrderRequest,
    ) -> Result<PlaceOrderOutcome, OrderError> {
        if !matching::valid_price(req.price_cents) {
            return Err(OrderError::InvalidPrice(req.price_cents));
        }
        if req.amount_sats < MIN_ORDER_SATS {
            return Err(OrderError::AmountTooSmall(req.amount_sats));
        }

        let mut attempt = 0;
        loop {
            match Self::place_once(pool, req).await {
                Err(OrderError::Database(e)) if db::is_retryable(&e) => {
                    if attempt >= db::MAX_TX_RETRIES {
                        tracing::warn!(
                            market_id = req.market_id,
                            user_id = req.user_id,
                            "placement kept colliding, giving up"
                        );
                        return Err(OrderError::Busy);
                    }
                    attempt += 1;
                    db::retry_backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn place_once(
        pool: &PgPool,
        req: &PlaceOrderRequest,
    ) -> Result<PlaceOrderOutcome, OrderError> {
        let mut tx = db::begin_pipeline(pool).await?;
        db::lock_market(&mut tx, req.market_id).await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM markets WHERE id = $1")
                .bind(req.market_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            None => return Err(OrderError::MarketNotFound(req.market_id)),
            Some("open") => {}
            Some(other) => return Err(OrderError::MarketUnavailable(other.to_string())),
        }

        let cost = cost_sats(req.price_cents, req.amount_sats);

        let order = sqlx::query_as::<_, Order>(
            "INSERT INTO orders (user_id, market_id, side, price_cents, amount_sats, cost_reserved_sats)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(req.user_id)
        .bind(req.market_id)
        .bind(req.side.as_str())
        .bind(req.price_cents)
        .bind(req.amount_sats)
        .bind(cost)
        .fetch_one(&mut *tx)
        .await?;

        LedgerEntry::debit(&mut tx, req.user_id, cost, TxType::OrderPlaced, Some(order.id))
            .await?;

        // Opposite side of this market, best price first, oldest first.
        let book = sqlx::query_as::<_, RestingBookRow>(
            "SELECT id, user_id, price_cents, amount_sats - filled_sats AS remaining_sats
             FROM orders
             WHERE market_id = $1 AND side = $2 AND status IN ('open', 'partial')
               AND price_cents >= 100 - $3 AND id <> $4
             ORDER BY price_cents DESC, id
             FOR UPDATE",
        )
        .bind(req.market_id)
        .bind(req.side.opposite().as_str())
        .bind(req.price_cents)
        .bind(order.id)
        .fetch_all(&mut *tx)
        .await?;
        let book: Vec<RestingOrder> = book.into_iter().map(RestingBookRow::into_resting).collect();

        let matched = matching::match_limit(req.user_id, req.price_cents, req.amount_sats, &book);

        for fill in &matched.fills {
            let maker = sqlx::query_as::<_, Order>(
                "UPDATE orders SET
                    filled_sats = filled_sats + $1,
                    cost_reserved_sats = cost_reserved_sats - $2,
                    status = CASE WHEN filled_sats + $1 >= amount_sats THEN 'filled' ELSE 'partial' END
                 WHERE id = $3
                 RETURNING *",
            )
            .bind(fill.amount_sats)
            .bind(fill.maker_cost_sats)
            .bind(fill.maker_order_id)
            .fetch_one(&mut *tx)
            .await?;

            // A fully filled maker releases the rounding residue of its
            // reservation.
            if maker.status == "filled" && maker.cost_reserved_sats > 0 {
                LedgerEntry::credit(
                    &mut tx,
                    maker.user_id,
                    maker.cost_reserved_sats,
                    TxType::OrderPlaced,
                    Some(maker.id),
                )
                .await?;
                sqlx::query("UPDATE orders SET cost_reserved_sats = 0 WHERE id = $1")
                    .bind(maker.id)
                    .execute(&mut *tx)
                    .await?;
            }

            Bet::create(
                &mut tx,
                req.market_id,
                req.user_id,
                fill.maker_user_id,
                req.side,
                fill.taker_price_cents,
                fill.amount_sats,
                fill.taker_cost_sats,
                order.id,
                fill.maker_order_id,
            )
            .await?;
            Bet::create(
                &mut tx,
                req.market_id,
                fill.maker_user_id,
                req.user_id,
                req.side.opposite(),
                fill.maker_price_cents,
                fill.amount_sats,
                fill.maker_cost_sats,
                order.id,
                fill.maker_order_id,
            )
            .await?;
        }

        let auto_settled = if matched.fills.is_empty() {
            None
        } else {
            Bet::auto_settle(&mut tx, req.market_id, req.user_id, order.id).await?
        };

        // Finalize the taker row. The reservation was taken at the limit
        // price; fills consumed the exact pair costs, so settle the
        // difference — a credit on price improvement, or a top-up of at most
        // a few sats of per-fill rounding.
        let filled = matched.filled_sats();
        let remaining = matched.remaining_sats;
        let consumed = matched.taker_cost_sats();
        let needed = if remaining > 0 {
            cost_sats(req.price_cents, remaining)
        } else {
            0
        };
        let reserve_delta = cost - consumed - needed;
        if reserve_delta > 0 {
            LedgerEntry::credit(
                &mut tx,
                req.user_id,
                reserve_delta,
                TxType::OrderPlaced,
                Some(order.id),
            )
            .await?;
        } else if reserve_delta < 0 {
            LedgerEntry::debit(
                &mut tx,
                req.user_id,
                -reserve_delta,
                TxType::OrderPlaced,
                Some(order.id),
            )
            .await?;
        }

        let final_status = if remaining == 0 {
            OrderStatus::Filled
        } else if filled > 0 {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        };
        let order = sqlx::query_as::<_, Order>(
            "UPDATE orders SET filled_sats = $1, status = $2, cost_reserved_sats = $3
             WHERE id = $4
             RETURNING *",
        )
        .bind(filled)
        .bind(final_status.as_str())
        .bind(needed)
        .bind(order.id)
        .fetch_one(&mut *tx)
        .await?;

        // Keep the maker's exposure snapshot coherent with this commit when
        // the bot was on either end of a fill.
        let tier_change = if matched.fills.is_empty() {
            None
        } else {
            maker::track_exposure_in_tx(&mut tx, req.user_id, &matched).await?
        };

        tx.commit().await?;

        if !matched.fills.is_empty() {
            tracing::info!(
                order_id = order.id,
                market_id = req.market_id,
                user_id = req.user_id,
                filled_sats = filled,
                fills = matched.fills.len(),
                "order matched"
            );
        }

        Ok(PlaceOrderOutcome {
            order,
            cost_sats: cost,
            matched_count: matched.fills.len() as i64,
            auto_settled,
            tier_change,
        })
    }

    /// Cancel an order, refunding whatever is still reserved for it.
    pub async fn cancel(
        pool: &PgPool,
        user_id: i64,
        order_id: i64,
    ) -> Result<CancelOutcome, OrderError> {
        let mut attempt = 0;
        loop {
            match Self::cancel_once(pool, user_id, order_id).await {
                Err(OrderError::Database(e)) if db::is_retryable(&e) => {
                    if attempt >= db::MAX_TX_RETRIES {
                        return Err(OrderError::Busy);
                    }
                    attempt += 1;
                    db::retry_backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn cancel_once(
        pool: &PgPool,
        user_id: i64,
        order_id: i64,
    ) -> Result<CancelOutcome, OrderError> {
        // Market id first, so the advisory lock is taken before any row lock.
        let market_id: Option<i64> =
            sqlx::query_scalar("SELECT market_id FROM orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(pool)
                .await?;
        let market_id = market_id.ok_or(OrderError::NotFound)?;

        let mut tx = db::begin_pipeline(pool).await?;
        db::lock_market(&mut tx, market_id).await?;

        let order =
            sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(OrderError::NotFound)?;

        if order.user_id != user_id {
            return Err(OrderError::NotOwner);
        }
        if order.is_terminal() {
            return Err(OrderError::OrderTerminal(order.status.clone()));
        }

        let refund = Self::cancel_in_tx(&mut tx, &order).await?;
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(CancelOutcome {
            order,
            refund_sats: refund,
        })
    }

    /// Cancel one open/partial order inside the caller's transaction and
    /// refund the remaining reservation. The caller has already locked the
    /// market and verified the status.
    pub(crate) async fn cancel_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<Sats, LedgerError> {
        let refund = order.cost_reserved_sats;
        sqlx::query(
            "UPDATE orders SET status = 'cancelled', cost_reserved_sats = 0 WHERE id = $1",
        )
        .bind(order.id)
        .execute(&mut **tx)
        .await?;
        if refund > 0 {
            LedgerEntry::credit(
                tx,
                order.user_id,
                refund,
                TxType::OrderCancelled,
                Some(order.id),
            )
            .await?;
        }
        Ok(refund)
    }

    /// Cancel every open order of one user across all markets, in one commit.
    pub async fn cancel_all(pool: &PgPool, user_id: i64) -> Result<CancelAllOutcome, OrderError> {
        let mut attempt = 0;
        loop {
            match Self::cancel_all_once(pool, user_id).await {
                Err(OrderError::Database(e)) if db::is_retryable(&e) => {
                    if attempt >= db::MAX_TX_RETRIES {
                        return Err(OrderError::Busy);
                    }
                    attempt += 1;
                    db::retry_backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn cancel_all_once(
        pool: &PgPool,
        user_id: i64,
    ) -> Result<CancelAllOutcome, OrderError> {
        let mut market_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT market_id FROM orders
             WHERE user_id = $1 AND status IN ('open', 'partial')",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        market_ids.sort_unstable();

        let mut tx = db::begin_pipeline(pool).await?;
        for market_id in &market_ids {
            db::lock_market(&mut tx, *market_id).await?;
        }

        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders
             WHERE user_id = $1 AND status IN ('open', 'partial')
             ORDER BY market_id, id
             FOR UPDATE",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut refund_total = 0;
        let mut cancelled = 0;
        for order in &orders {
            refund_total += Self::cancel_in_tx(&mut tx, order).await?;
            cancelled += 1;
        }
        tx.commit().await?;

        Ok(CancelAllOutcome {
            orders_cancelled: cancelled,
            refund_sats: refund_total,
        })
    }

    pub async fn get(pool: &PgPool, order_id: i64) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE user_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Resting liquidity of one side, aggregated by price, best first.
    pub async fn book_side(
        pool: &PgPool,
        market_id: i64,
        side: Side,
    ) -> Result<Vec<BookLevel>, sqlx::Error> {
        sqlx::query_as::<_, BookLevel>(
            "SELECT price_cents, SUM(amount_sats - filled_sats)::BIGINT AS total_sats
             FROM orders
             WHERE market_id = $1 AND side = $2 AND status IN ('open', 'partial')
             GROUP BY price_cents
             ORDER BY price_cents DESC",
        )
        .bind(market_id)
        .bind(side.as_str())
        .fetch_all(pool)
        .await
    }
}

#[derive(sqlx::FromRow)]
struct RestingBookRow {
    id: i64,
    user_id: i64,
    price_cents: i16,
    remaining_sats: i64,
}

impl RestingBookRow {
    fn into_resting(self) -> RestingOrder {
        RestingOrder {
            id: self.id,
            user_id: self.user_id,
            price_cents: self.price_cents,
            remaining_sats: self.remaining_sats,
        }
    }
}
