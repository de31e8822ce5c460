use chrono::{DateTime, Utc};
use matching::{Sats, Side};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::db;

use super::{Bet, LedgerEntry, LedgerError, Order, TxType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Event,
    Attendance,
    Winner,
}

impl MarketType {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketType::Event => "event",
            MarketType::Attendance => "attendance",
            MarketType::Winner => "winner",
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A binary market. Orders and bets exist only while the status is `open`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Market {
    pub id: i64,
    pub title: String,
    pub market_type: String,
    pub grandmaster_id: Option<i64>,
    pub status: String,
    pub resolution: Option<String>,
    pub proposed_resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub bot_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub bets_settled: i64,
    pub orders_cancelled: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("market not found: {0}")]
    NotFound(i64),
    #[error("market cannot transition from status {0}")]
    InvalidState(String),
    #[error("market is busy, try again")]
    Busy,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<LedgerError> for MarketError {
    fn from(err: LedgerError) -> Self {
        match err {
            // Resolution only credits; a ledger failure here is a bug, not a
            // caller fault.
            LedgerError::Database(e) => MarketError::Database(e),
            other => MarketError::Database(sqlx::Error::Protocol(other.to_string())),
        }
    }
}

impl Market {
    pub async fn create(
        pool: &PgPool,
        title: &str,
        market_type: MarketType,
        grandmaster_id: Option<i64>,
        bot_enabled: bool,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO markets (title, market_type, grandmaster_id, bot_enabled)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(title)
        .bind(market_type.as_str())
        .bind(grandmaster_id)
        .bind(bot_enabled)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &PgPool, market_id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM markets WHERE id = $1")
            .bind(market_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM markets ORDER BY id")
            .fetch_all(pool)
            .await
    }

    /// Markets the bot may quote on.
    pub async fn list_open_bot_enabled(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM markets WHERE status = 'open' AND bot_enabled ORDER BY id",
        )
        .fetch_all(pool)
        .await
    }

    /// First step of the delayed resolution path: freeze the market so no
    /// new orders land while the outcome is under review.
    pub async fn initiate_resolution(
        pool: &PgPool,
        market_id: i64,
        proposed: Side,
        notes: Option<&str>,
    ) -> Result<Self, MarketError> {
        let market = sqlx::query_as::<_, Self>(
            "UPDATE markets
             SET status = 'pending_resolution', proposed_resolution = $1, resolution_notes = $2
             WHERE id = $3 AND status = 'open'
             RETURNING *",
        )
        .bind(proposed.as_str())
        .bind(notes)
        .bind(market_id)
        .fetch_optional(pool)
        .await?;

        match market {
            Some(m) => Ok(m),
            None => match Self::get(pool, market_id).await? {
                Some(m) => Err(MarketError::InvalidState(m.status)),
                None => Err(MarketError::NotFound(market_id)),
            },
        }
    }

    /// Finalise a market: every pending bet becomes won or lost, winners are
    /// credited their face value, open orders are cancelled with refunds,
    /// and the market is marked resolved. One commit.
    pub async fn resolve(
        pool: &PgPool,
        market_id: i64,
        winning_side: Side,
        notes: Option<&str>,
    ) -> Result<ResolveOutcome, MarketError> {
        let mut attempt = 0;
        loop {
            match Self::resolve_once(pool, market_id, winning_side, notes).await {
                Err(MarketError::Database(e)) if db::is_retryable(&e) => {
                    if attempt >= db::MAX_TX_RETRIES {
                        return Err(MarketError::Busy);
                    }
                    attempt += 1;
                    db::retry_backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn resolve_once(
        pool: &PgPool,
        market_id: i64,
        winning_side: Side,
        notes: Option<&str>,
    ) -> Result<ResolveOutcome, MarketError> {
        let mut tx = db::begin_pipeline(pool).await?;
        db::lock_market(&mut tx, market_id).await?;

        let market =
            sqlx::query_as::<_, Self>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
                .bind(market_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(MarketError::NotFound(market_id))?;
        if market.status != "open" && market.status != "pending_resolution" {
            return Err(MarketError::InvalidState(market.status));
        }

        let bets = sqlx::query_as::<_, Bet>(
            "SELECT * FROM bets WHERE market_id = $1 AND result = 'pending' ORDER BY id FOR UPDATE",
        )
        .bind(market_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut bets_settled = 0;
        for bet in &bets {
            let won = bet.side == winning_side.as_str();
            sqlx::query("UPDATE bets SET result = $1 WHERE id = $2")
                .bind(if won { "won" } else { "lost" })
                .bind(bet.id)
                .execute(&mut *tx)
                .await?;
            if won {
                LedgerEntry::credit(
                    &mut tx,
                    bet.user_id,
                    bet.amount_sats,
                    TxType::BetWon,
                    Some(bet.id),
                )
                .await?;
            }
            // Losing bets paid their cost at placement; nothing moves here.
            bets_settled += 1;
        }

        let orders_cancelled = Self::cancel_open_orders_in_tx(&mut tx, market_id).await?;

        sqlx::query(
            "UPDATE markets
             SET status = 'resolved', resolution = $1, resolution_notes = COALESCE($2, resolution_notes)
             WHERE id = $3",
        )
        .bind(winning_side.as_str())
        .bind(notes)
        .bind(market_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            market_id,
            winning_side = %winning_side,
            bets_settled,
            orders_cancelled,
            "market resolved"
        );

        Ok(ResolveOutcome {
            bets_settled,
            orders_cancelled,
        })
    }

    /// Void a market. Open orders refund in full; each pending bet pays out
    /// half its face (a void binary claim is worth half its payout — costs
    /// can no longer be returned once auto-settles have drawn on the pool).
    pub async fn cancel(
        pool: &PgPool,
        market_id: i64,
        notes: Option<&str>,
    ) -> Result<ResolveOutcome, MarketError> {
        let mut tx = db::begin_pipeline(pool).await?;
        db::lock_market(&mut tx, market_id).await?;

        let market =
            sqlx::query_as::<_, Self>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
                .bind(market_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(MarketError::NotFound(market_id))?;
        if market.status != "open" && market.status != "pending_resolution" {
            return Err(MarketError::InvalidState(market.status));
        }

        let bets = sqlx::query_as::<_, Bet>(
            "SELECT * FROM bets WHERE market_id = $1 AND result = 'pending' ORDER BY id FOR UPDATE",
        )
        .bind(market_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut bets_settled = 0;
        for bet in &bets {
            let refund: Sats = bet.amount_sats / 2;
            sqlx::query("UPDATE bets SET result = 'settled' WHERE id = $1")
                .bind(bet.id)
                .execute(&mut *tx)
                .await?;
            if refund > 0 {
                LedgerEntry::credit(
                    &mut tx,
                    bet.user_id,
                    refund,
                    TxType::AdminAdjust,
                    Some(bet.id),
                )
                .await?;
            }
            bets_settled += 1;
        }

        let orders_cancelled = Self::cancel_open_orders_in_tx(&mut tx, market_id).await?;

        sqlx::query(
            "UPDATE markets
             SET status = 'cancelled', resolution_notes = COALESCE($1, resolution_notes)
             WHERE id = $2",
        )
        .bind(notes)
        .bind(market_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ResolveOutcome {
            bets_settled,
            orders_cancelled,
        })
    }

    async fn cancel_open_orders_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        market_id: i64,
    ) -> Result<i64, MarketError> {
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders
             WHERE market_id = $1 AND status IN ('open', 'partial')
             ORDER BY id
             FOR UPDATE",
        )
        .bind(market_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut cancelled = 0;
        for order in &orders {
            Order::cancel_in_tx(tx, order).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }
}
