use chrono::{DateTime, Utc};
use matching::{Sats, Side};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use super::{LedgerEntry, LedgerError, TxType};

/// One side of a matched stake. Each fill writes two rows, face for face:
/// the taker's at the fill price, the maker's at its quoted price. The pair's
/// costs sum to exactly the face value.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bet {
    pub id: i64,
    pub market_id: i64,
    pub user_id: i64,
    pub counterparty_user_id: i64,
    pub side: String,
    pub price_cents: i16,
    pub amount_sats: Sats,
    pub cost_sats: Sats,
    pub result: String,
    pub taker_order_id: i64,
    pub maker_order_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate holdings of one user in one market.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Position {
    pub market_id: i64,
    pub yes_sats: Sats,
    pub no_sats: Sats,
    pub cost_basis_sats: Sats,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AutoSettleOutcome {
    /// Face extinguished from each side and credited back in full.
    pub settled_sats: Sats,
    pub bets_closed: i64,
}

impl Bet {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        tx: &mut Transaction<'_, Postgres>,
        market_id: i64,
        user_id: i64,
        counterparty_user_id: i64,
        side: Side,
        price_cents: i16,
        amount_sats: Sats,
        cost_sats: Sats,
        taker_order_id: i64,
        maker_order_id: i64,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO bets (market_id, user_id, counterparty_user_id, side, price_cents,
                               amount_sats, cost_sats, taker_order_id, maker_order_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(market_id)
        .bind(user_id)
        .bind(counterparty_user_id)
        .bind(side.as_str())
        .bind(price_cents)
        .bind(amount_sats)
        .bind(cost_sats)
        .bind(taker_order_id)
        .bind(maker_order_id)
        .fetch_one(&mut **tx)
        .await
    }

    /// Net offsetting positions held by one user in one market: extinguish
    /// min(yes, no) face from each side (oldest bets first) and credit it
    /// back — a matched YES + NO pays its face on any outcome, so the cash
    /// can leave immediately. Counterparty rows stay live.
    pub async fn auto_settle(
        tx: &mut Transaction<'_, Postgres>,
        market_id: i64,
        user_id: i64,
        reference_order_id: i64,
    ) -> Result<Option<AutoSettleOutcome>, LedgerError> {
        let bets = sqlx::query_as::<_, Self>(
            "SELECT * FROM bets
             WHERE market_id = $1 AND user_id = $2 AND result = 'pending'
             ORDER BY id
             FOR UPDATE",
        )
        .bind(market_id)
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await?;

        let yes_total: Sats = bets
            .iter()
            .filter(|b| b.side == "yes")
            .map(|b| b.amount_sats)
            .sum();
        let no_total: Sats = bets
            .iter()
            .filter(|b| b.side == "no")
            .map(|b| b.amount_sats)
            .sum();

        let settle = yes_total.min(no_total);
        if settle == 0 {
            return Ok(None);
        }

        let mut closed = 0;
        for side in ["yes", "no"] {
            let mut left = settle;
            for bet in bets.iter().filter(|b| b.side == side) {
                if left == 0 {
                    break;
                }
                let take = left.min(bet.amount_sats);
                left -= take;
                if take == bet.amount_sats {
                    sqlx::query("UPDATE bets SET result = 'settled' WHERE id = $1")
                        .bind(bet.id)
                        .execute(&mut **tx)
                        .await?;
                    closed += 1;
                } else {
                    let remaining = bet.amount_sats - take;
                    let remaining_cost = bet.cost_sats * remaining / bet.amount_sats;
                    sqlx::query("UPDATE bets SET amount_sats = $1, cost_sats = $2 WHERE id = $3")
                        .bind(remaining)
                        .bind(remaining_cost)
                        .bind(bet.id)
                        .execute(&mut **tx)
                        .await?;
                }
            }
        }

        LedgerEntry::credit(
            tx,
            user_id,
            settle,
            TxType::AutoSettle,
            Some(reference_order_id),
        )
        .await?;

        Ok(Some(AutoSettleOutcome {
            settled_sats: settle,
            bets_closed: closed,
        }))
    }

    /// One row per market the user holds pending face in.
    pub async fn positions(pool: &PgPool, user_id: i64) -> Result<Vec<Position>, sqlx::Error> {
        sqlx::query_as::<_, Position>(
            "SELECT market_id,
                    COALESCE(SUM(amount_sats) FILTER (WHERE side = 'yes'), 0)::BIGINT AS yes_sats,
                    COALESCE(SUM(amount_sats) FILTER (WHERE side = 'no'), 0)::BIGINT AS no_sats,
                    COALESCE(SUM(cost_sats), 0)::BIGINT AS cost_basis_sats
             FROM bets
             WHERE user_id = $1 AND result = 'pending'
             GROUP BY market_id
             ORDER BY market_id",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn list_for_market(
        pool: &PgPool,
        market_id: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM bets WHERE market_id = $1 ORDER BY id")
            .bind(market_id)
            .fetch_all(pool)
            .await
    }
}
