use chrono::{DateTime, Utc};
use matching::Sats;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Deposit,
    Withdrawal,
    OrderPlaced,
    OrderCancelled,
    BetWon,
    BetLostPaid,
    AutoSettle,
    AdminAdjust,
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxType::Deposit => "deposit",
            TxType::Withdrawal => "withdrawal",
            TxType::OrderPlaced => "order_placed",
            TxType::OrderCancelled => "order_cancelled",
            TxType::BetWon => "bet_won",
            TxType::BetLostPaid => "bet_lost_paid",
            TxType::AutoSettle => "auto_settle",
            TxType::AdminAdjust => "admin_adjust",
        };
        f.write_str(s)
    }
}

/// One row of the append-only transaction journal. `balance_after` snapshots
/// the balance at that ordinal; the latest row always equals
/// `users.balance_sats`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub tx_type: String,
    pub amount_sats: Sats,
    pub balance_after: Sats,
    pub reference_id: Option<i64>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Sats, required: Sats },
    #[error("user not found: {0}")]
    UserNotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerEntry {
    /// Credit `amount` sats to a user. The only way balances grow.
    pub async fn credit(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        amount_sats: Sats,
        tx_type: TxType,
        reference_id: Option<i64>,
    ) -> Result<Self, LedgerError> {
        debug_assert!(amount_sats >= 0);
        Self::apply(tx, user_id, amount_sats, tx_type, reference_id).await
    }

    /// Debit `amount` sats from a user, failing without side effects when the
    /// balance would go negative.
    pub async fn debit(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        amount_sats: Sats,
        tx_type: TxType,
        reference_id: Option<i64>,
    ) -> Result<Self, LedgerError> {
        debug_assert!(amount_sats >= 0);
        Self::apply(tx, user_id, -amount_sats, tx_type, reference_id).await
    }

    /// Apply a signed delta under the caller's transaction: lock the user
    /// row, move the balance, append the journal row. No balance mutation
    /// happens anywhere else.
    async fn apply(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        delta_sats: Sats,
        tx_type: TxType,
        reference_id: Option<i64>,
    ) -> Result<Self, LedgerError> {
        let balance: Option<Sats> =
            sqlx::query_scalar("SELECT balance_sats FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;
        let balance = balance.ok_or(LedgerError::UserNotFound(user_id))?;

        let new_balance = balance + delta_sats;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientFunds {
                available: balance,
                required: -delta_sats,
            });
        }

        sqlx::query("UPDATE users SET balance_sats = $1 WHERE id = $2")
            .bind(new_balance)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        let entry = sqlx::query_as::<_, Self>(
            "INSERT INTO transactions (user_id, tx_type, amount_sats, balance_after, reference_id)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(user_id)
        .bind(tx_type.to_string())
        .bind(delta_sats)
        .bind(new_balance)
        .bind(reference_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Transaction history for a user, newest first.
    pub async fn history(
        pool: &PgPool,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM transactions WHERE user_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Derive a balance from the journal (for reconciliation checks).
    pub async fn derive_balance(pool: &PgPool, user_id: i64) -> Result<Sats, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_sats), 0)::BIGINT FROM transactions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
    }

    /// Check that the journal sum matches the stored balance.
    pub async fn reconcile(pool: &PgPool, user_id: i64) -> Result<bool, sqlx::Error> {
        let derived = Self::derive_balance(pool, user_id).await?;
        let stored: Sats =
            sqlx::query_scalar("SELECT COALESCE((SELECT balance_sats FROM users WHERE id = $1), 0)")
                .bind(user_id)
                .fetch_one(pool)
                .await?;
        Ok(derived == stored)
    }
}
