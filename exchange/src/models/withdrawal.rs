use chrono::{DateTime, Utc};
use matching::Sats;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::lightning::{bolt11_amount_sats, InvoiceError};
use crate::maker::BotConfig;

use super::{LedgerEntry, LedgerError, Order, TxType};

/// A withdrawal reserves funds synchronously; the Lightning/on-chain
/// dispatch happens in an external adapter, which reports back through
/// `mark_settled` or `fail`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub amount_sats: Sats,
    pub bolt11: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum WithdrawalError {
    #[error("amount must be positive")]
    AmountInvalid,
    #[error("invoice amount {invoice_sats} does not match requested {requested_sats}")]
    InvoiceMismatch {
        invoice_sats: Sats,
        requested_sats: Sats,
    },
    #[error("invalid invoice: {0}")]
    Invoice(#[from] InvoiceError),
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Sats, required: Sats },
    #[error("withdrawal not found")]
    NotFound,
    #[error("withdrawal cannot transition from status {0}")]
    InvalidState(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<LedgerError> for WithdrawalError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                available,
                required,
            } => WithdrawalError::InsufficientFunds {
                available,
                required,
            },
            LedgerError::UserNotFound(_) => WithdrawalError::NotFound,
            LedgerError::Database(e) => WithdrawalError::Database(e),
        }
    }
}

impl Withdrawal {
    /// Reserve funds for a withdrawal. Amounts at or under `instant_max_sats`
    /// dispatch immediately; larger ones queue for admin approval. When the
    /// bot user withdraws, enough of its resting quotes are cancelled first
    /// to keep its cash at or above its outstanding reservations.
    pub async fn request(
        pool: &PgPool,
        user_id: i64,
        amount_sats: Sats,
        bolt11: Option<String>,
        instant_max_sats: Sats,
    ) -> Result<Self, WithdrawalError> {
        if amount_sats <= 0 {
            return Err(WithdrawalError::AmountInvalid);
        }
        if let Some(invoice) = &bolt11 {
            if let Some(invoice_sats) = bolt11_amount_sats(invoice)? {
                if invoice_sats != amount_sats {
                    return Err(WithdrawalError::InvoiceMismatch {
                        invoice_sats,
                        requested_sats: amount_sats,
                    });
                }
            }
        }

        let mut tx = pool.begin().await?;

        let is_bot = BotConfig::get_in_tx(&mut tx)
            .await?
            .is_some_and(|cfg| cfg.bot_user_id == user_id);
        if is_bot {
            Self::free_bot_liquidity(&mut tx, user_id, amount_sats).await?;
        }

        let status = if amount_sats <= instant_max_sats {
            "sent"
        } else {
            "pending_approval"
        };
        let withdrawal = sqlx::query_as::<_, Self>(
            "INSERT INTO withdrawals (user_id, amount_sats, bolt11, status)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(user_id)
        .bind(amount_sats)
        .bind(&bolt11)
        .bind(status)
        .fetch_one(&mut *tx)
        .await?;

        LedgerEntry::debit(
            &mut tx,
            user_id,
            amount_sats,
            TxType::Withdrawal,
            Some(withdrawal.id),
        )
        .await?;

        tx.commit().await?;
        Ok(withdrawal)
    }

    /// Cancel the bot's oldest quotes until its cash after the withdrawal
    /// covers the cost still reserved for its open orders.
    async fn free_bot_liquidity(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        bot_user_id: i64,
        amount_sats: Sats,
    ) -> Result<(), WithdrawalError> {
        loop {
            let balance: Sats =
                sqlx::query_scalar("SELECT balance_sats FROM users WHERE id = $1 FOR UPDATE")
                    .bind(bot_user_id)
                    .fetch_optional(&mut **tx)
                    .await?
                    .ok_or(WithdrawalError::NotFound)?;
            let reserved: Sats = sqlx::query_scalar(
                "SELECT COALESCE(SUM(cost_reserved_sats), 0)::BIGINT FROM orders
                 WHERE user_id = $1 AND status IN ('open', 'partial')",
            )
            .bind(bot_user_id)
            .fetch_one(&mut **tx)
            .await?;

            if balance - amount_sats >= reserved {
                return Ok(());
            }

            let oldest = sqlx::query_as::<_, Order>(
                "SELECT * FROM orders
                 WHERE user_id = $1 AND status IN ('open', 'partial')
                 ORDER BY id LIMIT 1
                 FOR UPDATE",
            )
            .bind(bot_user_id)
            .fetch_optional(&mut **tx)
            .await?;

            match oldest {
                Some(order) => {
                    tracing::info!(
                        order_id = order.id,
                        market_id = order.market_id,
                        "cancelling bot quote to free withdrawal liquidity"
                    );
                    Order::cancel_in_tx(tx, &order).await?;
                }
                // Nothing left to free; let the debit decide.
                None => return Ok(()),
            }
        }
    }

    pub async fn approve(pool: &PgPool, withdrawal_id: i64) -> Result<Self, WithdrawalError> {
        Self::transition(pool, withdrawal_id, &["pending_approval"], "sent").await
    }

    /// Adapter callback: the payment left and confirmed.
    pub async fn mark_settled(pool: &PgPool, withdrawal_id: i64) -> Result<Self, WithdrawalError> {
        Self::transition(pool, withdrawal_id, &["sent"], "settled").await
    }

    /// Adapter callback: the payment failed. Compensate with a paired
    /// reversal credit.
    pub async fn fail(pool: &PgPool, withdrawal_id: i64) -> Result<Self, WithdrawalError> {
        let mut tx = pool.begin().await?;
        let withdrawal =
            sqlx::query_as::<_, Self>("SELECT * FROM withdrawals WHERE id = $1 FOR UPDATE")
                .bind(withdrawal_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(WithdrawalError::NotFound)?;
        if withdrawal.status != "sent" && withdrawal.status != "pending_approval" {
            return Err(WithdrawalError::InvalidState(withdrawal.status));
        }

        let withdrawal = sqlx::query_as::<_, Self>(
            "UPDATE withdrawals SET status = 'failed', updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(withdrawal_id)
        .fetch_one(&mut *tx)
        .await?;

        LedgerEntry::credit(
            &mut tx,
            withdrawal.user_id,
            withdrawal.amount_sats,
            TxType::Withdrawal,
            Some(withdrawal.id),
        )
        .await?;

        tx.commit().await?;
        Ok(withdrawal)
    }

    async fn transition(
        pool: &PgPool,
        withdrawal_id: i64,
        from: &[&str],
        to: &str,
    ) -> Result<Self, WithdrawalError> {
        let mut tx = pool.begin().await?;
        let withdrawal =
            sqlx::query_as::<_, Self>("SELECT * FROM withdrawals WHERE id = $1 FOR UPDATE")
                .bind(withdrawal_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(WithdrawalError::NotFound)?;
        if !from.contains(&withdrawal.status.as_str()) {
            return Err(WithdrawalError::InvalidState(withdrawal.status));
        }
        let withdrawal = sqlx::query_as::<_, Self>(
            "UPDATE withdrawals SET status = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(to)
        .bind(withdrawal_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(withdrawal)
    }

    pub async fn get(pool: &PgPool, withdrawal_id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM withdrawals WHERE id = $1")
            .bind(withdrawal_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM withdrawals WHERE user_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
