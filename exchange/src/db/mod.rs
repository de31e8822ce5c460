use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

/// Advisory lock class for per-market pipeline serialisation.
const MARKET_LOCK_CLASS: i32 = 1;

/// Bounded retry for commits that collide on a market.
pub const MAX_TX_RETRIES: u32 = 5;
pub const RETRY_BACKOFF_MS: u64 = 20;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Run migrations in order; every statement is idempotent.
    let migrations = [
        include_str!("../../migrations/001_create_users.sql"),
        include_str!("../../migrations/002_create_markets.sql"),
        include_str!("../../migrations/003_create_orders.sql"),
        include_str!("../../migrations/004_create_bets.sql"),
        include_str!("../../migrations/005_create_transactions.sql"),
        include_str!("../../migrations/006_create_withdrawals.sql"),
        include_str!("../../migrations/007_create_bot_tables.sql"),
    ];

    for migration in migrations {
        sqlx::raw_sql(migration).execute(pool).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Begin a pipeline transaction. Conflicting pipelines serialise on the
/// market's advisory lock rather than aborting each other; together with the
/// row locks taken on users and orders, the commit is serializable with
/// respect to balance and order updates. Deadlocks still surface and are
/// retried by the caller via `is_retryable`.
pub async fn begin_pipeline(pool: &PgPool) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
    pool.begin().await
}

/// Serialise all pipelines touching one market without holding the markets
/// row itself (a row lock there would stall unrelated market reads).
pub async fn lock_market(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(MARKET_LOCK_CLASS)
        .bind(market_id as i32)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Serialization failures and deadlocks are retried with backoff; everything
/// else propagates.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

pub async fn retry_backoff(attempt: u32) {
    tokio::time::sleep(std::time::Duration::from_millis(
        RETRY_BACKOFF_MS * (attempt as u64 + 1),
    ))
    .await;
}
