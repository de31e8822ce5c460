use chrono::{DateTime, Utc};
use matching::Sats;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// An account holder. The market-maker bot is a plain user row; identity and
/// authentication live in an external layer, so requests carry user ids.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub balance_sats: Sats,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Upsert by username. The identity provider calls this when it first
    /// sees an account; repeat calls refresh email/admin only.
    pub async fn ensure(
        pool: &PgPool,
        username: &str,
        email: Option<&str>,
        is_admin: bool,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO users (username, email, is_admin)
             VALUES ($1, $2, $3)
             ON CONFLICT (username) DO UPDATE SET
                email = COALESCE(EXCLUDED.email, users.email),
                is_admin = EXCLUDED.is_admin
             RETURNING *",
        )
        .bind(username)
        .bind(email)
        .bind(is_admin)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &PgPool, user_id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn get_by_username(
        pool: &PgPool,
        username: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(pool)
            .await
    }
}
