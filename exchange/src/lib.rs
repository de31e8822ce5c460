pub mod config;
pub mod db;
pub mod error;
pub mod lightning;
pub mod maker;
pub mod models;
pub mod routes;

use sqlx::PgPool;

use config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
}
