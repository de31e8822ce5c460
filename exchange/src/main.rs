use anyhow::Context;

use exchange::config::Config;
use exchange::{db, routes, AppState};

/// Exit codes: 0 normal, 1 configuration error, 2 storage unavailable.
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("exchange=debug,tower_http=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!("{e:#}");
        std::process::exit(2);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let bind_addr = config.bind_addr.clone();
    let state = AppState { pool, config };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("Exchange listening on {bind_addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
