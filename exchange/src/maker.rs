//! The market-maker bot: a plain user whose resting quotes follow a
//! per-market-type buy curve, scaled down as its matched exposure approaches
//! a hard loss cap. The order pipeline keeps the exposure snapshot coherent
//! inside its own commit; reconciliation reacts to tier changes afterwards.

use matching::curve::{self, CurvePoint, MULTIPLIER_UNIT};
use matching::{MatchResult, Sats, Side, MIN_ORDER_SATS};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::db;
use crate::models::{Market, Order, OrderError, PlaceOrderRequest};

/// Bound on reconcile-fill-reconcile cascades in one trigger.
const MAX_CASCADE_ROUNDS: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BotConfig {
    pub id: i16,
    pub bot_user_id: i64,
    pub side: String,
    pub max_acceptable_loss_sats: Sats,
    pub threshold_percent: i64,
    pub global_multiplier_permille: i64,
    pub is_active: bool,
}

impl BotConfig {
    pub fn quote_side(&self) -> Side {
        Side::parse(&self.side).unwrap_or(Side::No)
    }

    pub async fn get(pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT id, bot_user_id, side, max_acceptable_loss_sats, threshold_percent,
                    global_multiplier_permille, is_active
             FROM bot_config WHERE id = 1",
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn get_in_tx(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT id, bot_user_id, side, max_acceptable_loss_sats, threshold_percent,
                    global_multiplier_permille, is_active
             FROM bot_config WHERE id = 1",
        )
        .fetch_optional(&mut **tx)
        .await
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BotExposure {
    pub total_at_risk_sats: Sats,
    pub current_tier: i64,
}

/// Recorded when a commit moved exposure across a tier boundary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TierChange {
    pub previous_tier: i64,
    pub current_tier: i64,
    pub at_risk_sats: Sats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideType {
    Disable,
    Multiplier,
}

impl OverrideType {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideType::Disable => "disable",
            OverrideType::Multiplier => "multiplier",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MarketOverride {
    pub market_id: i64,
    pub override_type: String,
    pub multiplier_permille: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub market_id: i64,
    pub orders_cancelled: i64,
    pub placed_sats: Sats,
    pub placements_failed: i64,
    pub at_risk_sats: Sats,
    pub tier: i64,
    pub tier_moved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MakerStatus {
    pub config: Option<BotConfig>,
    pub exposure: BotExposure,
    pub pullback_permille: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum MakerError {
    #[error("market maker is not configured")]
    NotConfigured,
    #[error("market not found: {0}")]
    MarketNotFound(i64),
    #[error("order pipeline error: {0}")]
    Order(#[from] OrderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Worst-case matched loss across all markets: per market, the larger side of
/// the bot's pending bet faces. Resting quotes are excluded — they can always
/// be pulled, which is exactly what reconciliation does.
async fn matched_exposure_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    bot_user_id: i64,
) -> Result<Sats, sqlx::Error> {
    let rows: Vec<(i64, String, i64)> = sqlx::query_as(
        "SELECT market_id, side, COALESCE(SUM(amount_sats), 0)::BIGINT
         FROM bets
         WHERE user_id = $1 AND result = 'pending'
         GROUP BY market_id, side",
    )
    .bind(bot_user_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut total = 0;
    let mut current_market = None;
    let mut yes = 0;
    let mut no = 0;
    let mut rows = rows;
    rows.sort_by_key(|r| r.0);
    for (market_id, side, face) in rows {
        if current_market != Some(market_id) {
            total += yes.max(no);
            yes = 0;
            no = 0;
            current_market = Some(market_id);
        }
        if side == "yes" {
            yes = face;
        } else {
            no = face;
        }
    }
    total += yes.max(no);
    Ok(total)
}

/// Refresh the shared exposure row under lock and report a tier crossing.
async fn refresh_exposure_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    cfg: &BotConfig,
) -> Result<(BotExposure, Option<TierChange>), sqlx::Error> {
    let previous = sqlx::query_as::<_, BotExposure>(
        "SELECT total_at_risk_sats, current_tier FROM bot_exposure WHERE id = 1 FOR UPDATE",
    )
    .fetch_one(&mut **tx)
    .await?;

    let at_risk = matched_exposure_in_tx(tx, cfg.bot_user_id).await?;
    let tier = curve::tier(
        at_risk,
        cfg.max_acceptable_loss_sats,
        cfg.threshold_percent,
    );

    sqlx::query(
        "UPDATE bot_exposure SET total_at_risk_sats = $1, current_tier = $2, updated_at = NOW()
         WHERE id = 1",
    )
    .bind(at_risk)
    .bind(tier)
    .execute(&mut **tx)
    .await?;

    let change = (tier != previous.current_tier).then_some(TierChange {
        previous_tier: previous.current_tier,
        current_tier: tier,
        at_risk_sats: at_risk,
    });
    Ok((
        BotExposure {
            total_at_risk_sats: at_risk,
            current_tier: tier,
        },
        change,
    ))
}

/// Pipeline hook: when the bot sat on either end of a fill, bring the
/// exposure snapshot up to date inside the same commit so the tier check is
/// coherent with the fill.
pub(crate) async fn track_exposure_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    taker_user_id: i64,
    matched: &MatchResult,
) -> Result<Option<TierChange>, sqlx::Error> {
    let Some(cfg) = BotConfig::get_in_tx(tx).await? else {
        return Ok(None);
    };
    let involved = taker_user_id == cfg.bot_user_id
        || matched
            .fills
            .iter()
            .any(|f| f.maker_user_id == cfg.bot_user_id);
    if !involved {
        return Ok(None);
    }
    let (_, change) = refresh_exposure_in_tx(tx, &cfg).await?;
    Ok(change)
}

async fn log_activity(
    pool: &PgPool,
    action: &str,
    exposure_before: Sats,
    exposure_after: Sats,
    details: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO bot_activity_log (action, exposure_before_sats, exposure_after_sats, details)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(action)
    .bind(exposure_before)
    .bind(exposure_after)
    .bind(details.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

async fn curve_points(pool: &PgPool, market_type: &str) -> Result<Vec<CurvePoint>, sqlx::Error> {
    let rows: Vec<(i16, i64)> = sqlx::query_as(
        "SELECT price_cents, weight_sats FROM bot_buy_curves
         WHERE market_type = $1 ORDER BY price_cents",
    )
    .bind(market_type)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(price_cents, weight_sats)| CurvePoint {
            price_cents,
            weight_sats,
        })
        .collect())
}

async fn market_multiplier(pool: &PgPool, market: &Market) -> Result<i64, sqlx::Error> {
    if !market.bot_enabled {
        return Ok(0);
    }
    let override_row = sqlx::query_as::<_, MarketOverride>(
        "SELECT market_id, override_type, multiplier_permille
         FROM bot_market_overrides WHERE market_id = $1",
    )
    .bind(market.id)
    .fetch_optional(pool)
    .await?;
    Ok(match override_row {
        None => MULTIPLIER_UNIT,
        Some(o) if o.override_type == "disable" => 0,
        Some(o) => o.multiplier_permille,
    })
}

/// Bring one market's resting bot quotes to the curve targets under the
/// current pullback. Cancels run in one commit; top-ups go through the
/// normal order pipeline afterwards, one commit each, and a failed
/// reservation only skips that price.
pub async fn reconcile_market(
    pool: &PgPool,
    market_id: i64,
) -> Result<ReconcileOutcome, MakerError> {
    let cfg = BotConfig::get(pool).await?.ok_or(MakerError::NotConfigured)?;
    let market = Market::get(pool, market_id)
        .await?
        .ok_or(MakerError::MarketNotFound(market_id))?;

    let active = cfg.is_active && market.status == "open";
    let multiplier = if active {
        market_multiplier(pool, &market).await?
    } else {
        0
    };
    let points = curve_points(pool, &market.market_type).await?;
    let side = cfg.quote_side();

    let mut tx = db::begin_pipeline(pool).await?;
    db::lock_market(&mut tx, market_id).await?;

    let at_risk = matched_exposure_in_tx(&mut tx, cfg.bot_user_id).await?;
    let targets = curve::scaled_targets(
        &points,
        cfg.global_multiplier_permille,
        multiplier,
        at_risk,
        cfg.max_acceptable_loss_sats,
    );

    let resting = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders
         WHERE market_id = $1 AND user_id = $2 AND side = $3 AND status IN ('open', 'partial')
         ORDER BY id
         FOR UPDATE",
    )
    .bind(market_id)
    .bind(cfg.bot_user_id)
    .bind(side.as_str())
    .fetch_all(&mut *tx)
    .await?;

    let mut orders_cancelled = 0;
    let mut deficits: Vec<(i16, Sats)> = Vec::new();
    for (price, target) in &targets {
        let mut current: Sats = resting
            .iter()
            .filter(|o| o.price_cents == *price)
            .map(|o| o.remaining_sats())
            .sum();

        if current > *target {
            // Oldest first, whole orders, until at or under target.
            for order in resting.iter().filter(|o| o.price_cents == *price) {
                if current <= *target {
                    break;
                }
                Order::cancel_in_tx(&mut tx, order)
                    .await
                    .map_err(|e| MakerError::Order(e.into()))?;
                current -= order.remaining_sats();
                orders_cancelled += 1;
            }
        }
        // Whole-order cancels can overshoot; re-quote the gap either way.
        if *target - current >= MIN_ORDER_SATS {
            deficits.push((*price, *target - current));
        }
    }

    // Quotes at prices no longer on the curve are stale liquidity.
    for order in &resting {
        if !targets.iter().any(|(p, _)| *p == order.price_cents) && order.status != "cancelled" {
            Order::cancel_in_tx(&mut tx, order)
                .await
                .map_err(|e| MakerError::Order(e.into()))?;
            orders_cancelled += 1;
        }
    }

    let (exposure, tier_change) = refresh_exposure_in_tx(&mut tx, &cfg).await?;
    tx.commit().await?;

    let mut placed_sats = 0;
    let mut placements_failed = 0;
    let mut tier_moved = tier_change.is_some();
    for (price, deficit) in deficits {
        let req = PlaceOrderRequest {
            user_id: cfg.bot_user_id,
            market_id,
            side,
            price_cents: price,
            amount_sats: deficit,
        };
        match Order::place(pool, &req).await {
            Ok(outcome) => {
                placed_sats += deficit;
                tier_moved |= outcome.tier_change.is_some();
            }
            Err(OrderError::InsufficientFunds {
                available,
                required,
            }) => {
                tracing::warn!(
                    market_id,
                    price_cents = price,
                    available,
                    required,
                    "bot quote skipped: insufficient funds"
                );
                placements_failed += 1;
            }
            Err(OrderError::MarketUnavailable(status)) => {
                tracing::warn!(market_id, %status, "bot quote skipped: market closed underneath");
                placements_failed += 1;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let outcome = ReconcileOutcome {
        market_id,
        orders_cancelled,
        placed_sats,
        placements_failed,
        at_risk_sats: exposure.total_at_risk_sats,
        tier: exposure.current_tier,
        tier_moved,
    };
    log_activity(
        pool,
        "reconcile",
        at_risk,
        exposure.total_at_risk_sats,
        &serde_json::json!({
            "market_id": market_id,
            "orders_cancelled": orders_cancelled,
            "placed_sats": placed_sats,
            "placements_failed": placements_failed,
        }),
    )
    .await?;

    Ok(outcome)
}

/// Reconcile every market the bot quotes on. Fills caused by the bot's own
/// top-ups can move the tier again, so sweep until stable within a bounded
/// number of rounds.
pub async fn reconcile_all(pool: &PgPool) -> Result<Vec<ReconcileOutcome>, MakerError> {
    let mut outcomes = Vec::new();
    for round in 0..MAX_CASCADE_ROUNDS {
        let markets = Market::list_open_bot_enabled(pool).await?;
        let mut moved = false;
        for market in &markets {
            let outcome = reconcile_market(pool, market.id).await?;
            moved |= outcome.tier_moved;
            outcomes.push(outcome);
        }
        if !moved {
            break;
        }
        tracing::debug!(round, "tier moved during reconciliation, sweeping again");
    }
    Ok(outcomes)
}

/// Entry point for the pipeline's post-commit hook: a fill crossed a tier
/// boundary, so pull liquidity everywhere.
pub async fn on_tier_change(pool: &PgPool, change: TierChange) -> Result<(), MakerError> {
    tracing::info!(
        previous_tier = change.previous_tier,
        current_tier = change.current_tier,
        at_risk_sats = change.at_risk_sats,
        "exposure tier changed, reconciling all markets"
    );
    log_activity(
        pool,
        "tier_change",
        change.at_risk_sats,
        change.at_risk_sats,
        &serde_json::json!({
            "previous_tier": change.previous_tier,
            "current_tier": change.current_tier,
        }),
    )
    .await?;
    reconcile_all(pool).await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub markets_reconciled: i64,
    pub outcomes: Vec<ReconcileOutcome>,
}

/// Deploy liquidity across every open market the bot may quote on.
pub async fn deploy(pool: &PgPool) -> Result<DeployOutcome, MakerError> {
    let before = current_exposure(pool).await?;
    let outcomes = reconcile_all(pool).await?;
    let after = current_exposure(pool).await?;
    log_activity(
        pool,
        "deploy",
        before.total_at_risk_sats,
        after.total_at_risk_sats,
        &serde_json::json!({ "markets": outcomes.len() }),
    )
    .await?;
    Ok(DeployOutcome {
        markets_reconciled: outcomes.len() as i64,
        outcomes,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawOutcome {
    pub orders_cancelled: i64,
    pub refund_sats: Sats,
}

/// Pull every bot quote from every market.
pub async fn withdraw_all(pool: &PgPool) -> Result<WithdrawOutcome, MakerError> {
    let cfg = BotConfig::get(pool).await?.ok_or(MakerError::NotConfigured)?;
    let before = current_exposure(pool).await?;
    let cancelled = Order::cancel_all(pool, cfg.bot_user_id).await?;
    let after = current_exposure(pool).await?;
    log_activity(
        pool,
        "withdraw",
        before.total_at_risk_sats,
        after.total_at_risk_sats,
        &serde_json::json!({
            "orders_cancelled": cancelled.orders_cancelled,
            "refund_sats": cancelled.refund_sats,
        }),
    )
    .await?;
    Ok(WithdrawOutcome {
        orders_cancelled: cancelled.orders_cancelled,
        refund_sats: cancelled.refund_sats,
    })
}

/// Recompute the shared exposure row outside the pipeline, e.g. after a
/// resolution retired bot bets.
pub async fn refresh_exposure(pool: &PgPool) -> Result<Option<TierChange>, sqlx::Error> {
    let Some(cfg) = BotConfig::get(pool).await? else {
        return Ok(None);
    };
    let mut tx = pool.begin().await?;
    let (_, change) = refresh_exposure_in_tx(&mut tx, &cfg).await?;
    tx.commit().await?;
    Ok(change)
}

pub async fn current_exposure(pool: &PgPool) -> Result<BotExposure, sqlx::Error> {
    sqlx::query_as::<_, BotExposure>(
        "SELECT total_at_risk_sats, current_tier FROM bot_exposure WHERE id = 1",
    )
    .fetch_one(pool)
    .await
}

pub async fn status(pool: &PgPool) -> Result<MakerStatus, sqlx::Error> {
    let config = BotConfig::get(pool).await?;
    let exposure = current_exposure(pool).await?;
    let pullback = config
        .as_ref()
        .map(|c| curve::pullback_permille(exposure.total_at_risk_sats, c.max_acceptable_loss_sats))
        .unwrap_or(0);
    Ok(MakerStatus {
        config,
        exposure,
        pullback_permille: pullback,
    })
}

/// Replace the bot configuration. Reconciliation is the caller's follow-up.
#[allow(clippy::too_many_arguments)]
pub async fn set_config(
    pool: &PgPool,
    bot_user_id: i64,
    side: Side,
    max_acceptable_loss_sats: Sats,
    threshold_percent: i64,
    global_multiplier_permille: i64,
    is_active: bool,
) -> Result<BotConfig, sqlx::Error> {
    sqlx::query_as::<_, BotConfig>(
        "INSERT INTO bot_config (id, bot_user_id, side, max_acceptable_loss_sats,
                                 threshold_percent, global_multiplier_permille, is_active)
         VALUES (1, $1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET
            bot_user_id = EXCLUDED.bot_user_id,
            side = EXCLUDED.side,
            max_acceptable_loss_sats = EXCLUDED.max_acceptable_loss_sats,
            threshold_percent = EXCLUDED.threshold_percent,
            global_multiplier_permille = EXCLUDED.global_multiplier_permille,
            is_active = EXCLUDED.is_active,
            updated_at = NOW()
         RETURNING id, bot_user_id, side, max_acceptable_loss_sats, threshold_percent,
                   global_multiplier_permille, is_active",
    )
    .bind(bot_user_id)
    .bind(side.as_str())
    .bind(max_acceptable_loss_sats)
    .bind(threshold_percent)
    .bind(global_multiplier_permille)
    .bind(is_active)
    .fetch_one(pool)
    .await
}

/// Replace the buy curve for one market type.
pub async fn set_curve(
    pool: &PgPool,
    market_type: &str,
    points: &[(i16, Sats)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM bot_buy_curves WHERE market_type = $1")
        .bind(market_type)
        .execute(&mut *tx)
        .await?;
    for (price_cents, weight_sats) in points {
        sqlx::query(
            "INSERT INTO bot_buy_curves (market_type, price_cents, weight_sats)
             VALUES ($1, $2, $3)",
        )
        .bind(market_type)
        .bind(price_cents)
        .bind(weight_sats)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn set_override(
    pool: &PgPool,
    market_id: i64,
    override_type: OverrideType,
    multiplier_permille: i64,
) -> Result<MarketOverride, sqlx::Error> {
    sqlx::query_as::<_, MarketOverride>(
        "INSERT INTO bot_market_overrides (market_id, override_type, multiplier_permille)
         VALUES ($1, $2, $3)
         ON CONFLICT (market_id) DO UPDATE SET
            override_type = EXCLUDED.override_type,
            multiplier_permille = EXCLUDED.multiplier_permille,
            updated_at = NOW()
         RETURNING market_id, override_type, multiplier_permille",
    )
    .bind(market_id)
    .bind(override_type.as_str())
    .bind(multiplier_permille)
    .fetch_one(pool)
    .await
}

pub async fn clear_override(pool: &PgPool, market_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM bot_market_overrides WHERE market_id = $1")
        .bind(market_id)
        .execute(pool)
        .await?;
    Ok(())
}
