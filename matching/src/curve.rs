//! Quote sizing for the inventory-constrained market maker.
//!
//! A buy curve is an ordered set of (price, weight) points describing the
//! full-scale shape of the bot's ladder for one market type. Deployed size
//! at each price is the weight scaled by the global multiplier, a per-market
//! multiplier, and the pullback ratio 1 − at_risk/max_loss. Multipliers are
//! permille integers (1000 = ×1.0) so sizing stays in exact integer
//! arithmetic; the only rounding is the final floor.

use crate::Sats;

/// Permille fixed-point unit for multipliers.
pub const MULTIPLIER_UNIT: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurvePoint {
    pub price_cents: i16,
    pub weight_sats: Sats,
}

/// Exposure as a percentage of the loss cap, saturating at the cap and
/// treating a non-positive cap as fully exposed.
pub fn risk_percent(at_risk_sats: Sats, max_loss_sats: Sats) -> i64 {
    if max_loss_sats <= 0 {
        return 100;
    }
    let at_risk = at_risk_sats.max(0);
    (at_risk as i128 * 100 / max_loss_sats as i128).min(100) as i64
}

/// Tier index: exposure percentage bucketed by the threshold width.
pub fn tier(at_risk_sats: Sats, max_loss_sats: Sats, threshold_percent: i64) -> i64 {
    risk_percent(at_risk_sats, max_loss_sats) / threshold_percent.max(1)
}

/// Pullback ratio in permille, clamped to [0, 1000].
pub fn pullback_permille(at_risk_sats: Sats, max_loss_sats: Sats) -> i64 {
    if max_loss_sats <= 0 {
        return 0;
    }
    let headroom = (max_loss_sats - at_risk_sats.max(0)).max(0);
    (headroom as i128 * MULTIPLIER_UNIT as i128 / max_loss_sats as i128) as i64
}

/// Deployed face at one curve point:
/// ⌊weight · global · market · (1 − at_risk/max_loss)⌋.
pub fn target_sats(
    weight_sats: Sats,
    global_multiplier_permille: i64,
    market_multiplier_permille: i64,
    at_risk_sats: Sats,
    max_loss_sats: Sats,
) -> Sats {
    if max_loss_sats <= 0 {
        return 0;
    }
    let headroom = (max_loss_sats - at_risk_sats.max(0)).max(0) as i128;
    let scaled = weight_sats.max(0) as i128
        * global_multiplier_permille.max(0) as i128
        * market_multiplier_permille.max(0) as i128
        * headroom;
    let denom = MULTIPLIER_UNIT as i128 * MULTIPLIER_UNIT as i128 * max_loss_sats as i128;
    (scaled / denom) as Sats
}

/// Target face per curve price for one market under the current exposure.
pub fn scaled_targets(
    points: &[CurvePoint],
    global_multiplier_permille: i64,
    market_multiplier_permille: i64,
    at_risk_sats: Sats,
    max_loss_sats: Sats,
) -> Vec<(i16, Sats)> {
    points
        .iter()
        .map(|p| {
            (
                p.price_cents,
                target_sats(
                    p.weight_sats,
                    global_multiplier_permille,
                    market_multiplier_permille,
                    at_risk_sats,
                    max_loss_sats,
                ),
            )
        })
        .collect()
}
