//! Matching core for binary (YES/NO) outcome markets priced in satoshis.
//!
//! Every price is an integer number of cents in [1, 99]: the cost per
//! 100-sat payout for the side that owns the order. A YES order at 60 and a
//! NO order at 40 describe the same coin from opposite ends, so two orders
//! cross exactly when their prices sum to at least 100. All monetary
//! arithmetic is integer-only; costs round up against the payer.

use serde::{Deserialize, Serialize};

pub mod curve;

pub type Sats = i64;
pub type OrderId = i64;
pub type UserId = i64;

/// One share pays out 100 sats; prices are cents of that payout.
pub const PAYOUT_UNIT: i64 = 100;
pub const MIN_PRICE_CENTS: i16 = 1;
pub const MAX_PRICE_CENTS: i16 = 99;
/// Minimum order face value (one whole share).
pub const MIN_ORDER_SATS: Sats = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn valid_price(price_cents: i16) -> bool {
    (MIN_PRICE_CENTS..=MAX_PRICE_CENTS).contains(&price_cents)
}

/// Cost in sats of `amount_sats` of payout at `price_cents`, rounded up.
pub fn cost_sats(price_cents: i16, amount_sats: Sats) -> Sats {
    (amount_sats * price_cents as i64 + PAYOUT_UNIT - 1) / PAYOUT_UNIT
}

/// A taker at `taker_price_cents` crosses an opposite-side maker at
/// `maker_price_cents` when their combined willingness covers the payout.
pub fn crosses(taker_price_cents: i16, maker_price_cents: i16) -> bool {
    taker_price_cents as i64 + maker_price_cents as i64 >= PAYOUT_UNIT
}

/// The taker's effective own-side price when filling against a maker: the
/// trade executes at the maker's terms.
pub fn fill_price_cents(maker_price_cents: i16) -> i16 {
    (PAYOUT_UNIT as i16) - maker_price_cents
}

/// Split the locked face of one fill between the two sides. The taker pays
/// the rounded-up cost at the fill price; the maker pays the exact
/// remainder, so each pair locks precisely its face value.
pub fn split_pair_cost(maker_price_cents: i16, amount_sats: Sats) -> (Sats, Sats) {
    let taker = cost_sats(fill_price_cents(maker_price_cents), amount_sats);
    (taker, amount_sats - taker)
}

/// A resting open or partially filled order on the side opposite the taker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub price_cents: i16,
    pub remaining_sats: Sats,
}

/// One maker step of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub maker_order_id: OrderId,
    pub maker_user_id: UserId,
    pub maker_price_cents: i16,
    /// Taker-side price of this fill (100 − maker price).
    pub taker_price_cents: i16,
    pub amount_sats: Sats,
    pub taker_cost_sats: Sats,
    pub maker_cost_sats: Sats,
    pub maker_remaining_after: Sats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub fills: Vec<Fill>,
    pub remaining_sats: Sats,
}

impl MatchResult {
    pub fn filled_sats(&self) -> Sats {
        self.fills.iter().map(|f| f.amount_sats).sum()
    }

    pub fn taker_cost_sats(&self) -> Sats {
        self.fills.iter().map(|f| f.taker_cost_sats).sum()
    }
}

/// Sweep the opposite side of the book for a taker limit order.
///
/// `book` holds open/partial opposite-side orders sorted best-first: highest
/// price, then lowest id (earliest placed). The sweep stops at the first
/// maker that no longer crosses; resting orders owned by the taker are
/// skipped and left in place.
pub fn match_limit(
    taker_user_id: UserId,
    taker_price_cents: i16,
    amount_sats: Sats,
    book: &[RestingOrder],
) -> MatchResult {
    let mut fills = Vec::new();
    let mut remaining = amount_sats;

    for maker in book {
        if remaining == 0 {
            break;
        }
        if !crosses(taker_price_cents, maker.price_cents) {
            // Sorted best-first: nothing beyond this point crosses either.
            break;
        }
        if maker.user_id == taker_user_id {
            continue;
        }
        if maker.remaining_sats <= 0 {
            continue;
        }

        let fill = remaining.min(maker.remaining_sats);
        let (taker_cost, maker_cost) = split_pair_cost(maker.price_cents, fill);
        remaining -= fill;

        fills.push(Fill {
            maker_order_id: maker.id,
            maker_user_id: maker.user_id,
            maker_price_cents: maker.price_cents,
            taker_price_cents: fill_price_cents(maker.price_cents),
            amount_sats: fill,
            taker_cost_sats: taker_cost,
            maker_cost_sats: maker_cost,
            maker_remaining_after: maker.remaining_sats - fill,
        });
    }

    MatchResult {
        fills,
        remaining_sats: remaining,
    }
}
