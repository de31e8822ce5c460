//! End-to-end flows against a real Postgres. Set TEST_DATABASE_URL to run;
//! without it every test skips early so the suite stays green on machines
//! with no database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use matching::{Sats, Side};
use sqlx::PgPool;

use exchange::db;
use exchange::maker;
use exchange::models::{
    Bet, LedgerEntry, Market, MarketType, Order, OrderError, PlaceOrderOutcome,
    PlaceOrderRequest, TxType, User, Withdrawal,
};

/// Bot state (config, exposure, activity log) is a process-wide singleton,
/// so bot-driven tests take this lock and everything else avoids the bot.
static BOT_TEST_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

const SEED: Sats = 1_000_000;

async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping database integration test");
        return None;
    };
    let pool = db::create_pool(&url).await.expect("connect test database");
    db::run_migrations(&pool).await.expect("run migrations");
    Some(pool)
}

fn unique(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{prefix}-{nanos}-{}", SEQ.fetch_add(1, Ordering::Relaxed))
}

async fn seeded_user(pool: &PgPool, prefix: &str, seed_sats: Sats) -> User {
    let user = User::ensure(pool, &unique(prefix), None, false)
        .await
        .expect("create user");
    if seed_sats > 0 {
        let mut tx = pool.begin().await.expect("begin");
        LedgerEntry::credit(&mut tx, user.id, seed_sats, TxType::Deposit, None)
            .await
            .expect("seed deposit");
        tx.commit().await.expect("commit");
    }
    user
}

/// Markets for non-bot tests opt out of bot quoting so concurrently running
/// bot tests cannot land liquidity on them.
async fn plain_market(pool: &PgPool, title: &str) -> Market {
    Market::create(pool, &unique(title), MarketType::Event, None, false)
        .await
        .expect("create market")
}

async fn balance(pool: &PgPool, user_id: i64) -> Sats {
    User::get(pool, user_id).await.expect("get user").unwrap().balance_sats
}

/// Place and run the same post-commit reaction the HTTP layer runs.
async fn place(
    pool: &PgPool,
    user_id: i64,
    market_id: i64,
    side: Side,
    price_cents: i16,
    amount_sats: Sats,
) -> PlaceOrderOutcome {
    let outcome = Order::place(
        pool,
        &PlaceOrderRequest {
            user_id,
            market_id,
            side,
            price_cents,
            amount_sats,
        },
    )
    .await
    .expect("place order");
    if let Some(change) = outcome.tier_change {
        maker::on_tier_change(pool, change).await.expect("reconcile");
    }
    outcome
}

/// P4: pending YES face equals pending NO face in every market.
async fn assert_faces_balanced(pool: &PgPool, market_id: i64) {
    let (yes, no): (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount_sats) FILTER (WHERE side = 'yes'), 0)::BIGINT,
                COALESCE(SUM(amount_sats) FILTER (WHERE side = 'no'), 0)::BIGINT
         FROM bets WHERE market_id = $1 AND result = 'pending'",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await
    .expect("face sums");
    assert_eq!(yes, no, "pending faces unbalanced in market {market_id}");
}

async fn resting_no_liquidity(pool: &PgPool, market_id: i64) -> Sats {
    Order::book_side(pool, market_id, Side::No)
        .await
        .expect("book")
        .iter()
        .map(|l| l.total_sats)
        .sum()
}

// === Order pipeline ===

#[tokio::test]
async fn price_time_priority_fills_best_maker_first() {
    let Some(pool) = test_pool().await else { return };
    let bob = seeded_user(&pool, "bob", SEED).await;
    let carol = seeded_user(&pool, "carol", SEED).await;
    let dave = seeded_user(&pool, "dave", SEED).await;
    let alice = seeded_user(&pool, "alice", SEED).await;
    let market = plain_market(&pool, "priority").await;

    place(&pool, bob.id, market.id, Side::No, 40, 5000).await;
    place(&pool, carol.id, market.id, Side::No, 40, 5000).await;
    place(&pool, dave.id, market.id, Side::No, 45, 5000).await;

    let outcome = place(&pool, alice.id, market.id, Side::Yes, 60, 5000).await;
    assert_eq!(outcome.matched_count, 1);
    assert_eq!(outcome.order.status, "filled");

    let bets = Bet::list_for_market(&pool, market.id).await.unwrap();
    let alice_bet = bets.iter().find(|b| b.user_id == alice.id).unwrap();
    assert_eq!(alice_bet.price_cents, 55);
    assert_eq!(alice_bet.amount_sats, 5000);
    assert_eq!(alice_bet.cost_sats, 2750);
    assert_eq!(alice_bet.counterparty_user_id, dave.id);
    assert_eq!(balance(&pool, alice.id).await, SEED - 2750);

    // Dave's side costs the exact remainder of the face.
    let dave_bet = bets.iter().find(|b| b.user_id == dave.id).unwrap();
    assert_eq!(dave_bet.price_cents, 45);
    assert_eq!(dave_bet.cost_sats, 2250);
    assert_faces_balanced(&pool, market.id).await;
}

#[tokio::test]
async fn self_trade_prevention_skips_own_orders() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let bob = seeded_user(&pool, "bob", SEED).await;
    let market = plain_market(&pool, "selftrade").await;

    // Alice's own NO at the better price must be skipped, not matched.
    place(&pool, alice.id, market.id, Side::No, 45, 5000).await;
    place(&pool, bob.id, market.id, Side::No, 40, 5000).await;

    let outcome = place(&pool, alice.id, market.id, Side::Yes, 60, 5000).await;
    assert_eq!(outcome.matched_count, 1);

    let bets = Bet::list_for_market(&pool, market.id).await.unwrap();
    assert!(bets.iter().all(|b| b.user_id != b.counterparty_user_id));
    let alice_bet = bets.iter().find(|b| b.user_id == alice.id).unwrap();
    assert_eq!(alice_bet.counterparty_user_id, bob.id);
    assert_eq!(alice_bet.price_cents, 60);

    // Her own NO order is still resting.
    let own = Order::list_for_user(&pool, alice.id, 10).await.unwrap();
    assert!(own.iter().any(|o| o.side == "no" && o.status == "open"));
}

#[tokio::test]
async fn concurrent_takers_never_overfill_one_maker() {
    let Some(pool) = test_pool().await else { return };
    let maker_user = seeded_user(&pool, "maker", SEED).await;
    let market = plain_market(&pool, "concurrent").await;
    place(&pool, maker_user.id, market.id, Side::No, 40, 10_000).await;

    let mut takers = Vec::new();
    for _ in 0..10 {
        takers.push(seeded_user(&pool, "taker", SEED).await);
    }

    let mut handles = Vec::new();
    for taker in &takers {
        let pool = pool.clone();
        let user_id = taker.id;
        let market_id = market.id;
        handles.push(tokio::spawn(async move {
            Order::place(
                &pool,
                &PlaceOrderRequest {
                    user_id,
                    market_id,
                    side: Side::Yes,
                    price_cents: 60,
                    amount_sats: 10_000,
                },
            )
            .await
            .expect("concurrent place")
        }));
    }

    let mut total_filled = 0;
    for handle in handles {
        let outcome = handle.await.expect("join");
        total_filled += outcome.order.filled_sats;
    }
    assert_eq!(total_filled, 10_000, "maker liquidity must fill exactly once");

    let maker_order = &Order::list_for_user(&pool, maker_user.id, 1).await.unwrap()[0];
    assert_eq!(maker_order.filled_sats, 10_000);
    assert_eq!(maker_order.status, "filled");
    assert_faces_balanced(&pool, market.id).await;

    for taker in &takers {
        assert!(LedgerEntry::reconcile(&pool, taker.id).await.unwrap());
    }
}

#[tokio::test]
async fn place_then_cancel_is_zero_sum() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let market = plain_market(&pool, "cancel").await;

    let outcome = place(&pool, alice.id, market.id, Side::Yes, 33, 101).await;
    assert_eq!(outcome.cost_sats, 34);
    assert_eq!(balance(&pool, alice.id).await, SEED - 34);

    let cancel = Order::cancel(&pool, alice.id, outcome.order.id)
        .await
        .expect("cancel");
    assert_eq!(cancel.refund_sats, 34);
    assert_eq!(balance(&pool, alice.id).await, SEED);
    assert!(LedgerEntry::reconcile(&pool, alice.id).await.unwrap());
}

#[tokio::test]
async fn cancel_refunds_only_unfilled_remainder() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let bob = seeded_user(&pool, "bob", SEED).await;
    let market = plain_market(&pool, "partialcancel").await;

    place(&pool, bob.id, market.id, Side::No, 40, 2000).await;
    let outcome = place(&pool, alice.id, market.id, Side::Yes, 60, 5000).await;
    assert_eq!(outcome.order.status, "partial");
    assert_eq!(outcome.order.filled_sats, 2000);

    let cancel = Order::cancel(&pool, alice.id, outcome.order.id)
        .await
        .expect("cancel");
    // 3000 unfilled at her limit price of 60.
    assert_eq!(cancel.refund_sats, 1800);
    // Net spend: the filled 2000 at the maker-implied price of 60.
    assert_eq!(balance(&pool, alice.id).await, SEED - 1200);
    assert!(LedgerEntry::reconcile(&pool, alice.id).await.unwrap());
}

#[tokio::test]
async fn cancel_rejects_wrong_owner_and_terminal_orders() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let mallory = seeded_user(&pool, "mallory", SEED).await;
    let market = plain_market(&pool, "cancelguard").await;

    let outcome = place(&pool, alice.id, market.id, Side::Yes, 50, 1000).await;
    assert!(matches!(
        Order::cancel(&pool, mallory.id, outcome.order.id).await,
        Err(OrderError::NotOwner)
    ));

    Order::cancel(&pool, alice.id, outcome.order.id).await.unwrap();
    assert!(matches!(
        Order::cancel(&pool, alice.id, outcome.order.id).await,
        Err(OrderError::OrderTerminal(_))
    ));
    assert!(matches!(
        Order::cancel(&pool, alice.id, -1).await,
        Err(OrderError::NotFound)
    ));
}

// === Validation boundaries ===

#[tokio::test]
async fn price_and_amount_boundaries() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let market = plain_market(&pool, "bounds").await;

    for price in [0, 100, -1] {
        let err = Order::place(
            &pool,
            &PlaceOrderRequest {
                user_id: alice.id,
                market_id: market.id,
                side: Side::Yes,
                price_cents: price,
                amount_sats: 1000,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrderError::InvalidPrice(_)), "price {price}");
    }

    let err = Order::place(
        &pool,
        &PlaceOrderRequest {
            user_id: alice.id,
            market_id: market.id,
            side: Side::Yes,
            price_cents: 50,
            amount_sats: 99,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrderError::AmountTooSmall(99)));

    // Edges are accepted.
    place(&pool, alice.id, market.id, Side::Yes, 1, 100).await;
    place(&pool, alice.id, market.id, Side::No, 99, 100).await;
}

#[tokio::test]
async fn closed_markets_reject_orders() {
    let Some(pool) = test_pool().await else { return };
    let admin_check = seeded_user(&pool, "alice", SEED).await;
    let market = plain_market(&pool, "closed").await;

    Market::initiate_resolution(&pool, market.id, Side::Yes, Some("under review"))
        .await
        .expect("initiate");
    let err = Order::place(
        &pool,
        &PlaceOrderRequest {
            user_id: admin_check.id,
            market_id: market.id,
            side: Side::Yes,
            price_cents: 50,
            amount_sats: 1000,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrderError::MarketUnavailable(ref s) if s == "pending_resolution"));

    Market::resolve(&pool, market.id, Side::Yes, None).await.expect("resolve");
    let err = Order::place(
        &pool,
        &PlaceOrderRequest {
            user_id: admin_check.id,
            market_id: market.id,
            side: Side::Yes,
            price_cents: 50,
            amount_sats: 1000,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrderError::MarketUnavailable(ref s) if s == "resolved"));

    let cancelled = plain_market(&pool, "voided").await;
    Market::cancel(&pool, cancelled.id, None).await.expect("cancel market");
    let err = Order::place(
        &pool,
        &PlaceOrderRequest {
            user_id: admin_check.id,
            market_id: cancelled.id,
            side: Side::Yes,
            price_cents: 50,
            amount_sats: 1000,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrderError::MarketUnavailable(ref s) if s == "cancelled"));
}

#[tokio::test]
async fn insufficient_funds_rejects_without_side_effects() {
    let Some(pool) = test_pool().await else { return };
    let pauper = seeded_user(&pool, "pauper", 1000).await;
    let market = plain_market(&pool, "poor").await;

    let err = Order::place(
        &pool,
        &PlaceOrderRequest {
            user_id: pauper.id,
            market_id: market.id,
            side: Side::Yes,
            price_cents: 60,
            amount_sats: 10_000,
        },
    )
    .await
    .unwrap_err();
    match err {
        OrderError::InsufficientFunds {
            available,
            required,
        } => {
            assert_eq!(available, 1000);
            assert_eq!(required, 6000);
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
    assert_eq!(balance(&pool, pauper.id).await, 1000);
    assert!(Order::list_for_user(&pool, pauper.id, 10).await.unwrap().is_empty());
}

// === Auto-settle ===

#[tokio::test]
async fn offsetting_positions_auto_settle() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let bob = seeded_user(&pool, "bob", SEED).await;
    let carol = seeded_user(&pool, "carol", SEED).await;
    let market = plain_market(&pool, "autosettle").await;

    // Alice buys 5000 YES at 60 against Bob.
    place(&pool, bob.id, market.id, Side::No, 40, 5000).await;
    let yes_leg = place(&pool, alice.id, market.id, Side::Yes, 60, 5000).await;
    assert!(yes_leg.auto_settled.is_none());

    // Then 5000 NO at 60 against Carol: her book is now flat, so the whole
    // face comes back immediately.
    place(&pool, carol.id, market.id, Side::Yes, 40, 5000).await;
    let no_leg = place(&pool, alice.id, market.id, Side::No, 60, 5000).await;
    let settled = no_leg.auto_settled.expect("auto settle fired");
    assert_eq!(settled.settled_sats, 5000);

    // start − cost(YES@60) − cost(NO@60) + 5000
    assert_eq!(balance(&pool, alice.id).await, SEED - 3000 - 3000 + 5000);

    // Her bets are extinguished; the counterparties' stay live and balanced.
    let bets = Bet::list_for_market(&pool, market.id).await.unwrap();
    assert!(bets
        .iter()
        .filter(|b| b.user_id == alice.id)
        .all(|b| b.result == "settled"));
    assert!(bets
        .iter()
        .filter(|b| b.user_id != alice.id)
        .all(|b| b.result == "pending"));
    assert_faces_balanced(&pool, market.id).await;
    assert!(Bet::positions(&pool, alice.id)
        .await
        .unwrap()
        .iter()
        .all(|p| p.market_id != market.id));
}

#[tokio::test]
async fn auto_settle_nets_partial_overlap_fifo() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let bob = seeded_user(&pool, "bob", SEED).await;
    let carol = seeded_user(&pool, "carol", SEED).await;
    let market = plain_market(&pool, "partialsettle").await;

    place(&pool, bob.id, market.id, Side::No, 40, 5000).await;
    place(&pool, alice.id, market.id, Side::Yes, 60, 5000).await;

    place(&pool, carol.id, market.id, Side::Yes, 40, 2000).await;
    let no_leg = place(&pool, alice.id, market.id, Side::No, 60, 2000).await;
    assert_eq!(no_leg.auto_settled.expect("settled").settled_sats, 2000);

    let positions = Bet::positions(&pool, alice.id).await.unwrap();
    let pos = positions.iter().find(|p| p.market_id == market.id).unwrap();
    assert_eq!(pos.yes_sats, 3000);
    assert_eq!(pos.no_sats, 0);
    assert_faces_balanced(&pool, market.id).await;
}

#[tokio::test]
async fn positions_in_different_markets_never_net() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let bob = seeded_user(&pool, "bob", SEED).await;
    let carol = seeded_user(&pool, "carol", SEED).await;
    let market_a = plain_market(&pool, "isolation-a").await;
    let market_b = plain_market(&pool, "isolation-b").await;

    place(&pool, bob.id, market_a.id, Side::No, 40, 5000).await;
    place(&pool, alice.id, market_a.id, Side::Yes, 60, 5000).await;

    place(&pool, carol.id, market_b.id, Side::Yes, 40, 5000).await;
    let no_leg = place(&pool, alice.id, market_b.id, Side::No, 60, 5000).await;
    assert!(no_leg.auto_settled.is_none(), "cross-market netting is forbidden");

    let positions = Bet::positions(&pool, alice.id).await.unwrap();
    let a = positions.iter().find(|p| p.market_id == market_a.id).unwrap();
    let b = positions.iter().find(|p| p.market_id == market_b.id).unwrap();
    assert_eq!((a.yes_sats, a.no_sats), (5000, 0));
    assert_eq!((b.yes_sats, b.no_sats), (0, 5000));
}

// === Resolution ===

#[tokio::test]
async fn resolution_pays_winners_and_clears_the_book() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let bob = seeded_user(&pool, "bob", SEED).await;
    let carol = seeded_user(&pool, "carol", SEED).await;
    let market = plain_market(&pool, "resolve").await;

    place(&pool, bob.id, market.id, Side::No, 40, 5000).await;
    place(&pool, alice.id, market.id, Side::Yes, 60, 5000).await;
    // Carol rests an order that must come back in full.
    place(&pool, carol.id, market.id, Side::Yes, 30, 2000).await;

    let outcome = Market::resolve(&pool, market.id, Side::Yes, Some("final"))
        .await
        .expect("resolve");
    assert_eq!(outcome.bets_settled, 2);
    assert_eq!(outcome.orders_cancelled, 1);

    // Alice paid 3000 and won the 5000 face; Bob paid 2000 and lost it;
    // Carol's reservation came back. System conservation holds.
    assert_eq!(balance(&pool, alice.id).await, SEED - 3000 + 5000);
    assert_eq!(balance(&pool, bob.id).await, SEED - 2000);
    assert_eq!(balance(&pool, carol.id).await, SEED);
    let total = balance(&pool, alice.id).await
        + balance(&pool, bob.id).await
        + balance(&pool, carol.id).await;
    assert_eq!(total, 3 * SEED);

    let market = Market::get(&pool, market.id).await.unwrap().unwrap();
    assert_eq!(market.status, "resolved");
    assert_eq!(market.resolution.as_deref(), Some("yes"));

    let err = Market::resolve(&pool, market.id, Side::Yes, None).await.unwrap_err();
    assert!(matches!(err, exchange::models::MarketError::InvalidState(_)));

    for user in [&alice, &bob, &carol] {
        assert!(LedgerEntry::reconcile(&pool, user.id).await.unwrap());
    }
}

// === Market maker ===

struct BotFixture {
    bot: User,
    admin_markets: Vec<Market>,
}

async fn bot_fixture(pool: &PgPool, weight: Sats, max_loss: Sats, markets: usize) -> BotFixture {
    let bot = seeded_user(pool, "bot", SEED).await;
    maker::set_config(pool, bot.id, Side::No, max_loss, 10, 1000, true)
        .await
        .expect("bot config");
    maker::set_curve(pool, "event", &[(50, weight)]).await.expect("curve");

    let mut admin_markets = Vec::new();
    for i in 0..markets {
        let market = Market::create(pool, &unique(&format!("bot-market-{i}")), MarketType::Event, None, true)
            .await
            .expect("bot market");
        admin_markets.push(market);
    }
    maker::deploy(pool).await.expect("deploy");
    BotFixture {
        bot,
        admin_markets,
    }
}

async fn teardown_bot(pool: &PgPool, fixture: &BotFixture) {
    maker::withdraw_all(pool).await.ok();
    for market in &fixture.admin_markets {
        Market::cancel(pool, market.id, Some("test teardown")).await.ok();
    }
    maker::set_config(pool, fixture.bot.id, Side::No, 0, 10, 1000, false)
        .await
        .expect("deactivate bot");
    maker::refresh_exposure(pool).await.ok();
}

#[tokio::test]
async fn bot_fill_triggers_tier_pullback_across_markets() {
    let Some(pool) = test_pool().await else { return };
    let _guard = BOT_TEST_LOCK.lock().await;

    let fixture = bot_fixture(&pool, 5000, 10_000, 2).await;
    let market_a = fixture.admin_markets[0].id;
    let market_b = fixture.admin_markets[1].id;
    assert_eq!(resting_no_liquidity(&pool, market_a).await, 5000);
    assert_eq!(resting_no_liquidity(&pool, market_b).await, 5000);

    let attacker = seeded_user(&pool, "attacker", SEED).await;
    let outcome = place(&pool, attacker.id, market_a, Side::Yes, 60, 1000).await;
    assert_eq!(outcome.order.filled_sats, 1000);

    let exposure = maker::current_exposure(&pool).await.expect("exposure");
    assert_eq!(exposure.total_at_risk_sats, 1000);
    assert_eq!(exposure.current_tier, 1);

    // Ratio 0.9: the attacked market tops back up to 4500 and the untouched
    // market shrinks to 4500.
    assert_eq!(resting_no_liquidity(&pool, market_a).await, 4500);
    assert_eq!(resting_no_liquidity(&pool, market_b).await, 4500);

    // The tier change and reconciliation are on the activity log.
    let actions: Vec<String> =
        sqlx::query_scalar("SELECT action FROM bot_activity_log ORDER BY id DESC LIMIT 10")
            .fetch_all(&pool)
            .await
            .expect("activity log");
    assert!(actions.iter().any(|a| a == "tier_change"));
    assert!(actions.iter().any(|a| a == "reconcile"));

    teardown_bot(&pool, &fixture).await;
}

#[tokio::test]
async fn cascading_pullback_caps_total_losses() {
    let Some(pool) = test_pool().await else { return };
    let _guard = BOT_TEST_LOCK.lock().await;

    let max_loss = 10_000;
    let fixture = bot_fixture(&pool, 4000, max_loss, 3).await;

    let attacker = seeded_user(&pool, "attacker", SEED).await;
    let mut fills = Vec::new();
    for market in &fixture.admin_markets {
        let outcome = Order::place(
            &pool,
            &PlaceOrderRequest {
                user_id: attacker.id,
                market_id: market.id,
                side: Side::Yes,
                price_cents: 60,
                amount_sats: 4000,
            },
        )
        .await
        .expect("attack");
        fills.push(outcome.order.filled_sats);
        // The attacker pulls any resting remainder before the maker reacts,
        // so the bot's re-quotes cannot fill it.
        if outcome.order.remaining_sats() > 0 {
            Order::cancel(&pool, attacker.id, outcome.order.id).await.expect("cancel rest");
        }
        if let Some(change) = outcome.tier_change {
            maker::on_tier_change(&pool, change).await.expect("reconcile");
        }
    }

    assert_eq!(fills, vec![4000, 2400, 1440]);
    assert!(fills.windows(2).all(|w| w[1] < w[0]));
    let total: Sats = fills.iter().sum();
    assert!(total < 12_000);

    let exposure = maker::current_exposure(&pool).await.expect("exposure");
    assert!(exposure.total_at_risk_sats <= max_loss);
    assert_eq!(exposure.total_at_risk_sats, total);

    teardown_bot(&pool, &fixture).await;
}

#[tokio::test]
async fn bot_reconcile_survives_insufficient_funds() {
    let Some(pool) = test_pool().await else { return };
    let _guard = BOT_TEST_LOCK.lock().await;

    // A bot that cannot afford its own curve: placement failures are logged
    // and skipped, not fatal.
    let bot = seeded_user(&pool, "brokebot", 1000).await;
    maker::set_config(&pool, bot.id, Side::No, 100_000, 10, 1000, true)
        .await
        .expect("config");
    maker::set_curve(&pool, "event", &[(50, 50_000)]).await.expect("curve");
    let market = Market::create(&pool, &unique("broke"), MarketType::Event, None, true)
        .await
        .expect("market");

    let outcome = maker::reconcile_market(&pool, market.id).await.expect("reconcile");
    assert_eq!(outcome.placements_failed, 1);
    assert_eq!(outcome.placed_sats, 0);

    Market::cancel(&pool, market.id, None).await.ok();
    maker::set_config(&pool, bot.id, Side::No, 0, 10, 1000, false)
        .await
        .expect("deactivate");
}

// === Withdrawals ===

#[tokio::test]
async fn withdrawal_lifecycle_and_thresholds() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;
    let instant_max = 100_000;

    // Instant path.
    let instant = Withdrawal::request(&pool, alice.id, 50_000, None, instant_max)
        .await
        .expect("instant withdrawal");
    assert_eq!(instant.status, "sent");
    assert_eq!(balance(&pool, alice.id).await, SEED - 50_000);

    let settled = Withdrawal::mark_settled(&pool, instant.id).await.expect("settle");
    assert_eq!(settled.status, "settled");

    // Approval path, then failure compensates with a paired reversal.
    let large = Withdrawal::request(&pool, alice.id, 200_000, None, instant_max)
        .await
        .expect("large withdrawal");
    assert_eq!(large.status, "pending_approval");
    assert_eq!(balance(&pool, alice.id).await, SEED - 250_000);

    let approved = Withdrawal::approve(&pool, large.id).await.expect("approve");
    assert_eq!(approved.status, "sent");
    let failed = Withdrawal::fail(&pool, large.id).await.expect("fail");
    assert_eq!(failed.status, "failed");
    assert_eq!(balance(&pool, alice.id).await, SEED - 50_000);

    assert!(LedgerEntry::reconcile(&pool, alice.id).await.unwrap());
}

#[tokio::test]
async fn withdrawal_cross_checks_invoice_amount() {
    let Some(pool) = test_pool().await else { return };
    let alice = seeded_user(&pool, "alice", SEED).await;

    // 2500u encodes 250_000 sats; asking for anything else is rejected.
    let err = Withdrawal::request(
        &pool,
        alice.id,
        100_000,
        Some("lnbc2500u1pvjluezpp5qqqsyq".to_string()),
        100_000,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        exchange::models::WithdrawalError::InvoiceMismatch {
            invoice_sats: 250_000,
            requested_sats: 100_000,
        }
    ));
    assert_eq!(balance(&pool, alice.id).await, SEED);

    let ok = Withdrawal::request(
        &pool,
        alice.id,
        250_000,
        Some("lnbc2500u1pvjluezpp5qqqsyq".to_string()),
        100_000,
    )
    .await
    .expect("matching invoice");
    assert_eq!(ok.status, "pending_approval");
}
