pub mod bet;
pub mod ledger;
pub mod market;
pub mod order;
pub mod user;
pub mod withdrawal;

pub use bet::{AutoSettleOutcome, Bet, Position};
pub use ledger::{LedgerEntry, LedgerError, TxType};
pub use market::{Market, MarketError, MarketType, ResolveOutcome};
pub use order::{
    BookLevel, CancelAllOutcome, CancelOutcome, Order, OrderError, OrderStatus,
    PlaceOrderOutcome, PlaceOrderRequest,
};
pub use user::User;
pub use withdrawal::{Withdrawal, WithdrawalError};
