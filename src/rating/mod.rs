//! Ratings
//!
//! - `adjust`: fixed-K delta arithmetic
//! - `ledger`: single-writer actor persisting outcomes to the store

pub mod adjust;
pub mod ledger;

pub use adjust::{RatingDelta, INITIAL_RATING, K_FACTOR};
pub use ledger::{LedgerConfig, LedgerError, LedgerReceipt, RatingChange, RatingLedger};
