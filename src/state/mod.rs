pub mod valuation_cache;
pub mod watchlist;

pub use valuation_cache::{CommitOutcome, ValuationCache};
pub use watchlist::WatchlistRegistry;
