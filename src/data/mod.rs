//! Market data access.
//!
//! The decision core never talks to the broker for candles directly; it
//! goes through the `MarketDataCache`, which bounds staleness and retries.

pub mod cache;

pub use cache::{CacheStats, MarketDataCache, RetryPolicy};
