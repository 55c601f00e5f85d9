//! Client/server sales ledger: a tag-multiplexed TCP protocol, a worker pool,
//! blocking sale notifications and a day-windowed store with an LRU cache of
//! per-day aggregates.

pub mod cache;
pub mod config;
pub mod ledger;
pub mod logging;
pub mod notifications;
pub mod pools;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod store;
pub mod utils;
pub mod wire;
