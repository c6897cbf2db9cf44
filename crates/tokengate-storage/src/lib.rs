//! Storage backends for tokengate
//!
//! Implements the [`tokengate_core::UsageStore`] contract: an append-only
//! per-call log plus monthly aggregates, with the log as the source of
//! truth for all derived window sums.

mod memory;
mod sqlite;

pub use memory::InMemoryUsageStore;
pub use sqlite::SqliteUsageStore;
