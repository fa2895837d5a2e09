//! Scheduler and persistence store.
//!
//! Holds the test schedule, the DNS cache, the module queue for helper
//! tests and the per-test failure counters in one libsql database.

pub mod migrations;
pub mod models;
pub mod repository;

pub use models::{AddressFamily, CachedLookup, DNS_CACHE_TTL, ModuleQueueItem, ScheduleEntry};
pub use repository::{DueTests, LibsqlStore, Store};

use anyhow::Result;

/// Initialize the store schema
pub async fn initialize_store(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
