//! # SQLite Persistence
//!
//! Durable `ReservationStore` and `InventoryLedger` on one SQLite pool.
//! Every state change is a single conditional `UPDATE`, so concurrent
//! writers (booking path, callbacks, sweep) serialize in the database.

pub mod inventory;
pub mod reservations;
pub mod schema;

pub use inventory::SqliteLedger;
pub use reservations::SqliteReservationStore;

use reserve_core::ReserveError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // each in-memory connection is its own database, so keep exactly one alive
        let in_memory = database_url.contains(":memory:");

        let mut pool_options =
            SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 8 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }

    pub fn ledger(&self) -> SqliteLedger {
        SqliteLedger::new(self.pool.clone())
    }

    pub fn reservations(&self) -> SqliteReservationStore {
        SqliteReservationStore::new(self.pool.clone())
    }
}

pub(crate) fn storage_error(e: sqlx::Error) -> ReserveError {
    ReserveError::Storage(e.to_string())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
