//! Postgres-backed stores for the Courier engine.
//!
//! Every store writes through the writer pool and reads through the reader
//! pool (which may point at a replica). Tables are suffixed with the chain
//! id so one database can serve several chains.
mod error;
mod events;
mod logs;
mod sponsors;
mod userops;

pub use error::{StoreError, StoreResult};
pub use events::EventStore;
pub use logs::{LogPage, LogStore};
pub use sponsors::{Sponsor, SponsorStore};
pub use userops::{StoredUserOp, UserOpStatus, UserOpStore};

use sqlx::postgres::PgPoolOptions;

/// Shared handle to all stores of one chain.
#[derive(Clone)]
pub struct Store {
    pub logs: LogStore,
    pub userops: UserOpStore,
    pub events: EventStore,
    pub sponsors: SponsorStore,
}

impl Store {
    /// Connect both pools, create tables and indexes, and hand out the
    /// per-table stores.
    pub async fn connect(
        suffix: &str,
        writer_dsn: &str,
        reader_dsn: &str,
        secret: &str,
    ) -> StoreResult<Self> {
        let db = PgPoolOptions::new().max_connections(16).connect(writer_dsn).await?;
        let rdb = if reader_dsn == writer_dsn {
            db.clone()
        } else {
            PgPoolOptions::new().max_connections(16).connect(reader_dsn).await?
        };

        let store = Self {
            logs: LogStore::new(suffix, db.clone(), rdb.clone()),
            userops: UserOpStore::new(suffix, db.clone(), rdb.clone()),
            events: EventStore::new(suffix, db.clone(), rdb.clone()),
            sponsors: SponsorStore::new(suffix, db, rdb, secret),
        };

        store.logs.create_table().await?;
        store.userops.create_table().await?;
        store.events.create_table().await?;
        store.sponsors.create_table().await?;

        Ok(store)
    }
}

/// Shortened table suffix used in index names.
pub(crate) fn shorten(suffix: &str, n: usize) -> &str {
    &suffix[..suffix.len().min(n)]
}
