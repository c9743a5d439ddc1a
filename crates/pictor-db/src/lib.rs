//! Persistence for the artifact pipeline.
//!
//! The worker only talks to the traits in [`ports`]. [`postgres`] backs them
//! with sqlx; [`memory`] keeps everything in process and is what the tests use.

pub mod memory;
pub mod ports;
pub mod postgres;

pub use ports::{
    CacheFolderRepository, CollectionRepository, JobRepository, RequestQueue, SettingsRepository,
};
pub use postgres::{
    connect, PgCacheFolderRepository, PgCollectionRepository, PgJobRepository, PgRequestQueue,
    PgSettingsRepository,
};
