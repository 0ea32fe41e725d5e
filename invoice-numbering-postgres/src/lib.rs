//! [SettingsStore](invoice_numbering::SettingsStore) implementation based upon
//! [PostgreSQL](https://www.postgresql.org/).

mod pool;
mod settings_store;

pub use pool::{Config as PoolConfig, Pool};
pub use settings_store::{Config as PostgresSettingsStoreConfig, PostgresSettingsStore};

use invoice_numbering::ZeroVersionError;
use thiserror::Error;

/// Errors from the [PostgresSettingsStore].
#[derive(Debug, Error)]
pub enum Error {
    /// sqlx error.
    #[error("{0}")]
    Sqlx(String, #[source] sqlx::Error),

    /// A stored value cannot be represented.
    #[error("invalid value {1} for column {0}")]
    InvalidValue(&'static str, i64),

    /// A value to be stored cannot be represented.
    #[error("value {1} for column {0} is out of range")]
    OutOfRange(&'static str, u64),

    /// Invalid stored version.
    #[error("invalid version")]
    InvalidVersion(#[source] ZeroVersionError),

    /// Settings not found right after creating them if absent.
    #[error("no settings for account {0} after creating them")]
    MissingAfterCreate(String),
}
