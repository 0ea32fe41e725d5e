//! Persistence for invoice number settings.


use crate::{InvoiceNumberConfig, Version, VersionedConfig};
use std::{
    error::Error as StdError,
    fmt::{Debug, Display},
    future::Future,
};

/// Persistence for invoice number settings, keyed by account ID. This is the sole source of truth
/// for the counters; the only ordering guarantee for concurrent writers comes from
/// [SettingsStore::compare_and_swap] being atomic.
pub trait SettingsStore: Clone + Send + Sync + 'static {
    /// The account ID type.
    type Id: Debug + Display + Clone + Send + Sync + 'static;

    type Error: StdError + Send + Sync + 'static;

    /// The maximum value for next numbers. Defaults to `u64::MAX` unless overridden by an
    /// implementation.
    const MAX_NEXT_NUMBER: u64 = u64::MAX;

    /// Get the settings along with their version for the given account ID, if any.
    fn get(
        &self,
        id: &Self::Id,
    ) -> impl Future<Output = Result<Option<VersionedConfig>, Self::Error>> + Send;

    /// Store the given default settings for the given account ID unless settings already exist and
    /// return the stored settings. Concurrent callers for the same account ID must all observe the
    /// same single stored settings.
    fn create_if_absent(
        &self,
        id: &Self::Id,
        defaults: &InvoiceNumberConfig,
    ) -> impl Future<Output = Result<VersionedConfig, Self::Error>> + Send;

    /// Replace the settings for the given account ID with the given ones, assigning a new version,
    /// but only if the stored version equals the given expected one. Returns `false` if the version
    /// has moved on or there are no settings.
    fn compare_and_swap(
        &self,
        id: &Self::Id,
        expected: Version,
        config: &InvoiceNumberConfig,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}
