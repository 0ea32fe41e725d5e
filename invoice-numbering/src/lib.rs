#![cfg_attr(docsrs, feature(doc_cfg))]

//! Sequential, collision free invoice numbers.
//!
//! Every account owns an [InvoiceNumberConfig] with a prefix, the next number to be handed out and
//! a pad width. [InvoiceNumberAllocator::allocate] formats the next number as the prefix followed
//! by the zero-padded next number, e.g. "INV-042", and durably advances the counter by exactly one.
//!
//! The [SettingsStore] trait defines a pluggable persistence for the settings, which must offer an
//! atomic compare-and-swap. For [NATS](https://nats.io/) and [Postgres](https://www.postgresql.org/)
//! it is implemented in the respective crates. The allocator keeps no counters in memory: every
//! attempt reads the settings, formats the number from exactly what it has read and then tries to
//! swap in the advanced counter. If another caller has won the race in between, the formatted
//! number is discarded and the attempt is repeated after a jittered backoff, bounded by
//! [RetryConfig::max_attempts]. Hence concurrent callers, even in different processes, never
//! receive the same number and no number is skipped.
//!
//! Invoice numbers are unique, but they are not ordered by call arrival: which one of several
//! concurrent callers wins a race is unspecified.
//!
//! [InvoiceNumberAllocator::update_settings] is the explicit, user driven way to change the
//! settings. Setting the next number there is an authoritative reset.

pub mod retry;
pub mod settings;
pub mod settings_store;

mod version;

pub use retry::RetryConfig;
pub use settings::{zero_pad, InvalidConfig, InvoiceNumberConfig, SettingsUpdate, VersionedConfig};
pub use settings_store::SettingsStore;
pub use version::{Version, ZeroVersionError};

use error_ext::StdErrorExt;
use serde::Deserialize;
use std::{
    error::Error as StdError,
    fmt::{self, Display},
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Hands out unique, formatted invoice numbers for accounts, backed by a [SettingsStore].
///
/// Cheap to clone if the [SettingsStore] is; clones share the store.
#[derive(Debug, Clone)]
pub struct InvoiceNumberAllocator<S> {
    store: S,
    config: Config,
}

impl<S> InvoiceNumberAllocator<S>
where
    S: SettingsStore,
{
    /// Create an [InvoiceNumberAllocator] on top of the given [SettingsStore]. Fails if the
    /// configured default settings are invalid.
    pub fn new(store: S, config: Config) -> Result<Self, InvalidConfig> {
        config.defaults.validate()?;
        check_next_number_supported::<S>(config.defaults.next_number)?;

        Ok(Self { store, config })
    }

    /// Allocate the next invoice number for the given account ID and durably advance its counter.
    ///
    /// Settings are created from the configured defaults if absent, unless
    /// [Config::create_if_absent] is switched off, in which case [AllocateError::AccountNotFound]
    /// is returned. On any error nothing has been persisted, except possibly the default settings.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        id: &S::Id,
    ) -> Result<AllocatedNumber, AllocateError<S::Error>> {
        self.swap_loop(id, |config| {
            let value = config.format()?;
            let consumed = config.next_number;
            let next_number = consumed
                .checked_add(1)
                .filter(|&n| n <= S::MAX_NEXT_NUMBER)
                .ok_or(InvalidConfig::NextNumberExhausted(consumed))?;

            let advanced = InvoiceNumberConfig {
                next_number,
                ..config
            };
            Ok((advanced, AllocatedNumber { value, consumed }))
        })
        .await
    }

    /// Preview the invoice number the next allocation for the given account ID would return,
    /// without persisting anything. Never creates settings, i.e. returns
    /// [AllocateError::AccountNotFound] if there are none.
    #[instrument(skip(self))]
    pub async fn peek(&self, id: &S::Id) -> Result<AllocatedNumber, AllocateError<S::Error>> {
        let VersionedConfig { config, .. } = self.load(id, false).await?;
        let value = config.format()?;

        Ok(AllocatedNumber {
            value,
            consumed: config.next_number,
        })
    }

    /// Get the current settings for the given account ID, creating them from the configured
    /// defaults if absent, unless [Config::create_if_absent] is switched off.
    #[instrument(skip(self))]
    pub async fn settings(
        &self,
        id: &S::Id,
    ) -> Result<InvoiceNumberConfig, AllocateError<S::Error>> {
        self.load(id, self.config.create_if_absent)
            .await
            .map(|VersionedConfig { config, .. }| config)
    }

    /// Explicitly change the settings for the given account ID, which is also the way to correct
    /// invalid stored settings. Returns the new settings. The changed fields are validated in
    /// full, the resulting settings like stored ones, before anything is written.
    #[instrument(skip(self))]
    pub async fn update_settings(
        &self,
        id: &S::Id,
        update: SettingsUpdate,
    ) -> Result<InvoiceNumberConfig, AllocateError<S::Error>> {
        update.validate()?;
        if let Some(next_number) = update.next_number {
            check_next_number_supported::<S>(next_number)?;
        }

        self.swap_loop(id, |config| {
            let updated = config.apply(&update);
            updated.check()?;
            Ok((updated.clone(), updated))
        })
        .await
    }

    /// Read the settings, derive the new ones along with the result from exactly what has been
    /// read and try to swap them in; repeat with a fresh read after a lost race.
    async fn swap_loop<F, T>(&self, id: &S::Id, f: F) -> Result<T, AllocateError<S::Error>>
    where
        F: Fn(InvoiceNumberConfig) -> Result<(InvoiceNumberConfig, T), InvalidConfig>,
    {
        let max_attempts = self.config.retry.max_attempts.get();

        for attempt in 1..=max_attempts {
            let VersionedConfig { version, config } =
                self.load(id, self.config.create_if_absent).await?;

            let (config, result) = f(config)?;
            let swapped = self
                .store
                .compare_and_swap(id, version, &config)
                .await
                .map_err(|error| store_error(id, error))?;

            if swapped {
                debug!(%id, %version, attempt, ?config, "swapped settings");
                return Ok(result);
            }

            debug!(%id, %version, attempt, "lost compare-and-swap race");
            if attempt < max_attempts {
                sleep(self.config.retry.backoff()).await;
            }
        }

        warn!(%id, attempts = max_attempts, "giving up because of contention");
        Err(AllocateError::AllocationContention {
            attempts: max_attempts,
        })
    }

    async fn load(
        &self,
        id: &S::Id,
        create_if_absent: bool,
    ) -> Result<VersionedConfig, AllocateError<S::Error>> {
        let settings = self
            .store
            .get(id)
            .await
            .map_err(|error| store_error(id, error))?;

        match settings {
            Some(settings) => Ok(settings),

            None if create_if_absent => {
                debug!(%id, "creating default settings");
                self.store
                    .create_if_absent(id, &self.config.defaults)
                    .await
                    .map_err(|error| store_error(id, error))
            }

            None => Err(AllocateError::AccountNotFound(id.to_string())),
        }
    }
}

/// Configuration for the [InvoiceNumberAllocator].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub defaults: InvoiceNumberConfig,

    #[serde(default = "create_if_absent_default")]
    pub create_if_absent: bool,
}

impl Config {
    /// Change the `retry`.
    pub fn with_retry(self, retry: RetryConfig) -> Self {
        Self { retry, ..self }
    }

    /// Change the `defaults`.
    pub fn with_defaults(self, defaults: InvoiceNumberConfig) -> Self {
        Self { defaults, ..self }
    }

    /// Change the `create_if_absent` flag.
    pub fn with_create_if_absent(self, create_if_absent: bool) -> Self {
        Self {
            create_if_absent,
            ..self
        }
    }
}

impl Default for Config {
    /// Default [RetryConfig], default [InvoiceNumberConfig] and creating settings if absent.
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            defaults: InvoiceNumberConfig::default(),
            create_if_absent: create_if_absent_default(),
        }
    }
}

/// An allocated invoice number along with the counter value it has consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedNumber {
    pub value: String,
    pub consumed: u64,
}

impl Display for AllocatedNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Errors from the [InvoiceNumberAllocator]. If any of these is returned, no invoice number has
/// been allocated.
#[derive(Debug, Error)]
pub enum AllocateError<E> {
    /// There are no settings for the account and they must not be created.
    #[error("no invoice number settings for account {0}")]
    AccountNotFound(String),

    /// Too many concurrent callers; the whole operation may be retried.
    #[error("cannot swap settings because of contention after {attempts} attempts")]
    AllocationContention { attempts: u32 },

    /// Stored or requested settings violate invariants.
    #[error("invalid invoice number settings")]
    InvalidConfig(#[from] InvalidConfig),

    /// Error from the [SettingsStore], passed through unchanged.
    #[error(transparent)]
    Store(E),
}

impl<E> AllocateError<E>
where
    E: StdError,
{
    /// Whether the caller may retry the operation, i.e. for contention or errors from the
    /// [SettingsStore].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AllocationContention { .. } | Self::Store(_))
    }

    /// The [SettingsStore] error, if this is one.
    pub fn into_store_error(self) -> Option<E> {
        match self {
            Self::Store(error) => Some(error),
            _ => None,
        }
    }
}

fn check_next_number_supported<S>(next_number: u64) -> Result<(), InvalidConfig>
where
    S: SettingsStore,
{
    if next_number > S::MAX_NEXT_NUMBER {
        Err(InvalidConfig::NextNumberTooLarge(
            next_number,
            S::MAX_NEXT_NUMBER,
        ))
    } else {
        Ok(())
    }
}

fn store_error<I, E>(id: &I, error: E) -> AllocateError<E>
where
    I: Display,
    E: StdError,
{
    warn!(%id, error = error.as_chain(), "settings store failed");
    AllocateError::Store(error)
}

const fn create_if_absent_default() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use crate::{
        settings_store::{test::TestSettingsStore, SettingsStore},
        AllocateError, AllocatedNumber, Config, InvalidConfig, InvoiceNumberAllocator,
        InvoiceNumberConfig, RetryConfig, SettingsUpdate,
    };
    use assert_matches::assert_matches;
    use error_ext::BoxError;
    use std::{collections::HashSet, num::NonZeroU32, time::Duration};
    use tokio::task::JoinSet;
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn allocator(
        store: &TestSettingsStore<Uuid>,
    ) -> Result<InvoiceNumberAllocator<TestSettingsStore<Uuid>>, BoxError> {
        let retry = RetryConfig::default().with_backoff(Duration::ZERO, Duration::from_millis(1));
        let allocator =
            InvoiceNumberAllocator::new(store.clone(), Config::default().with_retry(retry))?;
        Ok(allocator)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_allocate() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        store.put(id, InvoiceNumberConfig::new("INV-", 42, 3)).await;

        let number = allocator.allocate(&id).await?;
        assert_eq!(
            number,
            AllocatedNumber {
                value: "INV-042".to_string(),
                consumed: 42
            }
        );
        assert_eq!(number.to_string(), "INV-042");

        let settings = store.get(&id).await?;
        assert_matches!(settings, Some(settings) if settings.config.next_number == 43);

        assert!(logs_contain("swapped settings"));

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_with_defaults() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        for n in 1..=3 {
            let number = allocator.allocate(&id).await?;
            assert_eq!(number.value, format!("INV-00{n}"));
            assert_eq!(number.consumed, n);
        }

        let settings = allocator.settings(&id).await?;
        assert_eq!(settings, InvoiceNumberConfig::new("INV-", 4, 3));

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_beyond_pad_width() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        store.put(id, InvoiceNumberConfig::new("", 999, 3)).await;

        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, "999");
        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, "1000");

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_allocate_concurrently() -> Result<(), BoxError> {
        let store = TestSettingsStore::default().with_read_latency(Duration::from_micros(100));
        let retry = RetryConfig::default()
            .with_max_attempts(NonZeroU32::new(100).ok_or("zero")?)
            .with_backoff(Duration::ZERO, Duration::from_millis(2));
        let allocator = InvoiceNumberAllocator::new(
            store.clone(),
            Config::default()
                .with_retry(retry)
                .with_defaults(InvoiceNumberConfig::new("INV-", 7, 3)),
        )?;
        let id = Uuid::now_v7();
        store.fail_next_cas(25);

        let mut tasks = JoinSet::new();
        for _ in 0..100 {
            let allocator = allocator.clone();
            tasks.spawn(async move {
                loop {
                    match allocator.allocate(&id).await {
                        Err(AllocateError::AllocationContention { .. }) => continue,
                        result => break result,
                    }
                }
            });
        }

        let mut numbers = vec![];
        while let Some(number) = tasks.join_next().await {
            numbers.push(number??);
        }

        let values = numbers
            .iter()
            .map(|number| number.value.clone())
            .collect::<HashSet<_>>();
        assert_eq!(values.len(), 100);

        let mut consumed = numbers
            .iter()
            .map(|number| number.consumed)
            .collect::<Vec<_>>();
        consumed.sort_unstable();
        assert_eq!(consumed, (7..107).collect::<Vec<_>>());

        for number in &numbers {
            assert_eq!(number.value, format!("INV-{:03}", number.consumed));
        }

        let settings = store.get(&id).await?;
        assert_matches!(settings, Some(settings) if settings.config.next_number == 107);
        assert!(store.cas_calls() > 100);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_allocate_first_time_concurrently() -> Result<(), BoxError> {
        let store = TestSettingsStore::default().with_read_latency(Duration::from_millis(1));
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        let mut tasks = JoinSet::new();
        for _ in 0..2 {
            let allocator = allocator.clone();
            tasks.spawn(async move { allocator.settings(&id).await });
        }
        while let Some(settings) = tasks.join_next().await {
            assert_eq!(settings??, InvoiceNumberConfig::default());
        }

        let settings = store.get(&id).await?;
        assert_matches!(
            settings,
            Some(settings) if settings.version.as_u64() == 1 && settings.config.next_number == 1
        );

        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_allocate_contention() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        let before = store.put(id, InvoiceNumberConfig::new("INV-", 42, 3)).await;
        store.set_fail_all_cas(true);

        let result = allocator.allocate(&id).await;
        assert_matches!(
            result,
            Err(ref error @ AllocateError::AllocationContention { attempts: 5 })
                if error.is_retryable()
        );
        assert_eq!(store.cas_calls(), 5);

        let after = store.get(&id).await?;
        assert_eq!(after, Some(before));
        assert!(logs_contain("giving up because of contention"));

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_retries_lost_race() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        store.put(id, InvoiceNumberConfig::new("INV-", 42, 3)).await;
        store.fail_next_cas(4);

        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, "INV-042");
        assert_eq!(store.cas_calls(), 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_without_settings() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = InvoiceNumberAllocator::new(
            store.clone(),
            Config::default().with_create_if_absent(false),
        )?;
        let id = Uuid::now_v7();

        let result = allocator.allocate(&id).await;
        assert_matches!(
            result,
            Err(ref error @ AllocateError::AccountNotFound(ref account))
                if *account == id.to_string() && !error.is_retryable()
        );
        assert_matches!(store.get(&id).await?, None);
        assert_eq!(store.cas_calls(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_invalid_settings() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        let corrupt = store.put(id, InvoiceNumberConfig::new("INV-", 42, 0)).await;
        let result = allocator.allocate(&id).await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::ZeroPadWidth))
        );

        let corrupt_too = store.put(id, InvoiceNumberConfig::new("INV-", 0, 3)).await;
        let result = allocator.allocate(&id).await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::ZeroNextNumber))
        );

        assert_eq!(corrupt.version.as_u64() + 1, corrupt_too.version.as_u64());
        assert_eq!(store.get(&id).await?, Some(corrupt_too));
        assert_eq!(store.cas_calls(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_settings_written_elsewhere() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        store.put(id, InvoiceNumberConfig::new("INV-", 7, 21)).await;
        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, format!("INV-{:0>21}", 7));
        assert_eq!(number.consumed, 7);

        let prefix = "Acme Widgets International GmbH & Co/";
        store.put(id, InvoiceNumberConfig::new(prefix, 8, 3)).await;
        let number = allocator.peek(&id).await?;
        assert_eq!(number.value, format!("{prefix}008"));
        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, format!("{prefix}008"));

        // Updating other fields keeps such settings.
        let settings = allocator
            .update_settings(&id, SettingsUpdate::default().with_next_number(20))
            .await?;
        assert_eq!(settings, InvoiceNumberConfig::new(prefix, 20, 3));

        // Changing them is validated in full.
        let result = allocator
            .update_settings(&id, SettingsUpdate::default().with_pad_width(21))
            .await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::PadWidthTooLarge(21)))
        );
        let result = allocator
            .update_settings(&id, SettingsUpdate::default().with_prefix(prefix))
            .await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::PrefixTooLong(37)))
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_exhausted() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        store.put(id, InvoiceNumberConfig::new("", u64::MAX, 3)).await;
        let result = allocator.allocate(&id).await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::NextNumberExhausted(n)))
                if n == u64::MAX
        );

        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_allocate_store_error() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        store.set_unavailable(true);
        let result = allocator.allocate(&id).await;
        assert_matches!(result, Err(ref error @ AllocateError::Store(_)) if error.is_retryable());
        let error = result.err().and_then(AllocateError::into_store_error);
        assert_matches!(error, Some(error) if error.to_string() == "settings store unavailable");
        assert!(logs_contain("settings store failed"));

        Ok(())
    }

    #[tokio::test]
    async fn test_peek() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        let result = allocator.peek(&id).await;
        assert_matches!(result, Err(AllocateError::AccountNotFound(_)));
        assert_matches!(store.get(&id).await?, None);

        let before = store.put(id, InvoiceNumberConfig::new("R", 5, 2)).await;
        let number = allocator.peek(&id).await?;
        assert_eq!(number.value, "R05");
        assert_eq!(number.consumed, 5);
        assert_eq!(store.get(&id).await?, Some(before));

        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, "R05");

        Ok(())
    }

    #[tokio::test]
    async fn test_update_settings() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        allocator.allocate(&id).await?;
        allocator.allocate(&id).await?;

        let settings = allocator
            .update_settings(&id, SettingsUpdate::default().with_next_number(100))
            .await?;
        assert_eq!(settings, InvoiceNumberConfig::new("INV-", 100, 3));

        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, "INV-100");
        assert_eq!(number.consumed, 100);

        let update = SettingsUpdate::default()
            .with_prefix("RE-")
            .with_pad_width(5)
            .with_next_number(7);
        allocator.update_settings(&id, update).await?;
        let number = allocator.allocate(&id).await?;
        assert_eq!(number.value, "RE-00007");

        Ok(())
    }

    #[tokio::test]
    async fn test_update_settings_invalid() -> Result<(), BoxError> {
        let store = TestSettingsStore::default();
        let allocator = allocator(&store)?;
        let id = Uuid::now_v7();

        let result = allocator
            .update_settings(&id, SettingsUpdate::default().with_pad_width(0))
            .await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::ZeroPadWidth))
        );
        assert_matches!(store.get(&id).await?, None);

        // Updating is the way to correct corrupted settings.
        store.put(id, InvoiceNumberConfig::new("INV-", 0, 3)).await;
        let result = allocator
            .update_settings(&id, SettingsUpdate::default().with_prefix("X-"))
            .await;
        assert_matches!(
            result,
            Err(AllocateError::InvalidConfig(InvalidConfig::ZeroNextNumber))
        );
        let settings = allocator
            .update_settings(&id, SettingsUpdate::default().with_next_number(12))
            .await?;
        assert_eq!(settings, InvoiceNumberConfig::new("INV-", 12, 3));
        assert_eq!(allocator.allocate(&id).await?.value, "INV-012");

        Ok(())
    }

    #[test]
    fn test_new_invalid_defaults() {
        let result = InvoiceNumberAllocator::new(
            TestSettingsStore::<Uuid>::default(),
            Config::default().with_defaults(InvoiceNumberConfig::new("INV-", 1, 0)),
        );
        assert_matches!(result, Err(InvalidConfig::ZeroPadWidth));

        let result = InvoiceNumberAllocator::new(
            TestSettingsStore::<Uuid>::default(),
            Config::default().with_defaults(InvoiceNumberConfig::new("INV-", 1, 21)),
        );
        assert_matches!(result, Err(InvalidConfig::PadWidthTooLarge(21)));
    }
}
