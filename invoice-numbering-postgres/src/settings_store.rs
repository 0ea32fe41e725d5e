//! A [SettingsStore] implementation based on [PostgreSQL](https://www.postgresql.org/).

use crate::{
    pool::{self, Pool},
    Error,
};
use invoice_numbering::{InvoiceNumberConfig, SettingsStore, Version, VersionedConfig};
use serde::Deserialize;
use sqlx::{postgres::PgRow, Executor, Row};
use std::{
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    sync::Arc,
};
use tracing::{debug, instrument};

/// A [SettingsStore] implementation based on [PostgreSQL](https://www.postgresql.org/). Settings
/// are stored one row per account; the compare-and-swap is an `UPDATE` conditioned on the row
/// version, which is incremented by every write.
#[derive(Clone)]
pub struct PostgresSettingsStore<I> {
    pool: Pool,
    table: String,
    statements: Arc<Statements>,
    _id: PhantomData<I>,
}

impl<I> PostgresSettingsStore<I> {
    #[allow(missing_docs)]
    pub async fn new(config: Config) -> Result<Self, Error> {
        debug!(?config, "creating PostgresSettingsStore");

        // Create connection pool.
        let pool = Pool::new(config.pool)
            .await
            .map_err(|error| Error::Sqlx("cannot create connection pool".to_string(), error))?;

        let settings_store = Self {
            pool,
            statements: Arc::new(Statements::new(&config.table)),
            table: config.table,
            _id: PhantomData,
        };

        // Optionally create table.
        if config.setup {
            settings_store.setup().await?;
        }

        Ok(settings_store)
    }

    /// Create the settings table unless it already exists.
    pub async fn setup(&self) -> Result<(), Error> {
        let ddl = include_str!("create_settings_store.sql")
            .replace("invoice_number_settings", &self.table);
        let ddl = ddl.as_str();

        (&*self.pool).execute(ddl).await.map_err(|error| {
            Error::Sqlx("cannot create table for settings store".to_string(), error)
        })?;
        debug!(table = %self.table, "created settings table");

        Ok(())
    }
}

impl<I> Debug for PostgresSettingsStore<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSettingsStore")
            .field("table", &self.table)
            .finish()
    }
}

impl<I> SettingsStore for PostgresSettingsStore<I>
where
    I: Debug + Display + Clone + Send + Sync + 'static,
{
    type Id = I;

    type Error = Error;

    /// The maximum value for next numbers. As PostgreSQL does not support unsigned integers,
    /// this is `i64::MAX` or `9_223_372_036_854_775_807`.
    const MAX_NEXT_NUMBER: u64 = i64::MAX as u64;

    #[instrument(skip(self))]
    async fn get(&self, id: &Self::Id) -> Result<Option<VersionedConfig>, Self::Error> {
        sqlx::query(&self.statements.select)
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|error| Error::Sqlx("cannot select settings".to_string(), error))?
            .map(into_versioned_config)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn create_if_absent(
        &self,
        id: &Self::Id,
        defaults: &InvoiceNumberConfig,
    ) -> Result<VersionedConfig, Self::Error> {
        let inserted = sqlx::query(&self.statements.insert)
            .bind(id.to_string())
            .bind(&defaults.prefix)
            .bind(to_i64("next_number", defaults.next_number)?)
            .bind(to_i32("pad_width", defaults.pad_width)?)
            .execute(&*self.pool)
            .await
            .map_err(|error| Error::Sqlx("cannot insert settings".to_string(), error))?
            .rows_affected();
        debug!(%id, created = inserted == 1, "created settings if absent");

        // A concurrent insert has either been committed before `ON CONFLICT DO NOTHING` took effect
        // or this one has been, hence the row is visible now.
        self.get(id)
            .await?
            .ok_or_else(|| Error::MissingAfterCreate(id.to_string()))
    }

    #[instrument(skip(self))]
    async fn compare_and_swap(
        &self,
        id: &Self::Id,
        expected: Version,
        config: &InvoiceNumberConfig,
    ) -> Result<bool, Self::Error> {
        let updated = sqlx::query(&self.statements.update)
            .bind(id.to_string())
            .bind(to_i64("version", expected.as_u64())?)
            .bind(&config.prefix)
            .bind(to_i64("next_number", config.next_number)?)
            .bind(to_i32("pad_width", config.pad_width)?)
            .execute(&*self.pool)
            .await
            .map_err(|error| Error::Sqlx("cannot update settings".to_string(), error))?
            .rows_affected();

        Ok(updated == 1)
    }
}

/// Configuration for the [PostgresSettingsStore].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub pool: pool::Config,

    #[serde(default = "table_default")]
    pub table: String,

    #[serde(default)]
    pub setup: bool,
}

#[derive(Debug)]
struct Statements {
    select: String,
    insert: String,
    update: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            select: format!(
                "SELECT prefix, next_number, pad_width, version FROM {table} WHERE account_id = $1"
            ),
            insert: format!(
                "INSERT INTO {table} (account_id, prefix, next_number, pad_width, version)
                 VALUES ($1, $2, $3, $4, 1)
                 ON CONFLICT (account_id) DO NOTHING"
            ),
            update: format!(
                "UPDATE {table}
                 SET prefix = $3, next_number = $4, pad_width = $5, version = version + 1
                 WHERE account_id = $1 AND version = $2"
            ),
        }
    }
}

fn into_versioned_config(row: PgRow) -> Result<VersionedConfig, Error> {
    let prefix = row
        .try_get::<String, _>(0)
        .map_err(|error| Error::Sqlx("cannot get prefix".to_string(), error))?;
    let next_number = row
        .try_get::<i64, _>(1)
        .map_err(|error| Error::Sqlx("cannot get next_number".to_string(), error))?;
    let pad_width = row
        .try_get::<i32, _>(2)
        .map_err(|error| Error::Sqlx("cannot get pad_width".to_string(), error))?;
    let version = row
        .try_get::<i64, _>(3)
        .map_err(|error| Error::Sqlx("cannot get version".to_string(), error))?;

    let config = InvoiceNumberConfig {
        prefix,
        next_number: u64::try_from(next_number)
            .map_err(|_| Error::InvalidValue("next_number", next_number))?,
        pad_width: u32::try_from(pad_width)
            .map_err(|_| Error::InvalidValue("pad_width", pad_width.into()))?,
    };
    let version = Version::try_from(version).map_err(Error::InvalidVersion)?;

    Ok(VersionedConfig::new(version, config))
}

fn to_i64(column: &'static str, value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::OutOfRange(column, value))
}

fn to_i32(column: &'static str, value: u32) -> Result<i32, Error> {
    i32::try_from(value).map_err(|_| Error::OutOfRange(column, value.into()))
}

fn table_default() -> String {
    "invoice_number_settings".to_string()
}
