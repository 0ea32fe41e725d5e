//! Connection pool for sqlx with Postgres.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::{ops::Deref, time::Duration};
use tracing::debug;

/// New type for `PgPool`, allowing for some custom extensions as well as security.
///
/// To use as `&PgPool` in `Query::execute`, use its `Deref` implementation: `&*pool` or
/// `pool.deref()`. If an owned `PgPool` is needed, use `Into::into`.
#[derive(Debug, Clone)]
pub struct Pool(PgPool);

impl Pool {
    /// Try to create a new [Pool] with the given [Config].
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.into())
            .await?;

        let pool = pool.into();
        debug!(?pool, "created pool");

        Ok(pool)
    }
}

impl From<PgPool> for Pool {
    fn from(pool: PgPool) -> Self {
        Self(pool)
    }
}

impl From<Pool> for PgPool {
    fn from(pool: Pool) -> Self {
        pool.0
    }
}

impl Deref for Pool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Configuration for [Pool].
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub host: String,

    pub port: u16,

    pub user: String,

    pub password: SecretString,

    pub dbname: String,

    #[serde_as(as = "DisplayFromStr")]
    pub sslmode: PgSslMode,

    #[serde(default = "max_connections_default")]
    pub max_connections: u32,

    #[serde(default = "acquire_timeout_default", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl From<Config> for PgConnectOptions {
    fn from(config: Config) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&config.host)
            .username(&config.user)
            .password(config.password.expose_secret())
            .database(&config.dbname)
            .port(config.port)
            .ssl_mode(config.sslmode)
    }
}

const fn max_connections_default() -> u32 {
    10
}

const fn acquire_timeout_default() -> Duration {
    Duration::from_secs(30)
}
