use anyhow::{Context, Result};
use configured::Configured;
use invoice_numbering_postgres::{PostgresSettingsStore, PostgresSettingsStoreConfig};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("initialize tracing")?;

    let config = Config::load().context("load configuration")?;
    println!("Starting with configuration: {config:?}");

    let settings_store = PostgresSettingsStore::<String>::new(config.settings_store)
        .await
        .context("create settings store")?;

    allocate::run(config.allocate, settings_store).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Config {
    allocate: allocate::Config,
    settings_store: PostgresSettingsStoreConfig,
}
