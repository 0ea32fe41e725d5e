//! A [SettingsStore] implementation based on [NATS](https://nats.io/).

use crate::{make_client, AuthConfig, Error};
use async_nats::jetstream::{
    self,
    kv::{CreateErrorKind, Entry, Operation, Store, UpdateErrorKind},
};
use bytes::{Bytes, BytesMut};
use invoice_numbering::{InvoiceNumberConfig, SettingsStore, Version, VersionedConfig};
use prost::Message;
use serde::Deserialize;
use std::{
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
};
use tracing::{debug, instrument};

/// A [SettingsStore] implementation based on [NATS](https://nats.io/). Settings are stored in a
/// JetStream key-value bucket, one entry per account, encoded as Protocol Buffers. The entry
/// revision is used as version.
#[derive(Clone)]
pub struct NatsSettingsStore<I> {
    bucket: String,
    store: Store,
    _id: PhantomData<I>,
}

impl<I> NatsSettingsStore<I> {
    #[allow(missing_docs)]
    pub async fn new(config: Config) -> Result<Self, Error> {
        debug!(?config, "creating NatsSettingsStore");

        let client = make_client(config.auth.as_ref(), &config.server_addr).await?;
        let jetstream = jetstream::new(client);

        // Setup bucket.
        if config.setup {
            jetstream
                .create_key_value(jetstream::kv::Config {
                    bucket: config.bucket.clone(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|error| {
                    Error::Nats(
                        format!("cannot create NATS KV bucket {}", config.bucket),
                        error.into(),
                    )
                })?;
            debug!(bucket = %config.bucket, "created bucket");
        }

        let store = jetstream
            .get_key_value(&config.bucket)
            .await
            .map_err(|error| {
                Error::Nats(
                    format!("cannot get NATS KV bucket {}", config.bucket),
                    error.into(),
                )
            })?;

        Ok(Self {
            bucket: config.bucket,
            store,
            _id: PhantomData,
        })
    }
}

impl<I> Debug for NatsSettingsStore<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsSettingsStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl<I> SettingsStore for NatsSettingsStore<I>
where
    I: Debug + Display + Clone + Send + Sync + 'static,
{
    type Id = I;

    type Error = Error;

    #[instrument(skip(self))]
    async fn get(&self, id: &Self::Id) -> Result<Option<VersionedConfig>, Self::Error> {
        self.store
            .entry(id.to_string())
            .await
            .map_err(|error| Error::Nats("cannot get settings entry".to_string(), error.into()))?
            .filter(|entry| matches!(entry.operation, Operation::Put))
            .map(into_versioned_config)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn create_if_absent(
        &self,
        id: &Self::Id,
        defaults: &InvoiceNumberConfig,
    ) -> Result<VersionedConfig, Self::Error> {
        match self.store.create(id.to_string(), encode(defaults)?).await {
            Ok(revision) => {
                debug!(%id, revision, "created settings");
                let version = Version::try_from(revision).map_err(Error::InvalidVersion)?;
                Ok(VersionedConfig::new(version, defaults.clone()))
            }

            Err(error) if matches!(error.kind(), CreateErrorKind::AlreadyExists) => self
                .get(id)
                .await?
                .ok_or_else(|| Error::MissingAfterCreate(id.to_string())),

            Err(error) => Err(Error::Nats(
                "cannot create settings entry".to_string(),
                error.into(),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn compare_and_swap(
        &self,
        id: &Self::Id,
        expected: Version,
        config: &InvoiceNumberConfig,
    ) -> Result<bool, Self::Error> {
        let result = self
            .store
            .update(id.to_string(), encode(config)?, expected.as_u64())
            .await;

        match result {
            Ok(_) => Ok(true),

            Err(error) if matches!(error.kind(), UpdateErrorKind::WrongLastRevision) => Ok(false),

            Err(error) => Err(Error::Nats(
                "cannot update settings entry".to_string(),
                error.into(),
            )),
        }
    }
}

/// Configuration for the [NatsSettingsStore].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server_addr: String,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default = "bucket_default")]
    pub bucket: String,

    #[serde(default)]
    pub setup: bool,
}

impl Config {
    /// Change the `server_addr`.
    pub fn with_server_addr<T>(self, server_addr: T) -> Self
    where
        T: Into<String>,
    {
        let server_addr = server_addr.into();
        Self {
            server_addr,
            ..self
        }
    }

    /// Change the `auth`.
    pub fn with_auth(self, auth: AuthConfig) -> Self {
        Self {
            auth: Some(auth),
            ..self
        }
    }

    /// Change the `bucket`.
    pub fn with_bucket<T>(self, bucket: T) -> Self
    where
        T: Into<String>,
    {
        let bucket = bucket.into();
        Self { bucket, ..self }
    }

    /// Change the `setup` flag.
    pub fn with_setup(self, setup: bool) -> Self {
        Self { setup, ..self }
    }
}

impl Default for Config {
    /// Use "localhost:4222" for `server_addr` and "invoice-number-settings" for `bucket`.
    fn default() -> Self {
        Self {
            server_addr: "localhost:4222".to_string(),
            auth: None,
            bucket: bucket_default(),
            setup: false,
        }
    }
}

fn encode(config: &InvoiceNumberConfig) -> Result<Bytes, Error> {
    let settings = proto::InvoiceNumberSettings {
        prefix: config.prefix.clone(),
        next_number: config.next_number,
        pad_width: config.pad_width,
    };
    let mut bytes = BytesMut::new();
    settings.encode(&mut bytes)?;
    Ok(bytes.freeze())
}

fn into_versioned_config(entry: Entry) -> Result<VersionedConfig, Error> {
    let proto::InvoiceNumberSettings {
        prefix,
        next_number,
        pad_width,
    } = proto::InvoiceNumberSettings::decode(entry.value)?;
    let version = Version::try_from(entry.revision).map_err(Error::InvalidVersion)?;

    Ok(VersionedConfig::new(
        version,
        InvoiceNumberConfig {
            prefix,
            next_number,
            pad_width,
        },
    ))
}

fn bucket_default() -> String {
    "invoice-number-settings".to_string()
}

mod proto {
    include!(concat!(env!("OUT_DIR"), "/settings_store.rs"));
}
