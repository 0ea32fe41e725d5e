//! [SettingsStore](invoice_numbering::SettingsStore) implementation based upon
//! [NATS](https://nats.io/) JetStream key-value buckets.

mod settings_store;

pub use settings_store::{Config as NatsSettingsStoreConfig, NatsSettingsStore};

use async_nats::{Client, ConnectOptions};
use error_ext::BoxError;
use invoice_numbering::ZeroVersionError;
use prost::{DecodeError, EncodeError};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the [NatsSettingsStore].
#[derive(Debug, Error)]
pub enum Error {
    #[error("NATS error: {0}")]
    Nats(String, #[source] BoxError),

    /// Settings cannot be encoded as Protocol Buffers.
    #[error("cannot encode settings as Protocol Buffers")]
    EncodeSettings(#[from] EncodeError),

    /// Settings cannot be decoded from Protocol Buffers.
    #[error("cannot decode settings from Protocol Buffers")]
    DecodeSettings(#[from] DecodeError),

    /// Invalid revision used as version.
    #[error("invalid version")]
    InvalidVersion(#[source] ZeroVersionError),

    /// Settings not found right after creating them if absent.
    #[error("no settings for account {0} after creating them")]
    MissingAfterCreate(String),
}

/// Authentication for connecting to a NATS server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum AuthConfig {
    UserPassword {
        user: String,
        password: SecretString,
    },

    Token {
        token: SecretString,
    },

    Credentials {
        path: PathBuf,
    },
}

async fn make_client(auth: Option<&AuthConfig>, server_addr: &str) -> Result<Client, Error> {
    let options = match auth {
        Some(AuthConfig::UserPassword { user, password }) => {
            ConnectOptions::with_user_and_password(
                user.to_owned(),
                password.expose_secret().to_owned(),
            )
        }

        Some(AuthConfig::Token { token }) => {
            ConnectOptions::with_token(token.expose_secret().to_owned())
        }

        Some(AuthConfig::Credentials { path }) => ConnectOptions::new()
            .credentials_file(path)
            .await
            .map_err(|error| {
                Error::Nats(
                    format!("cannot read NATS credentials file at {}", path.display()),
                    error.into(),
                )
            })?,

        None => ConnectOptions::new(),
    };

    options.connect(server_addr).await.map_err(|error| {
        Error::Nats(
            format!("cannot connect to NATS server at {server_addr}"),
            error.into(),
        )
    })
}
