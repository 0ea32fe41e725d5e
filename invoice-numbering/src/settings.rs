//! Invoice number settings of an account and their validation.

use crate::Version;
use serde::Deserialize;
use thiserror::Error;

/// Maximum pad width: the number of decimal digits of `u64::MAX`.
pub const MAX_PAD_WIDTH: u32 = 20;

/// Maximum number of characters of a prefix.
pub const MAX_PREFIX_LEN: usize = 32;

/// The invoice number settings of an account: the next number is zero-padded to the pad width and
/// the prefix is prepended verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InvoiceNumberConfig {
    #[serde(default = "prefix_default")]
    pub prefix: String,

    #[serde(default = "next_number_default")]
    pub next_number: u64,

    #[serde(default = "pad_width_default")]
    pub pad_width: u32,
}

impl InvoiceNumberConfig {
    #[allow(missing_docs)]
    pub fn new<T>(prefix: T, next_number: u64, pad_width: u32) -> Self
    where
        T: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            next_number,
            pad_width,
        }
    }

    /// Check these settings before writing them: the next number and the pad width must be
    /// positive, the pad width must not exceed [MAX_PAD_WIDTH] and the prefix must be short and
    /// free of control characters.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        self.check()?;
        validate_pad_width(self.pad_width)?;
        validate_prefix(&self.prefix)
    }

    /// Check settings as read from a settings store: only a zero next number or pad width is
    /// invalid. Any prefix and any larger pad width written elsewhere are accepted.
    pub fn check(&self) -> Result<(), InvalidConfig> {
        if self.next_number == 0 {
            return Err(InvalidConfig::ZeroNextNumber);
        }
        if self.pad_width == 0 {
            return Err(InvalidConfig::ZeroPadWidth);
        }
        Ok(())
    }

    /// Format the next number, i.e. the prefix followed by the zero-padded next number.
    pub fn format(&self) -> Result<String, InvalidConfig> {
        self.check()?;
        zero_pad(self.next_number, self.pad_width).map(|number| format!("{}{number}", self.prefix))
    }

    /// Apply the given update; fields which are not set keep their current value.
    pub fn apply(&self, update: &SettingsUpdate) -> Self {
        Self {
            prefix: update
                .prefix
                .clone()
                .unwrap_or_else(|| self.prefix.clone()),
            next_number: update.next_number.unwrap_or(self.next_number),
            pad_width: update.pad_width.unwrap_or(self.pad_width),
        }
    }
}

impl Default for InvoiceNumberConfig {
    /// "INV-" for `prefix`, 1 for `next_number` and 3 for `pad_width`.
    fn default() -> Self {
        Self {
            prefix: prefix_default(),
            next_number: next_number_default(),
            pad_width: pad_width_default(),
        }
    }
}

/// [InvoiceNumberConfig] along with its [Version] as read from a settings store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedConfig {
    pub version: Version,
    pub config: InvoiceNumberConfig,
}

impl VersionedConfig {
    #[allow(missing_docs)]
    pub fn new(version: Version, config: InvoiceNumberConfig) -> Self {
        Self { version, config }
    }
}

/// An explicit, user driven change of invoice number settings. Setting the next number is an
/// authoritative reset, i.e. it may move the counter backwards as well as forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SettingsUpdate {
    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub next_number: Option<u64>,

    #[serde(default)]
    pub pad_width: Option<u32>,
}

impl SettingsUpdate {
    /// Change the `prefix`.
    pub fn with_prefix<T>(self, prefix: T) -> Self
    where
        T: Into<String>,
    {
        let prefix = Some(prefix.into());
        Self { prefix, ..self }
    }

    /// Change the `next_number`.
    pub fn with_next_number(self, next_number: u64) -> Self {
        let next_number = Some(next_number);
        Self {
            next_number,
            ..self
        }
    }

    /// Change the `pad_width`.
    pub fn with_pad_width(self, pad_width: u32) -> Self {
        let pad_width = Some(pad_width);
        Self { pad_width, ..self }
    }

    /// Check the fields which are set.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.next_number == Some(0) {
            return Err(InvalidConfig::ZeroNextNumber);
        }
        if let Some(pad_width) = self.pad_width {
            validate_pad_width(pad_width)?;
        }
        if let Some(prefix) = &self.prefix {
            validate_prefix(prefix)?;
        }
        Ok(())
    }
}

/// Render `n` in base 10, left-padded with '0' to at least `width` digits. Numbers longer than
/// `width` are never truncated. Zero for either argument is rejected.
pub fn zero_pad(n: u64, width: u32) -> Result<String, InvalidConfig> {
    if n == 0 {
        return Err(InvalidConfig::ZeroNextNumber);
    }
    if width == 0 {
        return Err(InvalidConfig::ZeroPadWidth);
    }

    Ok(format!("{n:0>width$}", width = width as usize))
}

/// Invoice number settings violating invariants. Stored settings violating these signal data
/// corruption and are only reported, never healed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidConfig {
    #[error("next number must be positive")]
    ZeroNextNumber,

    #[error("pad width must be positive")]
    ZeroPadWidth,

    #[error("pad width {0} exceeds the maximum of {}", MAX_PAD_WIDTH)]
    PadWidthTooLarge(u32),

    #[error("prefix with {0} characters exceeds the maximum of {}", MAX_PREFIX_LEN)]
    PrefixTooLong(usize),

    #[error("prefix must not contain control characters")]
    PrefixControlChar,

    #[error("next number {0} exceeds the maximum of {1} supported by the settings store")]
    NextNumberTooLarge(u64, u64),

    #[error("next number {0} cannot be advanced any further")]
    NextNumberExhausted(u64),
}

fn validate_pad_width(pad_width: u32) -> Result<(), InvalidConfig> {
    match pad_width {
        0 => Err(InvalidConfig::ZeroPadWidth),
        n if n > MAX_PAD_WIDTH => Err(InvalidConfig::PadWidthTooLarge(n)),
        _ => Ok(()),
    }
}

fn validate_prefix(prefix: &str) -> Result<(), InvalidConfig> {
    let len = prefix.chars().count();
    if len > MAX_PREFIX_LEN {
        return Err(InvalidConfig::PrefixTooLong(len));
    }
    if prefix.chars().any(char::is_control) {
        return Err(InvalidConfig::PrefixControlChar);
    }
    Ok(())
}

fn prefix_default() -> String {
    "INV-".to_string()
}

const fn next_number_default() -> u64 {
    1
}

const fn pad_width_default() -> u32 {
    3
}
