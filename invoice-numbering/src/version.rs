use std::{
    fmt::{self, Display},
    num::NonZeroU64,
};
use thiserror::Error;

/// Version of stored invoice number settings, used for optimistic locking: every write assigns a
/// new version and a compare-and-swap only succeeds for the version it was read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(NonZeroU64);

impl Version {
    #[allow(missing_docs)]
    pub const MIN: Version = Self(NonZeroU64::MIN);

    #[allow(missing_docs)]
    pub const fn new(value: NonZeroU64) -> Self {
        Self(value)
    }

    #[allow(missing_docs)]
    pub const fn as_u64(&self) -> u64 {
        self.0.get()
    }

    /// Get the successor of this version, if any.
    pub fn succ(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl TryFrom<u64> for Version {
    type Error = ZeroVersionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        NonZeroU64::new(value).ok_or(ZeroVersionError).map(Self::new)
    }
}

impl TryFrom<i64> for Version {
    type Error = ZeroVersionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map_err(|_| ZeroVersionError)
            .and_then(Self::try_from)
    }
}

/// Error signaling that a version must be positive.
#[derive(Debug, Error)]
#[error("version must be positive")]
pub struct ZeroVersionError;

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
