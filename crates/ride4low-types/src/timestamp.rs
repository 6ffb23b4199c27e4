//! Unix timestamps for payment authorization windows.
//!
//! A transfer authorization is valid between `validAfter` and `validBefore`, both
//! absolute Unix-second bounds. A payment quote is stale once the time it was
//! received plus its `maxTimeoutSeconds` has passed. [`UnixTimestamp`] is the one
//! clock type used for both.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// Seconds since the Unix epoch.
///
/// Serialized as a stringified integer, the form EIP-3009 authorizations use on
/// the wire:
///
/// ```json
/// "1699999999"
/// ```
///
/// ```
/// use ride4low_types::timestamp::UnixTimestamp;
///
/// let start = UnixTimestamp::from_secs(1_700_000_000);
/// let end = start + 120;
/// assert_eq!(end.seconds_since(start), 120);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Current system time. A clock set before the epoch reads as zero.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Whole seconds elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn seconds_since(&self, earlier: UnixTimestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}
