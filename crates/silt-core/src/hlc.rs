//! Hybrid logical clock timestamps.
//!
//! An [`Hlc`] pairs wall-clock nanoseconds with a logical counter and orders
//! lexicographically, matching the commit timestamps emitted by the upstream
//! changefeed. The wire format is `<nanos>.<logical>` with a ten-digit
//! logical fraction, e.g. `1586019746136571000.0000000001`.

use crate::error::SiltError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A hybrid logical clock value.
///
/// The zero value means "unset" and sorts before every real timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct Hlc {
    nanos: i64,
    logical: i32,
}

impl Hlc {
    /// The unset timestamp.
    pub const ZERO: Hlc = Hlc {
        nanos: 0,
        logical: 0,
    };

    pub fn new(nanos: i64, logical: i32) -> Self {
        Self { nanos, logical }
    }

    pub fn nanos(&self) -> i64 {
        self.nanos
    }

    pub fn logical(&self) -> i32 {
        self.logical
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Parse the changefeed wire format `<nanos>.<logical>`.
    pub fn parse(s: &str) -> Result<Self, SiltError> {
        let (nanos, logical) = s
            .split_once('.')
            .ok_or_else(|| SiltError::bad_request(format!("invalid timestamp {s:?}")))?;
        let nanos: i64 = nanos
            .parse()
            .map_err(|_| SiltError::bad_request(format!("invalid timestamp nanos in {s:?}")))?;
        let logical: i32 = logical
            .parse()
            .map_err(|_| SiltError::bad_request(format!("invalid timestamp logical in {s:?}")))?;
        if nanos < 0 || logical < 0 {
            return Err(SiltError::bad_request(format!(
                "timestamp components must be non-negative in {s:?}"
            )));
        }
        Ok(Self { nanos, logical })
    }

    /// The `DECIMAL` representation used by the staging tables. Fixed-width
    /// logical digits keep numeric ordering aligned with HLC ordering.
    pub fn to_decimal(&self) -> String {
        format!("{}.{:010}", self.nanos, self.logical)
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.nanos, self.logical)
    }
}

impl FromStr for Hlc {
    type Err = SiltError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Hlc> for String {
    fn from(hlc: Hlc) -> Self {
        hlc.to_string()
    }
}

impl TryFrom<String> for Hlc {
    type Error = SiltError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}
