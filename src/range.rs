//! Contiguous ranges of numbered databases.
//!
//! Databases are addressed by 1-based index (`prefix-0000001`, ...). A
//! [`DbRange`] is either empty or an inclusive `low..=high` span of
//! positive indices.

use crate::error::{HarnessError, Result};
use crate::ids;
use std::fmt;

/// Inclusive range of database indices, or the empty marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DbRange {
    bounds: Option<(u32, u32)>,
}

impl DbRange {
    /// The empty range ("not used").
    pub const EMPTY: DbRange = DbRange { bounds: None };

    /// Validated `low..=high`. Both ends must be positive, `low <= high`
    /// and `high` must fit the fixed-width database names.
    pub fn new(low: u32, high: u32) -> Result<Self> {
        if low == 0 || low > high {
            return Err(HarnessError::Config(format!(
                "invalid database range ({}, {}): need 1 <= low <= high",
                low, high
            )));
        }
        if high > ids::MAX_INDEX {
            return Err(HarnessError::Config(format!(
                "invalid database range ({}, {}): indices are limited to {}",
                low,
                high,
                ids::MAX_INDEX
            )));
        }
        Ok(Self {
            bounds: Some((low, high)),
        })
    }

    /// A single database. Index 0 yields the empty range.
    pub fn single(index: u32) -> Self {
        if index == 0 {
            return Self::EMPTY;
        }
        Self {
            bounds: Some((index, index)),
        }
    }

    /// The first `count` databases, `1..=count`. A count of 0 is empty.
    pub fn first(count: u32) -> Self {
        if count == 0 {
            return Self::EMPTY;
        }
        Self {
            bounds: Some((1, count)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    pub fn cardinality(&self) -> usize {
        match self.bounds {
            Some((lo, hi)) => (hi - lo) as usize + 1,
            None => 0,
        }
    }

    pub fn low(&self) -> Option<u32> {
        self.bounds.map(|(lo, _)| lo)
    }

    pub fn high(&self) -> Option<u32> {
        self.bounds.map(|(_, hi)| hi)
    }

    pub fn contains(&self, index: u32) -> bool {
        matches!(self.bounds, Some((lo, hi)) if lo <= index && index <= hi)
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        let (lo, hi) = match self.bounds {
            Some(b) => b,
            // 1..=0 is empty
            None => (1, 0),
        };
        lo..=hi
    }
}

impl fmt::Display for DbRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bounds {
            None => write!(f, "()"),
            Some((lo, hi)) if lo == hi => write!(f, "{}", lo),
            Some((lo, hi)) => write!(f, "({}, {})", lo, hi),
        }
    }
}

impl From<u32> for DbRange {
    fn from(index: u32) -> Self {
        Self::single(index)
    }
}
