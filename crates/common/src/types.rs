// Core domain types shared across all Holdfast crates.

use serde::{Deserialize, Serialize};

use crate::si::StorageIndex;

/// Seconds in a day; lease-age histogram bins are this wide.
pub const DAY: i64 = 24 * 60 * 60;
/// Thirty days.
pub const MONTH: i64 = 30 * DAY;

/// Account pre-seeded at schema install for protocol-path leases.
pub const ANONYMOUS_ACCOUNT_ID: i64 = 0;
/// Account pre-seeded at schema install for crawler starter leases.
pub const STARTER_ACCOUNT_ID: i64 = 1;
/// Starter leases last two months.
pub const STARTER_LEASE_DURATION: i64 = 2 * MONTH;

/// What kind of share a catalog row describes.
///
/// The discriminants are the integers persisted in the `sharetype` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    Immutable = 0,
    Mutable = 1,
    Corrupted = 2,
    Unknown = 3,
}

impl ShareType {
    pub const ALL: [ShareType; 4] =
        [Self::Immutable, Self::Mutable, Self::Corrupted, Self::Unknown];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immutable => "immutable",
            Self::Mutable => "mutable",
            Self::Corrupted => "corrupted",
            Self::Unknown => "unknown",
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Immutable),
            1 => Some(Self::Mutable),
            2 => Some(Self::Corrupted),
            3 => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Share lifecycle state, persisted as the `state` column.
///
/// Transitions are monotonic: COMING goes to STABLE (upload finished) or is
/// deleted outright (upload aborted); STABLE goes to GOING before backend
/// deletion; GOING never returns to STABLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareState {
    Coming = 0,
    Stable = 1,
    Going = 2,
}

impl ShareState {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Coming),
            1 => Some(Self::Stable),
            2 => Some(Self::Going),
            _ => None,
        }
    }
}

/// Identity of one share: `(storage_index, shnum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareId {
    pub storage_index: StorageIndex,
    pub shnum: u32,
}

impl ShareId {
    pub fn new(storage_index: StorageIndex, shnum: u32) -> Self {
        Self { storage_index, shnum }
    }
}

impl std::fmt::Display for ShareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.storage_index, self.shnum)
    }
}

/// An account-scoped claim on a share.
///
/// Duration is implicit: `expiration_time - renewal_time`. Timestamps are
/// seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub storage_index: StorageIndex,
    pub shnum: u32,
    pub account_id: i64,
    pub renewal_time: i64,
    pub expiration_time: i64,
}
