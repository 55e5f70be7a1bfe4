//! Address book of peers learned through the network
//!
//! Addresses start in one of [`NEW_BUCKET_COUNT`] "new" buckets and move to
//! one of [`OLD_BUCKET_COUNT`] "old" buckets once a connection to them has
//! succeeded. Bucket placement is a keyed hash of the address and source
//! network groups, so a single network block cannot take over the book.

mod book;
mod file;
mod known_address;

pub use book::AddrBook;
pub use known_address::{BucketType, KnownAddress};

use crate::NetAddress;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Below this many addresses the book asks peers for more
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;

pub const OLD_BUCKET_SIZE: usize = 64;
pub const OLD_BUCKET_COUNT: usize = 64;
pub const NEW_BUCKET_SIZE: usize = 64;
pub const NEW_BUCKET_COUNT: usize = 256;

/// Old buckets a single network group can land in
pub const OLD_BUCKETS_PER_GROUP: u64 = 4;
/// New buckets addresses from a single source group can land in
pub const NEW_BUCKETS_PER_GROUP: u64 = 32;
/// New buckets a single address can be referenced from
pub const MAX_NEW_BUCKETS_PER_ADDRESS: usize = 4;

/// Days without an attempt before an address is considered bad
pub const NUM_MISSING_DAYS: i64 = 7;
/// Failed attempts without any success before an address is considered bad
pub const NUM_RETRIES: u32 = 3;
/// Failed attempts since the last success before an address is considered bad
pub const MAX_FAILURES: u32 = 10;
/// Days since the last success, together with [`MAX_FAILURES`]
pub const MIN_BAD_DAYS: i64 = 7;

/// Share of the book returned by a selection, in percent
pub const GET_SELECTION_PERCENT: usize = 23;
pub const MIN_GET_SELECTION: usize = 32;
pub const MAX_GET_SELECTION: usize = 250;

#[derive(Error, Debug)]
pub enum AddrBookError {
    #[error("Invalid address {addr}: {reason}")]
    InvalidAddress { addr: NetAddress, reason: String },

    #[error("Cannot add non-routable address {0}")]
    NonRoutable(NetAddress),

    #[error("Cannot add ourselves with address {0}")]
    SelfAddress(NetAddress),

    #[error("Cannot add private peer with address {0}")]
    PrivateAddress(NetAddress),

    #[error("Cannot add {addr} learned from private peer {src}")]
    PrivateSource { addr: NetAddress, src: NetAddress },

    #[error("Cannot add old address {0} to a new bucket")]
    OldAddressNewSource(NetAddress),

    #[error("Corrupt address book {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Address book state inconsistent: {0}")]
    Inconsistent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AddrBookConfig {
    /// Where the book is persisted
    pub file: PathBuf,

    /// Only accept publicly routable addresses
    pub strict: bool,

    /// Seconds between periodic saves
    pub save_interval_secs: u64,
}

impl Default for AddrBookConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("config/addrbook.json"),
            strict: true,
            save_interval_secs: 120,
        }
    }
}

impl AddrBookConfig {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval_secs = interval.as_secs();
        self
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.file.as_os_str().is_empty() {
            return Err("Address book file must be set".to_string());
        }
        if self.save_interval_secs == 0 {
            return Err("Address book save interval must be greater than 0".to_string());
        }
        Ok(())
    }
}
