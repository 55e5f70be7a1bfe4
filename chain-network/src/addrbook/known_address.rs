//! Reputation bookkeeping for a single address in the book

use crate::{NetAddress, NodeId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{MAX_FAILURES, MIN_BAD_DAYS, NUM_MISSING_DAYS, NUM_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    /// Learned about but never successfully connected
    New,
    /// Successfully connected at least once
    Old,
}

/// An address tracked by the book together with how it has behaved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownAddress {
    pub addr: NetAddress,
    pub src: NetAddress,
    pub buckets: Vec<usize>,
    pub attempts: u32,
    pub bucket_type: BucketType,
    pub last_attempt: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
}

impl KnownAddress {
    pub fn new(addr: NetAddress, src: NetAddress) -> Self {
        Self {
            addr,
            src,
            buckets: Vec::new(),
            attempts: 0,
            bucket_type: BucketType::New,
            last_attempt: Utc::now(),
            last_success: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.addr.id
    }

    pub fn is_old(&self) -> bool {
        self.bucket_type == BucketType::Old
    }

    pub fn is_new(&self) -> bool {
        self.bucket_type == BucketType::New
    }

    pub fn mark_attempt(&mut self) {
        self.last_attempt = Utc::now();
        self.attempts += 1;
    }

    pub fn mark_good(&mut self) {
        let now = Utc::now();
        self.last_attempt = now;
        self.attempts = 0;
        self.last_success = Some(now);
    }

    /// Returns the number of buckets referencing this address afterwards
    pub(crate) fn add_bucket_ref(&mut self, bucket_idx: usize) -> usize {
        if !self.buckets.contains(&bucket_idx) {
            self.buckets.push(bucket_idx);
        }
        self.buckets.len()
    }

    /// Returns the number of buckets referencing this address afterwards
    pub(crate) fn remove_bucket_ref(&mut self, bucket_idx: usize) -> usize {
        self.buckets.retain(|&idx| idx != bucket_idx);
        self.buckets.len()
    }

    /// Whether the address is a good eviction candidate
    pub fn is_bad(&self) -> bool {
        self.is_bad_at(Utc::now())
    }

    pub(crate) fn is_bad_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_old() {
            return false;
        }

        // Attempted in the last minute
        if self.last_attempt > now - Duration::minutes(1) {
            return false;
        }

        // Nothing heard for too long
        if self.last_attempt < now - Duration::days(NUM_MISSING_DAYS) {
            return true;
        }

        match self.last_success {
            None => self.attempts >= NUM_RETRIES,
            Some(success) => {
                success < now - Duration::days(MIN_BAD_DAYS) && self.attempts >= MAX_FAILURES
            }
        }
    }
}
