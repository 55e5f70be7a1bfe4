//! Database traits and interfaces

use crate::{ColumnFamily, DbResult};
use std::sync::Arc;

/// Key-value database trait
pub trait KeyValueDB: Send + Sync {
    /// Get value by key from a column family
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    /// Put key-value pair into a column family.
    ///
    /// Backends that support it make the write durable before returning.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()>;

    /// Delete key from a column family
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()>;

    /// Check if key exists in a column family
    fn exists(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Flush memtables to disk
    fn flush(&self) -> DbResult<()>;
}

/// Shared database reference
pub type SharedDatabase = Arc<dyn KeyValueDB>;
