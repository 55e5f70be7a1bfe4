//! In-memory key-value database

use crate::{ColumnFamily, DbResult, KeyValueDB};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Volatile database used by tests and nodes that do not persist state
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    data: RwLock<HashMap<(ColumnFamily, Vec<u8>), Vec<u8>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all column families
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueDB for MemoryDatabase {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(&(cf, key.to_vec())).cloned())
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.data.write().insert((cf, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()> {
        self.data.write().remove(&(cf, key.to_vec()));
        Ok(())
    }

    fn flush(&self) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_database() {
        let db = MemoryDatabase::new();
        assert!(db.is_empty());

        db.put(ColumnFamily::Default, b"a", b"1").unwrap();
        db.put(ColumnFamily::TrustHistory, b"a", b"2").unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(ColumnFamily::Default, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(
            db.get(ColumnFamily::TrustHistory, b"a").unwrap(),
            Some(b"2".to_vec())
        );

        db.delete(ColumnFamily::Default, b"a").unwrap();
        assert!(!db.exists(ColumnFamily::Default, b"a").unwrap());
        assert!(db.exists(ColumnFamily::TrustHistory, b"a").unwrap());
    }
}
