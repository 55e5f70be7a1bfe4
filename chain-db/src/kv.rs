//! RocksDB-backed key-value database

use crate::column_families::{get_column_family_configs, ColumnFamilyConfig, CompressionType};
use crate::{ColumnFamily, DbError, DbResult, KeyValueDB};
use rocksdb::{ColumnFamilyDescriptor, DBCompressionType, Options, WriteOptions, DB};
use std::path::PathBuf;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the RocksDB files
    pub path: PathBuf,
    /// Create the database if it does not exist
    pub create_if_missing: bool,
    /// fsync every write before returning
    pub sync_writes: bool,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
            sync_writes: true,
        }
    }

    /// Enable/disable synchronous writes
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// RocksDB database with one column family per [`ColumnFamily`]
pub struct Database {
    db: DB,
    sync_writes: bool,
}

impl Database {
    /// Open (or create) the database at the configured path
    pub fn open(config: &DatabaseConfig) -> DbResult<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(DbError::Config("database path is empty".to_string()));
        }

        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);

        let cf_configs = get_column_family_configs();
        let descriptors = ColumnFamily::all().iter().map(|cf| {
            let cf_config = cf_configs.get(cf).cloned().unwrap_or_default();
            ColumnFamilyDescriptor::new(cf.name(), cf_options(&cf_config))
        });

        let db = DB::open_cf_descriptors(&opts, &config.path, descriptors)?;
        tracing::info!("Opened database at {}", config.path.display());

        Ok(Self {
            db,
            sync_writes: config.sync_writes,
        })
    }

    fn handle(&self, cf: ColumnFamily) -> DbResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| DbError::UnknownColumnFamily(cf.name().to_string()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

fn cf_options(config: &ColumnFamilyConfig) -> Options {
    let mut opts = Options::default();
    opts.set_write_buffer_size(config.write_buffer_size);
    opts.set_max_write_buffer_number(config.max_write_buffer_number);
    opts.set_compression_type(match config.compression_type {
        CompressionType::None => DBCompressionType::None,
        CompressionType::Snappy => DBCompressionType::Snappy,
        CompressionType::Lz4 => DBCompressionType::Lz4,
        CompressionType::Zstd => DBCompressionType::Zstd,
    });
    opts
}

impl KeyValueDB for Database {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let handle = self.handle(cf)?;
        Ok(self.db.get_cf(handle, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()> {
        let handle = self.handle(cf)?;
        self.db.put_cf_opt(handle, key, value, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()> {
        let handle = self.handle(cf)?;
        self.db.delete_cf_opt(handle, key, &self.write_options())?;
        Ok(())
    }

    fn flush(&self) -> DbResult<()> {
        for cf in ColumnFamily::all() {
            let handle = self.handle(*cf)?;
            self.db.flush_cf(handle)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}
