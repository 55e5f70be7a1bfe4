//! Node-local key-value storage
//!
//! This crate provides the persistent storage used by the networking layer
//! for state that must survive restarts, such as peer trust history. It
//! offers a RocksDB backend for real nodes and an in-memory backend for
//! tests and ephemeral nodes.

pub mod column_families;
pub mod error;
pub mod kv;
pub mod memory;
pub mod traits;

pub use column_families::ColumnFamily;
pub use error::{DbError, DbResult};
pub use kv::{Database, DatabaseConfig};
pub use memory::MemoryDatabase;
pub use traits::{KeyValueDB, SharedDatabase};
