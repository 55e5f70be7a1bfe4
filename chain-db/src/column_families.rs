//! Column family definitions for the node database
//!
//! This module defines the column families used to organize data
//! in the key-value store.

use std::collections::HashMap;

/// Column family names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Default column family for misc data
    Default,
    /// Peer trust history (store key -> JSON map of peer key to interval history)
    TrustHistory,
}

impl ColumnFamily {
    /// Get the string name for this column family
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::TrustHistory => "trust_history",
        }
    }

    /// Get all column families
    pub fn all() -> &'static [ColumnFamily] {
        &[ColumnFamily::Default, ColumnFamily::TrustHistory]
    }

    /// Get column family from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(ColumnFamily::Default),
            "trust_history" => Some(ColumnFamily::TrustHistory),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Column family configuration
#[derive(Debug, Clone)]
pub struct ColumnFamilyConfig {
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    /// Max write buffer number
    pub max_write_buffer_number: i32,
    /// Compression type
    pub compression_type: CompressionType,
}

#[derive(Debug, Clone, Copy)]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl Default for ColumnFamilyConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            max_write_buffer_number: 2,
            compression_type: CompressionType::Lz4,
        }
    }
}

/// Get configurations for each column family
pub fn get_column_family_configs() -> HashMap<ColumnFamily, ColumnFamilyConfig> {
    let mut configs = HashMap::new();

    let default_config = ColumnFamilyConfig::default();

    // Trust history is a single small record rewritten every save period
    let trust_config = ColumnFamilyConfig {
        write_buffer_size: 1024 * 1024, // 1MB
        compression_type: CompressionType::None,
        ..default_config.clone()
    };

    configs.insert(ColumnFamily::Default, default_config);
    configs.insert(ColumnFamily::TrustHistory, trust_config);

    configs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_family_names() {
        assert_eq!(ColumnFamily::Default.name(), "default");
        assert_eq!(ColumnFamily::TrustHistory.name(), "trust_history");
    }

    #[test]
    fn test_column_family_from_name() {
        assert_eq!(ColumnFamily::from_name("default"), Some(ColumnFamily::Default));
        assert_eq!(
            ColumnFamily::from_name("trust_history"),
            Some(ColumnFamily::TrustHistory)
        );
        assert_eq!(ColumnFamily::from_name("blocks"), None);
    }

    #[test]
    fn test_every_column_family_has_config() {
        let configs = get_column_family_configs();
        for cf in ColumnFamily::all() {
            assert!(configs.contains_key(cf), "missing config for {}", cf);
        }
    }
}
