//! Configuration structures for an Arbor store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ArborError, Result};

/// Configuration for a block store and its cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the backing store file.
    pub path: PathBuf,
    /// Block size in bytes.
    pub block_size: usize,
    /// Total number of blocks in the store.
    pub num_blocks: u32,
    /// Number of blocks the cache keeps in memory.
    pub cache_frames: usize,
    /// Enable fsync after block writes.
    pub fsync_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./arbor.dat"),
            block_size: 4096,
            num_blocks: 1024,
            cache_frames: 64,
            fsync_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Checks the configuration for values the store cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(ArborError::ConfigError(
                "block_size must be nonzero".to_string(),
            ));
        }
        // Superblock plus root node are mandatory.
        if self.num_blocks < 2 {
            return Err(ArborError::ConfigError(format!(
                "num_blocks must be at least 2, got {}",
                self.num_blocks
            )));
        }
        if self.cache_frames == 0 {
            return Err(ArborError::ConfigError(
                "cache_frames must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.num_blocks, 1024);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let config = StoreConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_too_few_blocks_rejected() {
        let config = StoreConfig {
            num_blocks: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StoreConfig {
            num_blocks: 2,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_cache_frames_rejected() {
        let config = StoreConfig {
            cache_frames: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = StoreConfig {
            path: PathBuf::from("/tmp/test.dat"),
            block_size: 512,
            num_blocks: 32,
            cache_frames: 8,
            fsync_enabled: false,
        };

        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StoreConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.path, deserialized.path);
        assert_eq!(original.block_size, deserialized.block_size);
        assert_eq!(original.num_blocks, deserialized.num_blocks);
        assert_eq!(original.cache_frames, deserialized.cache_frames);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
