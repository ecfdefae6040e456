use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One buffer pool: `block_count` buffers of `block_size` bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub block_size: usize,
    pub block_count: usize,
    /// Caller-provided buffer memory, exactly `block_size * block_count`
    /// bytes. It is consumed at init and copied into one allocation per
    /// buffer, so it only supplies the initial content; the cache never
    /// writes through to this vector.
    #[serde(skip)]
    pub mem_area: Option<Vec<u8>>,
}

impl PoolConfig {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        PoolConfig {
            block_size,
            block_count,
            mem_area: None,
        }
    }

    pub fn with_mem_area(mut self, area: Vec<u8>) -> Self {
        self.mem_area = Some(area);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapoutConfig {
    pub thread_name: String,
    pub stack_size: Option<usize>,
}

impl Default for SwapoutConfig {
    fn default() -> Self {
        SwapoutConfig {
            thread_name: "bdbuf-swapout".to_string(),
            stack_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub swapout: SwapoutConfig,
}

impl CacheConfig {
    pub fn new(pools: Vec<PoolConfig>) -> Self {
        CacheConfig {
            pools,
            swapout: SwapoutConfig::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CacheConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        for (pool, p) in self.pools.iter().enumerate() {
            if p.block_size == 0 {
                return Err(ConfigError::ZeroBlockSize { pool });
            }
            if p.block_count == 0 {
                return Err(ConfigError::ZeroBlockCount { pool });
            }
            let bytes = p
                .block_size
                .checked_mul(p.block_count)
                .ok_or(ConfigError::NoMemory { pool, bytes: usize::MAX })?;
            if let Some(area) = &p.mem_area {
                if area.len() != bytes {
                    return Err(ConfigError::MemAreaSize {
                        pool,
                        expected: bytes,
                        actual: area.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let config = CacheConfig::from_json(
            r#"{
                "pools": [
                    { "block_size": 512, "block_count": 64 },
                    { "block_size": 4096, "block_count": 16 }
                ],
                "swapout": { "thread_name": "flush" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[1], PoolConfig::new(4096, 16));
        assert_eq!(config.swapout.thread_name, "flush");
        assert_eq!(config.swapout.stack_size, None);
    }

    #[test]
    fn test_swapout_defaults() {
        let config = CacheConfig::from_json(r#"{ "pools": [{ "block_size": 512, "block_count": 1 }] }"#).unwrap();
        assert_eq!(config.swapout, SwapoutConfig::default());
    }

    #[test]
    fn test_json_round_trip_skips_memory() {
        let config = CacheConfig::new(vec![PoolConfig::new(16, 2).with_mem_area(vec![0; 32])]);
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("mem_area"));
        let back = CacheConfig::from_json(&text).unwrap();
        assert_eq!(back.pools[0].mem_area, None);
    }

    #[test]
    fn test_validate() {
        assert!(matches!(CacheConfig::new(vec![]).validate(), Err(ConfigError::NoPools)));
        assert!(matches!(
            CacheConfig::new(vec![PoolConfig::new(512, 4), PoolConfig::new(0, 4)]).validate(),
            Err(ConfigError::ZeroBlockSize { pool: 1 })
        ));
        assert!(matches!(
            CacheConfig::new(vec![PoolConfig::new(512, 0)]).validate(),
            Err(ConfigError::ZeroBlockCount { pool: 0 })
        ));
        assert!(matches!(
            CacheConfig::new(vec![PoolConfig::new(16, 2).with_mem_area(vec![0; 31])]).validate(),
            Err(ConfigError::MemAreaSize { expected: 32, actual: 31, .. })
        ));
        assert!(matches!(CacheConfig::from_json("{ \"pools\": 3 }"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            CacheConfig::from_file("/nonexistent/blockcache.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
