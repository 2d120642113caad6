//! Sharding strategies for StrataDB.
//!
//! A strategy maps one sharding-key value to a shard index in
//! `0..shard_count`. Strategies are pure: the same value and shard count
//! always produce the same index, which is what keeps rows findable after
//! they are written.
use std::fmt;
use std::io::Cursor;

use strata_types::Value;
use thiserror::Error;

mod registry;

pub use registry::{StrategyConfig, StrategyRegistry};

/// Result type alias for strategy evaluation.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Strategy evaluation and configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShardError {
    /// A dimension was configured with zero shards.
    #[error("shard count must be at least 1")]
    ZeroShards,
    /// Negative integer key under a strategy that requires non-negative keys.
    #[error("{strategy}: negative key {value} is not allowed")]
    NegativeKey {
        /// Strategy name.
        strategy: String,
        /// Offending value.
        value: i64,
    },
    /// The key kind is not supported by the strategy (NULL, float, ...).
    #[error("{strategy}: cannot shard on {kind} value {value}")]
    UnsupportedKey {
        /// Strategy name.
        strategy: String,
        /// Value kind.
        kind: &'static str,
        /// Rendered value.
        value: String,
    },
    /// Range boundaries are not strictly ascending.
    #[error("range boundaries must be strictly ascending")]
    UnsortedBoundaries,
    /// Range boundary count does not match the shard count.
    #[error("range strategy needs {expected} boundaries for {shard_count} shards, got {actual}")]
    BoundaryCount {
        /// Required boundary count (`shard_count - 1`).
        expected: usize,
        /// Configured boundary count.
        actual: usize,
        /// Declared shard count.
        shard_count: u32,
    },
    /// A custom strategy name was not registered.
    #[error("unknown custom strategy {0:?}")]
    UnknownStrategy(String),
    /// A strategy produced an index outside `0..shard_count`.
    #[error("{strategy}: index {index} out of range for {shard_count} shards")]
    IndexOutOfRange {
        /// Strategy name.
        strategy: String,
        /// Produced index.
        index: u32,
        /// Declared shard count.
        shard_count: u32,
    },
}

impl ShardError {
    /// `true` for errors that stem from configuration rather than from the
    /// key value a caller supplied.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ShardError::ZeroShards
                | ShardError::UnsortedBoundaries
                | ShardError::BoundaryCount { .. }
                | ShardError::UnknownStrategy(_)
                | ShardError::IndexOutOfRange { .. }
        )
    }
}

/// Capability every sharding strategy provides.
///
/// Custom strategies implement this trait and are registered by name in a
/// [`StrategyRegistry`].
pub trait ShardingStrategy: Send + Sync + fmt::Debug {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Map `value` to a shard index in `0..shard_count`.
    fn resolve(&self, value: &Value, shard_count: u32) -> Result<u32>;

    /// Check that the strategy can serve `shard_count` shards. Called once at
    /// startup.
    fn validate(&self, shard_count: u32) -> Result<()> {
        if shard_count == 0 {
            return Err(ShardError::ZeroShards);
        }
        Ok(())
    }
}

/// `index = key mod shard_count`.
///
/// Integers must be non-negative. Text keys are first hashed with
/// MurmurHash3 (x86, 32-bit, seed 0) over their UTF-8 bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuloStrategy;

impl ShardingStrategy for ModuloStrategy {
    fn name(&self) -> &str {
        "modulo"
    }

    fn resolve(&self, value: &Value, shard_count: u32) -> Result<u32> {
        if shard_count == 0 {
            return Err(ShardError::ZeroShards);
        }
        let key = match value {
            Value::Int(v) if *v < 0 => {
                return Err(ShardError::NegativeKey { strategy: self.name().to_string(), value: *v })
            }
            Value::Int(v) => *v as u64,
            Value::Text(s) => u64::from(stable_hash(s.as_bytes())),
            other => return Err(unsupported(self.name(), other)),
        };
        Ok((key % u64::from(shard_count)) as u32)
    }
}

/// `index = murmur3(key) mod shard_count`, for keys of any kind.
///
/// Integers are hashed over their little-endian bytes so negative keys are
/// accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashModStrategy;

impl ShardingStrategy for HashModStrategy {
    fn name(&self) -> &str {
        "hash_mod"
    }

    fn resolve(&self, value: &Value, shard_count: u32) -> Result<u32> {
        if shard_count == 0 {
            return Err(ShardError::ZeroShards);
        }
        let hash = match value {
            Value::Int(v) => stable_hash(&v.to_le_bytes()),
            Value::Text(s) => stable_hash(s.as_bytes()),
            Value::Bool(b) => u32::from(*b),
            other => return Err(unsupported(self.name(), other)),
        };
        Ok(hash % shard_count)
    }
}

/// Ordered range partitioning.
///
/// `boundaries` are exclusive upper bounds: shard `i` holds keys in
/// `[boundaries[i-1], boundaries[i])`, the last shard is unbounded above.
/// The index is the position of the first boundary greater than the key.
#[derive(Debug, Clone)]
pub struct RangeStrategy {
    boundaries: Vec<i64>,
}

impl RangeStrategy {
    /// Build a range strategy. Boundaries must be strictly ascending.
    pub fn new(boundaries: Vec<i64>) -> Result<Self> {
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ShardError::UnsortedBoundaries);
        }
        Ok(Self { boundaries })
    }

    /// Configured boundaries.
    pub fn boundaries(&self) -> &[i64] {
        &self.boundaries
    }
}

impl ShardingStrategy for RangeStrategy {
    fn name(&self) -> &str {
        "range"
    }

    fn resolve(&self, value: &Value, shard_count: u32) -> Result<u32> {
        let key = match value {
            Value::Int(v) => *v,
            other => return Err(unsupported(self.name(), other)),
        };
        let index = self.boundaries.partition_point(|b| *b <= key) as u32;
        if index >= shard_count {
            return Err(ShardError::IndexOutOfRange { strategy: self.name().to_string(), index, shard_count });
        }
        Ok(index)
    }

    fn validate(&self, shard_count: u32) -> Result<()> {
        if shard_count == 0 {
            return Err(ShardError::ZeroShards);
        }
        let expected = shard_count as usize - 1;
        if self.boundaries.len() != expected {
            return Err(ShardError::BoundaryCount { expected, actual: self.boundaries.len(), shard_count });
        }
        Ok(())
    }
}

/// MurmurHash3 x86 32-bit, seed 0. Stable across processes and releases.
pub fn stable_hash(bytes: &[u8]) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(bytes), 0).unwrap_or_default()
}

fn unsupported(strategy: &str, value: &Value) -> ShardError {
    ShardError::UnsupportedKey { strategy: strategy.to_string(), kind: value.kind(), value: value.to_string() }
}
