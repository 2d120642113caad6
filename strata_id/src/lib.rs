//! Snowflake-style id generation for StrataDB.
//!
//! Ids are laid out as
//! `[41-bit ms since EPOCH_MS][10-bit node id][12-bit sequence]`
//! and are produced without any coordination between nodes. Uniqueness across
//! nodes relies on every deployed instance having a distinct node id.
#![deny(missing_docs)]

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use strata_types::GeneratedId;
use thiserror::Error;

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Custom epoch: 2016-11-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: u64 = 1_477_958_400_000;

/// Bits of the per-millisecond sequence.
pub const SEQUENCE_BITS: u32 = 12;
/// Bits of the node id.
pub const NODE_ID_BITS: u32 = 10;
/// Bits of the timestamp.
pub const TIMESTAMP_BITS: u32 = 41;

/// Largest sequence value inside one millisecond.
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
/// Largest allowed node id.
pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;
/// Largest timestamp offset representable in the id.
pub const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_ID_BITS;

/// Result type alias for id generation.
pub type Result<T> = std::result::Result<T, IdError>;

/// Id generator failures. All of them are fatal for the generator instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The wall clock moved backwards by more than the tolerated amount.
    #[error("clock moved backwards by {drift_ms}ms on node {node_id} (last={last_ms}, now={now_ms}); generator halted")]
    ClockSkew {
        /// Node id of the failing generator.
        node_id: u16,
        /// Last millisecond (relative to the epoch) an id was issued for.
        last_ms: u64,
        /// Observed millisecond (relative to the epoch).
        now_ms: u64,
        /// `last_ms - now_ms`.
        drift_ms: u64,
    },
    /// The clock reads earlier than [`EPOCH_MS`].
    #[error("system clock {now_unix_ms}ms is before the id epoch")]
    ClockBeforeEpoch {
        /// Observed unix milliseconds.
        now_unix_ms: u64,
    },
    /// 41 bits of milliseconds are used up (year 2086 with the default epoch).
    #[error("timestamp space exhausted")]
    TimestampOverflow,
    /// Node id does not fit in the node id field.
    #[error("node id {0} exceeds maximum {MAX_NODE_ID}")]
    InvalidNodeId(u16),
    /// Vibration offset larger than the sequence space.
    #[error("max_vibration_offset {0} exceeds maximum sequence {MAX_SEQUENCE}")]
    InvalidVibrationOffset(u16),
}

fn default_max_backward_ms() -> u64 {
    5
}

fn default_max_vibration_offset() -> u16 {
    1
}

/// Operator-provided generator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdGeneratorConfig {
    /// Node id, distinct per deployed instance.
    pub node_id: u16,
    /// Backward clock movement (ms) that is waited out instead of failing.
    #[serde(default = "default_max_backward_ms")]
    pub max_backward_ms: u64,
    /// The first sequence of each new millisecond cycles through
    /// `0..=max_vibration_offset`, so that ids issued at low rates do not all
    /// end in the same low bits.
    #[serde(default = "default_max_vibration_offset")]
    pub max_vibration_offset: u16,
}

impl IdGeneratorConfig {
    /// Config with defaults for the given node id.
    pub fn for_node(node_id: u16) -> Self {
        Self {
            node_id,
            max_backward_ms: default_max_backward_ms(),
            max_vibration_offset: default_max_vibration_offset(),
        }
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.node_id > MAX_NODE_ID {
            return Err(IdError::InvalidNodeId(self.node_id));
        }
        if u64::from(self.max_vibration_offset) > MAX_SEQUENCE {
            return Err(IdError::InvalidVibrationOffset(self.max_vibration_offset));
        }
        Ok(())
    }
}

/// Components of a decoded id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Unix milliseconds at which the id was issued.
    pub unix_ms: u64,
    /// Issuing node.
    pub node_id: u16,
    /// Sequence inside the millisecond.
    pub sequence: u16,
}

/// Lock-free Snowflake generator.
///
/// The last issued `(millisecond, sequence)` pair lives in one `AtomicU64`
/// and is advanced with compare-and-swap, so any number of threads can call
/// [`IdGenerator::next_id`] concurrently.
pub struct IdGenerator {
    config: IdGeneratorConfig,
    clock: Arc<dyn Clock>,
    /// `(last_ms << SEQUENCE_BITS) | sequence`.
    state: AtomicU64,
    vibration: AtomicU64,
    halted: OnceLock<IdError>,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("node_id", &self.config.node_id)
            .field("halted", &self.halted.get().is_some())
            .finish()
    }
}

impl IdGenerator {
    /// Generator backed by the system clock.
    pub fn new(config: IdGeneratorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Generator backed by a custom clock.
    pub fn with_clock(config: IdGeneratorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            state: AtomicU64::new(0),
            vibration: AtomicU64::new(0),
            halted: OnceLock::new(),
        })
    }

    /// Node id this generator stamps into every id.
    pub fn node_id(&self) -> u16 {
        self.config.node_id
    }

    /// `true` once a fatal clock anomaly has been observed.
    pub fn is_halted(&self) -> bool {
        self.halted.get().is_some()
    }

    /// Allocate the next id.
    ///
    /// Spins (never sleeps on I/O) when the sequence of the current
    /// millisecond is exhausted or when the clock went back by no more than
    /// `max_backward_ms`.
    pub fn next_id(&self) -> Result<GeneratedId> {
        if let Some(err) = self.halted.get() {
            return Err(err.clone());
        }
        loop {
            let prev = self.state.load(Ordering::Acquire);
            let (last_ms, sequence) = unpack(prev);
            let mut now = self.now_ms()?;
            if now < last_ms {
                now = self.wait_past(last_ms, last_ms)?;
            }
            let (ms, seq) = if now == last_ms {
                if sequence < MAX_SEQUENCE {
                    (last_ms, sequence + 1)
                } else {
                    (self.wait_past(last_ms + 1, last_ms)?, self.vibrate())
                }
            } else {
                (now, self.vibrate())
            };
            if ms > MAX_TIMESTAMP {
                return Err(IdError::TimestampOverflow);
            }
            if self
                .state
                .compare_exchange(prev, pack(ms, seq), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(self.compose(ms, seq));
            }
        }
    }

    /// Decode an id produced by any generator using the same epoch.
    pub fn decompose(id: GeneratedId) -> IdParts {
        let raw = id.get();
        IdParts {
            unix_ms: (raw >> TIMESTAMP_SHIFT) + EPOCH_MS,
            node_id: ((raw >> NODE_SHIFT) & u64::from(MAX_NODE_ID)) as u16,
            sequence: (raw & MAX_SEQUENCE) as u16,
        }
    }

    fn compose(&self, ms: u64, seq: u64) -> GeneratedId {
        GeneratedId((ms << TIMESTAMP_SHIFT) | (u64::from(self.config.node_id) << NODE_SHIFT) | seq)
    }

    fn vibrate(&self) -> u64 {
        let max = u64::from(self.config.max_vibration_offset);
        let prev = self
            .vibration
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(if v >= max { 0 } else { v + 1 }))
            .unwrap_or_default();
        if prev >= max {
            0
        } else {
            prev + 1
        }
    }

    /// Milliseconds since [`EPOCH_MS`].
    fn now_ms(&self) -> Result<u64> {
        let unix = self.clock.now_unix_ms();
        unix.checked_sub(EPOCH_MS).ok_or(IdError::ClockBeforeEpoch { now_unix_ms: unix })
    }

    /// Spin until the clock reaches `target`. Fails (and halts the generator)
    /// if the clock is more than `max_backward_ms` behind `last_ms`.
    fn wait_past(&self, target: u64, last_ms: u64) -> Result<u64> {
        loop {
            let now = self.now_ms()?;
            if now >= target {
                return Ok(now);
            }
            if now < last_ms && last_ms - now > self.config.max_backward_ms {
                return Err(self.halt(last_ms, now));
            }
            std::hint::spin_loop();
        }
    }

    fn halt(&self, last_ms: u64, now_ms: u64) -> IdError {
        let err = IdError::ClockSkew {
            node_id: self.config.node_id,
            last_ms,
            now_ms,
            drift_ms: last_ms - now_ms,
        };
        tracing::error!(node_id = self.config.node_id, last_ms, now_ms, "clock skew detected; id generator halted");
        self.halted.get_or_init(|| err).clone()
    }
}

fn pack(ms: u64, seq: u64) -> u64 {
    (ms << SEQUENCE_BITS) | seq
}

fn unpack(state: u64) -> (u64, u64) {
    (state >> SEQUENCE_BITS, state & MAX_SEQUENCE)
}

/// Unix milliseconds from the system clock.
pub(crate) fn system_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
