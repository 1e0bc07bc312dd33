//! Common types and error definitions for hybridlog
//!
//! This module contains the allocator configuration and the user-plane error
//! type used throughout the crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default page size: 2^22 = 4 MB pages.
pub const DEFAULT_PAGE_SIZE_BITS: u32 = 22;

/// Default number of page slots in the circular buffer.
pub const DEFAULT_BUFFER_SIZE: u32 = 16;

/// Default device sector size.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Default segment size: 2^30 = 1 GB per device segment.
pub const DEFAULT_SEGMENT_SIZE_BITS: u32 = 30;

/// Default upper bound on a single serialized object-log batch.
pub const DEFAULT_OBJECT_BLOCK_SIZE: u64 = 100 * 1024 * 1024;

/// Object-log fragments larger than this are rejected on read.
pub const MAX_OBJECT_FRAGMENT_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Configuration for a [`crate::hlog::LogAllocator`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// log2 of the page size in bytes (intra-page offset bits).
    pub page_size_bits: u32,
    /// Number of page slots in the circular buffer. Must be a power of two.
    pub buffer_size: u32,
    /// Device sector size in bytes. Must be a power of two.
    pub sector_size: u32,
    /// log2 of the device segment size in bytes.
    pub segment_size_bits: u32,
    /// Fraction of the in-memory buffer kept mutable (the rest is read-only
    /// and eligible for flushing).
    pub mutable_fraction: f64,
    /// Upper bound on a single serialized object-log batch.
    pub object_block_size: u64,
}

impl LogConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.page_size_bits < 10 || self.page_size_bits > 31 {
            return Err(HlogError::Configuration {
                message: "Page size must be between 1KB and 2GB".to_string(),
            });
        }

        if !self.buffer_size.is_power_of_two() {
            return Err(HlogError::Configuration {
                message: "Buffer size must be a power of 2".to_string(),
            });
        }

        if self.buffer_size < 2 {
            return Err(HlogError::Configuration {
                message: "Buffer size must be at least 2 pages".to_string(),
            });
        }

        if !self.sector_size.is_power_of_two() {
            return Err(HlogError::Configuration {
                message: "Sector size must be a power of 2".to_string(),
            });
        }

        if u64::from(self.sector_size) * 2 > self.page_size() {
            return Err(HlogError::Configuration {
                message: "Page size must be at least two sectors".to_string(),
            });
        }

        if self.segment_size_bits < self.page_size_bits {
            return Err(HlogError::Configuration {
                message: "Segment size must be at least one page".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.mutable_fraction) {
            return Err(HlogError::Configuration {
                message: "Mutable fraction must be in [0, 1]".to_string(),
            });
        }

        if self.object_block_size == 0 || self.object_block_size % u64::from(self.sector_size) != 0
        {
            return Err(HlogError::Configuration {
                message: "Object block size must be a nonzero multiple of the sector size"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        1u64 << self.page_size_bits
    }

    /// Segment size in bytes.
    #[inline]
    pub fn segment_size(&self) -> u64 {
        1u64 << self.segment_size_bits
    }

    /// A small configuration suitable for unit tests: 64KB pages, 4 slots.
    pub fn small() -> Self {
        Self {
            page_size_bits: 16,
            buffer_size: 4,
            sector_size: 512,
            segment_size_bits: 20,
            mutable_fraction: 0.9,
            object_block_size: 4096,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            page_size_bits: DEFAULT_PAGE_SIZE_BITS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sector_size: DEFAULT_SECTOR_SIZE,
            segment_size_bits: DEFAULT_SEGMENT_SIZE_BITS,
            mutable_fraction: 0.9,
            object_block_size: DEFAULT_OBJECT_BLOCK_SIZE,
        }
    }
}

/// Error types for hybridlog operations
#[derive(Error, Debug)]
pub enum HlogError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Target page not yet materialized or not writable. The caller should
    /// refresh its epoch and retry the allocation.
    #[error("Allocation stalled; refresh epoch and retry")]
    AllocationStall,

    #[error("Device error: code {code}")]
    Device { code: u32 },

    #[error("Object-log fragment of {size} bytes exceeds the 2 GiB limit")]
    OversizedObject { size: u64 },

    #[error("Address out of bounds: {address:#x}")]
    AddressOutOfBounds { address: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HlogError {
    /// Check if this error is recoverable by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HlogError::AllocationStall | HlogError::Io(_) | HlogError::Device { .. }
        )
    }

    /// Get error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            HlogError::Io(_) => "io",
            HlogError::Serialization(_) => "serialization",
            HlogError::Configuration { .. } => "configuration",
            HlogError::AllocationStall => "allocation",
            HlogError::Device { .. } => "device",
            HlogError::OversizedObject { .. } => "object_log",
            HlogError::AddressOutOfBounds { .. } => "addressing",
            HlogError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for hybridlog operations
pub type Result<T> = std::result::Result<T, HlogError>;
