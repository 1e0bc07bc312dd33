//! # hybridlog: Page-Resident Log Allocator
//!
//! `hybridlog` is the page-resident log allocator of a hybrid log-structured
//! key/value store. It owns an append-only logical address space backed by a
//! bounded circular buffer of fixed-size pages in memory and by one or two
//! block devices: the primary log, and optionally an object log holding
//! variable-sized payloads referenced from records.
//!
//! ## Core Features
//!
//! - **Lock-Free Allocation**: Tail bumps are a single atomic fetch-add
//! - **Circular Page Buffer**: Sector-aligned page slots recycled under a
//!   packed flush/close status word driven by compare-and-swap
//! - **Two-Device Flushing**: Asynchronous page writes with an object-log
//!   side channel and in-record back-reference patching
//! - **Epoch-Coordinated Eviction**: Pages close only after all protected
//!   threads have refreshed past the head shift
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hybridlog::{LightEpoch, LogAllocator, LogConfig};
//! use hybridlog::device::NullDisk;
//! use hybridlog::hlog::FixedSizeHandler;
//!
//! let config = LogConfig::default();
//! let epoch = Arc::new(LightEpoch::new());
//! let handler = FixedSizeHandler::<u64, u64>::new();
//! let log = LogAllocator::new(config, epoch, Arc::new(NullDisk), None, handler)?;
//!
//! let address = log.allocate(24)?;
//! # Ok::<(), hybridlog::HlogError>(())
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod common;
pub mod core;
pub mod device;
pub mod environment;
pub mod epoch;
pub mod hlog;

// Re-export commonly used types
pub use crate::common::{HlogError, LogConfig, Result};
pub use crate::core::address::{Address, AtomicAddress, PageLayout};
pub use crate::core::buffer_pool::{SectorAlignedBufferPool, SectorAlignedMemory};
pub use crate::core::record::{AddressInfo, Record, RecordInfo};
pub use crate::core::status::Status;
pub use crate::device::{Disk, FileSystemDisk, NullDisk};
pub use crate::epoch::LightEpoch;
// Re-export main types
pub use crate::hlog::{FixedSizeHandler, LogAllocator, PageHandler, VarByteValueHandler};
