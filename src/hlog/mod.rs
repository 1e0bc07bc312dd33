//! Hybrid log allocator
//!
//! The page-resident allocator core: a circular buffer of sector-aligned
//! page slots over an append-only logical address space, with asynchronous
//! flush and read engines and an optional object-log side channel.

pub mod allocator;
pub mod flush;
pub mod page_handler;
pub mod page_status;
pub mod read;

#[cfg(test)]
mod allocator_tests;

pub use allocator::LogAllocator;
pub use flush::FlushCompletion;
pub use page_handler::{FixedSizeHandler, ObjectRange, PageHandler, VarByteValueHandler};
pub use page_status::{AtomicFlushCloseStatus, CloseStatus, FlushCloseStatus, FlushStatus};
pub use read::{AsyncIOContext, ReadCompletion};
