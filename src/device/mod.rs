//! Device capability consumed by the allocator.
//!
//! A [`Disk`] provides sector-aligned asynchronous reads and writes on a
//! dense file space plus segmented variants used by the object log.
//! Completions carry `(error_code, bytes_transferred)`; a nonzero error code
//! is logged by the engines and surfaced to the user callback unchanged.

pub mod file_system_disk;
pub mod mmap_disk;
pub mod thread_pool_disk;

pub use file_system_disk::FileSystemDisk;
pub use mmap_disk::MmapDisk;
pub use thread_pool_disk::ThreadPoolDisk;

use crate::core::status::Status;

/// Completion callback for one asynchronous device operation. Receives the
/// raw error code (0 on success) and the number of bytes transferred. The
/// operation context lives in the closure's captures.
pub type IoCompletion = Box<dyn FnOnce(u32, u32) + Send>;

/// A raw source region handed to a device write.
///
/// The engines guarantee the region stays alive and unmodified until the
/// completion callback runs; the wrapper exists so the pointer can cross into
/// a device's worker threads.
#[derive(Clone, Copy)]
pub struct ConstPtr(pub *const u8);

unsafe impl Send for ConstPtr {}

impl ConstPtr {
    /// # Safety
    /// The region must be live and span at least `len` bytes.
    pub unsafe fn as_slice<'a>(&self, len: usize) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.0, len) }
    }
}

/// A raw destination region handed to a device read.
#[derive(Clone, Copy)]
pub struct MutPtr(pub *mut u8);

unsafe impl Send for MutPtr {}

impl MutPtr {
    /// # Safety
    /// The region must be live, exclusive, and span at least `len` bytes.
    pub unsafe fn as_mut_slice<'a>(&self, len: usize) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.0, len) }
    }
}

/// Sector-aligned asynchronous block device over a dense file space plus a
/// segmented space. Source/destination pointers, file offsets, and lengths
/// are all sector-aligned.
pub trait Disk: Send + Sync + 'static {
    fn sector_size(&self) -> u32;

    /// Write `length` bytes from `source` at `dest_offset` in the dense space.
    fn write_async(
        &self,
        source: ConstPtr,
        length: u32,
        dest_offset: u64,
        callback: IoCompletion,
    ) -> Status;

    /// Read `length` bytes at `source_offset` in the dense space into `dest`.
    fn read_async(
        &self,
        source_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status;

    /// Write into segment `segment` at `intra_offset`.
    fn write_segment_async(
        &self,
        segment: u64,
        source: ConstPtr,
        length: u32,
        intra_offset: u64,
        callback: IoCompletion,
    ) -> Status;

    /// Read from segment `segment` at `intra_offset`.
    fn read_segment_async(
        &self,
        segment: u64,
        intra_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status;

    /// Drop segments `[from_segment, to_segment)`.
    fn delete_segment_range(&self, from_segment: u64, to_segment: u64) -> Status;
}

/// A device that discards writes and reads back zeros. Completions run
/// inline on the calling thread.
pub struct NullDisk;

impl Disk for NullDisk {
    fn sector_size(&self) -> u32 {
        512
    }

    fn write_async(
        &self,
        _source: ConstPtr,
        length: u32,
        _dest_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        callback(0, length);
        Status::Ok
    }

    fn read_async(
        &self,
        _source_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        unsafe { std::ptr::write_bytes(dest.0, 0, length as usize) };
        callback(0, length);
        Status::Ok
    }

    fn write_segment_async(
        &self,
        _segment: u64,
        _source: ConstPtr,
        length: u32,
        _intra_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        callback(0, length);
        Status::Ok
    }

    fn read_segment_async(
        &self,
        _segment: u64,
        _intra_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        unsafe { std::ptr::write_bytes(dest.0, 0, length as usize) };
        callback(0, length);
        Status::Ok
    }

    fn delete_segment_range(&self, _from_segment: u64, _to_segment: u64) -> Status {
        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_null_disk_completes_inline() {
        let disk = NullDisk;
        let seen = Arc::new(AtomicU32::new(0));
        let mut buf = vec![0xAAu8; 512];

        let seen2 = seen.clone();
        disk.read_async(
            0,
            MutPtr(buf.as_mut_ptr()),
            512,
            Box::new(move |error, bytes| {
                assert_eq!(error, 0);
                seen2.store(bytes, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
