use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::core::status::Status;
use crate::device::{ConstPtr, Disk, IoCompletion, MutPtr};

/// Wraps any [`Disk`] and dispatches each operation onto a blocking thread
/// pool, so completions run asynchronously on pool threads. Returns
/// [`Status::Pending`] for dispatched operations.
pub struct ThreadPoolDisk<D: Disk> {
    inner: Arc<D>,
    runtime: Runtime,
}

impl<D: Disk> ThreadPoolDisk<D> {
    pub fn new(inner: Arc<D>) -> Result<Self, Status> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hybridlog-io")
            .build()
            .map_err(|e| {
                log::error!("failed to build I/O runtime: {}", e);
                Status::IoError
            })?;
        Ok(Self { inner, runtime })
    }

    pub fn inner(&self) -> &Arc<D> {
        &self.inner
    }
}

impl<D: Disk> Disk for ThreadPoolDisk<D> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn write_async(
        &self,
        source: ConstPtr,
        length: u32,
        dest_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        let inner = self.inner.clone();
        self.runtime.spawn_blocking(move || {
            inner.write_async(source, length, dest_offset, callback);
        });
        Status::Pending
    }

    fn read_async(
        &self,
        source_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        let inner = self.inner.clone();
        self.runtime.spawn_blocking(move || {
            inner.read_async(source_offset, dest, length, callback);
        });
        Status::Pending
    }

    fn write_segment_async(
        &self,
        segment: u64,
        source: ConstPtr,
        length: u32,
        intra_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        let inner = self.inner.clone();
        self.runtime.spawn_blocking(move || {
            inner.write_segment_async(segment, source, length, intra_offset, callback);
        });
        Status::Pending
    }

    fn read_segment_async(
        &self,
        segment: u64,
        intra_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        let inner = self.inner.clone();
        self.runtime.spawn_blocking(move || {
            inner.read_segment_async(segment, intra_offset, dest, length, callback);
        });
        Status::Pending
    }

    fn delete_segment_range(&self, from_segment: u64, to_segment: u64) -> Status {
        self.inner.delete_segment_range(from_segment, to_segment)
    }
}
