//! Flush engine
//!
//! Drives asynchronous page writes to the log device. When the page handler
//! declares object payloads, each page is first copied into a scratch buffer
//! whose records are serialized to the object log in bounded batches, the
//! in-record back-references patched with their segment reservations, and
//! only then is the patched image written to the log device. An internal
//! reference count guarantees exactly one top-level completion per page.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::address::Address;
use crate::core::buffer_pool::SectorAlignedMemory;
use crate::core::event::AutoResetEvent;
use crate::core::record::AddressInfo;
use crate::device::{ConstPtr, Disk};
use crate::hlog::allocator::LogAllocator;
use crate::hlog::page_handler::{PageHandler, read_slot, write_slot};
use crate::hlog::page_status::{CloseStatus, FlushCloseStatus, FlushStatus};

/// Per-page flush notification: `(page, error_code)`. A zero error code
/// means both the object-log batches and the page write landed.
pub type FlushCompletion = Arc<dyn Fn(u64, u32) + Send + Sync>;

/// Context for one in-flight page flush, shared by the object-log batch
/// completions and the main page-write completion.
pub(crate) struct PageAsyncFlushResult {
    page: u64,
    /// Outstanding completions; the decrement that reaches zero finishes
    /// the flush.
    count: AtomicI32,
    partial: bool,
    until_address: Address,
    /// First nonzero device error code observed.
    error: AtomicU32,
    /// Snapshot flushes bypass the ring's status machine.
    snapshot: bool,
    scratch: Mutex<Option<SectorAlignedMemory>>,
    completion: Option<FlushCompletion>,
}

impl<D: Disk, H: PageHandler> LogAllocator<D, H> {
    /// Flushes `[from, until)` to the log device, page by page. Whole pages
    /// transition the packed status word; the (at most one) trailing partial
    /// page only advances the flushed watermarks.
    pub fn async_flush_pages(
        self: &Arc<Self>,
        from: Address,
        until: Address,
        completion: Option<FlushCompletion>,
    ) {
        if until <= from {
            return;
        }
        let page_size = self.layout.page_size();
        let start_page = self.layout.page(from);
        let end_page =
            self.layout.page(until) + u64::from(self.layout.offset(until) > 0);

        for flush_page in start_page..end_page {
            let page_start = flush_page << self.config.page_size_bits;
            let until_this = until.control().min(page_start + page_size);
            let partial = until_this < page_start + page_size;

            if !partial {
                self.page_status[self.layout.page_index(flush_page)]
                    .status
                    .store(FlushStatus::InProgress, CloseStatus::Open);
            }

            let result = Arc::new(PageAsyncFlushResult {
                page: flush_page,
                count: AtomicI32::new(1),
                partial,
                until_address: Address::from_control(until_this),
                error: AtomicU32::new(0),
                snapshot: false,
                scratch: Mutex::new(None),
                completion: completion.clone(),
            });

            if self.handler.has_objects() {
                let object_disk = self
                    .object_disk
                    .as_ref()
                    .cloned()
                    .expect("checked at construction");
                self.write_page_with_objects(
                    flush_page,
                    Address::from_control(until_this),
                    Arc::clone(&self.disk),
                    object_disk,
                    page_start,
                    None,
                    result,
                );
            } else {
                let index = self.layout.page_index(flush_page);
                let aligned = self.pages[index].load(Ordering::Acquire);
                let length =
                    (until_this - page_start).next_multiple_of(u64::from(self.sector_size));
                let this = Arc::clone(self);
                let flush_result = Arc::clone(&result);
                self.disk.write_async(
                    ConstPtr(aligned),
                    length as u32,
                    page_start,
                    Box::new(move |error, _bytes| {
                        this.page_flush_callback(flush_result, error);
                    }),
                );
            }
        }
    }

    /// Snapshot sub-variant: flushes pages `[start_page, page(until)]` to a
    /// caller-supplied device at dense offsets, reserving object space from
    /// a caller-supplied offset vector. The ring's status machine is not
    /// touched.
    #[allow(clippy::too_many_arguments)]
    pub fn async_flush_pages_to_device(
        self: &Arc<Self>,
        start_page: u64,
        until: Address,
        dest_device: Arc<D>,
        object_device: Option<Arc<D>>,
        segment_offsets: Arc<Vec<AtomicU64>>,
        completion: Option<FlushCompletion>,
    ) {
        let page_size = self.layout.page_size();
        let end_page =
            self.layout.page(until) + u64::from(self.layout.offset(until) > 0);

        for flush_page in start_page..end_page {
            let page_start = flush_page << self.config.page_size_bits;
            let until_this = until.control().min(page_start + page_size);
            // Dense destination: the snapshot starts at file offset zero.
            let dest_offset = (flush_page - start_page) << self.config.page_size_bits;

            let result = Arc::new(PageAsyncFlushResult {
                page: flush_page,
                count: AtomicI32::new(1),
                partial: until_this < page_start + page_size,
                until_address: Address::from_control(until_this),
                error: AtomicU32::new(0),
                snapshot: true,
                scratch: Mutex::new(None),
                completion: completion.clone(),
            });

            if self.handler.has_objects() {
                let Some(object_device) = object_device.as_ref().cloned() else {
                    log::error!("snapshot flush of object pages needs an object device");
                    self.page_flush_callback(
                        result,
                        crate::core::status::Status::InvalidConfiguration as u32,
                    );
                    continue;
                };
                self.write_page_with_objects(
                    flush_page,
                    Address::from_control(until_this),
                    Arc::clone(&dest_device),
                    object_device,
                    dest_offset,
                    Some(Arc::clone(&segment_offsets)),
                    result,
                );
            } else {
                let index = self.layout.page_index(flush_page);
                let aligned = self.pages[index].load(Ordering::Acquire);
                let length =
                    (until_this - page_start).next_multiple_of(u64::from(self.sector_size));
                let this = Arc::clone(self);
                let flush_result = Arc::clone(&result);
                dest_device.write_async(
                    ConstPtr(aligned),
                    length as u32,
                    dest_offset,
                    Box::new(move |error, _bytes| {
                        this.page_flush_callback(flush_result, error);
                    }),
                );
            }
        }
    }

    /// Two-device flush of one page: scratch copy, object-log batches with
    /// back-reference patching, then the main page write. Non-final batches
    /// wait on an event before the next batch starts, because each batch
    /// extends serializer state and grows the segment.
    #[allow(clippy::too_many_arguments)]
    fn write_page_with_objects(
        self: &Arc<Self>,
        flush_page: u64,
        until: Address,
        dest_device: Arc<D>,
        object_device: Arc<D>,
        dest_offset: u64,
        snapshot_offsets: Option<Arc<Vec<AtomicU64>>>,
        result: Arc<PageAsyncFlushResult>,
    ) {
        let page_size = self.layout.page_size() as usize;
        let page_start = flush_page << self.config.page_size_bits;
        let begin = self.page_record_begin(flush_page);
        let end = (until.control() - page_start) as usize;
        let sector = u64::from(self.sector_size);
        let segment = self.layout.segment_of_page(flush_page);
        let block_size = self.config.object_block_size;

        // Serialization patches back-references in a scratch copy so the
        // live page keeps its object handles.
        let mut scratch = self.pool.get(page_size as u32);
        let index = self.layout.page_index(flush_page);
        let live = self.pages[index].load(Ordering::Acquire);
        unsafe { std::ptr::copy_nonoverlapping(live, scratch.as_mut_ptr(), page_size) };

        let flush_event = Arc::new(AutoResetEvent::new());
        let mut cursor = begin;
        let mut engine_error: u32 = 0;
        let mut stream = Vec::new();
        let mut patches = Vec::new();

        while cursor < end {
            stream.clear();
            patches.clear();
            let image = scratch.as_mut_slice();
            let next = match self.handler.serialize(
                image,
                cursor,
                end,
                block_size,
                &mut stream,
                &mut patches,
            ) {
                Ok(next) => next,
                Err(status) => {
                    engine_error = status as u32;
                    break;
                }
            };
            if next == cursor && stream.is_empty() {
                // Less than one record left below `end`.
                break;
            }
            let is_final = next >= end;

            if !stream.is_empty() {
                let aligned_length = (stream.len() as u64).next_multiple_of(sector);
                let base = match &snapshot_offsets {
                    Some(offsets) => offsets[(segment as usize) % offsets.len()]
                        .fetch_add(aligned_length, Ordering::AcqRel),
                    None => self.reserve_object_space(segment, aligned_length),
                };
                for &slot in &patches {
                    let info = AddressInfo::from_control(unsafe { read_slot(image, slot) });
                    unsafe { write_slot(image, slot, info.rebased(base).control()) };
                }

                let mut batch = self.pool.get(aligned_length as u32);
                batch.as_mut_slice()[..stream.len()].copy_from_slice(&stream);

                result.count.fetch_add(1, Ordering::AcqRel);
                let this = Arc::clone(self);
                let batch_result = Arc::clone(&result);
                let event = Arc::clone(&flush_event);
                let source = ConstPtr(batch.as_ptr());
                object_device.write_segment_async(
                    segment,
                    source,
                    aligned_length as u32,
                    base,
                    Box::new(move |error, _bytes| {
                        this.pool.return_buffer(batch);
                        this.page_flush_callback(batch_result, error);
                        event.set();
                    }),
                );
                if !is_final {
                    flush_event.wait();
                }
            }

            cursor = next;
            if is_final {
                break;
            }
        }

        if engine_error == 0 {
            // All batches submitted; write the patched page image.
            let length = (end as u64).next_multiple_of(sector) as u32;
            let source = ConstPtr(scratch.as_ptr());
            *result.scratch.lock() = Some(scratch);
            result.count.fetch_add(1, Ordering::AcqRel);
            let this = Arc::clone(self);
            let page_result = Arc::clone(&result);
            dest_device.write_async(
                source,
                length,
                dest_offset,
                Box::new(move |error, _bytes| {
                    this.page_flush_callback(page_result, error);
                }),
            );
        }

        // Release the issue-phase hold; the last completion to land finishes
        // the flush.
        self.page_flush_callback(result, engine_error);
    }

    /// Common completion path for every write belonging to a page flush.
    /// The decrement that reaches zero transitions the packed status word
    /// (clearing the slot if eviction already closed it), records the
    /// per-slot flushed watermark, and advances `FlushedUntilAddress`.
    pub(crate) fn page_flush_callback(
        self: &Arc<Self>,
        result: Arc<PageAsyncFlushResult>,
        error_code: u32,
    ) {
        if error_code != 0 {
            log::error!(
                "flush of page {} failed with device error {}",
                result.page,
                error_code
            );
            let _ = result.error.compare_exchange(
                0,
                error_code,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        if result.count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let error = result.error.load(Ordering::Acquire);
        if !result.snapshot {
            let page_size = self.layout.page_size();
            let page_end = (result.page << self.config.page_size_bits) + page_size;
            if !result.partial || result.until_address.control() >= page_end {
                let status = &self.page_status[self.layout.page_index(result.page)].status;
                loop {
                    let old_status = status.load();
                    if old_status.close == CloseStatus::Closed {
                        // Eviction won the race; this thread owns the clear.
                        self.clear_page(result.page);
                    }
                    let new_status = FlushCloseStatus {
                        flush: FlushStatus::Flushed,
                        close: old_status.close,
                    };
                    if status.compare_exchange(old_status, new_status).is_ok() {
                        break;
                    }
                }
            }
            self.page_status[self.layout.page_index(result.page)]
                .last_flushed_until_address
                .monotonic_update(result.until_address);
            self.shift_flushed_until_address();
        }

        if let Some(scratch) = result.scratch.lock().take() {
            self.pool.return_buffer(scratch);
        }
        if let Some(completion) = &result.completion {
            completion(result.page, error);
        }
    }

    /// Advances `FlushedUntilAddress` over every completed page, smallest
    /// page first, skipping none.
    pub(crate) fn shift_flushed_until_address(&self) {
        let mut current = self.flushed_until_address.load(Ordering::Acquire);
        let mut page = self.layout.page(current);
        let mut update = false;
        loop {
            let last = self.page_status[self.layout.page_index(page)]
                .last_flushed_until_address
                .load(Ordering::Acquire);
            if last.is_invalid() || last < current {
                break;
            }
            current = last;
            update = true;
            page += 1;
        }
        if update {
            self.flushed_until_address.monotonic_update(current);
        }
    }
}
