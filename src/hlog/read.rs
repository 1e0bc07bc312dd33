//! Read engine
//!
//! Reads flushed pages (or single records) back into memory. Pages whose
//! records carry object payloads go through a two-phase read: the page image
//! first, then a chain of object-log fragment reads that reinflate the
//! in-record back-references into live handles. The chain is driven by a
//! progress function re-entered from each completion.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::common::MAX_OBJECT_FRAGMENT_SIZE;
use crate::core::address::Address;
use crate::core::buffer_pool::SectorAlignedMemory;
use crate::core::record::AddressInfo;
use crate::core::status::Status;
use crate::device::{Disk, MutPtr};
use crate::hlog::allocator::LogAllocator;
use crate::hlog::page_handler::PageHandler;

/// Error code surfaced when an object-log fragment exceeds the 2 GiB limit.
pub const OVERSIZED_OBJECT_ERROR_CODE: u32 = 0xFFFF_FFFE;

/// Per-page read notification: `(page, error_code)`.
pub type ReadCompletion = Arc<dyn Fn(u64, u32) + Send + Sync>;

/// Completion for a record-granular read; receives the error code and the
/// context (with its buffers) back.
pub type ReadRecordCompletion = Box<dyn FnOnce(u32, AsyncIOContext) + Send>;

/// Context for a record-granular read.
///
/// For a fresh read, leave `record` and `object_info` empty: the engine
/// fetches `num_bytes` of the main log around `address` into a pooled
/// buffer whose `valid_offset`/`available_bytes` locate the record. When the
/// record has already been fetched but its payload has not, set
/// `object_info` to the record's back-reference and pass the context back:
/// the engine then reads only the payload and reinflates the record image.
pub struct AsyncIOContext {
    pub address: Address,
    pub record: Option<SectorAlignedMemory>,
    pub object_info: Option<AddressInfo>,
}

impl AsyncIOContext {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            record: None,
            object_info: None,
        }
    }
}

/// State for one page's object-reinflation chain.
struct PageObjectReadContext {
    page: u64,
    cursor: usize,
    end: usize,
    completion: Option<ReadCompletion>,
}

impl<D: Disk, H: PageHandler> LogAllocator<D, H> {
    /// Reads `num_pages` flushed pages starting at `start_page` back into
    /// their ring slots, reinflating object payloads when the handler
    /// declares them. The target slots must not back live pages.
    pub fn async_read_pages_from_device(
        self: &Arc<Self>,
        start_page: u64,
        num_pages: u64,
        completion: Option<ReadCompletion>,
    ) {
        let page_size = self.layout.page_size();
        for page in start_page..start_page + num_pages {
            self.new_page(page);
            let index = self.layout.page_index(page);
            let aligned = self.pages[index].load(Ordering::Acquire);
            let file_offset = page << self.config.page_size_bits;

            let this = Arc::clone(self);
            let page_completion = completion.clone();
            self.disk.read_async(
                file_offset,
                MutPtr(aligned),
                page_size as u32,
                Box::new(move |error, _bytes| {
                    if error != 0 {
                        log::error!("read of page {} failed with device error {}", page, error);
                        if let Some(callback) = &page_completion {
                            callback(page, error);
                        }
                        return;
                    }
                    if !this.handler.has_objects() {
                        if let Some(callback) = &page_completion {
                            callback(page, 0);
                        }
                        return;
                    }
                    let context = Box::new(PageObjectReadContext {
                        page,
                        cursor: this.page_record_begin(page),
                        end: this.layout.page_size() as usize,
                        completion: page_completion,
                    });
                    this.object_read_progress(context);
                }),
            );
        }
    }

    /// One step of the object-reinflation chain: ask the handler for the
    /// next fragment, read it from the object log, deserialize, repeat. The
    /// chain ends when no payload remains ahead of the cursor.
    fn object_read_progress(self: &Arc<Self>, mut context: Box<PageObjectReadContext>) {
        let index = self.layout.page_index(context.page);
        let aligned = self.pages[index].load(Ordering::Acquire);
        let page_size = self.layout.page_size() as usize;
        let image = unsafe { std::slice::from_raw_parts_mut(aligned, page_size) };

        let Some(range) = self.handler.get_object_info(
            image,
            context.cursor,
            context.end,
            self.config.object_block_size,
        ) else {
            self.finish_page_read(context, 0);
            return;
        };

        if range.size > MAX_OBJECT_FRAGMENT_SIZE {
            log::error!(
                "object fragment of {} bytes on page {} exceeds the limit",
                range.size,
                context.page
            );
            self.finish_page_read(context, OVERSIZED_OBJECT_ERROR_CODE);
            return;
        }

        let sector = u64::from(self.sector_size);
        let aligned_start = range.offset & !(sector - 1);
        let read_length = (range.offset + range.size).next_multiple_of(sector) - aligned_start;
        let mut fragment = self.pool.get(read_length as u32);
        fragment.valid_offset = (range.offset - aligned_start) as u32;
        fragment.available_bytes = range.size as u32;

        let Some(object_disk) = self.object_disk.as_ref().cloned() else {
            self.finish_page_read(context, Status::InvalidConfiguration as u32);
            return;
        };

        let segment = self.layout.segment_of_page(context.page);
        let destination = MutPtr(fragment.as_mut_ptr());
        let this = Arc::clone(self);
        object_disk.read_segment_async(
            segment,
            aligned_start,
            destination,
            read_length as u32,
            Box::new(move |error, _bytes| {
                if error != 0 {
                    this.pool.return_buffer(fragment);
                    this.finish_page_read(context, error);
                    return;
                }
                let index = this.layout.page_index(context.page);
                let aligned = this.pages[index].load(Ordering::Acquire);
                let page_size = this.layout.page_size() as usize;
                let image = unsafe { std::slice::from_raw_parts_mut(aligned, page_size) };
                let outcome = this.handler.deserialize(
                    image,
                    context.cursor,
                    range.until,
                    aligned_start,
                    fragment.as_slice(),
                );
                this.pool.return_buffer(fragment);
                match outcome {
                    Ok(()) => {
                        context.cursor = range.until;
                        this.object_read_progress(context);
                    }
                    Err(status) => this.finish_page_read(context, status as u32),
                }
            }),
        );
    }

    fn finish_page_read(&self, context: Box<PageObjectReadContext>, error: u32) {
        if let Some(callback) = &context.completion {
            callback(context.page, error);
        }
    }

    /// Record-granular read for point lookups below the head address.
    ///
    /// Computes the sector-aligned window around the record's file offset,
    /// fetches it into a pooled buffer, and hands the context back through
    /// `completion`. When `context.object_info` is set, reads only the
    /// record's object payload and reinflates the already-fetched record
    /// image instead.
    pub fn read_record_to_memory(
        self: &Arc<Self>,
        address: Address,
        num_bytes: u32,
        mut context: AsyncIOContext,
        completion: ReadRecordCompletion,
    ) {
        let sector = u64::from(self.sector_size);

        if let Some(info) = context.object_info {
            if info.size() > MAX_OBJECT_FRAGMENT_SIZE {
                completion(OVERSIZED_OBJECT_ERROR_CODE, context);
                return;
            }
            let Some(object_disk) = self.object_disk.as_ref().cloned() else {
                completion(Status::InvalidConfiguration as u32, context);
                return;
            };

            let aligned_start = info.offset() & !(sector - 1);
            let read_length =
                (info.offset() + info.size()).next_multiple_of(sector) - aligned_start;
            let mut fragment = self.pool.get(read_length as u32);
            fragment.valid_offset = (info.offset() - aligned_start) as u32;
            fragment.available_bytes = info.size() as u32;

            let segment = self.layout.segment(address);
            let destination = MutPtr(fragment.as_mut_ptr());
            let this = Arc::clone(self);
            object_disk.read_segment_async(
                segment,
                aligned_start,
                destination,
                read_length as u32,
                Box::new(move |error, _bytes| {
                    if error != 0 {
                        this.pool.return_buffer(fragment);
                        completion(error, context);
                        return;
                    }
                    let outcome = match context.record.as_mut() {
                        Some(record_buffer) => {
                            let valid = record_buffer.valid_offset as usize;
                            let until = valid + this.handler.record_size() as usize;
                            let image = record_buffer.as_mut_slice();
                            this.handler
                                .deserialize(image, valid, until, aligned_start, fragment.as_slice())
                        }
                        None => Err(Status::UnexpectedState),
                    };
                    this.pool.return_buffer(fragment);
                    match outcome {
                        Ok(()) => completion(0, context),
                        Err(status) => completion(status as u32, context),
                    }
                }),
            );
            return;
        }

        // Main-log record fetch with alignment bookkeeping.
        let file_offset = address.control();
        let aligned_offset = file_offset & !(sector - 1);
        let delta = file_offset - aligned_offset;
        let read_length = (delta + u64::from(num_bytes)).next_multiple_of(sector);

        let mut buffer = self.pool.get(read_length as u32);
        buffer.valid_offset = delta as u32;
        buffer.available_bytes = num_bytes;
        let destination = MutPtr(buffer.as_mut_ptr());
        context.record = Some(buffer);

        self.disk.read_async(
            aligned_offset,
            destination,
            read_length as u32,
            Box::new(move |error, _bytes| {
                completion(error, context);
            }),
        );
    }
}
