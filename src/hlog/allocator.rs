use std::alloc::Layout;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::common::{HlogError, LogConfig, Result};
use crate::core::address::{Address, AtomicAddress, PageLayout};
use crate::core::alloc::{aligned_alloc, aligned_free};
use crate::core::buffer_pool::SectorAlignedBufferPool;
use crate::core::record::Record;
use crate::device::Disk;
use crate::epoch::LightEpoch;
use crate::hlog::page_handler::PageHandler;
use crate::hlog::page_status::{CloseStatus, FlushCloseStatus, FlushStatus, FullPageStatus};

/// Pages of slack the head keeps behind the tail before eviction starts.
const K_HEAD_LAG_SLACK_PAGES: u64 = 4;

/// Tail position: page number in the high word, intra-page offset in the low
/// word, so a single fetch-add bumps the offset.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub(crate) struct PageOffset(u64);

impl PageOffset {
    pub(crate) fn new(page: u64, offset: u64) -> Self {
        debug_assert!(page < (1 << 32) && offset < (1 << 32));
        Self((page << 32) | offset)
    }

    pub(crate) fn page(&self) -> u64 {
        self.0 >> 32
    }

    pub(crate) fn offset(&self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }
}

#[repr(transparent)]
pub(crate) struct AtomicPageOffset(AtomicU64);

impl AtomicPageOffset {
    fn new(page: u64, offset: u64) -> Self {
        Self(AtomicU64::new(PageOffset::new(page, offset).0))
    }

    pub(crate) fn load(&self) -> PageOffset {
        PageOffset(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: PageOffset) {
        self.0.store(value.0, Ordering::SeqCst);
    }

    /// Reserves `bytes` at the tail, returning the pre-increment position.
    fn reserve(&self, bytes: u64) -> PageOffset {
        PageOffset(self.0.fetch_add(bytes, Ordering::AcqRel))
    }
}

/// The page-resident log allocator.
///
/// Owns a circular buffer of `buffer_size` sector-aligned page slots over an
/// append-only 48-bit logical address space, flushes read-only pages to the
/// log device (serializing object payloads to the object-log device when the
/// page handler declares them), and recycles slots once they are both
/// flushed and closed.
pub struct LogAllocator<D: Disk, H: PageHandler> {
    pub(crate) config: LogConfig,
    pub(crate) layout: PageLayout,
    pub(crate) sector_size: u32,
    pub(crate) handler: H,
    pub(crate) epoch: Arc<LightEpoch>,
    pub(crate) disk: Arc<D>,
    pub(crate) object_disk: Option<Arc<D>>,
    pub(crate) pool: SectorAlignedBufferPool,

    /// Owned allocation start of each slot's buffer, pinned for the slot's
    /// lifetime.
    pub(crate) raw_pages: Box<[AtomicPtr<u8>]>,
    /// Sector-aligned usable origin within each slot's buffer.
    pub(crate) pages: Box<[AtomicPtr<u8>]>,
    pub(crate) page_status: Box<[FullPageStatus]>,
    pub(crate) page_alloc_layout: Layout,

    pub(crate) tail_page_offset: AtomicPageOffset,
    pub(crate) read_only_address: AtomicAddress,
    pub(crate) safe_read_only_address: AtomicAddress,
    pub(crate) head_address: AtomicAddress,
    pub(crate) safe_head_address: AtomicAddress,
    pub(crate) begin_address: AtomicAddress,
    pub(crate) flushed_until_address: AtomicAddress,

    /// Next append position per object-log segment slot.
    pub(crate) segment_offsets: Box<[AtomicU64]>,

    read_only_lag: u64,
    head_lag: u64,
}

impl<D: Disk, H: PageHandler> LogAllocator<D, H> {
    pub fn new(
        config: LogConfig,
        epoch: Arc<LightEpoch>,
        disk: Arc<D>,
        object_disk: Option<Arc<D>>,
        handler: H,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if handler.has_objects() && object_disk.is_none() {
            return Err(HlogError::Configuration {
                message: "page handler declares objects but no object-log device was provided"
                    .to_string(),
            });
        }
        let record_size = handler.record_size();
        if record_size == 0 || record_size % 8 != 0 {
            return Err(HlogError::Configuration {
                message: format!("record size {} is not a positive multiple of 8", record_size),
            });
        }

        let layout = PageLayout::new(
            config.page_size_bits,
            config.segment_size_bits,
            config.buffer_size,
        );
        let page_size = layout.page_size();
        let buffer_size = config.buffer_size as usize;

        let adjusted_size = page_size as usize + 2 * config.sector_size as usize;
        let page_alloc_layout =
            Layout::from_size_align(adjusted_size, 64).map_err(|_| HlogError::Configuration {
                message: "page size overflows the allocator".to_string(),
            })?;

        let mut raw_pages = Vec::with_capacity(buffer_size);
        let mut pages = Vec::with_capacity(buffer_size);
        let mut page_status = Vec::with_capacity(buffer_size);
        for _ in 0..buffer_size {
            raw_pages.push(AtomicPtr::new(std::ptr::null_mut()));
            pages.push(AtomicPtr::new(std::ptr::null_mut()));
            page_status.push(FullPageStatus::default());
        }

        let ring_bytes = buffer_size as u64 * page_size;
        let segment_slots = ((ring_bytes >> config.segment_size_bits) + 1)
            .next_power_of_two()
            .max(2) as usize;
        let mut segment_offsets = Vec::with_capacity(segment_slots);
        for _ in 0..segment_slots {
            segment_offsets.push(AtomicU64::new(0));
        }

        let mutable_pages = ((config.mutable_fraction * config.buffer_size as f64) as u64)
            .clamp(1, buffer_size as u64 - 1);
        let head_lag_pages = (buffer_size as u64)
            .saturating_sub(K_HEAD_LAG_SLACK_PAGES)
            .clamp(1, buffer_size as u64 - 1);

        let first_valid = Address::FIRST_VALID_ADDRESS;
        let allocator = Arc::new(Self {
            sector_size: config.sector_size,
            pool: SectorAlignedBufferPool::new(config.sector_size),
            config,
            layout,
            handler,
            epoch,
            disk,
            object_disk,
            raw_pages: raw_pages.into_boxed_slice(),
            pages: pages.into_boxed_slice(),
            page_status: page_status.into_boxed_slice(),
            page_alloc_layout,
            tail_page_offset: AtomicPageOffset::new(0, first_valid.control()),
            read_only_address: AtomicAddress::new(first_valid),
            safe_read_only_address: AtomicAddress::new(first_valid),
            head_address: AtomicAddress::new(first_valid),
            safe_head_address: AtomicAddress::new(first_valid),
            begin_address: AtomicAddress::new(first_valid),
            flushed_until_address: AtomicAddress::new(first_valid),
            segment_offsets: segment_offsets.into_boxed_slice(),
            read_only_lag: mutable_pages << layout.page_size().trailing_zeros(),
            head_lag: head_lag_pages << layout.page_size().trailing_zeros(),
        });

        // Materialize page zero; its FIRST_VALID_ADDRESS prefix stays zeroed
        // and is never handed out.
        allocator.new_page(0);
        Ok(allocator)
    }

    // --- Watermark accessors ---

    pub fn get_tail_address(&self) -> Address {
        let tail = self.tail_page_offset.load();
        let offset = tail.offset().min(self.layout.page_size());
        Address::from_control((tail.page() << self.config.page_size_bits) + offset)
    }

    pub fn get_head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    pub fn get_safe_head_address(&self) -> Address {
        self.safe_head_address.load(Ordering::Acquire)
    }

    pub fn get_read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    pub fn get_safe_read_only_address(&self) -> Address {
        self.safe_read_only_address.load(Ordering::Acquire)
    }

    pub fn get_begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    pub fn get_flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    pub fn page_layout(&self) -> PageLayout {
        self.layout
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn epoch(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    // --- Allocation ---

    /// Reserves `num_bytes` (rounded up to 8) of contiguous log space,
    /// returning its logical address. An allocation that would straddle a
    /// page boundary skips to the next page. Fails with
    /// [`HlogError::AllocationStall`] when the next slot is still flushing
    /// or open; the caller refreshes its epoch and retries.
    pub fn allocate(self: &Arc<Self>, num_bytes: u32) -> Result<Address> {
        let page_size = self.layout.page_size();
        let size = u64::from(num_bytes).next_multiple_of(8);
        if size == 0 || size > page_size - Address::FIRST_VALID_ADDRESS.control() {
            return Err(HlogError::Configuration {
                message: format!("allocation of {} bytes does not fit a page", num_bytes),
            });
        }

        loop {
            let old = self.tail_page_offset.reserve(size);
            let page = old.page();
            let offset = old.offset();

            if offset + size <= page_size {
                return Ok(self.layout.address(page, offset));
            }

            if offset > page_size {
                // Another thread overflowed first and owns the page roll.
                // Wait for the tail to move, then retry.
                loop {
                    let current = self.tail_page_offset.load();
                    if current.page() != page || current.offset() <= page_size {
                        break;
                    }
                    std::hint::spin_loop();
                }
                continue;
            }

            // This thread made the offset cross the boundary, so it is
            // elected to roll the page and shift the watermarks.
            let next_page = page + 1;
            let page_aligned_tail = Address::from_control(next_page << self.config.page_size_bits);
            self.page_aligned_shift_read_only_address(page_aligned_tail);
            self.page_aligned_shift_head_address(page_aligned_tail);

            if self.cannot_allocate(next_page) {
                // Park the tail at the boundary so a later attempt re-elects
                // itself, and stall this caller.
                self.tail_page_offset
                    .store(PageOffset::new(page, page_size));
                log::debug!("allocation stalled: slot for page {} is not recycled", next_page);
                return Err(HlogError::AllocationStall);
            }

            self.new_page(next_page);
            // First-lap lookahead: materialize one page ahead so the next
            // roll does not pay the allocation.
            let ahead = next_page + 1;
            if ahead < u64::from(self.layout.buffer_size()) {
                self.new_page(ahead);
            }

            self.tail_page_offset
                .store(PageOffset::new(next_page, size));
            return Ok(self.layout.address(next_page, 0));
        }
    }

    /// A slot can back a new page only when the head has moved past its
    /// previous occupant AND that occupant has been observed both flushed
    /// and closed. The head check is load-bearing: a live page's slot also
    /// reads `(Flushed, Closed)` because that is the materialized state.
    /// First-lap pages have no previous occupant.
    fn cannot_allocate(&self, page: u64) -> bool {
        let buffer_size = u64::from(self.layout.buffer_size());
        if page < buffer_size {
            return false;
        }
        let head_page = self.layout.page(self.get_head_address());
        if page >= buffer_size + head_page {
            return true;
        }
        self.page_status[self.layout.page_index(page)].status.load() != FlushCloseStatus::clean()
    }

    // --- Page materialization ---

    /// Ensures the slot backing `page` has a materialized buffer. Recycled
    /// slots were zeroed when their previous page was cleared.
    pub(crate) fn new_page(&self, page: u64) {
        let index = self.layout.page_index(page);
        if self.raw_pages[index].load(Ordering::Acquire).is_null() {
            self.allocate_page(index);
        }
    }

    fn allocate_page(&self, index: usize) {
        let raw = unsafe { aligned_alloc(self.page_alloc_layout) };
        assert!(!raw.is_null(), "page buffer allocation failed");
        let sector = u64::from(self.sector_size);
        let aligned = ((raw as u64 + sector - 1) & !(sector - 1)) as *mut u8;

        match self.raw_pages[index].compare_exchange(
            std::ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.pages[index].store(aligned, Ordering::Release);
                // Publish the slot as reusable-but-empty under a full
                // barrier so later allocators observe a clean status.
                self.page_status[index]
                    .status
                    .store(FlushStatus::Flushed, CloseStatus::Closed);
            }
            Err(_) => {
                // Lost the race; another thread materialized the slot.
                unsafe { aligned_free(raw, self.page_alloc_layout) };
            }
        }
    }

    /// Releases object handles held by records of `page` (when the handler
    /// declares objects) and zeroes the slot's entire buffer, making it safe
    /// to reuse.
    pub(crate) fn clear_page(&self, page: u64) {
        let index = self.layout.page_index(page);
        let aligned = self.pages[index].load(Ordering::Acquire);
        if aligned.is_null() {
            return;
        }
        if self.handler.has_objects() {
            let begin = self.page_record_begin(page);
            let page_size = self.layout.page_size() as usize;
            let image = unsafe { std::slice::from_raw_parts_mut(aligned, page_size) };
            self.handler.clear_page(image, begin, page_size);
        }
        let raw = self.raw_pages[index].load(Ordering::Acquire);
        unsafe { std::ptr::write_bytes(raw, 0, self.page_alloc_layout.size()) };
        log::trace!("cleared slot {} (page {})", index, page);
    }

    /// First record offset on `page`: page zero reserves the
    /// `FIRST_VALID_ADDRESS` prefix.
    pub(crate) fn page_record_begin(&self, page: u64) -> usize {
        if page == 0 {
            Address::FIRST_VALID_ADDRESS.control() as usize
        } else {
            0
        }
    }

    // --- Address translation ---

    /// Translates a logical address to its in-memory location. No bounds
    /// check: callers must have ensured the address is in the live window.
    pub fn physical_address(&self, address: Address) -> *mut u8 {
        let index = self.layout.page_index(self.layout.page(address));
        let page_ptr = self.pages[index].load(Ordering::Acquire);
        unsafe { page_ptr.add(self.layout.offset(address) as usize) }
    }

    pub fn get_slice(&self, address: Address, size: usize) -> &[u8] {
        let index = self.layout.page_index(self.layout.page(address));
        let page_ptr = self.pages[index].load(Ordering::Acquire);
        if page_ptr.is_null() {
            return &[];
        }
        let offset = self.layout.offset(address) as usize;
        unsafe { std::slice::from_raw_parts(page_ptr.add(offset), size) }
    }

    pub fn get_mut_slice(&self, address: Address, size: usize) -> &mut [u8] {
        let index = self.layout.page_index(self.layout.page(address));
        let page_ptr = self.pages[index].load(Ordering::Acquire);
        if page_ptr.is_null() {
            return &mut [];
        }
        let offset = self.layout.offset(address) as usize;
        unsafe { std::slice::from_raw_parts_mut(page_ptr.add(offset), size) }
    }

    /// Typed view of the record at `address`.
    pub fn record<K, V>(&self, address: Address) -> Option<&Record<K, V>> {
        let slice = self.get_slice(address, Record::<K, V>::size() as usize);
        if slice.is_empty() {
            return None;
        }
        Some(unsafe { Record::from_ptr(slice.as_ptr()) })
    }

    /// Mutable typed view of the record at `address`.
    pub fn record_mut<K, V>(&self, address: Address) -> Option<&mut Record<K, V>> {
        let slice = self.get_mut_slice(address, Record::<K, V>::size() as usize);
        if slice.is_empty() {
            return None;
        }
        Some(unsafe { Record::from_ptr_mut(slice.as_mut_ptr()) })
    }

    // --- Watermark shifting ---

    fn page_aligned_shift_read_only_address(self: &Arc<Self>, page_aligned_tail: Address) {
        let Some(desired) = page_aligned_tail.control().checked_sub(self.read_only_lag) else {
            return;
        };
        let desired = Address::from_control(desired);
        if self.read_only_address.monotonic_update(desired).is_some() {
            let this = Arc::clone(self);
            self.epoch
                .bump_current_epoch(move || this.on_pages_marked_read_only(desired));
        }
    }

    fn page_aligned_shift_head_address(self: &Arc<Self>, page_aligned_tail: Address) {
        let Some(mut desired) = page_aligned_tail.control().checked_sub(self.head_lag) else {
            return;
        };
        // The head never advances past durable data.
        let flushed = self.get_flushed_until_address().control();
        if flushed < desired {
            desired = flushed;
        }
        let desired = Address::from_control(desired & !(self.layout.page_size() - 1));
        if self.head_address.monotonic_update(desired).is_some() {
            let this = Arc::clone(self);
            self.epoch
                .bump_current_epoch(move || this.on_pages_closed(desired));
        }
    }

    /// Runs once all threads protected at the read-only shift have
    /// refreshed: publishes the safe boundary and flushes the newly
    /// read-only range.
    pub(crate) fn on_pages_marked_read_only(self: &Arc<Self>, new_safe_read_only: Address) {
        if let Some(old) = self
            .safe_read_only_address
            .monotonic_update(new_safe_read_only)
        {
            self.async_flush_pages(old, new_safe_read_only, None);
        }
    }

    /// Runs once all threads protected at the head shift have refreshed:
    /// publishes the safe head and closes every whole page below it.
    pub(crate) fn on_pages_closed(self: &Arc<Self>, new_safe_head: Address) {
        let Some(old_safe_head) = self.safe_head_address.monotonic_update(new_safe_head) else {
            return;
        };
        let page_size = self.layout.page_size();
        let mut close_address = self.layout.page_aligned(old_safe_head);
        while close_address < new_safe_head {
            if new_safe_head.control() < close_address.control() + page_size {
                break;
            }
            let page = self.layout.page(close_address);
            let status = &self.page_status[self.layout.page_index(page)].status;
            loop {
                let old_status = status.load();
                if old_status.flush == FlushStatus::Flushed {
                    // The flush has already landed, so this thread clears
                    // the slot; otherwise the flush completion observes
                    // Closed and clears it.
                    self.clear_page(page);
                }
                let new_status = FlushCloseStatus {
                    flush: old_status.flush,
                    close: CloseStatus::Closed,
                };
                if status.compare_exchange(old_status, new_status).is_ok() {
                    break;
                }
            }
            close_address = close_address + page_size;
        }
    }

    /// Makes everything below the current tail read-only and eligible for
    /// flushing. Returns the tail it shifted to.
    pub fn shift_read_only_to_tail(self: &Arc<Self>) -> Address {
        let tail = self.get_tail_address();
        if self.read_only_address.monotonic_update(tail).is_some() {
            let this = Arc::clone(self);
            self.epoch
                .bump_current_epoch(move || this.on_pages_marked_read_only(tail));
        }
        tail
    }

    /// Advances `BeginAddress`, dropping dead segments on both devices once
    /// no protected thread can reference them.
    pub fn shift_begin_address(self: &Arc<Self>, new_begin: Address) {
        if let Some(old) = self.begin_address.monotonic_update(new_begin) {
            let this = Arc::clone(self);
            self.epoch.bump_current_epoch(move || {
                this.delete_address_range(old, new_begin);
            });
        }
    }

    /// Drives a flush of everything below `until` and blocks until
    /// `FlushedUntilAddress` passes it.
    pub fn flush_until_sync(self: &Arc<Self>, until: Address) -> Result<()> {
        self.shift_read_only_to_tail();
        let deadline = Instant::now() + Duration::from_secs(30);
        while self.get_flushed_until_address() < until {
            self.epoch.drain();
            if Instant::now() > deadline {
                return Err(HlogError::Internal {
                    message: format!("flush to {} did not complete", until),
                });
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    // --- Object-log segment bookkeeping ---

    /// Reserves `bytes` (sector-aligned by the caller) of object-log space
    /// in `segment`, returning the reservation's start offset.
    pub(crate) fn reserve_object_space(&self, segment: u64, bytes: u64) -> u64 {
        debug_assert_eq!(bytes % u64::from(self.sector_size), 0);
        let index = (segment as usize) & (self.segment_offsets.len() - 1);
        self.segment_offsets[index].fetch_add(bytes, Ordering::AcqRel)
    }

    /// Current append position of `segment` in the object log.
    pub fn segment_offset(&self, segment: u64) -> u64 {
        let index = (segment as usize) & (self.segment_offsets.len() - 1);
        self.segment_offsets[index].load(Ordering::Acquire)
    }

    /// Recycles a segment slot: the next write to it starts at offset zero.
    pub fn segment_closed(&self, segment: u64) {
        let index = (segment as usize) & (self.segment_offsets.len() - 1);
        self.segment_offsets[index].store(0, Ordering::Release);
    }

    /// Deletes `[from, to)` from the log device and the corresponding
    /// object-log segments.
    pub fn delete_address_range(&self, from: Address, to: Address) {
        let from_segment = self.layout.segment(from);
        let to_segment = self.layout.segment(to);
        if from_segment >= to_segment {
            return;
        }
        let status = self.disk.delete_segment_range(from_segment, to_segment);
        if status.is_error() {
            log::warn!(
                "log device failed to delete segments [{}, {}): {}",
                from_segment,
                to_segment,
                status
            );
        }
        if let Some(object_disk) = &self.object_disk {
            let status = object_disk.delete_segment_range(from_segment, to_segment);
            if status.is_error() {
                log::warn!(
                    "object device failed to delete segments [{}, {}): {}",
                    from_segment,
                    to_segment,
                    status
                );
            }
        }
    }
}

impl<D: Disk, H: PageHandler> Drop for LogAllocator<D, H> {
    fn drop(&mut self) {
        // Pages in [safe head, tail] may still hold live object handles;
        // everything below the safe head was cleared when it closed.
        if self.handler.has_objects() {
            let tail_page = self.layout.page(self.get_tail_address());
            let mut page = self.layout.page(self.get_safe_head_address());
            while page <= tail_page {
                self.clear_page(page);
                page += 1;
            }
        }
        for index in 0..self.raw_pages.len() {
            let raw = *self.raw_pages[index].get_mut();
            if !raw.is_null() {
                unsafe { aligned_free(raw, self.page_alloc_layout) };
            }
        }
    }
}
