//! End-to-end scenarios for the allocator: flush/read round trips, ring
//! wrap-around, object-log batching, the flush/close race, and device error
//! propagation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tempfile::tempdir;

use crate::common::LogConfig;
use crate::core::address::Address;
use crate::core::status::Status;
use crate::device::{ConstPtr, Disk, FileSystemDisk, IoCompletion, MutPtr};
use crate::epoch::LightEpoch;
use crate::hlog::allocator::LogAllocator;
use crate::hlog::page_handler::{FixedSizeHandler, VarByteValueHandler};
use crate::hlog::page_status::{CloseStatus, FlushCloseStatus, FlushStatus};
use crate::HlogError;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> LogConfig {
    LogConfig {
        page_size_bits: 16,
        buffer_size: 4,
        sector_size: 512,
        segment_size_bits: 20,
        mutable_fraction: 0.75,
        object_block_size: 100 * 1024 * 1024,
    }
}

/// Delegating device that can hold back main-log write completions, used to
/// pin a page in the `InProgress` flush state.
struct GatedDisk {
    inner: Arc<FileSystemDisk>,
    gate_writes: AtomicBool,
    held: Mutex<Vec<(u32, IoCompletion)>>,
}

impl GatedDisk {
    fn new(inner: Arc<FileSystemDisk>) -> Self {
        Self {
            inner,
            gate_writes: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        }
    }

    fn gate(&self) {
        self.gate_writes.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.gate_writes.store(false, Ordering::SeqCst);
        let held: Vec<_> = self.held.lock().drain(..).collect();
        for (length, callback) in held {
            callback(0, length);
        }
    }
}

impl Disk for GatedDisk {
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
        if self.gate_writes.load(Ordering::SeqCst) {
            // Perform the write now but surface the completion later.
            let status = self
                .inner
                .write_async(source, length, dest_offset, Box::new(|_, _| {}));
            self.held.lock().push((length, callback));
            return status;
        }
        self.inner.write_async(source, length, dest_offset, callback)
    }

    fn read_async(
        &self,
        source_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        self.inner.read_async(source_offset, dest, length, callback)
    }

    fn write_segment_async(
        &self,
        segment: u64,
        source: ConstPtr,
        length: u32,
        intra_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        self.inner
            .write_segment_async(segment, source, length, intra_offset, callback)
    }

    fn read_segment_async(
        &self,
        segment: u64,
        intra_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        self.inner
            .read_segment_async(segment, intra_offset, dest, length, callback)
    }

    fn delete_segment_range(&self, from_segment: u64, to_segment: u64) -> Status {
        self.inner.delete_segment_range(from_segment, to_segment)
    }
}

/// Delegating device that counts object-log writes and can inject an error
/// code into them.
struct ObservedDisk {
    inner: Arc<FileSystemDisk>,
    segment_writes: AtomicU32,
    misaligned_writes: AtomicU32,
    fault_code: AtomicU32,
}

impl ObservedDisk {
    fn new(inner: Arc<FileSystemDisk>) -> Self {
        Self {
            inner,
            segment_writes: AtomicU32::new(0),
            misaligned_writes: AtomicU32::new(0),
            fault_code: AtomicU32::new(0),
        }
    }
}

impl Disk for ObservedDisk {
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
        self.inner.write_async(source, length, dest_offset, callback)
    }

    fn read_async(
        &self,
        source_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        self.inner.read_async(source_offset, dest, length, callback)
    }

    fn write_segment_async(
        &self,
        segment: u64,
        source: ConstPtr,
        length: u32,
        intra_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        self.segment_writes.fetch_add(1, Ordering::SeqCst);
        if length % self.sector_size() != 0 || intra_offset % u64::from(self.sector_size()) != 0 {
            self.misaligned_writes.fetch_add(1, Ordering::SeqCst);
        }
        let fault = self.fault_code.load(Ordering::SeqCst);
        if fault != 0 {
            callback(fault, 0);
            return Status::IoError;
        }
        self.inner
            .write_segment_async(segment, source, length, intra_offset, callback)
    }

    fn read_segment_async(
        &self,
        segment: u64,
        intra_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        self.inner
            .read_segment_async(segment, intra_offset, dest, length, callback)
    }

    fn delete_segment_range(&self, from_segment: u64, to_segment: u64) -> Status {
        self.inner.delete_segment_range(from_segment, to_segment)
    }
}

fn file_disk(dir: &tempfile::TempDir, name: &str) -> Arc<FileSystemDisk> {
    let path = dir.path().join(name);
    Arc::new(FileSystemDisk::new(path.to_str().unwrap(), 512).unwrap())
}

type Key16 = [u8; 16];
type Value16 = [u8; 16];

/// Scenario: pure-blittable write, flush, evict, read back, byte-identical.
#[test]
fn test_blittable_flush_and_read_round_trip() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = LogConfig {
        page_size_bits: 20,
        buffer_size: 8,
        sector_size: 512,
        segment_size_bits: 30,
        mutable_fraction: 0.9,
        object_block_size: 100 * 1024 * 1024,
    };
    let log = LogAllocator::new(
        config,
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        None,
        FixedSizeHandler::<Key16, Value16>::new(),
    )
    .unwrap();
    let page_size = log.page_layout().page_size() as usize;

    // Fill page 0 (the FIRST_VALID_ADDRESS prefix is never handed out).
    loop {
        let address = log.allocate(40).unwrap();
        if log.page_layout().page(address) == 1 {
            break;
        }
        let record = log.record_mut::<Key16, Value16>(address).unwrap();
        let seed = address.control() as u8;
        record.key = [seed; 16];
        record.value = [seed.wrapping_add(1); 16];
    }

    let tail = log.get_tail_address();
    log.flush_until_sync(tail).unwrap();
    assert!(log.get_flushed_until_address() >= Address::from_control(1 << 20));

    // Snapshot the page image, drop it from memory, and read it back.
    let before: Vec<u8> = log.get_slice(Address::from_control(0), page_size).to_vec();
    log.clear_page(0);
    assert!(log.get_slice(Address::from_control(0), page_size).iter().all(|&b| b == 0));

    let done = Arc::new(AtomicBool::new(false));
    let errors = Arc::new(AtomicU32::new(0));
    {
        let done = done.clone();
        let errors = errors.clone();
        log.async_read_pages_from_device(
            0,
            1,
            Some(Arc::new(move |_page, error| {
                errors.store(error, Ordering::SeqCst);
                done.store(true, Ordering::SeqCst);
            })),
        );
    }
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    let after = log.get_slice(Address::from_control(0), page_size);
    assert_eq!(after, &before[..]);
}

/// Scenario: ring wrap. Slots are recycled only after flush + close, and
/// `FlushedUntilAddress` lands exactly at the read-only boundary.
#[test]
fn test_ring_wrap_recycles_slots() {
    init_logging();
    let dir = tempdir().unwrap();
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();
    let page_size = log.page_layout().page_size();

    let mut previous_flushed = log.get_flushed_until_address();
    let mut previous_head = log.get_head_address();
    let mut previous_read_only = log.get_read_only_address();

    while log.page_layout().page(log.get_tail_address()) < 9 {
        log.allocate(1024).unwrap();

        // Watermarks never regress.
        let flushed = log.get_flushed_until_address();
        let head = log.get_head_address();
        let read_only = log.get_read_only_address();
        assert!(flushed >= previous_flushed);
        assert!(head >= previous_head);
        assert!(read_only >= previous_read_only);
        previous_flushed = flushed;
        previous_head = head;
        previous_read_only = read_only;
    }

    // With a 4-slot ring and 3 mutable pages, a tail in page 9 pins the
    // read-only boundary (and the flush) at exactly page 6.
    assert_eq!(log.get_flushed_until_address().control(), 6 * page_size);
    assert_eq!(log.get_safe_head_address().control(), 6 * page_size);

    // Ordering chain over the exposed watermarks.
    assert!(log.get_begin_address() <= log.get_head_address());
    assert!(log.get_head_address() <= log.get_safe_head_address());
    assert!(log.get_safe_head_address() <= log.get_read_only_address());
    assert!(log.get_read_only_address() <= log.get_safe_read_only_address());
    assert!(log.get_safe_read_only_address() <= log.get_tail_address());
}

/// Property: translation stays inside the slot's aligned region for every
/// live address.
#[test]
fn test_translation_stays_in_page_bounds() {
    init_logging();
    let dir = tempdir().unwrap();
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();

    let mut addresses = Vec::new();
    for _ in 0..200 {
        addresses.push(log.allocate(512).unwrap());
    }
    let layout = log.page_layout();
    for address in addresses {
        let slot = layout.page_index(layout.page(address));
        let origin = log.pages[slot].load(Ordering::Acquire) as usize;
        let physical = log.physical_address(address) as usize;
        assert!(physical >= origin);
        assert!(physical < origin + layout.page_size() as usize);
    }
}

fn payload_for(index: usize) -> Vec<u8> {
    const LENGTHS: [usize; 7] = [0, 1, 63, 64, 65, 1024, 1 << 20];
    let length = LENGTHS[index % LENGTHS.len()];
    vec![(index % 251) as u8; length]
}

/// Scenario: object payload write/flush/read round trip, with the segment
/// offset accounting for the sector-aligned serialized stream.
#[test]
fn test_object_payload_round_trip() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = small_config();
    let handler = VarByteValueHandler::<u64>::new();
    let record_size = {
        use crate::hlog::page_handler::PageHandler;
        handler.record_size() as usize
    };
    let log = LogAllocator::new(
        config,
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        Some(file_disk(&dir, "obj")),
        handler,
    )
    .unwrap();

    const NUM_RECORDS: usize = 350;
    let mut addresses = Vec::new();
    let mut serialized_total = 0u64;
    for i in 0..NUM_RECORDS {
        let address = log.allocate(record_size as u32).unwrap();
        let payload = payload_for(i);
        serialized_total += 8 + payload.len() as u64;
        {
            let record = log.get_mut_slice(address, record_size);
            let header = crate::core::record::RecordInfo::new(
                Address::INVALID_ADDRESS,
                0,
                false,
                false,
                false,
            );
            unsafe {
                crate::hlog::page_handler::write_slot(record, 0, header.control());
                crate::hlog::page_handler::write_slot(record, 8, i as u64);
            }
            log.handler().set_value(record, payload);
        }
        addresses.push(address);
    }

    let tail = log.get_tail_address();
    log.flush_until_sync(tail).unwrap();

    // One batch, sector-aligned once.
    let expected_offset = serialized_total.next_multiple_of(512);
    assert_eq!(log.segment_offset(0), expected_offset);

    // Evict and read back, reinflating payloads from the object log.
    log.clear_page(0);
    let done = Arc::new(AtomicBool::new(false));
    let errors = Arc::new(AtomicU32::new(0));
    {
        let done = done.clone();
        let errors = errors.clone();
        log.async_read_pages_from_device(
            0,
            1,
            Some(Arc::new(move |_page, error| {
                errors.store(error, Ordering::SeqCst);
                done.store(true, Ordering::SeqCst);
            })),
        );
    }
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    for (i, address) in addresses.iter().enumerate() {
        let record = log.get_slice(*address, record_size);
        let key = unsafe { crate::hlog::page_handler::read_slot(record, 8) };
        assert_eq!(key, i as u64, "non-object fields survive byte-identically");
        assert_eq!(
            log.handler().value(record).unwrap(),
            &payload_for(i),
            "payload {} differs after round trip",
            i
        );
    }
}

/// Scenario: serialized objects spanning multiple object blocks produce one
/// sector-aligned object-log write per batch, and reads reconstruct them.
#[test]
fn test_object_payloads_span_multiple_blocks() {
    init_logging();
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.object_block_size = 4096;

    let main = Arc::new(ObservedDisk::new(file_disk(&dir, "log")));
    let objects = Arc::new(ObservedDisk::new(file_disk(&dir, "obj")));
    let handler = VarByteValueHandler::<u64>::new();
    let record_size = {
        use crate::hlog::page_handler::PageHandler;
        handler.record_size() as usize
    };
    let log = LogAllocator::new(
        config,
        Arc::new(LightEpoch::new()),
        main,
        Some(objects.clone()),
        handler,
    )
    .unwrap();

    const NUM_RECORDS: usize = 50;
    let mut addresses = Vec::new();
    for i in 0..NUM_RECORDS {
        let address = log.allocate(record_size as u32).unwrap();
        let record = log.get_mut_slice(address, record_size);
        unsafe { crate::hlog::page_handler::write_slot(record, 8, i as u64) };
        log.handler().set_value(record, vec![i as u8; 1000]);
        addresses.push(address);
    }

    let tail = log.get_tail_address();
    log.flush_until_sync(tail).unwrap();

    // 50 KB of payload against a 4 KB block bound means many batches.
    assert!(objects.segment_writes.load(Ordering::SeqCst) > 1);
    assert_eq!(objects.misaligned_writes.load(Ordering::SeqCst), 0);

    log.clear_page(0);
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        log.async_read_pages_from_device(
            0,
            1,
            Some(Arc::new(move |_page, error| {
                assert_eq!(error, 0);
                done.store(true, Ordering::SeqCst);
            })),
        );
    }
    assert!(done.load(Ordering::SeqCst));

    for (i, address) in addresses.iter().enumerate() {
        let record = log.get_slice(*address, record_size);
        assert_eq!(log.handler().value(record).unwrap(), &vec![i as u8; 1000]);
    }
}

fn fill_page_zero(log: &Arc<LogAllocator<GatedDisk, FixedSizeHandler<u64, u64>>>) {
    loop {
        let address = log.allocate(1024).unwrap();
        if log.page_layout().page(address) == 1 {
            break;
        }
        let record = log.record_mut::<u64, u64>(address).unwrap();
        record.key = address.control();
        record.value = !address.control();
    }
}

/// Scenario: close lands before the flush completion. The completing thread
/// observes `Closed` and runs the clear.
#[test]
fn test_flush_close_race_close_first() {
    init_logging();
    let dir = tempdir().unwrap();
    let disk = Arc::new(GatedDisk::new(file_disk(&dir, "log")));
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        disk.clone(),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();
    let page_size = log.page_layout().page_size();

    fill_page_zero(&log);

    disk.gate();
    log.async_flush_pages(
        Address::FIRST_VALID_ADDRESS,
        Address::from_control(page_size),
        None,
    );
    let status = &log.page_status[0].status;
    assert_eq!(
        status.load(),
        FlushCloseStatus::new(FlushStatus::InProgress, CloseStatus::Open)
    );

    // Eviction closes the page while the flush is still in flight; the
    // closer must not clear.
    log.on_pages_closed(Address::from_control(page_size));
    assert_eq!(
        status.load(),
        FlushCloseStatus::new(FlushStatus::InProgress, CloseStatus::Closed)
    );
    let image = log.get_slice(Address::from_control(0), page_size as usize);
    assert!(image.iter().any(|&b| b != 0), "closer must not clear early");

    // The flush completion observes Closed and clears before publishing
    // Flushed.
    disk.release();
    assert_eq!(status.load(), FlushCloseStatus::clean());
    let image = log.get_slice(Address::from_control(0), page_size as usize);
    assert!(image.iter().all(|&b| b == 0));
    assert_eq!(log.get_flushed_until_address().control(), page_size);
}

/// Scenario: flush completes before the close. The evicting thread runs the
/// clear; the completer does not.
#[test]
fn test_flush_close_race_flush_first() {
    init_logging();
    let dir = tempdir().unwrap();
    let disk = Arc::new(GatedDisk::new(file_disk(&dir, "log")));
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        disk.clone(),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();
    let page_size = log.page_layout().page_size();

    fill_page_zero(&log);

    log.async_flush_pages(
        Address::FIRST_VALID_ADDRESS,
        Address::from_control(page_size),
        None,
    );
    let status = &log.page_status[0].status;
    assert_eq!(
        status.load(),
        FlushCloseStatus::new(FlushStatus::Flushed, CloseStatus::Open)
    );
    let image = log.get_slice(Address::from_control(0), page_size as usize);
    assert!(
        image.iter().any(|&b| b != 0),
        "flush completion must not clear an open page"
    );

    log.on_pages_closed(Address::from_control(page_size));
    assert_eq!(status.load(), FlushCloseStatus::clean());
    let image = log.get_slice(Address::from_control(0), page_size as usize);
    assert!(image.iter().all(|&b| b == 0));
}

/// Scenario: a device error on an object-log write reaches the user
/// callback unchanged, and the slot is still released.
#[test]
fn test_object_write_error_propagates() {
    init_logging();
    let dir = tempdir().unwrap();
    let main = Arc::new(ObservedDisk::new(file_disk(&dir, "log")));
    let objects = Arc::new(ObservedDisk::new(file_disk(&dir, "obj")));
    objects.fault_code.store(5, Ordering::SeqCst);

    let handler = VarByteValueHandler::<u64>::new();
    let record_size = {
        use crate::hlog::page_handler::PageHandler;
        handler.record_size() as u32
    };
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        main,
        Some(objects),
        handler,
    )
    .unwrap();
    let page_size = log.page_layout().page_size();

    // Fill page 0 with records that carry payloads.
    loop {
        let address = log.allocate(record_size).unwrap();
        if log.page_layout().page(address) == 1 {
            break;
        }
        let slice = log.get_mut_slice(address, record_size as usize);
        log.handler().set_value(slice, vec![0xCD; 32]);
    }

    let seen_error = Arc::new(AtomicU32::new(0));
    {
        let seen_error = seen_error.clone();
        log.async_flush_pages(
            Address::FIRST_VALID_ADDRESS,
            Address::from_control(page_size),
            Some(Arc::new(move |_page, error| {
                seen_error.store(error, Ordering::SeqCst);
            })),
        );
    }
    assert_eq!(seen_error.load(Ordering::SeqCst), 5);

    // The slot is released despite the error.
    assert_eq!(
        log.page_status[0].status.load().flush,
        FlushStatus::Flushed
    );
}

/// An allocation that lands on an un-recycled slot stalls, and succeeds
/// after the flush completes and the epoch drains the close.
#[test]
fn test_allocation_stall_and_retry() {
    init_logging();
    let dir = tempdir().unwrap();
    let disk = Arc::new(GatedDisk::new(file_disk(&dir, "log")));
    let config = LogConfig {
        buffer_size: 2,
        ..small_config()
    };
    let log = LogAllocator::new(
        config,
        Arc::new(LightEpoch::new()),
        disk.clone(),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();

    disk.gate();
    // Fill pages 0 and 1; the roll into page 2 needs slot 0 back, but the
    // gated flush pins page 0 in-progress.
    let mut stalled = false;
    for _ in 0..200 {
        match log.allocate(1024) {
            Ok(_) => {}
            Err(HlogError::AllocationStall) => {
                stalled = true;
                break;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert!(stalled, "gated flush must stall the ring");

    // Complete the flush; the retry re-elects itself, closes page 0, and
    // proceeds.
    disk.release();
    let guard = log.epoch.protect();
    guard.refresh();
    drop(guard);
    let address = log.allocate(1024).unwrap();
    assert_eq!(log.page_layout().page(address), 2);
}

/// Record-granular read of an evicted blittable record, with alignment
/// bookkeeping.
#[test]
fn test_read_record_to_memory() {
    init_logging();
    let dir = tempdir().unwrap();
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();

    let mut target = Address::INVALID_ADDRESS;
    for i in 0..100u64 {
        let address = log.allocate(24).unwrap();
        let record = log.record_mut::<u64, u64>(address).unwrap();
        record.key = i;
        record.value = i * 3;
        if i == 57 {
            target = address;
        }
    }
    let tail = log.get_tail_address();
    log.flush_until_sync(tail).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        let context = crate::hlog::read::AsyncIOContext::new(target);
        log.read_record_to_memory(
            target,
            24,
            context,
            Box::new(move |error, context| {
                assert_eq!(error, 0);
                let buffer = context.record.unwrap();
                assert_eq!(
                    u64::from(buffer.valid_offset),
                    target.control() % 512
                );
                let record = unsafe {
                    crate::core::record::Record::<u64, u64>::from_ptr(
                        buffer.as_ptr().add(buffer.valid_offset as usize),
                    )
                };
                assert_eq!(record.key, 57);
                assert_eq!(record.value, 171);
                done.store(true, Ordering::SeqCst);
            }),
        );
    }
    assert!(done.load(Ordering::SeqCst));
}

/// Record-miss path: fetch a record's object payload into an already-read
/// record image.
#[test]
fn test_read_record_object_fetch() {
    init_logging();
    let dir = tempdir().unwrap();
    let handler = VarByteValueHandler::<u64>::new();
    let record_size = {
        use crate::hlog::page_handler::PageHandler;
        handler.record_size() as u32
    };
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        Some(file_disk(&dir, "obj")),
        handler,
    )
    .unwrap();

    let mut target = Address::INVALID_ADDRESS;
    for i in 0..40u64 {
        let address = log.allocate(record_size).unwrap();
        let record = log.get_mut_slice(address, record_size as usize);
        unsafe { crate::hlog::page_handler::write_slot(record, 8, i) };
        log.handler().set_value(record, vec![i as u8; 300]);
        if i == 21 {
            target = address;
        }
    }
    let tail = log.get_tail_address();
    log.flush_until_sync(tail).unwrap();

    // Phase one: fetch the raw record; its value slot holds an AddressInfo.
    let fetched = Arc::new(Mutex::new(None));
    {
        let fetched = fetched.clone();
        let context = crate::hlog::read::AsyncIOContext::new(target);
        log.read_record_to_memory(
            target,
            record_size,
            context,
            Box::new(move |error, context| {
                assert_eq!(error, 0);
                *fetched.lock() = Some(context);
            }),
        );
    }
    let mut context = fetched.lock().take().unwrap();

    let info = {
        let buffer = context.record.as_ref().unwrap();
        let valid = buffer.valid_offset as usize;
        log.handler()
            .address_info(&buffer.as_slice()[valid..valid + record_size as usize])
    };
    assert!(!info.is_empty());
    context.object_info = Some(info);

    // Phase two: fetch the payload and reinflate the record image.
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        let log2 = log.clone();
        log.read_record_to_memory(
            target,
            record_size,
            context,
            Box::new(move |error, context| {
                assert_eq!(error, 0);
                let buffer = context.record.unwrap();
                let valid = buffer.valid_offset as usize;
                let record = &buffer.as_slice()[valid..valid + record_size as usize];
                assert_eq!(log2.handler().value(record).unwrap(), &vec![21u8; 300]);
                // Release the reinflated handle.
                let mut image = buffer.as_slice().to_vec();
                use crate::hlog::page_handler::PageHandler;
                log2.handler()
                    .clear_page(&mut image, valid, valid + record_size as usize);
                done.store(true, Ordering::SeqCst);
            }),
        );
    }
    assert!(done.load(Ordering::SeqCst));
}

/// Snapshot sub-variant: pages land dense on the destination device with
/// caller-supplied segment offsets.
#[test]
fn test_snapshot_flush_to_device_is_dense() {
    init_logging();
    let dir = tempdir().unwrap();
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();
    let page_size = log.page_layout().page_size();

    // Fill pages 0 and 1.
    while log.page_layout().page(log.get_tail_address()) < 2 {
        let address = log.allocate(1024).unwrap();
        let record = log.record_mut::<u64, u64>(address).unwrap();
        record.key = address.control();
    }

    let snapshot_disk = file_disk(&dir, "snapshot");
    let offsets = Arc::new(vec![AtomicU64::new(0), AtomicU64::new(0)]);
    let flushed_pages = Arc::new(AtomicU32::new(0));
    {
        let flushed_pages = flushed_pages.clone();
        log.async_flush_pages_to_device(
            1,
            Address::from_control(2 * page_size),
            snapshot_disk.clone(),
            None,
            offsets,
            Some(Arc::new(move |_page, error| {
                assert_eq!(error, 0);
                flushed_pages.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }
    assert_eq!(flushed_pages.load(Ordering::SeqCst), 1);

    // Page 1 sits at snapshot offset 0.
    let mut out = vec![0u8; page_size as usize];
    snapshot_disk.read_async(
        0,
        MutPtr(out.as_mut_ptr()),
        page_size as u32,
        Box::new(|error, _| assert_eq!(error, 0)),
    );
    let live = log.get_slice(Address::from_control(page_size), page_size as usize);
    assert_eq!(&out[..], live);

    // The ring's own status machine was not touched by the snapshot.
    assert_eq!(
        log.page_status[1].status.load(),
        FlushCloseStatus::clean()
    );
}

/// Begin-address shifts delete dead object-log segments on both devices.
#[test]
fn test_shift_begin_address_deletes_segments() {
    init_logging();
    let dir = tempdir().unwrap();
    let handler = VarByteValueHandler::<u64>::new();
    let record_size = {
        use crate::hlog::page_handler::PageHandler;
        handler.record_size() as u32
    };
    let object_disk = file_disk(&dir, "obj");
    let log = LogAllocator::new(
        small_config(),
        Arc::new(LightEpoch::new()),
        file_disk(&dir, "log"),
        Some(object_disk.clone()),
        handler,
    )
    .unwrap();

    for i in 0..20u64 {
        let address = log.allocate(record_size).unwrap();
        let record = log.get_mut_slice(address, record_size as usize);
        log.handler().set_value(record, vec![i as u8; 64]);
    }
    let tail = log.get_tail_address();
    log.flush_until_sync(tail).unwrap();

    // Everything lives in segment 0 (1 MB segments); advancing begin past
    // one whole segment deletes it.
    log.shift_begin_address(Address::from_control(1 << 20));
    let mut probe = vec![0u8; 512];
    object_disk.read_segment_async(
        0,
        0,
        MutPtr(probe.as_mut_ptr()),
        512,
        Box::new(|_error, _bytes| {}),
    );
    assert!(probe.iter().all(|&b| b == 0), "segment 0 should be gone");
}
