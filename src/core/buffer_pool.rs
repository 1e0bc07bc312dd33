use std::alloc::Layout;

use parking_lot::Mutex;

use crate::core::alloc::{aligned_alloc, aligned_free};

/// Number of power-of-two size levels a pool maintains.
const K_LEVELS: usize = 32;

/// A sector-aligned scratch buffer handed out by [`SectorAlignedBufferPool`].
///
/// `valid_offset` and `available_bytes` let a caller that had to round a file
/// offset down to a sector boundary locate the bytes it actually asked for
/// inside the buffer.
pub struct SectorAlignedMemory {
    ptr: *mut u8,
    layout: Layout,
    level: usize,
    /// Offset of the first caller-requested byte inside the buffer.
    pub valid_offset: u32,
    /// Bytes available at `valid_offset`.
    pub available_bytes: u32,
    /// Bytes the caller originally asked for.
    pub required_bytes: u32,
}

// The buffer is uniquely owned and carries no interior references.
unsafe impl Send for SectorAlignedMemory {}

impl SectorAlignedMemory {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Full (sector-rounded) capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }

    /// The caller-requested window of the buffer.
    pub fn valid_slice(&self) -> &[u8] {
        let start = self.valid_offset as usize;
        let end = start + self.available_bytes as usize;
        &self.as_slice()[start..end]
    }
}

impl Drop for SectorAlignedMemory {
    fn drop(&mut self) {
        // Buffers returned to the pool have been emptied out; anything else
        // is freed here so dropping a buffer is never a leak.
        if !self.ptr.is_null() {
            unsafe { aligned_free(self.ptr, self.layout) };
        }
    }
}

/// Pool of sector-aligned buffers with per-level free lists.
///
/// Buffers are grouped into power-of-two multiples of the sector size;
/// `get` pops a free buffer of the right level or allocates a fresh one, and
/// `return_buffer` pushes it back for reuse.
pub struct SectorAlignedBufferPool {
    sector_size: u32,
    free_list: Vec<Mutex<Vec<usize>>>,
}

impl SectorAlignedBufferPool {
    pub fn new(sector_size: u32) -> Self {
        debug_assert!(sector_size.is_power_of_two());
        let mut free_list = Vec::with_capacity(K_LEVELS);
        for _ in 0..K_LEVELS {
            free_list.push(Mutex::new(Vec::new()));
        }
        Self {
            sector_size,
            free_list,
        }
    }

    fn level(&self, sectors: u64) -> usize {
        debug_assert!(sectors > 0);
        sectors.next_power_of_two().trailing_zeros() as usize
    }

    /// Gets a zeroed buffer with capacity for at least `required_bytes`.
    pub fn get(&self, required_bytes: u32) -> SectorAlignedMemory {
        let sector = u64::from(self.sector_size);
        let sectors = (u64::from(required_bytes).max(1)).div_ceil(sector);
        let level = self.level(sectors);
        let capacity = (sector << level) as usize;
        let layout = Layout::from_size_align(capacity, self.sector_size as usize)
            .expect("pool layout parameters are validated at construction");

        let recycled = self.free_list[level].lock().pop();
        let ptr = match recycled {
            Some(addr) => {
                let ptr = addr as *mut u8;
                unsafe { std::ptr::write_bytes(ptr, 0, capacity) };
                ptr
            }
            None => unsafe { aligned_alloc(layout) },
        };
        assert!(!ptr.is_null(), "sector-aligned allocation failed");

        SectorAlignedMemory {
            ptr,
            layout,
            level,
            valid_offset: 0,
            available_bytes: required_bytes,
            required_bytes,
        }
    }

    /// Returns a buffer to the pool for reuse.
    pub fn return_buffer(&self, mut buffer: SectorAlignedMemory) {
        let ptr = buffer.ptr;
        buffer.ptr = std::ptr::null_mut();
        self.free_list[buffer.level].lock().push(ptr as usize);
    }
}

impl Drop for SectorAlignedBufferPool {
    fn drop(&mut self) {
        let sector = u64::from(self.sector_size);
        for (level, list) in self.free_list.iter_mut().enumerate() {
            let capacity = (sector << level) as usize;
            let layout = Layout::from_size_align(capacity, self.sector_size as usize)
                .expect("pool layout parameters are validated at construction");
            for addr in list.lock().drain(..) {
                unsafe { aligned_free(addr as *mut u8, layout) };
            }
        }
    }
}
