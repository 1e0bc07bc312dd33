use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

static TOTAL_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static PEAK_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// Returns `(currently allocated, peak allocated)` bytes obtained through
/// [`aligned_alloc`]. Used by tests to check for leaked page buffers.
pub fn allocation_stats() -> (usize, usize) {
    (
        TOTAL_ALLOCATED.load(Ordering::Relaxed),
        PEAK_ALLOCATED.load(Ordering::Relaxed),
    )
}

fn track_allocation(size: usize) {
    let current = TOTAL_ALLOCATED.fetch_add(size, Ordering::Relaxed) + size;
    let mut peak = PEAK_ALLOCATED.load(Ordering::Relaxed);
    while current > peak {
        match PEAK_ALLOCATED.compare_exchange_weak(
            peak,
            current,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(new_peak) => peak = new_peak,
        }
    }
}

/// Allocates zeroed memory with the alignment given in `layout`.
///
/// # Safety
///
/// The caller must ensure that the `layout` has a non-zero size.
pub unsafe fn aligned_alloc(layout: Layout) -> *mut u8 {
    if layout.size() == 0 {
        return null_mut();
    }
    let ptr = unsafe { alloc_zeroed(layout) };
    if !ptr.is_null() {
        track_allocation(layout.size());
    }
    ptr
}

/// Frees memory that was allocated with `aligned_alloc`.
///
/// # Safety
///
/// `ptr` must have been allocated using `aligned_alloc` with the same `layout`.
pub unsafe fn aligned_free(ptr: *mut u8, layout: Layout) {
    if !ptr.is_null() {
        TOTAL_ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
        unsafe {
            dealloc(ptr, layout);
        }
    }
}
