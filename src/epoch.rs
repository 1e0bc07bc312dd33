//! Epoch protection for hybridlog
//!
//! The allocator consumes a narrow epoch interface: threads `protect`
//! themselves while holding pointers into the page buffer, and the allocator
//! publishes deferred actions through `bump_current_epoch`. An action runs
//! once every thread that was protected at bump time has refreshed or
//! released its guard — immediately, if no thread is protected.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Number of simultaneous protection slots.
const K_TABLE_SIZE: usize = 128;

struct DrainEntry {
    epoch: u64,
    action: Box<dyn FnOnce() + Send>,
}

/// A light-weight epoch manager.
///
/// Each protected thread occupies a slot in a fixed table, stamped with the
/// epoch current at protection time. The safe epoch is the minimum stamp over
/// occupied slots; deferred actions whose trigger epoch is at or below the
/// safe epoch are drained on every release, refresh, or bump.
pub struct LightEpoch {
    current_epoch: AtomicU64,
    table: Box<[AtomicU64]>,
    drain_list: Mutex<Vec<DrainEntry>>,
}

impl LightEpoch {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(K_TABLE_SIZE);
        for _ in 0..K_TABLE_SIZE {
            table.push(AtomicU64::new(0));
        }
        Self {
            // Slot value 0 marks a free slot, so epochs start at 1.
            current_epoch: AtomicU64::new(1),
            table: table.into_boxed_slice(),
            drain_list: Mutex::new(Vec::new()),
        }
    }

    /// Protects the calling thread, returning a guard that occupies a slot
    /// until dropped.
    pub fn protect(&self) -> Guard<'_> {
        loop {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            for slot in 0..self.table.len() {
                if self.table[slot]
                    .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Guard { epoch: self, slot };
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Advances the epoch and registers `action` to run once all currently
    /// protected threads have refreshed or released.
    pub fn bump_current_epoch(&self, action: impl FnOnce() + Send + 'static) {
        let trigger = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.drain_list.lock().push(DrainEntry {
            epoch: trigger,
            action: Box::new(action),
        });
        self.drain();
    }

    /// Runs every deferred action whose trigger epoch has become safe.
    pub fn drain(&self) {
        let mut runnable = Vec::new();
        {
            let mut list = self.drain_list.lock();
            if list.is_empty() {
                return;
            }
            let safe = self.safe_epoch();
            let mut i = 0;
            while i < list.len() {
                if list[i].epoch <= safe {
                    runnable.push(list.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        // Run outside the lock; actions may bump or drain again.
        for entry in runnable {
            (entry.action)();
        }
    }

    /// Minimum epoch stamp over occupied slots, or the current epoch when no
    /// thread is protected.
    fn safe_epoch(&self) -> u64 {
        let mut safe = self.current_epoch.load(Ordering::Acquire);
        for slot in self.table.iter() {
            let stamp = slot.load(Ordering::Acquire);
            if stamp != 0 && stamp < safe {
                safe = stamp;
            }
        }
        safe
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

/// Protection guard for one thread. Dropping releases the slot and drains.
pub struct Guard<'a> {
    epoch: &'a LightEpoch,
    slot: usize,
}

impl Guard<'_> {
    /// Re-stamps this thread's slot with the current epoch, allowing actions
    /// deferred since protection to become safe, and drains.
    pub fn refresh(&self) {
        let epoch = self.epoch.current_epoch.load(Ordering::Acquire);
        self.epoch.table[self.slot].store(epoch, Ordering::SeqCst);
        self.epoch.drain();
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.epoch.table[self.slot].store(0, Ordering::Release);
        self.epoch.drain();
    }
}
