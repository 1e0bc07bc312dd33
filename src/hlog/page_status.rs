use std::sync::atomic::{AtomicU16, Ordering};

use crate::core::address::AtomicAddress;

/// Flush state of a page slot. `Flushed` means every byte below the slot's
/// `last_flushed_until_address` is durable on the log device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlushStatus {
    Flushed,
    InProgress,
}

/// Close state of a page slot. A slot may be reused for a new page only once
/// it has been observed both `Closed` and `Flushed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseStatus {
    Closed,
    Open,
}

/// The two status bytes packed into one word so that flush completion and
/// page eviction can race on a single compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FlushCloseStatus {
    pub flush: FlushStatus,
    pub close: CloseStatus,
}

impl FlushCloseStatus {
    pub fn new(flush: FlushStatus, close: CloseStatus) -> Self {
        Self { flush, close }
    }

    /// A freshly materialized (or fully recycled) slot: nothing to flush,
    /// nothing holding the slot open.
    pub fn clean() -> Self {
        Self {
            flush: FlushStatus::Flushed,
            close: CloseStatus::Closed,
        }
    }
}

impl From<u16> for FlushCloseStatus {
    fn from(control: u16) -> Self {
        // Both fields are single-byte enums with only 0/1 discriminants ever
        // stored through the typed constructors.
        unsafe { std::mem::transmute(control) }
    }
}

impl From<FlushCloseStatus> for u16 {
    fn from(status: FlushCloseStatus) -> Self {
        unsafe { std::mem::transmute(status) }
    }
}

#[derive(Default)]
#[repr(transparent)]
pub struct AtomicFlushCloseStatus(AtomicU16);

impl AtomicFlushCloseStatus {
    pub fn load(&self) -> FlushCloseStatus {
        self.0.load(Ordering::Acquire).into()
    }

    pub fn store(&self, flush: FlushStatus, close: CloseStatus) {
        self.0
            .store(FlushCloseStatus { flush, close }.into(), Ordering::SeqCst);
    }

    pub fn compare_exchange(
        &self,
        current: FlushCloseStatus,
        new: FlushCloseStatus,
    ) -> Result<FlushCloseStatus, FlushCloseStatus> {
        match self.0.compare_exchange(
            current.into(),
            new.into(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(v) => Ok(v.into()),
            Err(v) => Err(v.into()),
        }
    }
}

/// Per-slot status: the packed flush/close word plus the watermark recording
/// how far this slot's page has been flushed.
#[derive(Default)]
pub struct FullPageStatus {
    pub last_flushed_until_address: AtomicAddress,
    pub status: AtomicFlushCloseStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Address;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_default_is_clean() {
        let status = AtomicFlushCloseStatus::default();
        assert_eq!(status.load(), FlushCloseStatus::clean());
    }

    #[test]
    fn test_pack_round_trip() {
        for flush in [FlushStatus::Flushed, FlushStatus::InProgress] {
            for close in [CloseStatus::Closed, CloseStatus::Open] {
                let status = FlushCloseStatus::new(flush, close);
                let control: u16 = status.into();
                assert_eq!(FlushCloseStatus::from(control), status);
            }
        }
    }

    #[test]
    fn test_compare_exchange_whole_word() {
        let status = AtomicFlushCloseStatus::default();
        status.store(FlushStatus::InProgress, CloseStatus::Open);

        // A CAS expecting the stale clean word fails.
        assert!(
            status
                .compare_exchange(
                    FlushCloseStatus::clean(),
                    FlushCloseStatus::new(FlushStatus::Flushed, CloseStatus::Open),
                )
                .is_err()
        );

        let current = status.load();
        let next = FlushCloseStatus::new(FlushStatus::Flushed, current.close);
        assert!(status.compare_exchange(current, next).is_ok());
        assert_eq!(
            status.load(),
            FlushCloseStatus::new(FlushStatus::Flushed, CloseStatus::Open)
        );
    }

    #[test]
    fn test_full_page_status_watermark() {
        let full = FullPageStatus::default();
        assert!(
            full.last_flushed_until_address
                .load(Ordering::Acquire)
                .is_invalid()
        );
        full.last_flushed_until_address
            .store(Address::from_control(4096), Ordering::Release);
        assert_eq!(
            full.last_flushed_until_address
                .load(Ordering::Acquire)
                .control(),
            4096
        );
    }
}
