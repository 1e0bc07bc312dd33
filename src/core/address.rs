use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

/// Represents a logical address into the append-only log. Identifies a page
/// and an offset within that page.
/// Uses 48 bits of the 64-bit word; the remaining 16 bits are reserved for
/// use by the enclosing store's hash index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    /// A logical address is 8 bytes, of which 48 bits are used for the
    /// address itself.
    pub const K_ADDRESS_BITS: u64 = 48;
    pub const K_MAX_ADDRESS: u64 = (1 << Self::K_ADDRESS_BITS) - 1;

    /// The null sentinel. Logical address 0 never holds a record.
    pub const INVALID_ADDRESS: Address = Address(0);

    /// The lowest logical address handed out by the allocator. The prefix of
    /// page zero below this is stored zeroed and never used, so that address
    /// 0 stays distinguishable from real records.
    pub const FIRST_VALID_ADDRESS: Address = Address(64);

    /// Creates an `Address` from a raw `u64` control value.
    pub fn from_control(control: u64) -> Self {
        debug_assert!(
            control >> Self::K_ADDRESS_BITS == 0,
            "Invalid address control value: reserved bits are not zero. Value: {:#x}",
            control
        );
        Address(control)
    }

    /// Returns the raw `u64` control value of the address.
    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Address {
    fn from(control: u64) -> Self {
        Address::from_control(control)
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl Add<u64> for Address {
    type Output = Self;
    fn add(self, delta: u64) -> Self::Output {
        let new_control = self.0 + delta;
        debug_assert!(
            new_control >> Self::K_ADDRESS_BITS == 0,
            "Address addition overflowed reserved bits. Original: {:#x}, Delta: {:#x}",
            self.0,
            delta
        );
        Address(new_control)
    }
}

impl AddAssign<u64> for Address {
    fn add_assign(&mut self, delta: u64) {
        self.0 += delta;
        debug_assert!(
            self.0 >> Self::K_ADDRESS_BITS == 0,
            "Address addition overflowed reserved bits. Value: {:#x}",
            self.0
        );
    }
}

impl Sub for Address {
    type Output = u64;
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Runtime address decomposition. The page size (and therefore the number of
/// intra-page offset bits), the ring size, and the segment size are all
/// configured per allocator instance, so the page/offset/segment arithmetic
/// lives here rather than on [`Address`] itself.
#[derive(Debug, Clone, Copy)]
pub struct PageLayout {
    offset_bits: u32,
    segment_bits: u32,
    buffer_size: u32,
}

impl PageLayout {
    pub fn new(offset_bits: u32, segment_bits: u32, buffer_size: u32) -> Self {
        debug_assert!(buffer_size.is_power_of_two());
        debug_assert!(segment_bits >= offset_bits);
        Self {
            offset_bits,
            segment_bits,
            buffer_size,
        }
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        1u64 << self.offset_bits
    }

    /// Number of page slots in the circular buffer.
    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Global page number of `address`.
    #[inline]
    pub fn page(&self, address: Address) -> u64 {
        address.control() >> self.offset_bits
    }

    /// Offset of `address` within its page.
    #[inline]
    pub fn offset(&self, address: Address) -> u64 {
        address.control() & (self.page_size() - 1)
    }

    /// Ring slot backing `page`.
    #[inline]
    pub fn page_index(&self, page: u64) -> usize {
        (page & u64::from(self.buffer_size - 1)) as usize
    }

    /// Composes a logical address from page number and intra-page offset.
    #[inline]
    pub fn address(&self, page: u64, offset: u64) -> Address {
        debug_assert!(offset < self.page_size());
        Address::from_control((page << self.offset_bits) | offset)
    }

    /// Address of the first byte of the page containing `address`.
    #[inline]
    pub fn page_aligned(&self, address: Address) -> Address {
        Address::from_control(address.control() & !(self.page_size() - 1))
    }

    /// Device segment holding `address`.
    #[inline]
    pub fn segment(&self, address: Address) -> u64 {
        address.control() >> self.segment_bits
    }

    /// Device segment holding `page`.
    #[inline]
    pub fn segment_of_page(&self, page: u64) -> u64 {
        (page << self.offset_bits) >> self.segment_bits
    }

    /// Segment size in bytes.
    #[inline]
    pub fn segment_size(&self) -> u64 {
        1u64 << self.segment_bits
    }
}

/// Atomic (logical) address.
#[derive(Default)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    /// Creates a new `AtomicAddress` from an `Address`.
    pub fn new(address: Address) -> Self {
        AtomicAddress(AtomicU64::new(address.control()))
    }

    /// Atomically loads the current `Address`.
    pub fn load(&self, order: Ordering) -> Address {
        Address(self.0.load(order))
    }

    /// Atomically stores an `Address`.
    pub fn store(&self, value: Address, order: Ordering) {
        self.0.store(value.control(), order)
    }

    /// Atomically compares and exchanges the `Address`.
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Address, Address> {
        match self.0.compare_exchange(current.0, new.0, success, failure) {
            Ok(v) => Ok(Address(v)),
            Err(v) => Err(Address(v)),
        }
    }

    /// Advances the address to `new` if `new` is larger than the current
    /// value. Returns `Some(old)` when the update took effect; watermarks
    /// never move backwards.
    pub fn monotonic_update(&self, new: Address) -> Option<Address> {
        let mut current = self.0.load(Ordering::Acquire);
        while new.control() > current {
            match self.0.compare_exchange(
                current,
                new.control(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(old) => return Some(Address(old)),
                Err(actual) => current = actual,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_control_round_trip() {
        let addr = Address::from_control(0x1234_5678);
        assert_eq!(addr.control(), 0x1234_5678);
    }

    #[test]
    fn test_address_sentinels() {
        assert!(Address::INVALID_ADDRESS.is_invalid());
        assert_eq!(Address::FIRST_VALID_ADDRESS.control(), 64);
        assert!(Address::INVALID_ADDRESS < Address::FIRST_VALID_ADDRESS);
    }

    #[test]
    fn test_address_arithmetic() {
        let a = Address::from_control(100);
        let b = a + 28;
        assert_eq!(b.control(), 128);
        assert_eq!(b - a, 28);
    }

    #[test]
    fn test_layout_decomposition() {
        // 1MB pages, 4MB segments, 8 slots.
        let layout = PageLayout::new(20, 22, 8);
        let addr = layout.address(5, 0x321);
        assert_eq!(layout.page(addr), 5);
        assert_eq!(layout.offset(addr), 0x321);
        assert_eq!(layout.page_index(5), 5);
        assert_eq!(layout.page_index(13), 5);
        assert_eq!(layout.segment(addr), 1);
        assert_eq!(layout.page_aligned(addr), layout.address(5, 0));
    }

    #[test]
    fn test_segment_of_page() {
        let layout = PageLayout::new(20, 22, 8);
        assert_eq!(layout.segment_of_page(3), 0);
        assert_eq!(layout.segment_of_page(4), 1);
        assert_eq!(layout.segment_of_page(11), 2);
    }

    #[test]
    fn test_monotonic_update() {
        let atomic = AtomicAddress::new(Address::from_control(100));
        assert!(atomic.monotonic_update(Address::from_control(200)).is_some());
        assert!(atomic.monotonic_update(Address::from_control(150)).is_none());
        assert_eq!(atomic.load(Ordering::Acquire).control(), 200);
    }
}
