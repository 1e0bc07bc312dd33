use std::marker::PhantomData;
use std::mem;

use crate::core::record::{AddressInfo, Record};
use crate::core::status::Status;

/// Reads the 8-byte object slot at `offset` in a page image.
///
/// # Safety
/// `offset` must be 8-byte aligned relative to the (sector-aligned) image
/// start and `offset + 8` must be in bounds.
#[inline]
pub(crate) unsafe fn read_slot(page: &[u8], offset: usize) -> u64 {
    debug_assert!(offset + 8 <= page.len());
    debug_assert_eq!(offset % 8, 0);
    unsafe { (page.as_ptr().add(offset) as *const u64).read() }
}

/// Writes the 8-byte object slot at `offset` in a page image.
///
/// # Safety
/// Same bounds and alignment requirements as [`read_slot`], plus exclusive
/// access to the image.
#[inline]
pub(crate) unsafe fn write_slot(page: &mut [u8], offset: usize, value: u64) {
    debug_assert!(offset + 8 <= page.len());
    debug_assert_eq!(offset % 8, 0);
    unsafe { (page.as_mut_ptr().add(offset) as *mut u64).write(value) }
}

/// A contiguous object-log range covering the payloads of the records in
/// `page[cursor..until]`, as reported by [`PageHandler::get_object_info`].
#[derive(Debug, Clone, Copy)]
pub struct ObjectRange {
    /// Page offset of the first record not covered by this range.
    pub until: usize,
    /// Segment-relative byte offset of the first payload.
    pub offset: u64,
    /// Span of the range in bytes.
    pub size: u64,
}

/// Encapsulates whether records carry out-of-line object payloads and, if
/// so, how to serialize, deserialize, size, and clear them.
///
/// All methods operate on page images by byte offset. An object-carrying
/// record reserves an 8-byte slot that alternates between a live heap handle
/// (while the image is a live in-memory page) and an [`AddressInfo`] (in
/// scratch and on-disk images). A zero slot means the record has no payload.
pub trait PageHandler: Send + Sync + 'static {
    fn key_has_objects(&self) -> bool;

    fn value_has_objects(&self) -> bool;

    fn has_objects(&self) -> bool {
        self.key_has_objects() || self.value_has_objects()
    }

    /// Fixed size of one record, a multiple of 8.
    fn record_size(&self) -> u32;

    /// Releases the live object handles of every record in
    /// `page[begin..end]`, zeroing their slots.
    fn clear_page(&self, page: &mut [u8], begin: usize, end: usize);

    /// Serializes payloads for records in `page[cursor..end]` into `stream`,
    /// stopping before the stream would exceed `block_size` (a batch always
    /// covers at least one payload). Each serialized record's slot is
    /// rewritten with a stream-relative [`AddressInfo`] and its byte offset
    /// pushed onto `patches` for the flush engine to rebase. Returns the
    /// cursor after the last covered record.
    fn serialize(
        &self,
        page: &mut [u8],
        cursor: usize,
        end: usize,
        block_size: u64,
        stream: &mut Vec<u8>,
        patches: &mut Vec<usize>,
    ) -> Result<usize, Status>;

    /// Reinflates payloads for records in `page[cursor..until]` from
    /// `stream`, whose first byte sits at segment-relative offset
    /// `stream_base`, replacing each `AddressInfo` slot with a live handle.
    fn deserialize(
        &self,
        page: &mut [u8],
        cursor: usize,
        until: usize,
        stream_base: u64,
        stream: &[u8],
    ) -> Result<(), Status>;

    /// Describes the next contiguous object-log range needed to reinflate
    /// records from `cursor`, covering roughly `block_size` payload bytes.
    /// Returns `None` when no record in `page[cursor..end]` has a payload.
    fn get_object_info(
        &self,
        page: &[u8],
        cursor: usize,
        end: usize,
        block_size: u64,
    ) -> Option<ObjectRange>;
}

/// Handler for fully blittable records: fixed-size key and value, no
/// out-of-line payloads, so pages flush and read as plain byte images.
pub struct FixedSizeHandler<K, V> {
    _marker: PhantomData<Record<K, V>>,
}

impl<K, V> FixedSizeHandler<K, V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for FixedSizeHandler<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PageHandler for FixedSizeHandler<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn key_has_objects(&self) -> bool {
        false
    }

    fn value_has_objects(&self) -> bool {
        false
    }

    fn record_size(&self) -> u32 {
        Record::<K, V>::size()
    }

    fn clear_page(&self, _page: &mut [u8], _begin: usize, _end: usize) {}

    fn serialize(
        &self,
        _page: &mut [u8],
        _cursor: usize,
        end: usize,
        _block_size: u64,
        _stream: &mut Vec<u8>,
        _patches: &mut Vec<usize>,
    ) -> Result<usize, Status> {
        Ok(end)
    }

    fn deserialize(
        &self,
        _page: &mut [u8],
        _cursor: usize,
        _until: usize,
        _stream_base: u64,
        _stream: &[u8],
    ) -> Result<(), Status> {
        Ok(())
    }

    fn get_object_info(
        &self,
        _page: &[u8],
        _cursor: usize,
        _end: usize,
        _block_size: u64,
    ) -> Option<ObjectRange> {
        None
    }
}

/// Handler for records with a fixed-size key and a variable-length byte
/// payload held out of line. The record's 8-byte value slot holds a leaked
/// `Box<Vec<u8>>` while the page is live; payloads travel through the object
/// log bincode-encoded.
pub struct VarByteValueHandler<K> {
    value_offset: usize,
    _marker: PhantomData<K>,
}

impl<K> VarByteValueHandler<K>
where
    K: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            value_offset: mem::offset_of!(Record<K, u64>, value),
            _marker: PhantomData,
        }
    }

    /// Installs `payload` as the record's live value, releasing any payload
    /// the record already held. `record` must be a live in-memory record
    /// image of at least `record_size` bytes.
    pub fn set_value(&self, record: &mut [u8], payload: Vec<u8>) {
        let old = unsafe { read_slot(record, self.value_offset) };
        if old != 0 {
            drop(unsafe { Box::from_raw(old as usize as *mut Vec<u8>) });
        }
        let handle = Box::into_raw(Box::new(payload)) as usize as u64;
        unsafe { write_slot(record, self.value_offset, handle) };
    }

    /// The record's live payload, if it has one.
    pub fn value<'a>(&self, record: &'a [u8]) -> Option<&'a Vec<u8>> {
        let handle = unsafe { read_slot(record, self.value_offset) };
        if handle == 0 {
            None
        } else {
            Some(unsafe { &*(handle as usize as *const Vec<u8>) })
        }
    }

    /// The on-disk back-reference in a record image that has not been
    /// reinflated. Used by the record-miss read path.
    pub fn address_info(&self, record: &[u8]) -> AddressInfo {
        AddressInfo::from_control(unsafe { read_slot(record, self.value_offset) })
    }
}

impl<K> Default for VarByteValueHandler<K>
where
    K: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> PageHandler for VarByteValueHandler<K>
where
    K: Send + Sync + 'static,
{
    fn key_has_objects(&self) -> bool {
        false
    }

    fn value_has_objects(&self) -> bool {
        true
    }

    fn record_size(&self) -> u32 {
        Record::<K, u64>::size()
    }

    fn clear_page(&self, page: &mut [u8], begin: usize, end: usize) {
        let rs = self.record_size() as usize;
        let mut offset = begin;
        while offset + rs <= end {
            let slot_offset = offset + self.value_offset;
            let handle = unsafe { read_slot(page, slot_offset) };
            if handle != 0 {
                drop(unsafe { Box::from_raw(handle as usize as *mut Vec<u8>) });
                unsafe { write_slot(page, slot_offset, 0) };
            }
            offset += rs;
        }
    }

    fn serialize(
        &self,
        page: &mut [u8],
        cursor: usize,
        end: usize,
        block_size: u64,
        stream: &mut Vec<u8>,
        patches: &mut Vec<usize>,
    ) -> Result<usize, Status> {
        let rs = self.record_size() as usize;
        let mut offset = cursor;
        while offset + rs <= end {
            let slot_offset = offset + self.value_offset;
            let handle = unsafe { read_slot(page, slot_offset) };
            if handle == 0 {
                offset += rs;
                continue;
            }
            let payload = unsafe { &*(handle as usize as *const Vec<u8>) };

            // Length-prefixed encoding: 8 bytes of length plus the bytes.
            let needed = 8 + payload.len() as u64;
            if !stream.is_empty() && stream.len() as u64 + needed > block_size {
                break;
            }

            let position = stream.len() as u64;
            bincode::serialize_into(&mut *stream, payload).map_err(|e| {
                log::error!("object serialization failed: {}", e);
                Status::Corruption
            })?;
            let size = stream.len() as u64 - position;
            if size > AddressInfo::K_MAX_SIZE {
                log::error!("object payload of {} bytes overflows the address slot", size);
                return Err(Status::BufferTooSmall);
            }

            unsafe { write_slot(page, slot_offset, AddressInfo::new(position, size).control()) };
            patches.push(slot_offset);
            offset += rs;
        }
        Ok(offset)
    }

    fn deserialize(
        &self,
        page: &mut [u8],
        cursor: usize,
        until: usize,
        stream_base: u64,
        stream: &[u8],
    ) -> Result<(), Status> {
        let rs = self.record_size() as usize;
        let mut offset = cursor;
        while offset + rs <= until {
            let slot_offset = offset + self.value_offset;
            let control = unsafe { read_slot(page, slot_offset) };
            if control == 0 {
                offset += rs;
                continue;
            }
            let info = AddressInfo::from_control(control);
            debug_assert!(info.offset() >= stream_base);
            let start = (info.offset() - stream_base) as usize;
            let stop = start + info.size() as usize;
            if stop > stream.len() {
                log::error!(
                    "object reference {:#x}+{} overruns a {}-byte fragment",
                    info.offset(),
                    info.size(),
                    stream.len()
                );
                return Err(Status::Corruption);
            }
            let payload: Vec<u8> = bincode::deserialize(&stream[start..stop]).map_err(|e| {
                log::error!("object deserialization failed: {}", e);
                Status::Corruption
            })?;
            let handle = Box::into_raw(Box::new(payload)) as usize as u64;
            unsafe { write_slot(page, slot_offset, handle) };
            offset += rs;
        }
        Ok(())
    }

    fn get_object_info(
        &self,
        page: &[u8],
        cursor: usize,
        end: usize,
        block_size: u64,
    ) -> Option<ObjectRange> {
        let rs = self.record_size() as usize;
        let mut offset = cursor;
        let mut first: Option<u64> = None;
        let mut span_end = 0u64;
        while offset + rs <= end {
            let control = unsafe { read_slot(page, offset + self.value_offset) };
            if control != 0 {
                let info = AddressInfo::from_control(control);
                match first {
                    None => {
                        first = Some(info.offset());
                        span_end = info.offset() + info.size();
                    }
                    Some(start) => {
                        let payload_end = info.offset() + info.size();
                        if payload_end - start > block_size {
                            break;
                        }
                        span_end = span_end.max(payload_end);
                    }
                }
            }
            offset += rs;
        }
        first.map(|start| ObjectRange {
            until: offset,
            offset: start,
            size: span_end - start,
        })
    }
}
