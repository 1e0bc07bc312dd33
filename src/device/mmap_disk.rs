use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::core::status::Status;
use crate::device::{ConstPtr, Disk, IoCompletion, MutPtr};

/// File growth granularity.
const GROWTH_CHUNK: u64 = 64 * 1024 * 1024;

struct MmapFile {
    file: std::fs::File,
    mmap: Option<MmapMut>,
    size: u64,
}

impl MmapFile {
    fn open(path: &Path) -> Result<Self, Status> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| Status::IoError)?;
        Ok(Self {
            file,
            mmap: None,
            size: 0,
        })
    }

    fn resize_and_remap(&mut self, new_size: u64) -> Result<(), Status> {
        if new_size == self.size {
            return Ok(());
        }
        self.mmap = None;
        self.file.set_len(new_size).map_err(|_| Status::IoError)?;
        self.size = new_size;
        if new_size > 0 {
            let mmap = unsafe {
                MmapOptions::new()
                    .len(new_size as usize)
                    .map_mut(&self.file)
                    .map_err(|_| Status::IoError)?
            };
            self.mmap = Some(mmap);
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, offset: u64, len: usize) -> Result<(), Status> {
        let required = offset + len as u64;
        if required > self.size {
            let new_size = required.div_ceil(GROWTH_CHUNK) * GROWTH_CHUNK;
            self.resize_and_remap(new_size)?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Status> {
        self.ensure_capacity(offset, data.len())?;
        match self.mmap.as_mut() {
            Some(mmap) => {
                let start = offset as usize;
                mmap[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            None => Err(Status::IoError),
        }
    }

    /// Bytes past the mapped size are zero-filled, mirroring aligned reads
    /// over a file tail.
    fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        match self.mmap.as_ref() {
            Some(mmap) => {
                let start = (offset as usize).min(mmap.len());
                let available = buf.len().min(mmap.len() - start);
                buf[..available].copy_from_slice(&mmap[start..start + available]);
                buf[available..].fill(0);
                available
            }
            None => {
                buf.fill(0);
                0
            }
        }
    }
}

/// A [`Disk`] over two memory-mapped files: a dense main-log file and an
/// object file in which segment `s` occupies the byte range
/// `[s * segment_size, (s + 1) * segment_size)`. Completions run inline.
pub struct MmapDisk {
    sector_size: u32,
    segment_size: u64,
    log: RwLock<MmapFile>,
    objects: RwLock<MmapFile>,
}

impl MmapDisk {
    pub fn new(root_path: &str, sector_size: u32, segment_size: u64) -> Result<Self, Status> {
        let root = Path::new(root_path);
        if !root.exists() {
            std::fs::create_dir_all(root).map_err(|_| Status::IoError)?;
        }
        Ok(Self {
            sector_size,
            segment_size,
            log: RwLock::new(MmapFile::open(&root.join("hlog.mmap"))?),
            objects: RwLock::new(MmapFile::open(&root.join("hlog.obj.mmap"))?),
        })
    }
}

impl Disk for MmapDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn write_async(
        &self,
        source: ConstPtr,
        length: u32,
        dest_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        let data = unsafe { source.as_slice(length as usize) };
        let status = match self.log.write().write(dest_offset, data) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        };
        callback(status as u32, if status.is_error() { 0 } else { length });
        status
    }

    fn read_async(
        &self,
        source_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        let buf = unsafe { dest.as_mut_slice(length as usize) };
        let n = self.log.read().read(source_offset, buf);
        callback(0, n as u32);
        Status::Ok
    }

    fn write_segment_async(
        &self,
        segment: u64,
        source: ConstPtr,
        length: u32,
        intra_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        debug_assert!(intra_offset + u64::from(length) <= self.segment_size);
        let data = unsafe { source.as_slice(length as usize) };
        let offset = segment * self.segment_size + intra_offset;
        let status = match self.objects.write().write(offset, data) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        };
        callback(status as u32, if status.is_error() { 0 } else { length });
        status
    }

    fn read_segment_async(
        &self,
        segment: u64,
        intra_offset: u64,
        dest: MutPtr,
        length: u32,
        callback: IoCompletion,
    ) -> Status {
        let buf = unsafe { dest.as_mut_slice(length as usize) };
        let offset = segment * self.segment_size + intra_offset;
        let n = self.objects.read().read(offset, buf);
        callback(0, n as u32);
        Status::Ok
    }

    fn delete_segment_range(&self, from_segment: u64, to_segment: u64) -> Status {
        // The mapping is dense, so deletion zeroes the dead ranges instead of
        // dropping files.
        let mut objects = self.objects.write();
        for segment in from_segment..to_segment {
            let offset = segment * self.segment_size;
            if offset >= objects.size {
                break;
            }
            let len = self.segment_size.min(objects.size - offset) as usize;
            if let Some(mmap) = objects.mmap.as_mut() {
                mmap[offset as usize..offset as usize + len].fill(0);
            }
        }
        Status::Ok
    }
}
