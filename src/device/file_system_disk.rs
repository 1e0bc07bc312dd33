use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::status::Status;
use crate::device::{ConstPtr, Disk, IoCompletion, MutPtr};
use crate::environment::file::{File, FileCreateDisposition, FileOptions};

/// A [`Disk`] backed by the local file system: one dense file for the main
/// log and one file per object-log segment. Operations execute synchronously
/// on the calling thread and run their completion inline; wrap the disk in
/// [`crate::device::ThreadPoolDisk`] for true asynchrony.
pub struct FileSystemDisk {
    root_path: String,
    sector_size: u32,
    log: Mutex<File>,
    segments: DashMap<u64, Arc<Mutex<File>>, ahash::RandomState>,
}

impl FileSystemDisk {
    pub fn new(root_path: &str, sector_size: u32) -> Result<Self, Status> {
        let path = Path::new(root_path);
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|_| Status::IoError)?;
        }
        let log_path = path.join("hlog.log");
        let mut log = File::new(log_path.to_str().ok_or(Status::IoError)?);
        log.open(FileCreateDisposition::OpenOrCreate, FileOptions::default())?;

        Ok(Self {
            root_path: root_path.to_string(),
            sector_size,
            log: Mutex::new(log),
            segments: DashMap::with_hasher(ahash::RandomState::new()),
        })
    }

    fn segment_path(&self, segment: u64) -> String {
        format!("{}/hlog.obj.{}", self.root_path, segment)
    }

    fn segment_file(&self, segment: u64) -> Result<Arc<Mutex<File>>, Status> {
        if let Some(existing) = self.segments.get(&segment) {
            return Ok(existing.clone());
        }
        let mut file = File::new(&self.segment_path(segment));
        file.open(FileCreateDisposition::OpenOrCreate, FileOptions::default())?;
        let file = Arc::new(Mutex::new(file));
        Ok(self
            .segments
            .entry(segment)
            .or_insert(file)
            .value()
            .clone())
    }
}

impl Disk for FileSystemDisk {
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
        debug_assert_eq!(dest_offset % u64::from(self.sector_size), 0);
        debug_assert_eq!(length % self.sector_size, 0);

        let data = unsafe { source.as_slice(length as usize) };
        let status = match self.log.lock().write(dest_offset, data) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        };

        // Inline completion.
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
        debug_assert_eq!(source_offset % u64::from(self.sector_size), 0);
        debug_assert_eq!(length % self.sector_size, 0);

        let buf = unsafe { dest.as_mut_slice(length as usize) };
        match self.log.lock().read(source_offset, buf) {
            Ok(n) => {
                callback(0, n as u32);
                Status::Ok
            }
            Err(status) => {
                callback(status as u32, 0);
                status
            }
        }
    }

    fn write_segment_async(
        &self,
        segment: u64,
        source: ConstPtr,
        length: u32,
        intra_offset: u64,
        callback: IoCompletion,
    ) -> Status {
        debug_assert_eq!(intra_offset % u64::from(self.sector_size), 0);

        let data = unsafe { source.as_slice(length as usize) };
        let status = match self.segment_file(segment) {
            Ok(file) => match file.lock().write(intra_offset, data) {
                Ok(()) => Status::Ok,
                Err(status) => status,
            },
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
        debug_assert_eq!(intra_offset % u64::from(self.sector_size), 0);

        let buf = unsafe { dest.as_mut_slice(length as usize) };
        match self.segment_file(segment) {
            Ok(file) => match file.lock().read(intra_offset, buf) {
                Ok(n) => {
                    callback(0, n as u32);
                    Status::Ok
                }
                Err(status) => {
                    callback(status as u32, 0);
                    status
                }
            },
            Err(status) => {
                callback(status as u32, 0);
                status
            }
        }
    }

    fn delete_segment_range(&self, from_segment: u64, to_segment: u64) -> Status {
        for segment in from_segment..to_segment {
            self.segments.remove(&segment);
            let path = self.segment_path(segment);
            if Path::new(&path).exists() && std::fs::remove_file(&path).is_err() {
                log::warn!("failed to delete object-log segment {}", segment);
                return Status::IoError;
            }
        }
        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn completion_expecting(expected_error: u32) -> IoCompletion {
        Box::new(move |error, _bytes| assert_eq!(error, expected_error))
    }

    #[test]
    fn test_dense_write_read() {
        let dir = tempdir().unwrap();
        let disk = FileSystemDisk::new(dir.path().to_str().unwrap(), 512).unwrap();

        let data = vec![7u8; 1024];
        disk.write_async(ConstPtr(data.as_ptr()), 1024, 512, completion_expecting(0));

        let mut out = vec![0u8; 1024];
        disk.read_async(512, MutPtr(out.as_mut_ptr()), 1024, completion_expecting(0));
        assert_eq!(out, data);
    }

    #[test]
    fn test_segment_isolation() {
        let dir = tempdir().unwrap();
        let disk = FileSystemDisk::new(dir.path().to_str().unwrap(), 512).unwrap();

        let a = vec![1u8; 512];
        let b = vec![2u8; 512];
        disk.write_segment_async(0, ConstPtr(a.as_ptr()), 512, 0, completion_expecting(0));
        disk.write_segment_async(1, ConstPtr(b.as_ptr()), 512, 0, completion_expecting(0));

        let mut out = vec![0u8; 512];
        disk.read_segment_async(1, 0, MutPtr(out.as_mut_ptr()), 512, completion_expecting(0));
        assert_eq!(out, b);
    }

    #[test]
    fn test_delete_segment_range() {
        let dir = tempdir().unwrap();
        let disk = FileSystemDisk::new(dir.path().to_str().unwrap(), 512).unwrap();

        let data = vec![3u8; 512];
        for segment in 0..3 {
            disk.write_segment_async(
                segment,
                ConstPtr(data.as_ptr()),
                512,
                0,
                completion_expecting(0),
            );
        }
        assert_eq!(disk.delete_segment_range(0, 2), Status::Ok);
        assert!(!Path::new(&disk.segment_path(0)).exists());
        assert!(!Path::new(&disk.segment_path(1)).exists());
        assert!(Path::new(&disk.segment_path(2)).exists());
    }
}
