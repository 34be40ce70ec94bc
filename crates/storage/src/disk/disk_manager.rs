use crate::page::PAGE_SIZE;
use crate::typedef::PageId;
use crate::Result;
use bytes::{Bytes, BytesMut};
use fs2::FileExt;
use loamdb_error::{errdata, errinput, Error};
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub(crate) const DATA_DIR: &str = "src/disk/data/";

/// Byte-level access to the page file. Page N occupies bytes
/// `[N * PAGE_SIZE, (N + 1) * PAGE_SIZE)`.
///
/// Not thread-safe; the disk scheduler's worker is the sole caller.
#[derive(Debug)]
pub struct DiskManager {
    file: RefCell<std::fs::File>,
    /// The maximum capacity (in pages) that the file can hold before we resize it.
    page_capacity: usize,
}

impl DiskManager {
    /// Creates a new disk manager for the given database file `filename`.
    /// The file is truncated and locked exclusively at creation.
    pub fn new(filename: &str) -> Result<Self> {
        let path = Path::new(DATA_DIR).join(filename);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::IO(format!("Unable to create {}: {}", dir.display(), e)))?;
        }

        // Open or create the file, truncating it
        let file = std::fs::OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::IO(format!("Unable to open file {}: {}", path.display(), e)))?;

        // Acquire an exclusive lock on the file at creation
        file.lock_exclusive()
            .map_err(|e| Error::IO(format!("Failed to acquire exclusive file lock: {}", e)))?;

        let dm = Self {
            file: RefCell::new(file),
            page_capacity: 32, // Start with 32 as the default capacity
        };

        // Initialize the file with enough space for `page_capacity` pages
        dm.resize_file()?;

        Ok(dm)
    }

    /// Reads a page. Pages beyond the written region read as zeroes.
    pub(crate) fn read(&mut self, page_id: PageId) -> Result<Bytes> {
        if page_id < 0 {
            return errinput!("Cannot read invalid page id {}", page_id);
        }
        let offset = page_id as u64 * PAGE_SIZE as u64;

        let mut file = self.file.borrow_mut();
        let file_size = file.metadata()?.len();
        let mut bytes = BytesMut::zeroed(PAGE_SIZE);
        if offset + PAGE_SIZE as u64 <= file_size {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut bytes)?;
        }
        Ok(bytes.freeze())
    }

    /// Writes data to a page. Must not exceed PAGE_SIZE.
    pub(crate) fn write(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if page_id < 0 {
            return errinput!("Cannot write invalid page id {}", page_id);
        }
        if data.len() > PAGE_SIZE {
            return errdata!("Page data must fit in a page.");
        }

        // Double the capacity until the target page fits.
        if page_id as usize >= self.page_capacity {
            while page_id as usize >= self.page_capacity {
                self.page_capacity *= 2;
            }
            self.resize_file()?;
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_all()?;

        Ok(())
    }

    /// Syncs any outstanding writes to the file.
    pub fn shut_down(&self) -> Result<()> {
        self.file.borrow().sync_all()?;
        Ok(())
    }

    /// Resizes the underlying file to `page_capacity * PAGE_SIZE` bytes.
    fn resize_file(&self) -> Result<()> {
        let size = self.page_capacity as u64 * PAGE_SIZE as u64;
        let file = self.file.borrow();
        file.set_len(size)
            .map_err(|e| Error::IO(format!("Failed to resize file: {}", e)))?;
        Ok(())
    }

    /// Returns the current size of the database file.
    pub fn get_db_file_size(&self) -> Result<u64> {
        let file = self.file.borrow();
        file.metadata()
            .map(|meta| meta.len())
            .map_err(|e| Error::IO(format!("Failed to get file size: {}", e)))
    }
}

impl Drop for DiskManager {
    /// We unlock the file when the DiskManager is dropped.
    ///
    /// This ensures that while the DiskManager is running, it has exclusive access
    /// to the database file, preventing other processes from modifying it concurrently.
    /// When the DiskManager is dropped, we release the lock so that other processes
    /// (or a new instance of DiskManager) can access the file safely.
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&*self.file.borrow()) {
            panic!("Failed to unlock file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_disk_manager_write_read_roundtrip() {
        let mut dm = DiskManager::new("disk_manager_test.db").unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[..5].copy_from_slice(b"hello");
        page[PAGE_SIZE - 1] = 0xAB;

        dm.write(3, &page).unwrap();
        let read = dm.read(3).unwrap();
        assert_eq!(&read[..], &page[..]);

        // Pages that were never written read as zeroes.
        let empty = dm.read(7).unwrap();
        assert!(empty.iter().all(|&b| b == 0));
    }

    #[test]
    #[serial]
    fn test_disk_manager_grows_file() {
        let mut dm = DiskManager::new("disk_manager_grow_test.db").unwrap();
        let initial_size = dm.get_db_file_size().unwrap();

        let page = vec![0x5Au8; PAGE_SIZE];
        dm.write(100, &page).unwrap();

        assert!(dm.get_db_file_size().unwrap() > initial_size);
        assert_eq!(&dm.read(100).unwrap()[..], &page[..]);
    }

    #[test]
    #[serial]
    fn test_disk_manager_rejects_oversized_write() {
        let mut dm = DiskManager::new("disk_manager_oversize_test.db").unwrap();
        let oversized = vec![0u8; PAGE_SIZE + 1];
        assert!(dm.write(0, &oversized).is_err());
        assert!(dm.write(-1, &oversized[..PAGE_SIZE]).is_err());
    }
}
