use bytes::{Bytes, BytesMut};
use loamdb_error::Error;
use log::debug;

use crate::disk::disk_manager::DiskManager;
use crate::disk::disk_scheduler::{DiskData, DiskRequest, DiskScheduler};
use crate::frame::PageFrame;
use crate::frame_handle::{PageFrameHandle, PageFrameMutHandle, PageFrameRefHandle};
use crate::page::PAGE_SIZE;
use crate::replacer::replacer::{AccessType, Replacer};
use crate::typedef::{FrameId, PageId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::Result;

/// Manages page allocation, caching, and eviction in the buffer pool.
///
/// All bookkeeping (page table, free list, pin counts, dirty bits) is
/// serialized by the `RwLock` the manager is shared behind; that lock stays
/// held across disk waits, so a frame picked for replacement is never visible
/// to a concurrent caller. Per-frame latches are independent of it and are
/// only ever acquired through page handles, after the pool lock is released.
#[derive(Debug)]
pub struct BufferPoolManager {
    frames: Vec<PageFrame>, // Storage for all frames in the buffer pool
    page_table: HashMap<PageId, FrameId>, // Maps page IDs to frame IDs
    replacer: Box<dyn Replacer>, // Handles page replacement policy (e.g., LRU-K)
    free_list: VecDeque<FrameId>, // List of free frames
    disk_scheduler: DiskScheduler, // Serializes page I/O onto the disk worker
    next_page_id: AtomicI32, // The next page id to hand out
}

impl BufferPoolManager {
    /// Initializes the buffer pool with a given size.
    pub fn new(
        pool_size: usize,
        disk_manager: Arc<Mutex<DiskManager>>,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        frames.resize_with(pool_size, PageFrame::new);

        Self {
            frames,
            page_table: HashMap::new(),
            replacer,
            free_list: (0..pool_size).collect(),
            disk_scheduler: DiskScheduler::new(disk_manager),
            next_page_id: AtomicI32::new(0),
        }
    }

    /// Schedules a write of `data` and blocks until the worker confirms it.
    fn write_to_disk(scheduler: &DiskScheduler, page_id: PageId, data: &[u8]) {
        let (promise, future) = DiskScheduler::create_promise();
        scheduler.schedule(DiskRequest {
            page_id,
            data: DiskData::Write(Bytes::copy_from_slice(data)),
            done: promise,
        });
        let _ok = future.wait();
        debug_assert!(_ok, "Disk write for page {} failed", page_id);
    }

    /// Schedules a read of `page_id` and blocks until the page image arrives.
    fn read_from_disk(scheduler: &DiskScheduler, page_id: PageId) -> BytesMut {
        let buffer = Arc::new(Mutex::new(BytesMut::zeroed(PAGE_SIZE)));
        let (promise, future) = DiskScheduler::create_promise();
        scheduler.schedule(DiskRequest {
            page_id,
            data: DiskData::Read(Arc::clone(&buffer)),
            done: promise,
        });
        let _ok = future.wait();
        debug_assert!(_ok, "Disk read for page {} failed", page_id);
        // The worker releases its clone of the buffer before fulfilling the
        // promise, so we are the sole owner again.
        let buffer = Arc::into_inner(buffer).expect("read buffer still shared");
        buffer.into_inner().unwrap()
    }

    /// Returns a free frame, evicting a page if necessary.
    fn get_free_frame(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.pop_front() {
            return Ok(frame_id);
        }

        // Evict a page if no free frames are available
        let frame_id = self.replacer.evict().ok_or(Error::BufferPoolError(
            "No evictable frame in buffer pool".to_string(),
        ))?;
        let scheduler = &self.disk_scheduler;
        let frame = &mut self.frames[frame_id];
        assert_eq!(
            frame.pin_count(),
            0,
            "If page is evicted from replacer, its pin count must be 0."
        );

        // Write dirty page back to disk before eviction
        if frame.is_dirty() {
            debug!("evicting dirty page {} from frame {}", frame.page_id(), frame_id);
            Self::write_to_disk(scheduler, frame.page_id(), frame.data());
        }

        // Remove old page from the page table
        self.page_table.remove(&frame.page_id());

        // Reset the frame for reuse
        frame.clear();

        Ok(frame_id)
    }

    /// Allocates a new page and loads it into a free frame. The returned frame
    /// is pinned once and not evictable.
    pub(crate) fn create_page(&mut self) -> Result<&PageFrame> {
        let frame_id = self.get_free_frame()?;

        // install a zeroed page image, pinned once for the caller
        let page_id = self.allocate_page();
        self.frames[frame_id].load(page_id, &[]);
        self.page_table.insert(page_id, frame_id);

        // update the replacer
        self.replacer.record_access(frame_id, AccessType::Unknown);
        self.replacer.set_evictable(frame_id, false);

        Ok(&self.frames[frame_id])
    }

    /// Pins the page in a frame, loading it from disk if it is not resident.
    pub(crate) fn fetch_page(
        &mut self,
        page_id: PageId,
        access_type: AccessType,
    ) -> Result<&PageFrame> {
        // check if the page is already in memory
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            self.frames[frame_id].pin();
            self.replacer.record_access(frame_id, access_type);
            self.replacer.set_evictable(frame_id, false);
            return Ok(&self.frames[frame_id]);
        }

        // if not: get a free frame and install the page image from disk
        let frame_id = self.get_free_frame()?;
        let image = Self::read_from_disk(&self.disk_scheduler, page_id);
        self.frames[frame_id].load(page_id, &image);

        // update page table and replacer
        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id, access_type);
        self.replacer.set_evictable(frame_id, false);

        Ok(&self.frames[frame_id])
    }

    /// Unpins a page, marking it evictable once the pin count reaches zero.
    ///
    /// Returns false (without side effects) if the page is not resident or its
    /// pin count is already zero. The dirty flag is only ever OR-ed in; a
    /// clean unpin never clears a dirty page.
    pub(crate) fn unpin_page(&mut self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return false;
        };
        let frame = &mut self.frames[frame_id];
        if frame.pin_count() == 0 {
            return false;
        }

        let remaining = frame.unpin();
        if is_dirty {
            frame.mark_dirty();
        }
        if remaining == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Flushes a specific page to disk, regardless of its dirty flag, and
    /// marks it clean.
    pub fn flush_page(&mut self, page_id: &PageId) -> Result<()> {
        if let Some(&frame_id) = self.page_table.get(page_id) {
            let scheduler = &self.disk_scheduler;
            let frame = &mut self.frames[frame_id];
            Self::write_to_disk(scheduler, *page_id, frame.data());
            frame.mark_clean();
            Ok(())
        } else {
            // page not in memory
            Err(Error::BufferPoolError(format!(
                "Page {:?} not found in buffer pool",
                page_id
            )))
        }
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&mut self) -> Result<()> {
        let page_ids: Vec<PageId> = self.page_table.keys().copied().collect();
        for page_id in page_ids {
            self.flush_page(&page_id)?;
        }
        Ok(())
    }

    /// Deletes a page from the buffer pool.
    ///
    /// A page that is not resident is trivially deleted. A pinned page cannot
    /// be deleted and the call fails with [`Error::PagePinned`].
    pub fn delete_page(&mut self, page_id: PageId) -> Result<()> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return Ok(());
        };
        if self.frames[frame_id].pin_count() > 0 {
            return Err(Error::PagePinned(page_id));
        }

        // remove from page table and replacer, then recycle the frame
        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        self.frames[frame_id].clear();
        self.free_list.push_back(frame_id);

        self.deallocate_page(page_id);
        Ok(())
    }

    /// Hands out the next page id. Page ids start at 0 and grow monotonically.
    pub(crate) fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Placeholder: page ids are never recycled by this core.
    fn deallocate_page(&self, _page_id: PageId) {}

    /// Returns the total number of frames in the buffer pool.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames that could hold a new page.
    pub fn free_frame_count(&self) -> usize {
        self.free_list.len() + self.replacer.size()
    }

    /// Returns the pin count of a page, or `None` if it is not resident.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u16> {
        let frame_id = self.page_table.get(&page_id)?;
        Some(self.frames[*frame_id].pin_count())
    }

    /// Returns whether a page is currently resident in the pool.
    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.page_table.contains_key(&page_id)
    }

    /// Creates a new page and returns a handle pinning it.
    pub fn create_page_handle(
        bpm: &Arc<RwLock<BufferPoolManager>>,
    ) -> Result<PageFrameHandle<'_>> {
        let page_frame = {
            let mut bpm_guard = bpm.write()?;
            // SAFETY:
            // The handle must pair a reference to the new frame with the lock
            // wrapping the BufferPoolManager, but `create_page()` borrows the
            // whole manager through `bpm_guard`, so the borrow checker will not
            // let both escape this block. We launder the frame reference
            // through a raw pointer instead. This is sound because the frames
            // vector is allocated once in `new()` and never grows or shrinks,
            // and the frame stays pinned (hence never evicted or reused) until
            // the returned handle unpins it on drop.
            let bpm_ptr = &mut *bpm_guard as *mut BufferPoolManager;
            unsafe { (*bpm_ptr).create_page()? }
        };

        Ok(PageFrameHandle::new(bpm, page_frame))
    }

    /// Fetches a handle pinning a page, without latching it.
    pub fn fetch_page_handle<'a>(
        bpm: &'a Arc<RwLock<BufferPoolManager>>,
        page_id: PageId,
    ) -> Result<PageFrameHandle<'a>> {
        let page_frame = {
            let mut bpm_guard = bpm.write()?;
            // SAFETY: see `create_page_handle`
            let bpm_ptr = &mut *bpm_guard as *mut BufferPoolManager;
            unsafe { (*bpm_ptr).fetch_page(page_id, AccessType::Unknown)? }
        };

        Ok(PageFrameHandle::new(bpm, page_frame))
    }

    /// Fetches a read handle to a page. The frame's shared latch is held for
    /// the life of the handle.
    pub fn fetch_page_ref_handle<'a>(
        bpm: &'a Arc<RwLock<BufferPoolManager>>,
        page_id: PageId,
    ) -> Result<PageFrameRefHandle<'a>> {
        let page_frame = {
            let mut bpm_guard = bpm.write()?;
            // SAFETY: see `create_page_handle`
            let bpm_ptr = &mut *bpm_guard as *mut BufferPoolManager;
            unsafe { (*bpm_ptr).fetch_page(page_id, AccessType::Unknown)? }
        };

        // The pool lock is released; the latch is acquired outside of it.
        Ok(PageFrameRefHandle::new(bpm, page_frame))
    }

    /// Fetches a write handle to a page. The frame's exclusive latch is held
    /// for the life of the handle.
    pub fn fetch_page_mut_handle<'a>(
        bpm: &'a Arc<RwLock<BufferPoolManager>>,
        page_id: PageId,
    ) -> Result<PageFrameMutHandle<'a>> {
        let page_frame = {
            let mut bpm_guard = bpm.write()?;
            // SAFETY: see `create_page_handle`
            let bpm_ptr = &mut *bpm_guard as *mut BufferPoolManager;
            unsafe { (*bpm_ptr).fetch_page(page_id, AccessType::Unknown)? }
        };

        // The pool lock is released; the latch is acquired outside of it.
        Ok(PageFrameMutHandle::new(bpm, page_frame))
    }
}
