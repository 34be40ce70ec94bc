use crate::buffer_pool::BufferPoolManager;
use crate::frame::PageFrame;
use crate::typedef::PageId;
use core::fmt;
use std::mem::ManuallyDrop;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read access to a pinned page. On-page structures are generic over this,
/// so they work behind any of the handle flavors.
pub trait PageRead {
    fn page_id(&self) -> PageId;
    fn data(&self) -> &[u8];
}

/// Write access to a pinned page, provided only by the handle that holds the
/// frame's exclusive latch.
pub trait PageWrite: PageRead {
    fn data_mut(&mut self) -> &mut [u8];
}

/// A handle that pins a page without latching it.
///
/// Dropping the handle unpins the page, allowing it to be evicted. Handles
/// are move-only: moving one transfers the pin, and the affine type system
/// makes releasing it twice impossible. An explicit release is spelled
/// `drop(handle)`.
///
/// Reads through a basic handle are unlatched. That is safe against the pool
/// (the pin keeps the frame resident and untouched), but not against a write
/// handle: callers must not hold a basic handle to a page another thread is
/// writing through [`PageFrameMutHandle`]. When readers and writers can
/// overlap, use [`PageFrameRefHandle`] instead.
pub struct PageFrameHandle<'a> {
    bpm: &'a Arc<RwLock<BufferPoolManager>>,
    page_frame: &'a PageFrame,
    is_dirty: bool,
}

impl fmt::Debug for PageFrameHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrameHandle")
            .field("page_frame", &self.page_frame)
            .finish()
    }
}

impl<'a> PageFrameHandle<'a> {
    pub(crate) fn new(bpm: &'a Arc<RwLock<BufferPoolManager>>, page_frame: &'a PageFrame) -> Self {
        PageFrameHandle {
            bpm,
            page_frame,
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_frame.page_id()
    }

    /// Read-only access to the page data, without a latch. See the type docs
    /// for when this is allowed to overlap other handles.
    pub fn data(&self) -> &[u8] {
        self.page_frame.data()
    }

    /// Acquires the frame's shared latch, transferring the pin into a read
    /// handle.
    pub fn upgrade_read(self) -> PageFrameRefHandle<'a> {
        let this = ManuallyDrop::new(self);
        PageFrameRefHandle::new(this.bpm, this.page_frame)
    }

    /// Acquires the frame's exclusive latch, transferring the pin into a
    /// write handle. Blocks until concurrent read handles are gone.
    pub fn upgrade_write(self) -> PageFrameMutHandle<'a> {
        let this = ManuallyDrop::new(self);
        PageFrameMutHandle::new(this.bpm, this.page_frame)
    }
}

impl Drop for PageFrameHandle<'_> {
    fn drop(&mut self) {
        self.bpm
            .write()
            .unwrap()
            .unpin_page(self.page_frame.page_id(), self.is_dirty);
    }
}

impl PageRead for PageFrameHandle<'_> {
    fn page_id(&self) -> PageId {
        self.page_frame.page_id()
    }

    fn data(&self) -> &[u8] {
        self.page_frame.data()
    }
}

/// A handle for a read-only `PageFrame`: a pin plus the frame's shared latch.
///
/// When the handle is dropped the latch is released first, then the page is
/// unpinned.
pub struct PageFrameRefHandle<'a> {
    bpm: &'a Arc<RwLock<BufferPoolManager>>,
    page_frame: &'a PageFrame,
    latch_guard: Option<RwLockReadGuard<'a, ()>>,
}

impl fmt::Debug for PageFrameRefHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrameRefHandle")
            .field("page_frame", &self.page_frame)
            .finish()
    }
}

impl<'a> PageFrameRefHandle<'a> {
    // Creates a new read-only page handle. Blocks until the shared latch is
    // available; the caller must not hold the pool lock.
    pub(crate) fn new(bpm: &'a Arc<RwLock<BufferPoolManager>>, page_frame: &'a PageFrame) -> Self {
        let latch_guard = page_frame.latch_shared();
        PageFrameRefHandle {
            bpm,
            page_frame,
            latch_guard: Some(latch_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_frame.page_id()
    }

    /// Read-only access to the page data, stable while the shared latch is
    /// held.
    pub fn data(&self) -> &[u8] {
        self.page_frame.data()
    }
}

impl Drop for PageFrameRefHandle<'_> {
    fn drop(&mut self) {
        // Drop the shared latch, then release the pin.
        self.latch_guard.take();
        self.bpm
            .write()
            .unwrap()
            .unpin_page(self.page_frame.page_id(), false);
    }
}

impl PageRead for PageFrameRefHandle<'_> {
    fn page_id(&self) -> PageId {
        self.page_frame.page_id()
    }

    fn data(&self) -> &[u8] {
        self.page_frame.data()
    }
}

/// A handle for exclusive page access: a pin plus the frame's exclusive
/// latch.
///
/// The latch is acquired before the handle exists, and mutable access to the
/// page bytes is derived from it ([`PageFrame::data_latched_mut`]); the
/// handle never holds a `&mut PageFrame`, so other pinned references to the
/// frame stay valid. The page is assumed modified: dropping the handle
/// releases the latch and unpins with the dirty flag set.
pub struct PageFrameMutHandle<'a> {
    bpm: &'a Arc<RwLock<BufferPoolManager>>,
    page_frame: &'a PageFrame,
    latch_guard: Option<RwLockWriteGuard<'a, ()>>,
}

impl fmt::Debug for PageFrameMutHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrameMutHandle")
            .field("page_frame", &self.page_frame)
            .finish()
    }
}

impl<'a> PageFrameMutHandle<'a> {
    // Creates a new mutable page handle. Blocks until the exclusive latch is
    // available; the caller must not hold the pool lock.
    pub(crate) fn new(bpm: &'a Arc<RwLock<BufferPoolManager>>, page_frame: &'a PageFrame) -> Self {
        let latch_guard = page_frame.latch_exclusive();
        PageFrameMutHandle {
            bpm,
            page_frame,
            latch_guard: Some(latch_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_frame.page_id()
    }

    pub fn data(&self) -> &[u8] {
        self.page_frame.data()
    }

    /// Mutable access to the page data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.latch_guard.is_some());
        // SAFETY: this handle holds the frame's exclusive latch for its whole
        // lifetime, and the returned slice cannot outlive the borrow of the
        // handle.
        unsafe { self.page_frame.data_latched_mut() }
    }

    /// Writes `bytes` into the page at the given offset.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        let data = self.data_mut();
        if offset + bytes.len() > data.len() {
            panic!("Write out of bounds");
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Drop for PageFrameMutHandle<'_> {
    fn drop(&mut self) {
        // Drop the exclusive latch, then release the pin, marking the page
        // dirty.
        self.latch_guard.take();
        self.bpm
            .write()
            .unwrap()
            .unpin_page(self.page_frame.page_id(), true);
    }
}

impl PageRead for PageFrameMutHandle<'_> {
    fn page_id(&self) -> PageId {
        self.page_frame.page_id()
    }

    fn data(&self) -> &[u8] {
        self.page_frame.data()
    }
}

impl PageWrite for PageFrameMutHandle<'_> {
    fn data_mut(&mut self) -> &mut [u8] {
        PageFrameMutHandle::data_mut(self)
    }
}
