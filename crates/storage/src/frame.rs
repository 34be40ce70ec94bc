use core::fmt;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    page::{INVALID_PAGE_ID, PAGE_SIZE},
    typedef::PageId,
};

/// A buffer pool frame: one page-sized buffer plus the metadata the pool
/// tracks for it.
///
/// The buffer sits in an `UnsafeCell` so handles can reach it through a
/// shared borrow: read handles take the frame latch shared, the write handle
/// takes it exclusively and is the only caller of [`Self::data_latched_mut`].
/// The pool itself installs and clears page images through `&mut PageFrame`
/// while a frame has no handles, which needs no latch at all. Basic
/// (unlatched) handles get a raw peek through [`Self::data`] and must not
/// overlap a write handle to the same page.
//
// repr(C) keeps the page buffer at offset 0 so on-page structs can be cast
// in place with an alignment guarantee.
#[repr(C, align(8))]
pub struct PageFrame {
    data: UnsafeCell<[u8; PAGE_SIZE]>,
    page_id: PageId,
    is_dirty: bool,
    pin_cnt: AtomicU16,
    latch: RwLock<()>,
}

// SAFETY: the only interior mutability is the page buffer, and every write to
// it goes through `&mut PageFrame` or the frame's exclusive latch.
unsafe impl Sync for PageFrame {}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("page_id", &self.page_id)
            .field("is_dirty", &self.is_dirty)
            .field("pin_cnt", &self.pin_cnt.load(Ordering::SeqCst))
            .finish()
    }
}

impl PageFrame {
    /// Creates a new, unoccupied frame.
    pub(crate) fn new() -> Self {
        Self {
            data: UnsafeCell::new([0; PAGE_SIZE]),
            page_id: INVALID_PAGE_ID,
            is_dirty: false,
            pin_cnt: AtomicU16::new(0),
            latch: RwLock::new(()),
        }
    }

    /// Returns the id of the resident page.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Whether the in-memory copy may diverge from the on-disk copy.
    pub(crate) fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Returns the current pin count.
    pub(crate) fn pin_count(&self) -> u16 {
        self.pin_cnt.load(Ordering::Acquire)
    }

    /// Takes one more pin on the frame.
    pub(crate) fn pin(&self) {
        self.pin_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one pin, returning the count that remains. Panics if the
    /// frame was not pinned.
    pub(crate) fn unpin(&self) -> u16 {
        let old = self.pin_cnt.fetch_sub(1, Ordering::SeqCst);
        if old == 0 {
            panic!(
                "Page {} was unpinned more often than it was pinned",
                self.page_id
            );
        }
        old - 1
    }

    /// Marks the in-memory copy as diverging from disk.
    pub(crate) fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Marks the frame clean after a successful flush.
    pub(crate) fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Installs a page image in this frame: the buffer takes the image
    /// (zero-padded to the page size), the metadata is reset, and the frame
    /// starts out clean with a single pin held by the caller.
    pub(crate) fn load(&mut self, page_id: PageId, image: &[u8]) {
        let data = self.data.get_mut();
        data[..image.len()].copy_from_slice(image);
        data[image.len()..].fill(0);
        self.page_id = page_id;
        self.is_dirty = false;
        self.pin_cnt.store(1, Ordering::Release);
    }

    /// Returns the frame to its unoccupied state.
    pub(crate) fn clear(&mut self) {
        self.data.get_mut().fill(0);
        self.page_id = INVALID_PAGE_ID;
        self.is_dirty = false;
        self.pin_cnt.store(0, Ordering::Release);
    }

    /// Read-only view of the page bytes.
    ///
    /// The buffer is only written under the frame's exclusive latch or
    /// through `&mut PageFrame`, so readers holding the shared latch see a
    /// stable slice. An unlatched caller must not overlap a write handle to
    /// the same page.
    pub fn data(&self) -> &[u8] {
        // SAFETY: writers hold the exclusive latch (or `&mut PageFrame`),
        // per the contract above.
        unsafe { &*self.data.get() }
    }

    /// Mutable view of the page bytes for the write handle.
    ///
    /// # Safety
    /// The caller must hold this frame's exclusive latch for as long as the
    /// returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_latched_mut(&self) -> &mut [u8] {
        &mut *self.data.get()
    }

    /// Acquires the frame latch in shared mode.
    pub(crate) fn latch_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.latch.read().unwrap()
    }

    /// Acquires the frame latch in exclusive mode.
    pub(crate) fn latch_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.latch.write().unwrap()
    }
}
