use crate::frame_handle::{PageFrameMutHandle, PageRead, PageWrite};
use crate::page::{INVALID_PAGE_ID, PAGE_SIZE};
use crate::typedef::PageId;
use bytemuck::{Pod, Zeroable};
use std::mem;

/// The deepest directory this layout supports; `max_depth` is clamped to it.
pub const HASH_DIRECTORY_MAX_DEPTH: u32 = 9;
pub(crate) const HASH_DIRECTORY_ARRAY_SIZE: usize = 1 << HASH_DIRECTORY_MAX_DEPTH;

/// On-page layout of a hash table directory.
///
/// ```text
/// | max_depth (4) | global_depth (4) | local_depths (512) | bucket_page_ids (4 * 512) |
/// ```
#[repr(C)]
#[derive(Pod, Zeroable, Copy, Clone)]
pub(crate) struct HashDirectoryLayout {
    max_depth: u32,
    global_depth: u32,
    local_depths: [u8; HASH_DIRECTORY_ARRAY_SIZE],
    bucket_page_ids: [PageId; HASH_DIRECTORY_ARRAY_SIZE],
}

pub(crate) const HASH_DIRECTORY_LAYOUT_SIZE: usize = mem::size_of::<HashDirectoryLayout>();
const _: () = assert!(HASH_DIRECTORY_LAYOUT_SIZE <= PAGE_SIZE);

/// A hash table directory: maps the low `global_depth` bits of a hash to a
/// bucket page.
///
/// The directory always exposes `2^global_depth` slots. Every slot carries a
/// local depth, the number of hash bits that actually determine its bucket's
/// contents; all slots agreeing on the low `local_depth` bits reference the
/// same bucket page.
pub struct HashDirectoryPage<T> {
    page_frame_handle: T,
}

impl<T: PageRead> HashDirectoryPage<T> {
    pub fn page_id(&self) -> PageId {
        self.page_frame_handle.page_id()
    }

    fn layout(&self) -> &HashDirectoryLayout {
        bytemuck::from_bytes(&self.page_frame_handle.data()[..HASH_DIRECTORY_LAYOUT_SIZE])
    }

    pub fn max_depth(&self) -> u32 {
        self.layout().max_depth
    }

    pub fn global_depth(&self) -> u32 {
        self.layout().global_depth
    }

    /// Mask selecting the hash bits the directory currently indexes by.
    pub fn global_depth_mask(&self) -> u32 {
        (1 << self.layout().global_depth) - 1
    }

    /// The number of directory slots currently visible.
    pub fn size(&self) -> u32 {
        1 << self.layout().global_depth
    }

    /// The number of slots at the maximum depth.
    pub fn max_size(&self) -> u32 {
        1 << self.layout().max_depth
    }

    /// Maps a hash to its bucket slot using the low `global_depth` bits.
    pub fn hash_to_bucket_index(&self, hash: u32) -> u32 {
        hash & self.global_depth_mask()
    }

    pub fn bucket_page_id(&self, bucket_idx: u32) -> PageId {
        assert!(bucket_idx < self.size());
        self.layout().bucket_page_ids[bucket_idx as usize]
    }

    pub fn local_depth(&self, bucket_idx: u32) -> u32 {
        assert!(bucket_idx < self.size());
        self.layout().local_depths[bucket_idx as usize] as u32
    }

    /// The slot differing from `bucket_idx` in exactly the local-depth-th bit.
    pub fn split_image_index(&self, bucket_idx: u32) -> u32 {
        let local_depth = self.local_depth(bucket_idx);
        assert!(local_depth > 0, "A depth-0 bucket has no split image");
        bucket_idx ^ (1 << (local_depth - 1))
    }

    /// Checks the directory invariants, panicking on violation:
    /// every local depth is bounded by the global depth, and all slots that
    /// agree on the low `local_depth` bits reference the same bucket page
    /// with the same local depth.
    pub fn verify_integrity(&self) {
        let layout = self.layout();
        let size = self.size();
        for i in 0..size {
            let local_depth = layout.local_depths[i as usize] as u32;
            assert!(
                local_depth <= layout.global_depth,
                "Slot {} has local depth {} above global depth {}",
                i,
                local_depth,
                layout.global_depth
            );
            let bucket_page_id = layout.bucket_page_ids[i as usize];
            let local_mask = (1u32 << local_depth) - 1;
            for j in 0..size {
                if j & local_mask == i & local_mask {
                    assert_eq!(
                        layout.bucket_page_ids[j as usize], bucket_page_id,
                        "Slots {} and {} share low bits but reference different buckets",
                        i, j
                    );
                    assert_eq!(
                        layout.local_depths[j as usize] as u32, local_depth,
                        "Slots {} and {} share a bucket but disagree on local depth",
                        i, j
                    );
                }
            }
        }
    }
}

impl<T: PageWrite> HashDirectoryPage<T> {
    fn layout_mut(&mut self) -> &mut HashDirectoryLayout {
        bytemuck::from_bytes_mut(
            &mut self.page_frame_handle.data_mut()[..HASH_DIRECTORY_LAYOUT_SIZE],
        )
    }

    /// Must be called on a freshly allocated page before any other use.
    pub fn init(&mut self, max_depth: u32) {
        let layout = self.layout_mut();
        layout.max_depth = max_depth.min(HASH_DIRECTORY_MAX_DEPTH);
        layout.global_depth = 0;
        layout.local_depths.fill(0);
        layout.bucket_page_ids.fill(INVALID_PAGE_ID);
    }

    pub fn set_bucket_page_id(&mut self, bucket_idx: u32, bucket_page_id: PageId) {
        assert!(bucket_idx < self.size());
        self.layout_mut().bucket_page_ids[bucket_idx as usize] = bucket_page_id;
    }

    // The local depth may transiently exceed the global depth mid-split (it
    // is bumped before the directory doubles), so only bound it by max_depth.
    pub fn set_local_depth(&mut self, bucket_idx: u32, local_depth: u32) {
        assert!(bucket_idx < self.size());
        assert!(local_depth <= self.layout().max_depth);
        self.layout_mut().local_depths[bucket_idx as usize] = local_depth as u8;
    }

    pub fn incr_local_depth(&mut self, bucket_idx: u32) {
        let local_depth = self.local_depth(bucket_idx);
        self.set_local_depth(bucket_idx, local_depth + 1);
    }

    /// Doubles the directory. Every new slot inherits the bucket page id and
    /// local depth of the slot it mirrors.
    pub fn incr_global_depth(&mut self) {
        let old_size = self.size() as usize;
        let layout = self.layout_mut();
        assert!(
            layout.global_depth < layout.max_depth,
            "Directory cannot grow past its max depth"
        );
        for i in 0..old_size {
            layout.bucket_page_ids[old_size + i] = layout.bucket_page_ids[i];
            layout.local_depths[old_size + i] = layout.local_depths[i];
        }
        layout.global_depth += 1;
    }
}

/// Type alias for a mutable directory page view. The index always traverses
/// directories through write handles.
pub type HashDirectoryPageMut<'a> = HashDirectoryPage<PageFrameMutHandle<'a>>;

impl<'a> From<PageFrameMutHandle<'a>> for HashDirectoryPageMut<'a> {
    fn from(page_frame_handle: PageFrameMutHandle<'a>) -> Self {
        HashDirectoryPage { page_frame_handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use crate::disk::disk_manager::DiskManager;
    use crate::replacer::lru_k_replacer::LrukReplacer;
    use loamdb_error::assert_errors;
    use serial_test::serial;
    use std::sync::{Arc, Mutex, RwLock};

    fn get_bpm_arc(file_name: &str) -> Arc<RwLock<BufferPoolManager>> {
        let disk_manager = Arc::new(Mutex::new(DiskManager::new(file_name).unwrap()));
        let replacer = Box::new(LrukReplacer::new(10, 2));
        Arc::new(RwLock::new(BufferPoolManager::new(
            10,
            disk_manager,
            replacer,
        )))
    }

    #[test]
    #[serial]
    fn test_directory_page_init() {
        let bpm = get_bpm_arc("hash_directory_test.db");

        let handle = BufferPoolManager::create_page_handle(&bpm)
            .expect("create failed")
            .upgrade_write();
        let mut directory = HashDirectoryPageMut::from(handle);
        directory.init(3);

        assert_eq!(directory.global_depth(), 0);
        assert_eq!(directory.size(), 1);
        assert_eq!(directory.max_size(), 8);
        assert_eq!(directory.global_depth_mask(), 0);
        assert_eq!(directory.bucket_page_id(0), INVALID_PAGE_ID);
        assert_eq!(directory.local_depth(0), 0);

        // Depth 0: every hash maps to the only slot.
        assert_eq!(directory.hash_to_bucket_index(0xDEAD_BEEF), 0);

        directory.set_bucket_page_id(0, 7);
        directory.verify_integrity();
    }

    #[test]
    #[serial]
    fn test_directory_page_growth_copies_slots() {
        let bpm = get_bpm_arc("hash_directory_grow_test.db");

        let handle = BufferPoolManager::create_page_handle(&bpm)
            .expect("create failed")
            .upgrade_write();
        let mut directory = HashDirectoryPageMut::from(handle);
        directory.init(3);
        directory.set_bucket_page_id(0, 11);

        directory.incr_global_depth();
        assert_eq!(directory.global_depth(), 1);
        assert_eq!(directory.size(), 2);
        // The new slot inherited its sibling's bucket.
        assert_eq!(directory.bucket_page_id(1), 11);
        assert_eq!(directory.local_depth(1), 0);
        directory.verify_integrity();

        // Split slot 0 away from slot 1.
        directory.incr_local_depth(0);
        directory.set_local_depth(1, 1);
        assert_eq!(directory.split_image_index(0), 1);
        assert_eq!(directory.split_image_index(1), 0);
        directory.set_bucket_page_id(1, 12);
        directory.verify_integrity();

        assert_eq!(directory.hash_to_bucket_index(6), 0);
        assert_eq!(directory.hash_to_bucket_index(9), 1);
    }

    #[test]
    #[serial]
    fn test_directory_page_growth_is_bounded() {
        let bpm = get_bpm_arc("hash_directory_bound_test.db");

        let handle = BufferPoolManager::create_page_handle(&bpm)
            .expect("create failed")
            .upgrade_write();
        let mut directory = HashDirectoryPageMut::from(handle);
        directory.init(1);
        directory.set_bucket_page_id(0, 3);

        directory.incr_global_depth();
        assert_eq!(directory.size(), directory.max_size());
        assert_errors!(directory.incr_global_depth());
    }

    #[test]
    #[serial]
    fn test_directory_page_integrity_detects_violations() {
        let bpm = get_bpm_arc("hash_directory_violation_test.db");

        let handle = BufferPoolManager::create_page_handle(&bpm)
            .expect("create failed")
            .upgrade_write();
        let mut directory = HashDirectoryPageMut::from(handle);
        directory.init(2);
        directory.set_bucket_page_id(0, 3);
        directory.incr_global_depth();

        // Slots 0 and 1 share local depth 0 but point at different buckets.
        directory.set_bucket_page_id(1, 4);
        assert_errors!(directory.verify_integrity());
    }
}
