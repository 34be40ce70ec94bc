use crate::frame_handle::{PageFrameMutHandle, PageRead, PageWrite};
use crate::index::KeyComparator;
use crate::page::PAGE_SIZE;
use crate::typedef::PageId;
use bytemuck::{Pod, Zeroable};
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::mem;

#[repr(C)]
#[derive(Pod, Zeroable, Copy, Clone)]
pub(crate) struct HashBucketHeader {
    size: u32,
    max_size: u32,
}

pub(crate) const HASH_BUCKET_HEADER_SIZE: usize = mem::size_of::<HashBucketHeader>();

/// The number of `(key, value)` pairs a bucket page can hold.
pub const fn hash_bucket_capacity<K, V>() -> usize {
    (PAGE_SIZE - HASH_BUCKET_HEADER_SIZE) / (mem::size_of::<K>() + mem::size_of::<V>())
}

/// A hash table bucket: `(key, value)` pairs packed in insertion order.
///
/// ```text
/// | size (4) | max_size (4) | key_0 | value_0 | key_1 | value_1 | ... |
/// ```
///
/// Pairs are read and written as unaligned `Pod` copies, so arbitrary key and
/// value types work without padding concerns.
pub struct HashBucketPage<T, K, V> {
    page_frame_handle: T,
    _marker: PhantomData<(K, V)>,
}

impl<T, K, V> HashBucketPage<T, K, V>
where
    T: PageRead,
    K: Pod,
    V: Pod,
{
    pub fn page_id(&self) -> PageId {
        self.page_frame_handle.page_id()
    }

    fn header(&self) -> &HashBucketHeader {
        bytemuck::from_bytes(&self.page_frame_handle.data()[..HASH_BUCKET_HEADER_SIZE])
    }

    pub fn size(&self) -> u32 {
        self.header().size
    }

    pub fn max_size(&self) -> u32 {
        self.header().max_size
    }

    pub fn is_full(&self) -> bool {
        self.header().size >= self.header().max_size
    }

    pub fn is_empty(&self) -> bool {
        self.header().size == 0
    }

    fn entry_offset(idx: u32) -> usize {
        HASH_BUCKET_HEADER_SIZE + idx as usize * (mem::size_of::<K>() + mem::size_of::<V>())
    }

    /// The key of the entry at `idx`.
    pub fn key_at(&self, idx: u32) -> K {
        assert!(idx < self.size());
        let offset = Self::entry_offset(idx);
        bytemuck::pod_read_unaligned(
            &self.page_frame_handle.data()[offset..offset + mem::size_of::<K>()],
        )
    }

    /// The value of the entry at `idx`.
    pub fn value_at(&self, idx: u32) -> V {
        assert!(idx < self.size());
        let offset = Self::entry_offset(idx) + mem::size_of::<K>();
        bytemuck::pod_read_unaligned(
            &self.page_frame_handle.data()[offset..offset + mem::size_of::<V>()],
        )
    }

    /// Finds the slot holding `key`, if present.
    fn find<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> Option<u32> {
        (0..self.size()).find(|&idx| cmp.compare(&self.key_at(idx), key) == Ordering::Equal)
    }

    /// Looks up the value stored for `key`.
    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> Option<V> {
        self.find(key, cmp).map(|idx| self.value_at(idx))
    }
}

impl<T, K, V> HashBucketPage<T, K, V>
where
    T: PageWrite,
    K: Pod,
    V: Pod,
{
    fn header_mut(&mut self) -> &mut HashBucketHeader {
        bytemuck::from_bytes_mut(&mut self.page_frame_handle.data_mut()[..HASH_BUCKET_HEADER_SIZE])
    }

    /// Must be called on a freshly allocated page before any other use.
    /// `max_size` is clamped to what the page can physically hold.
    pub fn init(&mut self, max_size: u32) {
        let capacity = hash_bucket_capacity::<K, V>() as u32;
        let header = self.header_mut();
        header.size = 0;
        header.max_size = max_size.min(capacity);
    }

    /// Appends `(key, value)` unless the bucket is full or the key is already
    /// present.
    pub fn insert<C: KeyComparator<K>>(&mut self, key: &K, value: &V, cmp: &C) -> bool {
        if self.is_full() || self.find(key, cmp).is_some() {
            return false;
        }

        let idx = self.size();
        let offset = Self::entry_offset(idx);
        let key_size = mem::size_of::<K>();
        let value_size = mem::size_of::<V>();
        let data = self.page_frame_handle.data_mut();
        data[offset..offset + key_size].copy_from_slice(bytemuck::bytes_of(key));
        data[offset + key_size..offset + key_size + value_size]
            .copy_from_slice(bytemuck::bytes_of(value));
        self.header_mut().size = idx + 1;
        true
    }

    /// Removes the entry for `key`, returning whether it was found.
    pub fn remove<C: KeyComparator<K>>(&mut self, key: &K, cmp: &C) -> bool {
        match self.find(key, cmp) {
            Some(idx) => {
                self.remove_at(idx);
                true
            }
            None => false,
        }
    }

    /// Removes the entry at `idx`, shifting later entries left so insertion
    /// order is preserved.
    pub fn remove_at(&mut self, idx: u32) {
        let size = self.size();
        assert!(idx < size);
        let entry_size = mem::size_of::<K>() + mem::size_of::<V>();
        let start = Self::entry_offset(idx);
        let end = Self::entry_offset(size - 1) + entry_size;
        self.page_frame_handle
            .data_mut()
            .copy_within(start + entry_size..end, start);
        self.header_mut().size = size - 1;
    }
}

/// Type alias for a mutable bucket page view. The index always traverses
/// buckets through write handles.
pub type HashBucketPageMut<'a, K, V> = HashBucketPage<PageFrameMutHandle<'a>, K, V>;

impl<'a, K, V> From<PageFrameMutHandle<'a>> for HashBucketPageMut<'a, K, V> {
    fn from(page_frame_handle: PageFrameMutHandle<'a>) -> Self {
        HashBucketPage {
            page_frame_handle,
            _marker: PhantomData,
        }
    }
}
