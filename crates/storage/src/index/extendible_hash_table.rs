use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use crate::buffer_pool::BufferPoolManager;
use crate::index::{HashFunction, KeyComparator};
use crate::page::hash_bucket_page::HashBucketPageMut;
use crate::page::hash_directory_page::HashDirectoryPageMut;
use crate::page::hash_header_page::{HashHeaderPageMut, HashHeaderPageRef};
use crate::page::INVALID_PAGE_ID;
use crate::typedef::PageId;
use crate::Result;

/// A disk-backed extendible hash table mapping unique keys to single values.
///
/// The table is a composition of guarded page accesses: a header page routes
/// the top bits of a hash to a directory page, the directory routes the low
/// bits to a bucket page, and the bucket holds the `(key, value)` pairs.
/// Buckets split on overflow, doubling the directory when a bucket's local
/// depth has caught up with the global depth. Empty buckets are never merged
/// and the directory never shrinks.
///
/// Directories and buckets are always traversed through write handles, so
/// each traversal holds exclusive page latches in header-to-bucket order.
pub struct DiskExtendibleHashTable<K, V, C> {
    bpm: Arc<RwLock<BufferPoolManager>>,
    cmp: C,
    hash_fn: HashFunction<K>,
    header_page_id: PageId,
    directory_max_depth: u32,
    bucket_max_size: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> DiskExtendibleHashTable<K, V, C>
where
    K: Pod,
    V: Pod,
    C: KeyComparator<K>,
{
    /// Creates the table: a header page, plus a directory and an empty bucket
    /// wired to header slot 0. Other header slots are populated on the first
    /// insert routed to them.
    pub fn new(
        bpm: Arc<RwLock<BufferPoolManager>>,
        cmp: C,
        hash_fn: HashFunction<K>,
        header_max_depth: u32,
        directory_max_depth: u32,
        bucket_max_size: u32,
    ) -> Result<Self> {
        let header_page_id = {
            let header_handle = BufferPoolManager::create_page_handle(&bpm)?.upgrade_write();
            let header_page_id = header_handle.page_id();
            let mut header = HashHeaderPageMut::from(header_handle);
            header.init(header_max_depth);

            let directory_handle = BufferPoolManager::create_page_handle(&bpm)?.upgrade_write();
            let directory_page_id = directory_handle.page_id();
            let mut directory = HashDirectoryPageMut::from(directory_handle);
            directory.init(directory_max_depth);

            let bucket_handle = BufferPoolManager::create_page_handle(&bpm)?.upgrade_write();
            let bucket_page_id = bucket_handle.page_id();
            let mut bucket = HashBucketPageMut::<K, V>::from(bucket_handle);
            bucket.init(bucket_max_size);

            directory.set_bucket_page_id(0, bucket_page_id);
            directory.set_local_depth(0, 0);
            header.set_directory_page_id(0, directory_page_id);

            header_page_id
        };

        Ok(Self {
            bpm,
            cmp,
            hash_fn,
            header_page_id,
            directory_max_depth,
            bucket_max_size,
            _marker: PhantomData,
        })
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    fn hash(&self, key: &K) -> u32 {
        (self.hash_fn)(key)
    }

    /// Looks up the value stored for `key`, appending it to `result` on a hit.
    pub fn get_value(&self, key: &K, result: &mut Vec<V>) -> Result<bool> {
        let hash = self.hash(key);

        let header = HashHeaderPageRef::from(BufferPoolManager::fetch_page_handle(
            &self.bpm,
            self.header_page_id,
        )?);
        let directory_index = header.hash_to_directory_index(hash);
        let directory_page_id = header.directory_page_id(directory_index);
        if directory_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let directory = HashDirectoryPageMut::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            directory_page_id,
        )?);
        let bucket_index = directory.hash_to_bucket_index(hash);
        let bucket = HashBucketPageMut::<K, V>::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            directory.bucket_page_id(bucket_index),
        )?);

        match bucket.lookup(key, &self.cmp) {
            Some(value) => {
                result.push(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Inserts `(key, value)`, splitting the owning bucket at most once.
    ///
    /// Returns false when the key is already present, when the directory
    /// would have to grow past its maximum depth, or in the pathological case
    /// where a single split leaves every rehashed entry (and the new key) on
    /// the same side of a still-full bucket.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let hash = self.hash(key);

        let header = HashHeaderPageRef::from(BufferPoolManager::fetch_page_handle(
            &self.bpm,
            self.header_page_id,
        )?);
        let directory_index = header.hash_to_directory_index(hash);
        let mut directory_page_id = header.directory_page_id(directory_index);
        drop(header);

        if directory_page_id == INVALID_PAGE_ID {
            directory_page_id = self.insert_to_new_directory(directory_index)?;
        }

        let mut directory = HashDirectoryPageMut::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            directory_page_id,
        )?);
        let bucket_index = directory.hash_to_bucket_index(hash);
        let bucket_page_id = directory.bucket_page_id(bucket_index);
        let mut bucket = HashBucketPageMut::<K, V>::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            bucket_page_id,
        )?);

        if !bucket.is_full() {
            return Ok(bucket.insert(key, value, &self.cmp));
        }
        if bucket.lookup(key, &self.cmp).is_some() {
            // Duplicate key; a split would not make room for it.
            return Ok(false);
        }

        let local_depth = directory.local_depth(bucket_index);
        if directory.global_depth() == local_depth && directory.size() == directory.max_size() {
            // The bucket can only split by doubling the directory, and the
            // directory is as large as it may get.
            return Ok(false);
        }

        // Create the split image bucket.
        let split_handle = BufferPoolManager::create_page_handle(&self.bpm)?.upgrade_write();
        let split_page_id = split_handle.page_id();
        let mut split_bucket = HashBucketPageMut::<K, V>::from(split_handle);
        split_bucket.init(self.bucket_max_size);

        if directory.global_depth() == local_depth {
            // The local depth goes up before the directory doubles, so the
            // mirrored slots inherit the post-split depth.
            directory.incr_local_depth(bucket_index);
            directory.incr_global_depth();
        } else {
            directory.incr_local_depth(bucket_index);
        }

        let new_local_depth = directory.local_depth(bucket_index);
        let split_image_index = directory.split_image_index(bucket_index);
        directory.set_bucket_page_id(split_image_index, split_page_id);
        directory.set_local_depth(split_image_index, new_local_depth);

        // Retarget every other slot that still references the split bucket:
        // all of them take the new local depth, and those disagreeing with
        // bucket_index on the distinguishing bit move to the split image.
        let distinguishing_bit = 1u32 << (new_local_depth - 1);
        for idx in 0..directory.size() {
            if idx == bucket_index || idx == split_image_index {
                continue;
            }
            if directory.bucket_page_id(idx) != bucket_page_id {
                continue;
            }
            directory.set_local_depth(idx, new_local_depth);
            if idx & distinguishing_bit != bucket_index & distinguishing_bit {
                directory.set_bucket_page_id(idx, split_page_id);
            }
        }

        // Rehash the old bucket's entries. Walking backwards keeps the
        // remaining indices stable across removals.
        for idx in (0..bucket.size()).rev() {
            let entry_key = bucket.key_at(idx);
            if directory.hash_to_bucket_index(self.hash(&entry_key)) == bucket_index {
                continue;
            }
            let entry_value = bucket.value_at(idx);
            bucket.remove_at(idx);
            split_bucket.insert(&entry_key, &entry_value, &self.cmp);
        }

        // Insert into whichever side owns the key under the new mapping.
        let target_index = directory.hash_to_bucket_index(hash);
        let inserted = if target_index == bucket_index {
            bucket.insert(key, value, &self.cmp)
        } else {
            split_bucket.insert(key, value, &self.cmp)
        };
        Ok(inserted)
    }

    /// Wires a fresh directory (with one empty bucket) into a header slot.
    /// Rechecks the slot under the header's exclusive latch, so concurrent
    /// inserts agree on a single winner.
    fn insert_to_new_directory(&self, directory_index: u32) -> Result<PageId> {
        let mut header = HashHeaderPageMut::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            self.header_page_id,
        )?);
        let existing = header.directory_page_id(directory_index);
        if existing != INVALID_PAGE_ID {
            return Ok(existing);
        }

        let directory_handle = BufferPoolManager::create_page_handle(&self.bpm)?.upgrade_write();
        let directory_page_id = directory_handle.page_id();
        let mut directory = HashDirectoryPageMut::from(directory_handle);
        directory.init(self.directory_max_depth);

        let bucket_handle = BufferPoolManager::create_page_handle(&self.bpm)?.upgrade_write();
        let bucket_page_id = bucket_handle.page_id();
        let mut bucket = HashBucketPageMut::<K, V>::from(bucket_handle);
        bucket.init(self.bucket_max_size);

        directory.set_bucket_page_id(0, bucket_page_id);
        directory.set_local_depth(0, 0);
        header.set_directory_page_id(directory_index, directory_page_id);

        Ok(directory_page_id)
    }

    /// Removes the entry for `key`, returning whether it was found. Buckets
    /// are never merged and the directory never shrinks.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let hash = self.hash(key);

        let header = HashHeaderPageRef::from(BufferPoolManager::fetch_page_handle(
            &self.bpm,
            self.header_page_id,
        )?);
        let directory_index = header.hash_to_directory_index(hash);
        let directory_page_id = header.directory_page_id(directory_index);
        if directory_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let directory = HashDirectoryPageMut::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            directory_page_id,
        )?);
        let bucket_index = directory.hash_to_bucket_index(hash);
        let mut bucket = HashBucketPageMut::<K, V>::from(BufferPoolManager::fetch_page_mut_handle(
            &self.bpm,
            directory.bucket_page_id(bucket_index),
        )?);

        Ok(bucket.remove(key, &self.cmp))
    }

    /// Checks the invariants of every wired directory, panicking on
    /// violation.
    pub fn verify_integrity(&self) -> Result<()> {
        let header = HashHeaderPageRef::from(BufferPoolManager::fetch_page_handle(
            &self.bpm,
            self.header_page_id,
        )?);
        for directory_index in 0..header.max_size() {
            let directory_page_id = header.directory_page_id(directory_index);
            if directory_page_id == INVALID_PAGE_ID {
                continue;
            }
            let directory = HashDirectoryPageMut::from(
                BufferPoolManager::fetch_page_mut_handle(&self.bpm, directory_page_id)?,
            );
            directory.verify_integrity();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::disk_manager::DiskManager;
    use crate::index::OrdComparator;
    use crate::replacer::lru_k_replacer::LrukReplacer;
    use loamdb_error::Error;
    use serial_test::serial;
    use std::sync::Mutex;

    fn get_bpm_arc(pool_size: usize, file_name: &str) -> Arc<RwLock<BufferPoolManager>> {
        let disk_manager = Arc::new(Mutex::new(DiskManager::new(file_name).unwrap()));
        let replacer = Box::new(LrukReplacer::new(pool_size, 2));
        Arc::new(RwLock::new(BufferPoolManager::new(
            pool_size,
            disk_manager,
            replacer,
        )))
    }

    fn identity_hash(key: &i32) -> u32 {
        *key as u32
    }

    fn lookup(table: &DiskExtendibleHashTable<i32, i32, OrdComparator>, key: i32) -> Option<i32> {
        let mut result = Vec::new();
        if table.get_value(&key, &mut result).unwrap() {
            assert_eq!(result.len(), 1);
            Some(result[0])
        } else {
            assert!(result.is_empty());
            None
        }
    }

    #[test]
    #[serial]
    fn test_hash_table_split_and_grow_trace() {
        let bpm = get_bpm_arc(10, "hash_table_trace_test.db");
        let table: DiskExtendibleHashTable<i32, i32, OrdComparator> =
            DiskExtendibleHashTable::new(Arc::clone(&bpm), OrdComparator, identity_hash, 0, 2, 2)
                .expect("table creation failed");

        // The first two keys share the initial bucket; no split, global depth 0.
        assert!(table.insert(&1, &1).unwrap());
        assert!(table.insert(&2, &2).unwrap());
        table.verify_integrity().unwrap();

        // The third key overflows the bucket: one split, global depth 1.
        assert!(table.insert(&3, &3).unwrap());
        table.verify_integrity().unwrap();
        assert_eq!(lookup(&table, 1), Some(1));
        assert_eq!(lookup(&table, 2), Some(2));
        assert_eq!(lookup(&table, 3), Some(3));

        // Key 4 has an even hash and lands in the half-empty even bucket.
        assert!(table.insert(&4, &4).unwrap());
        table.verify_integrity().unwrap();

        // Key 6 overflows the even bucket: another split, global depth 2.
        assert!(table.insert(&6, &6).unwrap());
        table.verify_integrity().unwrap();
        for key in [1, 2, 3, 4, 6] {
            assert_eq!(lookup(&table, key), Some(key));
        }

        // Key 10 maps to the full bucket of {2, 6}; its local depth equals the
        // global depth and the directory is at max size, so growth is blocked.
        assert!(!table.insert(&10, &10).unwrap());
        assert_eq!(lookup(&table, 10), None);

        // Key 5 maps to the full bucket of {1, 3}, whose local depth is below
        // the global depth: it splits without growing the directory.
        assert!(table.insert(&5, &5).unwrap());
        table.verify_integrity().unwrap();
        for key in [1, 2, 3, 4, 5, 6] {
            assert_eq!(lookup(&table, key), Some(key));
        }

        assert!(table.remove(&3).unwrap());
        assert!(!table.remove(&3).unwrap());
        assert_eq!(lookup(&table, 3), None);
        table.verify_integrity().unwrap();
    }

    #[test]
    #[serial]
    fn test_hash_table_insert_get_remove_many() {
        let bpm = get_bpm_arc(64, "hash_table_many_test.db");
        let table: DiskExtendibleHashTable<i32, i32, OrdComparator> =
            DiskExtendibleHashTable::new(Arc::clone(&bpm), OrdComparator, identity_hash, 0, 9, 4)
                .expect("table creation failed");

        // Sequential keys with an identity hash spread evenly over the low
        // bits, so every overflow is resolved by a single split.
        for i in 0..200 {
            assert!(table.insert(&i, &(i * 10)).unwrap(), "insert {} failed", i);
        }
        table.verify_integrity().unwrap();

        for i in 0..200 {
            assert_eq!(lookup(&table, i), Some(i * 10));
        }
        assert_eq!(lookup(&table, 200), None);
        assert_eq!(lookup(&table, -1), None);

        // Remove the even keys; the odd ones must survive.
        for i in (0..200).step_by(2) {
            assert!(table.remove(&i).unwrap());
        }
        table.verify_integrity().unwrap();
        for i in 0..200 {
            let expected = if i % 2 == 0 { None } else { Some(i * 10) };
            assert_eq!(lookup(&table, i), expected);
        }

        // The removed keys can be inserted again.
        for i in (0..200).step_by(2) {
            assert!(table.insert(&i, &(i * 10)).unwrap());
        }
        for i in 0..200 {
            assert_eq!(lookup(&table, i), Some(i * 10));
        }
    }

    #[test]
    #[serial]
    fn test_hash_table_duplicate_keys_rejected() {
        let bpm = get_bpm_arc(10, "hash_table_dup_test.db");
        let table: DiskExtendibleHashTable<i32, i32, OrdComparator> =
            DiskExtendibleHashTable::new(Arc::clone(&bpm), OrdComparator, identity_hash, 0, 4, 4)
                .expect("table creation failed");

        assert!(table.insert(&42, &1).unwrap());
        assert!(!table.insert(&42, &2).unwrap());
        assert_eq!(lookup(&table, 42), Some(1));
    }

    #[test]
    #[serial]
    fn test_hash_table_lazy_directory_creation() {
        let bpm = get_bpm_arc(10, "hash_table_lazy_test.db");
        // One header bit: hashes with the top bit set route to header slot 1,
        // which starts out unwired.
        let table: DiskExtendibleHashTable<i32, i32, OrdComparator> =
            DiskExtendibleHashTable::new(Arc::clone(&bpm), OrdComparator, identity_hash, 1, 4, 4)
                .expect("table creation failed");

        // Nothing routed to slot 1 yet: lookups and removals miss cheaply.
        assert_eq!(lookup(&table, i32::MIN), None);
        assert!(!table.remove(&i32::MIN).unwrap());

        // The first insert with the top hash bit set wires the directory.
        assert!(table.insert(&i32::MIN, &7).unwrap());
        assert_eq!(lookup(&table, i32::MIN), Some(7));
        table.verify_integrity().unwrap();

        // Slot 0 traffic is unaffected.
        assert!(table.insert(&1, &1).unwrap());
        assert_eq!(lookup(&table, 1), Some(1));
    }

    #[test]
    #[serial]
    fn test_hash_table_propagates_pool_exhaustion() {
        // Three frames fit the header, directory, and bucket of a plain
        // traversal, but a split needs a fourth.
        let bpm = get_bpm_arc(3, "hash_table_exhaustion_test.db");
        let table: DiskExtendibleHashTable<i32, i32, OrdComparator> =
            DiskExtendibleHashTable::new(Arc::clone(&bpm), OrdComparator, identity_hash, 0, 4, 1)
                .expect("table creation failed");

        assert!(table.insert(&0, &0).unwrap());
        match table.insert(&2, &2) {
            Err(Error::BufferPoolError(_)) => {}
            other => panic!("expected a buffer pool error, got {:?}", other.map(|_| ())),
        }
    }
}
