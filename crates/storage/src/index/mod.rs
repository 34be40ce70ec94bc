use bytemuck::Pod;
use siphasher::sip::SipHasher13;
use std::cmp::Ordering;
use std::hash::Hasher;

pub mod extendible_hash_table;

/// A total order over keys. Two keys are equal iff `compare` returns
/// [`Ordering::Equal`].
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Compares keys through their `Ord` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// The hash function injected into the index, mapping a key to 32 bits.
pub type HashFunction<K> = fn(&K) -> u32;

/// Default hash function: SipHash-1-3 over the key's bytes, folded to 32 bits.
pub fn sip_hash<K: Pod>(key: &K) -> u32 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytemuck::bytes_of(key));
    hasher.finish() as u32
}
