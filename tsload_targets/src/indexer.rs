//! Consistent assignment of points to partitions.

use std::{
    hash::{Hash, Hasher},
    num::NonZeroUsize,
};

use siphasher::sip::SipHasher13;

use crate::{HashProvider, PointIndexer};

/// A [`JumpHash`] maps keys consistently to one of `N` buckets with near
/// perfect distribution.
///
/// Different instances using the same seed key and the same bucket count
/// always map the same input to the same bucket, in this process or any
/// other, which lets independent loaders agree on partition ownership without
/// coordinating.
///
/// Lookups are `O(ln N)`, utilising Google's [jump hash] internally. Adding 1
/// additional bucket causes approximately `1/N` keys to be remapped.
///
/// [jump hash]: https://arxiv.org/ftp/arxiv/papers/1406/1406.2294.pdf
#[derive(Debug, Clone)]
pub struct JumpHash {
    hasher: SipHasher13,
    buckets: NonZeroUsize,
}

impl JumpHash {
    /// Initialise a [`JumpHash`] that consistently maps keys to one of
    /// `buckets` buckets.
    pub fn new(buckets: NonZeroUsize) -> Self {
        // A randomly generated static siphash key to ensure all loader
        // instances hash the same input to the same u64 key.
        //
        // Generated with: xxd -i -l 16 /dev/urandom
        let key = [
            0x6d, 0x83, 0x93, 0x52, 0xa3, 0x7c, 0xe6, 0x02, 0xac, 0x01, 0x11, 0x94, 0x79, 0x0c,
            0x64, 0x42,
        ];

        Self {
            hasher: SipHasher13::new_with_key(&key),
            buckets,
        }
    }

    /// Reinitialise [`Self`] with a new key.
    ///
    /// Re-keying changes the mapping of inputs to buckets.
    pub fn with_seed_key(self, key: &[u8; 16]) -> Self {
        let hasher = SipHasher13::new_with_key(key);
        Self { hasher, ..self }
    }

    pub fn buckets(&self) -> NonZeroUsize {
        self.buckets
    }

    /// Consistently hash `key` to a bucket in `[0, buckets)`.
    pub fn bucket<H>(&self, key: H) -> usize
    where
        H: Hash,
    {
        let mut state = self.hasher;
        key.hash(&mut state);
        let mut key = state.finish();

        let mut b = -1;
        let mut j = 0;
        while j < self.buckets.get() as i64 {
            b = j;
            key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
                as i64
        }

        assert!(b >= 0);
        b as usize
    }
}

/// The indexer shared by every target: hashes the bytes a [`HashProvider`]
/// extracts from a point into `max_partitions` partitions.
///
/// With a single partition every point maps to `0` without hashing.
#[derive(Debug, Clone)]
pub struct GenericPointIndexer<H> {
    sharder: JumpHash,
    hash_provider: H,
}

impl<H> GenericPointIndexer<H> {
    pub fn new(max_partitions: NonZeroUsize, hash_provider: H) -> Self {
        Self {
            sharder: JumpHash::new(max_partitions),
            hash_provider,
        }
    }

    pub fn max_partitions(&self) -> NonZeroUsize {
        self.sharder.buckets()
    }

    pub fn hash_provider(&self) -> &H {
        &self.hash_provider
    }
}

impl<P, H> PointIndexer<P> for GenericPointIndexer<H>
where
    H: HashProvider<P>,
{
    fn index(&self, point: &P) -> usize {
        if self.sharder.buckets().get() == 1 {
            return 0;
        }
        self.sharder.bucket(self.hash_provider.hash_key(point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn partitions(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[derive(Debug)]
    struct FirstWord;

    impl HashProvider<String> for FirstWord {
        fn hash_key<'a>(&self, point: &'a String) -> &'a [u8] {
            point.split(' ').next().unwrap_or_default().as_bytes()
        }
    }

    #[test]
    fn test_consistent_hashing() {
        const NUM_TESTS: usize = 10_000;

        let hasher = JumpHash::new(partitions(10));

        // Create a HashMap<key, bucket> to verify against.
        let mappings = (0..NUM_TESTS)
            .map(|v| (v, hasher.bucket(v)))
            .collect::<HashMap<_, _>>();

        // Rehash all the same keys and validate they map to the same bucket.
        //
        // The random iteration order of the hashmap asserts the bucket output
        // is not a function of the order of the keys hashed.
        assert!(
            mappings
                .iter()
                .all(|(&key, &value)| hasher.bucket(key) == value)
        );

        // Reinitialise the hasher with the same (default) key
        let hasher = JumpHash::new(partitions(10));
        assert!(
            mappings
                .iter()
                .all(|(&key, &value)| hasher.bucket(key) == value)
        );

        // Reinitialise the hasher with a different key, and assert the
        // mappings are NOT all the same (some may be the same)
        let hasher = JumpHash::new(partitions(10)).with_seed_key(&[42; 16]);
        assert!(
            !mappings
                .iter()
                .all(|(&key, &value)| hasher.bucket(key) == value)
        );
    }

    #[test]
    fn test_buckets_in_range() {
        for n in [1, 2, 3, 7, 64] {
            let hasher = JumpHash::new(partitions(n));
            for i in 0..1_000 {
                assert!(hasher.bucket(format!("host_{i}").as_bytes()) < n);
            }
        }
    }

    #[test]
    fn test_distribution() {
        let hasher = JumpHash::new(partitions(10));

        let mut mapping = HashMap::<_, usize>::new();
        for i in 0..100_000 {
            *mapping
                .entry(hasher.bucket(format!("host_{i}").as_bytes()))
                .or_default() += 1;
        }

        assert_eq!(mapping.len(), 10);
        let (min, max) = mapping.values().fold((usize::MAX, 0), |acc, &v| {
            let (min, max) = acc;
            (min.min(v), max.max(v))
        });

        // Each bucket is expected to hold 10k keys, allow for ±10%
        assert!(max - min < 2_000, "min: {min}, max: {max}");
    }

    #[test]
    fn test_same_key_same_partition() {
        let indexer = GenericPointIndexer::new(partitions(4), FirstWord);

        let a = indexer.index(&"us-east cpu=1".to_string());
        let b = indexer.index(&"us-east mem=2 disk=3".to_string());
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn test_empty_key_is_hashed() {
        let indexer = GenericPointIndexer::new(partitions(16), FirstWord);

        let a = indexer.index(&"".to_string());
        let b = indexer.index(&" something".to_string());
        assert_eq!(a, b);
        assert!(a < 16);
    }

    #[test]
    fn test_single_partition() {
        let indexer = GenericPointIndexer::new(partitions(1), FirstWord);
        for i in 0..100 {
            assert_eq!(indexer.index(&format!("host_{i}")), 0);
        }
    }
}
