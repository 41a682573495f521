// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::extract_user_key;
use std::sync::Arc;

/// Builds and probes compact per-block key filters
///
/// A filter may report false positives but never false negatives.
pub trait FilterPolicy: Send + Sync {
    /// Stable name, persisted in each table's metaindex block.
    ///
    /// Tables whose filter was built with a differently named policy
    /// are read without filters.
    fn name(&self) -> &str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Returns `false` only if `key` was definitely not part of the
    /// key set the filter was created from.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with a fixed number of bits per key
///
/// Uses double hashing: one 32-bit hash, rotated to obtain the delta
/// between probes. The probe count is stored in the filter's last byte.
#[derive(Debug, Clone)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,

    /// Number of hash functions
    k: usize,
}

impl BloomFilterPolicy {
    /// Constructs a bloom filter policy using `bits_per_key` bits of
    /// memory for every key. 10 bits give roughly a 1% false positive rate.
    #[must_use]
    pub fn new(bits_per_key: usize) -> Self {
        // NOTE: Truncation is okay and actually needed
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let k = (bits_per_key as f64 * std::f64::consts::LN_2) as usize;

        Self {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

fn bloom_hash(key: &[u8]) -> u32 {
    // NOTE: Truncation is okay and actually needed
    #[allow(clippy::cast_possible_truncation)]
    let h = xxhash_rust::xxh3::xxh3_64(key) as u32;
    h
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "levelkv.BuiltinBloomFilter2"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // NOTE: For small n, the false positive rate would be very high,
        // so enforce a minimum bloom filter length
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = bits.div_ceil(8);
        let bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);

        // NOTE: k is at most 30
        #[allow(clippy::cast_possible_truncation)]
        dst.push(self.k as u8);

        let Some(array) = dst.get_mut(init_size..init_size + bytes) else {
            return;
        };

        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);

            for _ in 0..self.k {
                let bit_pos = (h as usize) % bits;

                if let Some(byte) = array.get_mut(bit_pos / 8) {
                    *byte |= 1 << (bit_pos % 8);
                }

                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let Some((&k, array)) = filter.split_last() else {
            return false;
        };

        if array.is_empty() {
            return false;
        }

        if k > 30 {
            // Reserved for potentially new encodings for short bloom filters.
            // Consider it a match.
            return true;
        }

        let bits = array.len() * 8;

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);

        for _ in 0..k {
            let bit_pos = (h as usize) % bits;

            let is_set = array
                .get(bit_pos / 8)
                .is_some_and(|byte| byte & (1 << (bit_pos % 8)) != 0);

            if !is_set {
                return false;
            }

            h = h.wrapping_add(delta);
        }

        true
    }
}

/// Adapts a user-key filter policy to tables that store internal keys
pub(crate) struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        Self { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let user_keys = keys
            .iter()
            .map(|key| extract_user_key(key))
            .collect::<Vec<_>>();

        self.user_policy.create_filter(&user_keys, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy
            .key_may_match(extract_user_key(key), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn build(policy: &BloomFilterPolicy, keys: &[Vec<u8>]) -> Vec<u8> {
        let refs = keys.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let mut filter = vec![];
        policy.create_filter(&refs, &mut filter);
        filter
    }

    #[test]
    fn bloom_empty_filter() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, &[]);
        assert!(!policy.key_may_match(b"hello", &filter));
        assert!(!policy.key_may_match(b"world", &filter));
    }

    #[test]
    fn bloom_small() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, &[b"hello".to_vec(), b"world".to_vec()]);
        assert!(policy.key_may_match(b"hello", &filter));
        assert!(policy.key_may_match(b"world", &filter));
        assert!(!policy.key_may_match(b"x", &filter));
        assert!(!policy.key_may_match(b"foo", &filter));
    }

    #[test]
    fn bloom_false_positive_rate() {
        let policy = BloomFilterPolicy::new(10);

        for length in [1, 10, 100, 1_000, 10_000] {
            let keys = (0..length as u32)
                .map(|i| i.to_le_bytes().to_vec())
                .collect::<Vec<_>>();
            let filter = build(&policy, &keys);

            assert!(filter.len() <= (length * 10 / 8) + 40);

            // All added keys must match
            for key in &keys {
                assert!(policy.key_may_match(key, &filter));
            }

            let mut false_positives = 0;
            for i in 0..10_000u32 {
                let key = (i + 1_000_000_000).to_le_bytes();
                if policy.key_may_match(&key, &filter) {
                    false_positives += 1;
                }
            }

            // Allow up to 2%
            assert!(false_positives <= 200, "{false_positives} false positives");
        }
    }

    #[test]
    fn bloom_internal_policy_strips_trailer() {
        use crate::value::{InternalKey, ValueType};

        let policy = InternalFilterPolicy::new(Arc::new(BloomFilterPolicy::new(10)));
        let a = InternalKey::new(b"a", 5, ValueType::Value);
        let b = InternalKey::new(b"b", 6, ValueType::Deletion);

        let mut filter = vec![];
        policy.create_filter(&[a.encoded(), b.encoded()], &mut filter);

        let lookup = InternalKey::new(b"a", 100, ValueType::Value);
        assert!(policy.key_may_match(lookup.encoded(), &filter));
    }
}
