//! Key filters.
//!
//! A [`FilterPolicy`] builds a compact summary of the keys in a table
//! region; the reader probes the summary before touching a data block, so
//! most lookups for absent keys skip the block read entirely.

/// Builds and probes per-table key filters. Keys passed in are user keys.
pub trait FilterPolicy: Send + Sync {
    /// Name recorded in the table's meta-index; reading back a table built
    /// with a differently-named policy disables filtering rather than
    /// producing false negatives.
    fn name(&self) -> &'static str;

    /// Serializes a filter covering `keys`.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// May return false only when `key` was not in the creating set.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with double hashing.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2) minimizes the false-positive rate.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        BloomFilterPolicy { bits_per_key, k: k.clamp(1, 30) }
    }
}

fn bloom_hash(data: &[u8]) -> u32 {
    hash(data, 0xbc9f1d34)
}

// Murmur-flavored byte-string hash shared by the bloom probes.
fn hash(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4a793;
    const R: u32 = 24;
    let mut h = seed ^ (M.wrapping_mul(data.len() as u32));
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes(chunk.try_into().unwrap());
        h = h.wrapping_add(w).wrapping_mul(M);
        h ^= h >> 16;
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        for (i, &b) in rest.iter().enumerate() {
            h = h.wrapping_add((b as u32) << (8 * i));
        }
        h = h.wrapping_mul(M);
        h ^= h >> R;
    }
    h
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "emberdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // Round up for short key lists to keep the false-positive rate in
        // range without wasting much space.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let mut filter = vec![0u8; bytes + 1];
        filter[bytes] = self.k as u8;
        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit = (h as usize) % bits;
                filter[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let bits = (filter.len() - 1) * 8;
        let k = filter[filter.len() - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; err on the side of a read.
            return true;
        }
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit = (h as usize) % bits;
            if filter[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key{i:05}").into_bytes()).collect()
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&[]);
        assert!(!policy.key_may_match(b"anything", &filter));
    }

    #[test]
    fn no_false_negatives() {
        let policy = BloomFilterPolicy::new(10);
        for n in [1, 10, 100, 1000] {
            let set = keys(n);
            let filter = policy.create_filter(&set);
            for key in &set {
                assert!(policy.key_may_match(key, &filter), "lost key in n={n}");
            }
        }
    }

    #[test]
    fn false_positive_rate_is_sane() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&keys(1000));
        let mut hits = 0;
        for i in 0..10000 {
            let absent = format!("absent{i:05}").into_bytes();
            if policy.key_may_match(&absent, &filter) {
                hits += 1;
            }
        }
        // 10 bits/key targets ~1%; allow generous slack.
        assert!(hits < 300, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn empty_key_is_representable() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&[Vec::new()]);
        assert!(policy.key_may_match(b"", &filter));
    }
}
