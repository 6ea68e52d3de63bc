use bit_vec::BitVec;
use seahash::hash;

/// Bloom filter over `(record id, payload digest)` pairs.
///
/// A negative answer means the exact replica was never seen. A positive
/// answer must be confirmed against the local database.
pub struct ReplicaFilter {
    bits: BitVec,
    num_hashes: u32,
    inserted: usize,
}

impl ReplicaFilter {
    /// Sizes the filter for `expected_items` at `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        // m = -(n * ln(p)) / (ln(2)^2), k = (m / n) * ln(2)
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(8.0);
        let k = ((m / n) * ln2).ceil().max(1.0);

        Self {
            bits: BitVec::from_elem(m as usize, false),
            num_hashes: k as u32,
            inserted: 0,
        }
    }

    pub fn mark_seen(&mut self, id: &str, digest: u64) {
        let m = self.bits.len() as u64;
        for idx in Self::bit_indices(id, digest, self.num_hashes, m) {
            self.bits.set(idx, true);
        }
        self.inserted += 1;
    }

    pub fn maybe_seen(&self, id: &str, digest: u64) -> bool {
        let m = self.bits.len() as u64;
        Self::bit_indices(id, digest, self.num_hashes, m).all(|idx| self.bits.get(idx).unwrap_or(false))
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    // Double hashing: g_i = h1 + i * h2
    fn bit_indices(id: &str, digest: u64, k: u32, m: u64) -> impl Iterator<Item = usize> {
        let h1 = hash(id.as_bytes()) ^ digest;
        let h2 = h1.rotate_left(31).wrapping_add(0x9E3779B97F4A7C15) | 1;
        (0..k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}
