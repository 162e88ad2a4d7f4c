use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;

use crate::distribution::{Distribution, DistributionContext};

const FNV_OFFSET_BASIS_64: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME_64: u64 = 1_099_511_628_211;

/// FNV-1a over the eight low-to-high bytes of `value`, folded to a
/// non-negative number.
pub fn fnv_hash64(value: i64) -> u64 {
    let mut val = value as u64;
    let mut hash = FNV_OFFSET_BASIS_64;
    for _ in 0..8 {
        hash ^= val & 0xff;
        hash = hash.wrapping_mul(FNV_PRIME_64);
        val >>= 8;
    }
    (hash as i64).wrapping_abs() as u64
}

pub fn build_key_name(keynum: u64) -> String {
    format!("user{}", keynum)
}

/// Maps raw draws (from a skew distribution or a trace) onto the table's
/// key namespace.
#[derive(Clone, Copy, Debug)]
pub struct KeySpace {
    rows: u64,
}

impl KeySpace {
    pub fn new(rows: u64) -> Self {
        assert!(rows > 0, "key space must not be empty");
        Self { rows }
    }

    pub fn derive(&self, raw: i64) -> String {
        build_key_name(fnv_hash64(raw) % self.rows)
    }
}

pub trait ValueGenerator: Send + Sync {
    fn generate(&self, ctx: &mut DistributionContext) -> Bytes;
}

/// Random printable payloads whose length follows `length_dist`.
pub struct PrintableValueGenerator {
    length_dist: Arc<dyn Distribution>,
}

impl PrintableValueGenerator {
    pub fn new(length_dist: Arc<dyn Distribution>) -> Self {
        Self { length_dist }
    }
}

impl ValueGenerator for PrintableValueGenerator {
    fn generate(&self, ctx: &mut DistributionContext) -> Bytes {
        let dest_len = self.length_dist.get_i64(ctx).max(0) as usize;
        let mut ret = Vec::with_capacity((dest_len + 7) / 8 * 8);
        while ret.len() < dest_len {
            let word: u64 = ctx.get_gen_mut().gen();
            ret.extend(word.to_le_bytes().iter().map(|b| b' ' + (b & 63)));
        }
        ret.truncate(dest_len);
        Bytes::from(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::FixedDistribution;

    #[test]
    fn fnv_hash_is_stable() {
        assert_eq!(fnv_hash64(0), fnv_hash64(0));
        assert_ne!(fnv_hash64(3), fnv_hash64(7));
        for raw in &[i64::MIN, -1, 0, 1, i64::MAX] {
            assert!(fnv_hash64(*raw) <= i64::MAX as u64 + 1);
        }
    }

    #[test]
    fn key_space_bounds_keys() {
        let space = KeySpace::new(100);
        for raw in -50..500 {
            let key = space.derive(raw);
            let num: u64 = key.strip_prefix("user").unwrap().parse().unwrap();
            assert!(num < 100);
        }
        assert_eq!(space.derive(12), space.derive(12));
    }

    #[test]
    fn values_have_requested_length_and_are_printable() {
        let mut ctx = DistributionContext::seeded(1);
        let gen = PrintableValueGenerator::new(Arc::new(FixedDistribution(13)));
        let value = gen.generate(&mut ctx);
        assert_eq!(value.len(), 13);
        assert!(value.iter().all(|b| (b' '..=b'_').contains(b)));

        let empty = PrintableValueGenerator::new(Arc::new(FixedDistribution(-4)));
        assert!(empty.generate(&mut ctx).is_empty());
    }
}
