use by_address::ByAddress;
use lazy_static::lazy_static;
use lru::LruCache;
use std::sync::Arc;

use crate::chunks::{BlockLen, DimSizes};
use crate::prelude::*;

const CACHE_CAPACITY: usize = 512;

#[derive(PartialEq, Eq, Hash)]
struct CumsumKey {
    // The cached Arc keeps the address alive, so an address can never be
    // reused while its entry is resident; the content hash guards entries
    // that outlive eviction races and unknown-bearing sequences.
    seq: ByAddress<DimSizes>,
    content: u64,
    leading_zero: bool,
}

lazy_static! {
    static ref CUMSUM_CACHE: Mutex<LruCache<CumsumKey, DimSizes>> =
        Mutex::new(LruCache::new(CACHE_CAPACITY));
}

/// Prefix sums over a sequence of block lengths.
///
/// With `leading_zero` the result starts with an extra `0` entry (block start
/// offsets); without it the result holds the running block end boundaries.
/// An `Unknown` length poisons every prefix sum from its position onwards.
pub fn cumsum(sizes: &[BlockLen], leading_zero: bool) -> DimSizes {
    let mut out = Vec::with_capacity(sizes.len() + leading_zero as usize);
    let mut acc = BlockLen::Known(0);

    if leading_zero {
        out.push(acc);
    }

    for &s in sizes {
        acc = acc + s;
        out.push(acc);
    }

    Arc::from(out)
}

/// Memoized [`cumsum`] keyed by sequence identity and content.
///
/// The same dimension handle is consulted once per planner operation that
/// touches it, so repeated lookups hit the cache; a different handle with
/// equal content recomputes into its own entry.
pub fn cached_cumsum(sizes: &DimSizes, leading_zero: bool) -> DimSizes {
    let key = CumsumKey {
        seq: ByAddress(sizes.clone()),
        content: fxhash::hash64(&**sizes),
        leading_zero,
    };

    let mut cache = CUMSUM_CACHE.lock();
    if let Some(hit) = cache.get(&key) {
        return hit.clone();
    }

    let result = cumsum(sizes, leading_zero);
    cache.put(key, result.clone());
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunks::block_sizes;

    #[test]
    fn test_cumsum() {
        let sizes = block_sizes(&[25, 25, 25, 25]);
        assert_eq!(&*cumsum(&sizes, false), &*block_sizes(&[25, 50, 75, 100]));
        assert_eq!(
            &*cumsum(&sizes, true),
            &*block_sizes(&[0, 25, 50, 75, 100])
        );

        assert_eq!(cumsum(&[], false).len(), 0);
        assert_eq!(&*cumsum(&[], true), &*block_sizes(&[0]));
    }

    #[test]
    fn test_cumsum_unknown() {
        let sizes: DimSizes = Arc::from(vec![
            BlockLen::Known(5),
            BlockLen::Unknown,
            BlockLen::Known(3),
        ]);

        let sums = cumsum(&sizes, false);
        assert_eq!(sums[0], BlockLen::Known(5));
        assert_eq!(sums[1], BlockLen::Unknown);
        assert_eq!(sums[2], BlockLen::Unknown);
    }

    #[test]
    fn test_cached_cumsum() {
        let sizes = block_sizes(&[10, 20, 30]);

        // The same handle is served from the cache.
        let a = cached_cumsum(&sizes, false);
        let b = cached_cumsum(&sizes, false);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(&*a, &*block_sizes(&[10, 30, 60]));

        // A distinct handle with equal content still computes correctly.
        let other = block_sizes(&[10, 20, 30]);
        let c = cached_cumsum(&other, false);
        assert_eq!(&*a, &*c);

        // The two prefix-sum variants are cached independently.
        let z = cached_cumsum(&sizes, true);
        assert_eq!(&*z, &*block_sizes(&[0, 10, 30, 60]));
    }

    #[test]
    fn test_cached_cumsum_unknown_content() {
        // Unknown-bearing sequences with different content must never share
        // an entry, even if one handle is dropped and its address reused.
        let a: DimSizes = Arc::from(vec![BlockLen::Unknown, BlockLen::Known(2)]);
        let sums_a = cached_cumsum(&a, false);
        assert_eq!(&*sums_a, &[BlockLen::Unknown, BlockLen::Unknown]);

        let b: DimSizes = Arc::from(vec![BlockLen::Known(2), BlockLen::Unknown]);
        let sums_b = cached_cumsum(&b, false);
        assert_eq!(&*sums_b, &[BlockLen::Known(2), BlockLen::Unknown]);
    }
}
