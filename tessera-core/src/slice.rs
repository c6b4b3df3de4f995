use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use crate::chunks::{known_sizes, DimSizes};
use crate::prelude::*;
use crate::util::{cached_cumsum, div_ceil, pymod};

/// A slice along one dimension with Python semantics: optional bounds, an
/// arbitrary non-zero step, and negative values counting from the end.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: i64,
}

impl Slice {
    pub fn new(start: impl Into<Option<i64>>, stop: impl Into<Option<i64>>, step: i64) -> Self {
        assert!(step != 0, "slice step cannot be zero");
        Self {
            start: start.into(),
            stop: stop.into(),
            step,
        }
    }

    pub const fn full() -> Self {
        Self {
            start: None,
            stop: None,
            step: 1,
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::full()
    }

    /// Resolves the bounds against a dimension of length `n`, clipping
    /// permissively the way Python's `slice.indices` does. Returns
    /// `(start, stop, step)` where for a negative step a stop of `-1` means
    /// "one before the first element".
    pub fn resolve(&self, n: u64) -> (i64, i64, i64) {
        let n = n as i64;
        let step = self.step;

        let mut start = self.start.unwrap_or(if step > 0 { 0 } else { n - 1 });
        if start < 0 {
            start += n;
            if start < 0 {
                start = if step < 0 { -1 } else { 0 };
            }
        } else if start >= n {
            start = if step < 0 { n - 1 } else { n };
        }

        let mut stop = self.stop.unwrap_or(if step > 0 { n } else { -(n + 1) });
        if stop < 0 {
            stop += n;
            if stop < 0 {
                stop = if step < 0 { -1 } else { 0 };
            }
        } else if stop >= n {
            stop = if step < 0 { n - 1 } else { n };
        }

        (start, stop, step)
    }

    /// The number of elements selected from a dimension of length `n`.
    pub fn output_len(&self, n: u64) -> u64 {
        let (start, stop, step) = self.resolve(n);
        max(div_ceil(stop - start, step), 0) as u64
    }

    /// The number of elements selected by an already block-local slice, as
    /// produced by [`translate_slice`]. Bounds must be present (the full
    /// slice is handled by the caller, which knows the block length).
    pub fn selected_len(&self) -> u64 {
        let start = self.start.expect("slice bounds must be resolved");
        let stop = self.stop.expect("slice bounds must be resolved");
        max(div_ceil(stop - start, self.step), 0) as u64
    }
}

impl Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn bound(b: Option<i64>) -> impl Debug {
            struct B(Option<i64>);
            impl Debug for B {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match self.0 {
                        Some(v) => write!(f, "{}", v),
                        None => write!(f, "None"),
                    }
                }
            }
            B(b)
        }

        write!(
            f,
            "slice({:?}, {:?}, {})",
            bound(self.start),
            bound(self.stop),
            self.step
        )
    }
}

/// Translates a slice along one chunked dimension into a sparse per-block
/// mapping: `block -> local slice`, in block-relative coordinates.
///
/// Blocks that contribute nothing are absent from the result. A block that is
/// selected whole (with step 1) maps to the full slice, so that callers can
/// recognize pass-through blocks without comparing against the block length.
///
/// For a negative step the local bounds are expressed as negative
/// offsets-from-block-end. This keeps the per-block arithmetic independent of
/// the order in which blocks are later traversed; the caller reverses the
/// block order to obtain the requested element order.
///
/// Out-of-bounds slice bounds are clipped, never rejected.
pub fn translate_slice(sizes: &DimSizes, index: Slice) -> BTreeMap<usize, Slice> {
    let lengths = known_sizes(sizes);
    let bounds = known_sizes(&cached_cumsum(sizes, false));
    let n = lengths.len();
    let dim = bounds.last().copied().unwrap_or(0);

    let mut d = BTreeMap::new();

    if index.is_full() {
        for i in 0..n {
            d.insert(i, Slice::full());
        }
        return d;
    }

    let (start, stop, step) = index.resolve(dim);

    if (step > 0 && stop <= start) || (step < 0 && stop >= start) {
        debug!("slice {:?} selects nothing from dimension of {}", index, dim);
        return d;
    }

    if step > 0 {
        let istart = bounds.partition_point(|&b| (b as i64) <= start);
        let istop = min(bounds.partition_point(|&b| (b as i64) < stop) + 1, n);

        // Jump directly to the first contributing block.
        let skipped = if istart > 0 { bounds[istart - 1] as i64 } else { 0 };
        let mut start = start - skipped;
        let mut stop = stop - skipped;

        for i in istart..istop {
            let length = lengths[i] as i64;
            if start < length && stop > 0 {
                d.insert(i, Slice::new(start, min(stop, length), step));
                start = pymod(start - length, step);
            } else {
                start -= length;
            }
            stop -= length;
        }
    } else {
        let istart = min(
            bounds.partition_point(|&b| (b as i64) < start) as i64 + 1,
            n as i64 - 1,
        );
        let istop = max(
            bounds.partition_point(|&b| (b as i64) <= stop) as i64 - 1,
            -1,
        );

        let mut rstart = start;
        let mut i = istart;
        while i > istop {
            let chunk_stop = bounds[i as usize] as i64;
            let chunk_start = if i == 0 { 0 } else { bounds[i as usize - 1] as i64 };

            if chunk_start <= rstart && rstart < chunk_stop && rstart > stop {
                d.insert(
                    i as usize,
                    Slice::new(
                        rstart - chunk_stop,
                        max(chunk_start - 1, stop) - chunk_stop,
                        step,
                    ),
                );

                let offset = pymod(rstart - (chunk_start - 1), step);
                rstart = chunk_start + offset - 1;
            }

            i -= 1;
        }
    }

    // A block selected whole reduces to the full slice.
    let full_blocks = d
        .iter()
        .filter(|(&k, &v)| v == Slice::new(0, lengths[k] as i64, 1))
        .map(|(&k, _)| k)
        .collect_vec();
    for k in full_blocks {
        d.insert(k, Slice::full());
    }

    d
}
