use smallvec::SmallVec;
use std::fmt::{self, Debug, Display};
use std::ops;
use std::sync::Arc;

use crate::prelude::*;
use crate::util::cached_cumsum;

/// The length of a single block along one dimension.
///
/// Most operations know the exact length of every block they produce. The
/// exception are operations whose output size depends on the data itself
/// (for example, filtering through a boolean mask that has not been computed
/// yet). These produce `Unknown` lengths, which poison any arithmetic they
/// participate in.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockLen {
    Known(u64),
    Unknown,
}

impl BlockLen {
    #[inline(always)]
    pub fn known(self) -> Option<u64> {
        match self {
            BlockLen::Known(v) => Some(v),
            BlockLen::Unknown => None,
        }
    }

    #[inline(always)]
    pub fn is_unknown(self) -> bool {
        matches!(self, BlockLen::Unknown)
    }
}

impl From<u64> for BlockLen {
    fn from(v: u64) -> Self {
        BlockLen::Known(v)
    }
}

impl ops::Add for BlockLen {
    type Output = BlockLen;

    fn add(self, rhs: BlockLen) -> BlockLen {
        match (self, rhs) {
            (BlockLen::Known(a), BlockLen::Known(b)) => BlockLen::Known(a + b),
            _ => BlockLen::Unknown,
        }
    }
}

impl Debug for BlockLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockLen::Known(v) => write!(f, "{}", v),
            BlockLen::Unknown => write!(f, "?"),
        }
    }
}

impl Display for BlockLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Block sizes of an `Arc`d dimension, used as cache handle by the prefix-sum
/// cache.
pub type DimSizes = Arc<[BlockLen]>;

pub fn block_sizes(sizes: &[u64]) -> DimSizes {
    sizes.iter().map(|&v| BlockLen::Known(v)).collect()
}

/// Describes how a logical array is partitioned into blocks: one sequence of
/// block lengths per dimension.
///
/// A `Chunks` value is immutable once constructed. Planner operations derive
/// new values rather than mutating in place, so a dimension handle can be
/// shared between the array that introduced it and every array derived from
/// it (which also makes the prefix-sum cache effective).
#[derive(Clone, PartialEq, Eq)]
pub struct Chunks {
    dims: SmallVec<[DimSizes; 4]>,
}

impl Chunks {
    pub fn from_dims(dims: impl IntoIterator<Item = DimSizes>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    pub fn from_sizes(dims: &[Vec<u64>]) -> Self {
        Self::from_dims(dims.iter().map(|d| block_sizes(d)))
    }

    /// Regular tiling: every block along dimension `i` has length
    /// `block_shape[i]`, except the last one which may be ragged.
    pub fn regular(shape: &[u64], block_shape: &[u64]) -> Result<Self> {
        if shape.len() != block_shape.len() {
            bail!(
                "shape has {} dimensions but block shape has {}",
                shape.len(),
                block_shape.len()
            );
        }

        let mut dims = SmallVec::with_capacity(shape.len());
        for (&extent, &block) in shape.iter().zip(block_shape) {
            if block == 0 {
                bail!("block length must be positive");
            }

            let mut sizes = Vec::new();
            let mut remaining = extent;
            while remaining > block {
                sizes.push(BlockLen::Known(block));
                remaining -= block;
            }
            sizes.push(BlockLen::Known(remaining));
            dims.push(DimSizes::from(sizes));
        }

        Ok(Self { dims })
    }

    #[inline(always)]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    #[inline(always)]
    pub fn dim(&self, axis: usize) -> &DimSizes {
        &self.dims[axis]
    }

    pub fn dims(&self) -> impl Iterator<Item = &DimSizes> {
        self.dims.iter()
    }

    /// The number of blocks along every dimension.
    pub fn numblocks(&self) -> SmallVec<[usize; 4]> {
        self.dims.iter().map(|d| d.len()).collect()
    }

    pub fn nblocks(&self, axis: usize) -> usize {
        self.dims[axis].len()
    }

    /// The total number of blocks (product over all dimensions).
    pub fn block_count(&self) -> usize {
        self.dims.iter().map(|d| d.len().max(1)).product()
    }

    /// The extent along every dimension, `Unknown` where any block length
    /// along that dimension is unknown.
    pub fn shape(&self) -> SmallVec<[BlockLen; 4]> {
        (0..self.ndim()).map(|i| self.extent(i)).collect()
    }

    pub fn extent(&self, axis: usize) -> BlockLen {
        self.boundaries(axis)
            .last()
            .copied()
            .unwrap_or(BlockLen::Known(0))
    }

    pub fn is_fully_known(&self) -> bool {
        self.dims.iter().all(|d| d.iter().all(|s| !s.is_unknown()))
    }

    pub fn dim_is_known(&self, axis: usize) -> bool {
        self.dims[axis].iter().all(|s| !s.is_unknown())
    }

    /// Running block boundaries along `axis` (prefix sums without a leading
    /// zero), served from the shared prefix-sum cache.
    pub fn boundaries(&self, axis: usize) -> DimSizes {
        cached_cumsum(&self.dims[axis], false)
    }
}

impl Debug for Chunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for dim in &self.dims {
            list.entry(&format_args!("{:?}", &dim[..]));
        }
        list.finish()
    }
}

/// Extracts the known block lengths of a dimension.
///
/// Callers must establish that the dimension is fully known before indexing
/// arithmetic is attempted (the planners raise a typed error otherwise).
pub fn known_sizes(sizes: &[BlockLen]) -> Vec<u64> {
    sizes
        .iter()
        .map(|s| s.known().expect("block sizes must be known"))
        .collect()
}

/// Maps a global index along a dimension to a `(block, local offset)` pair.
///
/// An index that is exactly on a block boundary belongs to the block starting
/// at that boundary. The index must lie within `[0, extent)`.
pub fn locate(sizes: &DimSizes, index: u64) -> (usize, u64) {
    let boundaries = cached_cumsum(sizes, false);
    let bounds = known_sizes(&boundaries);

    let block = bounds.partition_point(|&b| b <= index);
    assert!(block < bounds.len(), "index {} out of range", index);

    let start = if block > 0 { bounds[block - 1] } else { 0 };
    (block, index - start)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_regular() {
        let c = Chunks::regular(&[100, 7], &[30, 7]).unwrap();
        assert_eq!(c.ndim(), 2);
        assert_eq!(&known_sizes(c.dim(0)), &[30, 30, 30, 10]);
        assert_eq!(&known_sizes(c.dim(1)), &[7]);
        assert_eq!(c.numblocks().as_slice(), &[4, 1]);
        assert_eq!(c.extent(0), BlockLen::Known(100));

        // An empty extent still produces a single empty block.
        let c = Chunks::regular(&[0], &[5]).unwrap();
        assert_eq!(&known_sizes(c.dim(0)), &[0]);

        assert!(Chunks::regular(&[10], &[0]).is_err());
        assert!(Chunks::regular(&[10, 10], &[5]).is_err());
    }

    #[test]
    fn test_locate() {
        let dim = block_sizes(&[25, 25, 25, 25]);
        assert_eq!(locate(&dim, 0), (0, 0));
        assert_eq!(locate(&dim, 24), (0, 24));
        assert_eq!(locate(&dim, 25), (1, 0));
        assert_eq!(locate(&dim, 99), (3, 24));

        let dim = block_sizes(&[3, 1, 4]);
        assert_eq!(locate(&dim, 3), (1, 0));
        assert_eq!(locate(&dim, 4), (2, 0));
        assert_eq!(locate(&dim, 7), (2, 3));
    }

    #[test]
    fn test_unknown_propagation() {
        let c = Chunks::from_dims(vec![
            DimSizes::from(vec![BlockLen::Known(5), BlockLen::Unknown]),
            block_sizes(&[10]),
        ]);

        assert!(!c.is_fully_known());
        assert!(!c.dim_is_known(0));
        assert!(c.dim_is_known(1));
        assert_eq!(c.extent(0), BlockLen::Unknown);
        assert_eq!(c.extent(1), BlockLen::Known(10));
        assert_eq!(
            BlockLen::Known(3) + BlockLen::Unknown,
            BlockLen::Unknown
        );
    }
}
