//! Compilation of array-level operations into task graphs.
//!
//! Every planner here is a pure function from immutable array descriptors
//! (name plus chunk structure) to a [`Plan`]: the descriptor of the produced
//! array together with the graph fragment that computes its blocks. Planners
//! never execute anything and hold no state; graphs are handed to an
//! executor once planning is complete.

pub mod blockwise;
pub mod reduction;
pub mod slicing;

use std::sync::Arc;

use crate::types::{BlockIndex, Chunks, TaskGraph};

pub use self::blockwise::{
    blockwise, optimize_blockwise, rewrite_blockwise, AdjustChunks, BlockwiseArg, BlockwiseStage,
    NewAxisChunks, Symbol,
};
pub use self::reduction::{
    normalize_axes, tree_reduce, ChunkPhase, ReductionKernels, SplitEvery, DEFAULT_SPLIT_EVERY,
};
pub use self::slicing::{normalize_index, slice_array, DynamicIndex, DynamicKind, IndexTerm};

/// The product of one planning operation.
#[derive(Clone, Debug)]
pub struct Plan {
    pub name: Arc<str>,
    pub chunks: Chunks,
    pub graph: TaskGraph,
}

/// Row-major enumeration of every block coordinate for the given
/// per-dimension block counts. Zero dimensions yield the single empty
/// coordinate.
pub(crate) fn coordinates(counts: &[usize]) -> Vec<BlockIndex> {
    let mut out = vec![BlockIndex::new()];
    for &count in counts {
        let mut next = Vec::with_capacity(out.len() * count);
        for coord in &out {
            for i in 0..count {
                let mut extended = coord.clone();
                extended.push(i);
                next.push(extended);
            }
        }
        out = next;
    }
    out
}
