mod graph;
mod value;

pub use self::graph::*;
pub use self::value::*;

pub use tessera_core::{
    block_sizes, known_sizes, locate, translate_slice, BlockLen, Chunks, DimSizes, Slice,
};
