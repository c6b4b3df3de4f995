use crate::prelude::*;
use tessera_core::util::RangeOverflow;

/// Coarse classification of planner failures, mirroring the exception
/// classes a NumPy-style indexing surface distinguishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Index,
    Value,
    Type,
    Overflow,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("index {index} is out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds { index: i64, axis: usize, size: u64 },

    #[error("boolean index of length {mask} does not match axis {axis} of length {size}")]
    MaskLengthMismatch { mask: u64, axis: usize, size: u64 },

    #[error("too many indices for array: array is {ndim}-dimensional, but {got} were indexed")]
    TooManyIndices { ndim: usize, got: usize },

    #[error("an index can only have a single ellipsis")]
    MultipleEllipsis,

    #[error("axis {axis} is out of bounds for array of dimension {ndim}")]
    AxisOutOfBounds { axis: i64, ndim: usize },

    #[error("repeated axis {axis} in axis list")]
    RepeatedAxis { axis: usize },

    #[error("axis must be a single integer, not a sequence of {got}")]
    AxisNotScalar { got: usize },

    #[error("repeated index symbol {symbol:?} for input {input:?}")]
    RepeatedSymbol { symbol: char, input: String },

    #[error("unknown dimension {symbol:?}")]
    UnknownDimension { symbol: char },

    #[error("new axis {symbol:?} already indexes an input dimension")]
    NewAxisConflict { symbol: char },

    #[error("input {input:?} is {ndim}-dimensional but has {symbols} index symbols")]
    SymbolCountMismatch {
        input: String,
        symbols: usize,
        ndim: usize,
    },

    #[error("dimension {symbol:?} has {left} blocks in one input but {right} in another")]
    BlockCountMismatch {
        symbol: char,
        left: usize,
        right: usize,
    },

    #[error("no more free index symbols while fusing stages")]
    SymbolsExhausted,

    #[error("adjusted sizes for {symbol:?} list {got} blocks but the dimension has {expected}")]
    AdjustLengthMismatch {
        symbol: char,
        got: usize,
        expected: usize,
    },

    #[error("block sizes along axis {axis} are unknown; compute the array first")]
    UnknownChunks { axis: usize },

    #[error("only one integer-array index is supported per indexing expression")]
    MultipleListIndices,

    #[error("a chunked index array cannot be combined with other non-trivial indices")]
    MixedDynamicIndex,

    #[error("index arrays must be one-dimensional and contain integers or booleans")]
    InvalidIndexArray,

    #[error("chunking of the index array does not match axis {axis}")]
    MismatchedIndexChunks { axis: usize },

    #[error("split_every must be at least 1, got {got}")]
    InvalidSplitEvery { got: usize },

    #[error("all-NaN slice encountered")]
    AllNanSlice,

    #[error("attempt to reduce an empty axis {axis}")]
    EmptyReduction { axis: usize },

    #[error(transparent)]
    RangeOverflow(#[from] RangeOverflow),
}

impl PlanError {
    pub fn kind(&self) -> ErrorKind {
        use PlanError::*;

        match self {
            IndexOutOfBounds { .. }
            | MaskLengthMismatch { .. }
            | TooManyIndices { .. }
            | MultipleEllipsis => ErrorKind::Index,
            AxisNotScalar { .. } => ErrorKind::Type,
            RangeOverflow(_) => ErrorKind::Overflow,
            _ => ErrorKind::Value,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = PlanError::IndexOutOfBounds {
            index: 6,
            axis: 0,
            size: 5,
        };
        assert_eq!(err.kind(), ErrorKind::Index);
        assert!(err.to_string().contains("out of bounds"));

        assert_eq!(
            PlanError::UnknownDimension { symbol: 'k' }.kind(),
            ErrorKind::Value
        );
        assert_eq!(PlanError::AxisNotScalar { got: 2 }.kind(), ErrorKind::Type);

        let err = PlanError::from(tessera_core::util::RangeOverflow { len: 10, cap: 5 });
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn test_anyhow_downcast() {
        // Typed planner errors survive the anyhow boundary of the API layer.
        let err: Error = PlanError::MultipleEllipsis.into();
        let plan = err.downcast_ref::<PlanError>().unwrap();
        assert_eq!(plan.kind(), ErrorKind::Index);
    }
}
