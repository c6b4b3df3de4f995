//! Per-block pure functions referenced by emitted tasks.
//!
//! Kernels are opaque collaborators from the planner's point of view: they
//! take block-shaped values plus literal configuration and return a
//! block-shaped value or a partial aggregate. The planners only rely on the
//! declared name/token for deterministic naming.

pub mod reduce;

use ndarray::{concatenate, ArrayD, Axis, Slice as NdSlice};
use std::fmt::Debug;

use crate::prelude::*;
use crate::types::{Slice, Value};

pub use self::reduce::*;

pub trait Kernel: Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Canonical encoding of the kernel and its parameters, hashed into the
    /// deterministic names of the tasks that call it.
    fn token(&self) -> String {
        format!("{:?}", self)
    }

    fn execute(&self, args: &[Value]) -> Result<Value>;
}

fn single_block<'a>(kernel: &dyn Kernel, args: &'a [Value]) -> Result<&'a ArrayD<f64>> {
    match args {
        [value] => value.block(),
        _ => bail!("{} expects exactly one argument, got {}", kernel.name(), args.len()),
    }
}

/// Converts a Python-semantics local slice into an `ndarray` slice against an
/// axis of length `len`. The bounds are resolved (with clipping) first; for a
/// negative step `ndarray` walks an ascending range from its back, so the
/// exclusive Python stop becomes the range's inclusive lower bound.
fn to_nd_slice(s: &Slice, len: u64) -> NdSlice {
    if s.output_len(len) == 0 {
        return NdSlice::new(0, Some(0), 1);
    }

    let (start, stop, step) = s.resolve(len);
    if step > 0 {
        NdSlice::new(start as isize, Some(stop as isize), step as isize)
    } else {
        NdSlice::new((stop + 1) as isize, Some((start + 1) as isize), step as isize)
    }
}

fn resolve_position(index: i64, len: u64, axis: usize) -> Result<usize> {
    let n = len as i64;
    let resolved = if index < 0 { index + n } else { index };

    if resolved < 0 || resolved >= n {
        return Err(PlanError::IndexOutOfBounds {
            index,
            axis,
            size: len,
        }
        .into());
    }

    Ok(resolved as usize)
}

/// Produces a fixed value; used for source blocks fed into a graph.
#[derive(Clone, Debug)]
pub struct Const {
    value: Value,
}

impl Const {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl Kernel for Const {
    fn name(&self) -> &'static str {
        "const"
    }

    fn token(&self) -> String {
        self.value.canonical_token()
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        if !args.is_empty() {
            bail!("const takes no arguments");
        }
        Ok(self.value.clone())
    }
}

/// One per-dimension operation of a [`Subset`] kernel, applied in order.
#[derive(Clone, Debug, PartialEq)]
pub enum SubsetOp {
    /// Keep the axis untouched.
    Full,
    /// Apply a local slice along the axis.
    Range(Slice),
    /// Select a single position, dropping the axis.
    At(i64),
    /// Select explicit positions, keeping the axis.
    Pick(Vec<i64>),
    /// Insert a new unit axis.
    NewAxis,
}

/// Applies the per-dimension local slices/indices of one output block in a
/// single call.
#[derive(Clone, Debug)]
pub struct Subset {
    pub ops: Vec<SubsetOp>,
}

impl Subset {
    pub fn new(ops: Vec<SubsetOp>) -> Self {
        Self { ops }
    }

    pub fn is_identity(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, SubsetOp::Full))
    }
}

impl Kernel for Subset {
    fn name(&self) -> &'static str {
        "subset"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let mut block = single_block(self, args)?.clone();
        let mut axis = 0;

        for op in &self.ops {
            match op {
                SubsetOp::Full => {
                    axis += 1;
                }
                SubsetOp::Range(s) => {
                    let len = block.len_of(Axis(axis)) as u64;
                    block = block.slice_axis(Axis(axis), to_nd_slice(s, len)).to_owned();
                    axis += 1;
                }
                SubsetOp::At(index) => {
                    let len = block.len_of(Axis(axis)) as u64;
                    let position = resolve_position(*index, len, axis)?;
                    block = block.index_axis(Axis(axis), position).to_owned();
                }
                SubsetOp::Pick(positions) => {
                    let len = block.len_of(Axis(axis)) as u64;
                    let positions = positions
                        .iter()
                        .map(|&p| resolve_position(p, len, axis))
                        .collect::<Result<Vec<_>>>()?;
                    block = block.select(Axis(axis), &positions);
                    axis += 1;
                }
                SubsetOp::NewAxis => {
                    block = block.insert_axis(Axis(axis));
                    axis += 1;
                }
            }
        }

        Ok(Value::Block(block))
    }
}

/// Gathers explicit local positions along one axis of one source block.
#[derive(Clone, Debug)]
pub struct Take {
    pub axis: usize,
    pub positions: Vec<usize>,
    /// Positions are ascending; the kernel may use a contiguity fast path
    /// instead of a full gather.
    pub sorted: bool,
}

impl Kernel for Take {
    fn name(&self) -> &'static str {
        "take"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let block = single_block(self, args)?;
        Ok(Value::Block(block.select(Axis(self.axis), &self.positions)))
    }
}

/// Reorders rows gathered from several buckets into the requested order;
/// `picks` holds `(argument, row)` pairs, one per output position.
#[derive(Clone, Debug)]
pub struct Reorder {
    pub axis: usize,
    pub picks: Vec<(usize, usize)>,
}

impl Kernel for Reorder {
    fn name(&self) -> &'static str {
        "reorder"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let blocks = args.iter().map(|v| v.block()).collect::<Result<Vec<_>>>()?;

        if self.picks.is_empty() {
            let empty = blocks[0]
                .slice_axis(Axis(self.axis), NdSlice::new(0, Some(0), 1))
                .to_owned();
            return Ok(Value::Block(empty));
        }

        let rows = self
            .picks
            .iter()
            .map(|&(arg, row)| {
                let block = blocks.get(arg).ok_or_else(|| {
                    anyhow!("reorder references argument {} of {}", arg, blocks.len())
                })?;
                Ok(block.slice_axis(
                    Axis(self.axis),
                    NdSlice::new(row as isize, Some(row as isize + 1), 1),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Value::Block(concatenate(Axis(self.axis), &rows)?))
    }
}

/// Filters one axis of a block through a boolean mask block.
#[derive(Clone, Debug)]
pub struct Compress {
    pub axis: usize,
}

impl Kernel for Compress {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (block, mask) = match args {
            [block, mask] => (block.block()?, mask.bool_block()?),
            _ => bail!("compress expects a block and a mask"),
        };

        if mask.ndim() != 1 || mask.len() != block.len_of(Axis(self.axis)) {
            return Err(PlanError::MaskLengthMismatch {
                mask: mask.len() as u64,
                axis: self.axis,
                size: block.len_of(Axis(self.axis)) as u64,
            }
            .into());
        }

        let picks = mask
            .iter()
            .enumerate()
            .filter(|(_, &keep)| keep)
            .map(|(i, _)| i)
            .collect_vec();

        Ok(Value::Block(block.select(Axis(self.axis), &picks)))
    }
}

/// Gathers rows selected by a computed integer index block from all source
/// blocks along one axis. `boundaries` are the running block boundaries of
/// that axis, used to route every requested position to its owner.
#[derive(Clone, Debug)]
pub struct GatherBlocks {
    pub axis: usize,
    pub boundaries: Vec<u64>,
}

impl Kernel for GatherBlocks {
    fn name(&self) -> &'static str {
        "gather-blocks"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (index, blocks) = match args.split_first() {
            Some((index, blocks)) if !blocks.is_empty() => (index.int_block()?, blocks),
            _ => bail!("gather expects an index block and at least one source block"),
        };

        let blocks = blocks.iter().map(|v| v.block()).collect::<Result<Vec<_>>>()?;
        let total = self.boundaries.last().copied().unwrap_or(0);

        if index.is_empty() {
            let empty = blocks[0]
                .slice_axis(Axis(self.axis), NdSlice::new(0, Some(0), 1))
                .to_owned();
            return Ok(Value::Block(empty));
        }

        let rows = index
            .iter()
            .map(|&ix| {
                // Bounds are data-dependent and can only be checked here,
                // once the index values exist.
                let position = resolve_position(ix, total, self.axis)? as u64;
                let owner = self.boundaries.partition_point(|&b| b <= position);
                let start = if owner > 0 { self.boundaries[owner - 1] } else { 0 };
                let local = (position - start) as isize;

                Ok(blocks[owner].slice_axis(Axis(self.axis), NdSlice::new(local, Some(local + 1), 1)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Value::Block(concatenate(Axis(self.axis), &rows)?))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
        }
    }
}

/// Elementwise binary operation over two aligned blocks, or a block and a
/// scalar literal.
#[derive(Clone, Debug)]
pub struct BinOp {
    pub op: BinaryOp,
}

impl BinOp {
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }
}

impl Kernel for BinOp {
    fn name(&self) -> &'static str {
        "binop"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let op = self.op;
        match args {
            [Value::Block(a), Value::Block(b)] => {
                let mut out = a.clone();
                out.zip_mut_with(b, |x, &y| *x = op.apply(*x, y));
                Ok(Value::Block(out))
            }
            [Value::Block(a), scalar] => {
                let s = scalar.float()?;
                Ok(Value::Block(a.mapv(|x| op.apply(x, s))))
            }
            [scalar, Value::Block(b)] => {
                let s = scalar.float()?;
                Ok(Value::Block(b.mapv(|x| op.apply(s, x))))
            }
            [a, b] => Ok(Value::Float(op.apply(a.float()?, b.float()?))),
            _ => bail!("binop expects exactly two arguments"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Square,
    Exp,
    Ln,
}

impl UnaryOp {
    fn apply(self, v: f64) -> f64 {
        match self {
            UnaryOp::Neg => -v,
            UnaryOp::Abs => v.abs(),
            UnaryOp::Sqrt => v.sqrt(),
            UnaryOp::Square => v * v,
            UnaryOp::Exp => v.exp(),
            UnaryOp::Ln => v.ln(),
        }
    }
}

/// Elementwise unary operation over one block.
#[derive(Clone, Debug)]
pub struct MapOp {
    pub op: UnaryOp,
}

impl MapOp {
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }
}

impl Kernel for MapOp {
    fn name(&self) -> &'static str {
        "map"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let op = self.op;
        let block = single_block(self, args)?;
        Ok(Value::Block(block.mapv(|v| op.apply(v))))
    }
}

/// Adds an arbitrary number of aligned blocks; the contraction helper for
/// blockwise stages whose inputs carry symbols absent from the output.
#[derive(Clone, Debug)]
pub struct SumArgs;

impl Kernel for SumArgs {
    fn name(&self) -> &'static str {
        "sum-args"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let blocks = args.iter().map(|v| v.block()).collect::<Result<Vec<_>>>()?;
        let first = match blocks.first() {
            Some(b) => (*b).clone(),
            None => bail!("sum of no blocks"),
        };

        let mut out = first;
        for block in &blocks[1..] {
            out.zip_mut_with(block, |x, &y| *x += y);
        }

        Ok(Value::Block(out))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::IxDyn;

    fn block(values: &[f64]) -> Value {
        Value::Block(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap())
    }

    #[test]
    fn test_subset_slice_and_drop() {
        let data = ArrayD::from_shape_vec(
            IxDyn(&[3, 4]),
            (0..12).map(|v| v as f64).collect(),
        )
        .unwrap();

        // Row 1, columns 1..3.
        let kernel = Subset::new(vec![
            SubsetOp::At(1),
            SubsetOp::Range(Slice::new(1, 3, 1)),
        ]);
        let out = kernel.execute(&[Value::Block(data.clone())]).unwrap();
        let out = out.block().unwrap().clone();
        assert_eq!(out.shape(), &[2]);
        assert_eq!(out.as_slice().unwrap(), &[5.0, 6.0]);

        // A new axis in front, full rows, strided reversed columns.
        let kernel = Subset::new(vec![
            SubsetOp::NewAxis,
            SubsetOp::Full,
            SubsetOp::Range(Slice::new(None, None, -2)),
        ]);
        let out = kernel.execute(&[Value::Block(data)]).unwrap();
        let out = out.block().unwrap().clone();
        assert_eq!(out.shape(), &[1, 3, 2]);
        assert_eq!(out[[0, 0, 0]], 3.0);
        assert_eq!(out[[0, 0, 1]], 1.0);
    }

    #[test]
    fn test_subset_negative_offsets() {
        // Local slices produced for negative steps use offsets from the
        // block end, including the "one past the beginning" stop.
        let data = ArrayD::from_shape_vec(IxDyn(&[5]), vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let kernel = Subset::new(vec![SubsetOp::Range(Slice::new(-1, -6, -2))]);
        let out = kernel.execute(&[Value::Block(data)]).unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[4.0, 2.0, 0.0]);
    }

    #[test]
    fn test_subset_bounds_check() {
        let data = block(&[1.0, 2.0]);
        let kernel = Subset::new(vec![SubsetOp::At(5)]);
        let err = kernel.execute(&[data]).unwrap_err();
        let plan = err.downcast_ref::<PlanError>().unwrap();
        assert_eq!(plan.kind(), ErrorKind::Index);
    }

    #[test]
    fn test_take_and_reorder() {
        let data = block(&[10.0, 11.0, 12.0, 13.0]);
        let kernel = Take {
            axis: 0,
            positions: vec![3, 0, 0],
            sorted: false,
        };
        let out = kernel.execute(&[data.clone()]).unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[13.0, 10.0, 10.0]);

        let other = block(&[20.0, 21.0]);
        let kernel = Reorder {
            axis: 0,
            picks: vec![(1, 0), (0, 2), (1, 1)],
        };
        let out = kernel.execute(&[data, other]).unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[20.0, 12.0, 21.0]);
    }

    #[test]
    fn test_compress() {
        let data = block(&[1.0, 2.0, 3.0]);
        let mask = Value::BoolBlock(
            ArrayD::from_shape_vec(IxDyn(&[3]), vec![true, false, true]).unwrap(),
        );
        let out = Compress { axis: 0 }.execute(&[data.clone(), mask]).unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[1.0, 3.0]);

        let short = Value::BoolBlock(ArrayD::from_shape_vec(IxDyn(&[2]), vec![true, true]).unwrap());
        let err = Compress { axis: 0 }.execute(&[data, short]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PlanError>().unwrap().kind(),
            ErrorKind::Index
        );
    }

    #[test]
    fn test_gather_blocks() {
        let index = Value::IntBlock(
            ArrayD::from_shape_vec(IxDyn(&[4]), vec![5, 0, -1, 2]).unwrap(),
        );
        let a = block(&[0.0, 1.0, 2.0]);
        let b = block(&[3.0, 4.0, 5.0]);

        let kernel = GatherBlocks {
            axis: 0,
            boundaries: vec![3, 6],
        };
        let out = kernel.execute(&[index, a.clone(), b.clone()]).unwrap();
        assert_eq!(
            out.block().unwrap().as_slice().unwrap(),
            &[5.0, 0.0, 5.0, 2.0]
        );

        let oob = Value::IntBlock(ArrayD::from_shape_vec(IxDyn(&[1]), vec![6]).unwrap());
        let err = kernel.execute(&[oob, a, b]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PlanError>().unwrap().kind(),
            ErrorKind::Index
        );
    }

    #[test]
    fn test_elementwise() {
        let a = block(&[1.0, 2.0]);
        let b = block(&[10.0, 20.0]);

        let out = BinOp::new(BinaryOp::Add).execute(&[a.clone(), b]).unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[11.0, 22.0]);

        let out = BinOp::new(BinaryOp::Mul)
            .execute(&[a.clone(), Value::Float(3.0)])
            .unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[3.0, 6.0]);

        let out = MapOp::new(UnaryOp::Square).execute(&[a]).unwrap();
        assert_eq!(out.block().unwrap().as_slice().unwrap(), &[1.0, 4.0]);
    }
}
