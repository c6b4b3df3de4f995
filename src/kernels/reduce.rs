//! The shipped reduction kernel family: per-block partials, tree combines
//! and final aggregates for the standard statistics, including nan-skipping
//! variants.
//!
//! Partials travel as tuples so that combining never re-introduces bias:
//! mean carries `(sum, count)`, variance carries `(count, total, m2)` merged
//! with the pairwise update formula, and the arg reductions carry
//! `(value, source index)` pairs so the final index refers to the original
//! coordinate space.

use itertools::izip;
use ndarray::{ArrayD, Axis};
use std::sync::Arc;

use super::Kernel;
use crate::planner::reduction::{ChunkPhase, ReductionKernels};
use crate::prelude::*;
use crate::types::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl ReduceOp {
    fn identity(self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Prod => 1.0,
            ReduceOp::Min => f64::INFINITY,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }

    /// Strict accumulation: a NaN operand poisons the result.
    fn strict(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Prod => a * b,
            ReduceOp::Min | ReduceOp::Max if a.is_nan() || b.is_nan() => f64::NAN,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    /// Nan-skipping accumulation over an accumulator that starts as NaN for
    /// min/max (an all-missing lane stays NaN) and as the identity otherwise.
    fn skipping(self, acc: f64, v: f64) -> f64 {
        if v.is_nan() {
            return acc;
        }

        match self {
            ReduceOp::Sum => acc + v,
            ReduceOp::Prod => acc * v,
            ReduceOp::Min => {
                if acc.is_nan() {
                    v
                } else {
                    acc.min(v)
                }
            }
            ReduceOp::Max => {
                if acc.is_nan() {
                    v
                } else {
                    acc.max(v)
                }
            }
        }
    }

    fn chunk_init(self, skipna: bool) -> f64 {
        match (self, skipna) {
            (ReduceOp::Min, true) | (ReduceOp::Max, true) => f64::NAN,
            _ => self.identity(),
        }
    }
}

/// Reduces the given axes of a block one at a time, keeping every reduced
/// axis as a unit dimension.
fn fold_axes<F>(block: &ArrayD<f64>, axes: &[usize], init: f64, f: F) -> ArrayD<f64>
where
    F: Fn(f64, f64) -> f64,
{
    let mut out = block.clone();
    for &ax in axes {
        out = out
            .fold_axis(Axis(ax), init, |&acc, &v| f(acc, v))
            .insert_axis(Axis(ax));
    }
    out
}

/// Removes the (unit-sized) reduced axes from an aggregated block.
fn drop_axes<T: Clone>(block: ArrayD<T>, axes: &[usize]) -> ArrayD<T> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();

    let mut out = block;
    for &ax in sorted.iter().rev() {
        out = out.index_axis_move(Axis(ax), 0);
    }
    out
}

fn cleaned_and_counts(block: &ArrayD<f64>, skipna: bool) -> (ArrayD<f64>, ArrayD<f64>) {
    if skipna {
        (
            block.mapv(|v| if v.is_nan() { 0.0 } else { v }),
            block.mapv(|v| if v.is_nan() { 0.0 } else { 1.0 }),
        )
    } else {
        (block.clone(), block.mapv(|_| 1.0))
    }
}

fn pair2<'a>(kernel: &dyn Kernel, value: &'a Value) -> Result<(&'a Value, &'a Value)> {
    match value.tuple()? {
        [a, b] => Ok((a, b)),
        other => bail!("{} expects pairs, got {} items", kernel.name(), other.len()),
    }
}

fn triple<'a>(kernel: &dyn Kernel, value: &'a Value) -> Result<(&'a Value, &'a Value, &'a Value)> {
    match value.tuple()? {
        [a, b, c] => Ok((a, b, c)),
        other => bail!("{} expects triples, got {} items", kernel.name(), other.len()),
    }
}

/// Per-block partial of a plain reduction, keeping reduced axes as unit
/// dimensions.
#[derive(Clone, Debug)]
pub struct ReduceChunk {
    pub op: ReduceOp,
    pub axes: Vec<usize>,
    pub skipna: bool,
}

impl Kernel for ReduceChunk {
    fn name(&self) -> &'static str {
        "reduce-chunk"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let block = super::single_block(self, args)?;
        let op = self.op;

        let out = if self.skipna {
            match op {
                // Replacing NaN with the identity up front keeps the
                // skipping semantics even for an empty axis set, where the
                // fold never runs.
                ReduceOp::Sum | ReduceOp::Prod => {
                    let cleaned = block.mapv(|v| if v.is_nan() { op.identity() } else { v });
                    fold_axes(&cleaned, &self.axes, op.identity(), |acc, v| op.strict(acc, v))
                }
                ReduceOp::Min | ReduceOp::Max => {
                    fold_axes(block, &self.axes, op.chunk_init(true), |acc, v| {
                        op.skipping(acc, v)
                    })
                }
            }
        } else {
            fold_axes(block, &self.axes, op.chunk_init(false), |acc, v| {
                op.strict(acc, v)
            })
        };

        Ok(Value::Block(out))
    }
}

/// Combines a bucket of aligned partials elementwise.
#[derive(Clone, Debug)]
pub struct ReduceCombine {
    pub op: ReduceOp,
    pub skipna: bool,
}

impl Kernel for ReduceCombine {
    fn name(&self) -> &'static str {
        "reduce-combine"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        Ok(Value::Block(combine_blocks(self.op, self.skipna, args)?))
    }
}

fn combine_blocks(op: ReduceOp, skipna: bool, args: &[Value]) -> Result<ArrayD<f64>> {
    let mut iter = args.iter();
    let first = match iter.next() {
        Some(v) => v.block()?.clone(),
        None => bail!("combine of no partials"),
    };

    let mut acc = first;
    for value in iter {
        let block = value.block()?;
        if skipna {
            acc.zip_mut_with(block, |x, &y| *x = op.skipping(*x, y));
        } else {
            acc.zip_mut_with(block, |x, &y| *x = op.strict(*x, y));
        }
    }

    Ok(acc)
}

/// Final aggregation of a plain reduction. For the nan-skipping min/max
/// variants an all-missing lane is a degenerate condition raised here, at
/// compute time.
#[derive(Clone, Debug)]
pub struct ReduceAggregate {
    pub op: ReduceOp,
    pub axes: Vec<usize>,
    pub skipna: bool,
    pub keepdims: bool,
}

impl Kernel for ReduceAggregate {
    fn name(&self) -> &'static str {
        "reduce-aggregate"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let acc = combine_blocks(self.op, self.skipna, args)?;

        if self.skipna
            && matches!(self.op, ReduceOp::Min | ReduceOp::Max)
            && acc.iter().any(|v| v.is_nan())
        {
            return Err(PlanError::AllNanSlice.into());
        }

        let out = if self.keepdims {
            acc
        } else {
            drop_axes(acc, &self.axes)
        };

        Ok(Value::Block(out))
    }
}

/// Per-block partial of a mean: the `(sum, count)` pair.
#[derive(Clone, Debug)]
pub struct MeanChunk {
    pub axes: Vec<usize>,
    pub skipna: bool,
}

impl Kernel for MeanChunk {
    fn name(&self) -> &'static str {
        "mean-chunk"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let block = super::single_block(self, args)?;
        let (cleaned, counts) = cleaned_and_counts(block, self.skipna);

        let sum = fold_axes(&cleaned, &self.axes, 0.0, |a, b| a + b);
        let count = fold_axes(&counts, &self.axes, 0.0, |a, b| a + b);

        Ok(Value::Tuple(vec![Value::Block(sum), Value::Block(count)]))
    }
}

#[derive(Clone, Debug)]
pub struct MeanCombine;

impl Kernel for MeanCombine {
    fn name(&self) -> &'static str {
        "mean-combine"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (sum, count) = sum_pairs(self, args)?;
        Ok(Value::Tuple(vec![Value::Block(sum), Value::Block(count)]))
    }
}

fn sum_pairs(kernel: &dyn Kernel, args: &[Value]) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
    let mut iter = args.iter();
    let (sum0, count0) = match iter.next() {
        Some(v) => pair2(kernel, v)?,
        None => bail!("combine of no partials"),
    };

    let mut sum = sum0.block()?.clone();
    let mut count = count0.block()?.clone();

    for value in iter {
        let (s, c) = pair2(kernel, value)?;
        sum.zip_mut_with(s.block()?, |x, &y| *x += y);
        count.zip_mut_with(c.block()?, |x, &y| *x += y);
    }

    Ok((sum, count))
}

#[derive(Clone, Debug)]
pub struct MeanAggregate {
    pub axes: Vec<usize>,
    pub skipna: bool,
    pub keepdims: bool,
}

impl Kernel for MeanAggregate {
    fn name(&self) -> &'static str {
        "mean-aggregate"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (sum, count) = sum_pairs(self, args)?;

        let mut mean = sum;
        mean.zip_mut_with(&count, |x, &n| *x /= n);

        let out = if self.keepdims {
            mean
        } else {
            drop_axes(mean, &self.axes)
        };

        Ok(Value::Block(out))
    }
}

/// Per-block partial of a variance: `(count, total, m2)` where `m2` is the
/// sum of squared deviations from the block mean.
#[derive(Clone, Debug)]
pub struct MomentChunk {
    pub axes: Vec<usize>,
    pub skipna: bool,
}

impl Kernel for MomentChunk {
    fn name(&self) -> &'static str {
        "moment-chunk"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let block = super::single_block(self, args)?;
        let (cleaned, counts) = cleaned_and_counts(block, self.skipna);

        let total = fold_axes(&cleaned, &self.axes, 0.0, |a, b| a + b);
        let count = fold_axes(&counts, &self.axes, 0.0, |a, b| a + b);

        let mut mean = total.clone();
        mean.zip_mut_with(&count, |x, &n| *x /= n);

        let diff = block - &mean;
        let sq = if self.skipna {
            diff.mapv(|d| if d.is_nan() { 0.0 } else { d * d })
        } else {
            diff.mapv(|d| d * d)
        };
        let m2 = fold_axes(&sq, &self.axes, 0.0, |a, b| a + b);

        Ok(Value::Tuple(vec![
            Value::Block(count),
            Value::Block(total),
            Value::Block(m2),
        ]))
    }
}

fn merge_moments(
    kernel: &dyn Kernel,
    args: &[Value],
) -> Result<(ArrayD<f64>, ArrayD<f64>, ArrayD<f64>)> {
    let mut iter = args.iter();
    let (n0, t0, m0) = match iter.next() {
        Some(v) => triple(kernel, v)?,
        None => bail!("combine of no partials"),
    };

    let mut count = n0.block()?.clone();
    let mut total = t0.block()?.clone();
    let mut m2 = m0.block()?.clone();

    for value in iter {
        let (n2, t2, mm2) = triple(kernel, value)?;
        let (n2, t2, mm2) = (n2.block()?, t2.block()?, mm2.block()?);

        let shape = count.raw_dim();
        let mut counts = Vec::with_capacity(count.len());
        let mut totals = Vec::with_capacity(count.len());
        let mut ms = Vec::with_capacity(count.len());

        for (&na, &ta, &ma, &nb, &tb, &mb) in izip!(
            count.iter(),
            total.iter(),
            m2.iter(),
            n2.iter(),
            t2.iter(),
            mm2.iter()
        ) {
            // Pairwise merge of `(count, total, m2)` statistics.
            let (n, t, m) = if na == 0.0 {
                (nb, tb, mb)
            } else if nb == 0.0 {
                (na, ta, ma)
            } else {
                let n = na + nb;
                let delta = tb / nb - ta / na;
                let m = ma + mb + delta * delta * na * nb / n;
                (n, ta + tb, m)
            };

            counts.push(n);
            totals.push(t);
            ms.push(m);
        }

        count = ArrayD::from_shape_vec(shape.clone(), counts)?;
        total = ArrayD::from_shape_vec(shape.clone(), totals)?;
        m2 = ArrayD::from_shape_vec(shape, ms)?;
    }

    Ok((count, total, m2))
}

#[derive(Clone, Debug)]
pub struct MomentCombine;

impl Kernel for MomentCombine {
    fn name(&self) -> &'static str {
        "moment-combine"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (count, total, m2) = merge_moments(self, args)?;
        Ok(Value::Tuple(vec![
            Value::Block(count),
            Value::Block(total),
            Value::Block(m2),
        ]))
    }
}

#[derive(Clone, Debug)]
pub struct MomentAggregate {
    pub axes: Vec<usize>,
    pub ddof: f64,
    pub skipna: bool,
    pub keepdims: bool,
}

impl Kernel for MomentAggregate {
    fn name(&self) -> &'static str {
        "moment-aggregate"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (count, _total, m2) = merge_moments(self, args)?;
        let ddof = self.ddof;

        let mut var = m2;
        var.zip_mut_with(&count, |m, &n| {
            let denom = n - ddof;
            *m = if n == 0.0 || denom <= 0.0 {
                f64::NAN
            } else {
                *m / denom
            };
        });

        let out = if self.keepdims {
            var
        } else {
            drop_axes(var, &self.axes)
        };

        Ok(Value::Block(out))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArgOp {
    Min,
    Max,
}

impl ArgOp {
    /// Whether `candidate` is strictly better than `best`, both non-NaN.
    fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            ArgOp::Min => candidate < best,
            ArgOp::Max => candidate > best,
        }
    }
}

/// Per-block partial of an arg reduction along a single axis: lane-wise
/// `(value, index)` pairs, where the index is offset into the un-reduced
/// coordinate space of the source array.
#[derive(Clone, Debug)]
pub struct ArgChunk {
    pub op: ArgOp,
    pub axis: usize,
    pub skipna: bool,
    pub offset: i64,
}

impl Kernel for ArgChunk {
    fn name(&self) -> &'static str {
        "arg-chunk"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let block = super::single_block(self, args)?;
        let axis = self.axis;

        if block.len_of(Axis(axis)) == 0 {
            return Err(PlanError::EmptyReduction { axis }.into());
        }

        let op = self.op;
        let skipna = self.skipna;
        let pairs = block.map_axis(Axis(axis), |lane| {
            let mut best_v = f64::NAN;
            let mut best_i: i64 = -1;

            for (i, &v) in lane.iter().enumerate() {
                if skipna {
                    if v.is_nan() {
                        continue;
                    }
                    if best_i < 0 || op.improves(v, best_v) {
                        best_v = v;
                        best_i = i as i64;
                    }
                } else if best_i < 0 {
                    best_v = v;
                    best_i = i as i64;
                } else if best_v.is_nan() {
                    // The first NaN wins a strict arg reduction.
                } else if v.is_nan() || op.improves(v, best_v) {
                    best_v = v;
                    best_i = i as i64;
                }
            }

            (best_v, best_i)
        });

        let offset = self.offset;
        let values = pairs.mapv(|(v, _)| v).insert_axis(Axis(axis));
        let indices = pairs
            .mapv(|(_, i)| if i < 0 { -1 } else { i + offset })
            .insert_axis(Axis(axis));

        Ok(Value::Tuple(vec![
            Value::Block(values),
            Value::IntBlock(indices),
        ]))
    }
}

fn choose_args(
    kernel: &dyn Kernel,
    op: ArgOp,
    skipna: bool,
    args: &[Value],
) -> Result<(ArrayD<f64>, ArrayD<i64>)> {
    let mut iter = args.iter();
    let (v0, i0) = match iter.next() {
        Some(v) => pair2(kernel, v)?,
        None => bail!("combine of no partials"),
    };

    let mut values = v0.block()?.clone();
    let mut indices = i0.int_block()?.clone();

    // Partials arrive in ascending coordinate order, so keeping the current
    // winner on ties preserves first-occurrence semantics.
    for value in iter {
        let (vb, ib) = pair2(kernel, value)?;
        let (vb, ib) = (vb.block()?, ib.int_block()?);

        let shape = values.raw_dim();
        let mut out_v = Vec::with_capacity(values.len());
        let mut out_i = Vec::with_capacity(values.len());

        for (&va, &ia, &vb, &ib) in izip!(values.iter(), indices.iter(), vb.iter(), ib.iter()) {
            let keep_b = if skipna {
                !vb.is_nan() && (va.is_nan() || op.improves(vb, va))
            } else if va.is_nan() {
                false
            } else {
                vb.is_nan() || op.improves(vb, va)
            };

            if keep_b {
                out_v.push(vb);
                out_i.push(ib);
            } else {
                out_v.push(va);
                out_i.push(ia);
            }
        }

        values = ArrayD::from_shape_vec(shape.clone(), out_v)?;
        indices = ArrayD::from_shape_vec(shape, out_i)?;
    }

    Ok((values, indices))
}

#[derive(Clone, Debug)]
pub struct ArgCombine {
    pub op: ArgOp,
    pub skipna: bool,
}

impl Kernel for ArgCombine {
    fn name(&self) -> &'static str {
        "arg-combine"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (values, indices) = choose_args(self, self.op, self.skipna, args)?;
        Ok(Value::Tuple(vec![
            Value::Block(values),
            Value::IntBlock(indices),
        ]))
    }
}

#[derive(Clone, Debug)]
pub struct ArgAggregate {
    pub op: ArgOp,
    pub axis: usize,
    pub skipna: bool,
    pub keepdims: bool,
}

impl Kernel for ArgAggregate {
    fn name(&self) -> &'static str {
        "arg-aggregate"
    }

    fn execute(&self, args: &[Value]) -> Result<Value> {
        let (values, indices) = choose_args(self, self.op, self.skipna, args)?;

        if self.skipna && values.iter().any(|v| v.is_nan()) {
            return Err(PlanError::AllNanSlice.into());
        }

        let out = if self.keepdims {
            indices
        } else {
            drop_axes(indices, &[self.axis])
        };

        Ok(Value::IntBlock(out))
    }
}

/// Kernel triple for `sum`, `prod`, `min` and `max` style reductions.
pub fn reduce_kernels(op: ReduceOp, axes: &[usize], skipna: bool, keepdims: bool) -> ReductionKernels {
    ReductionKernels {
        chunk: ChunkPhase::Blockwise(Arc::new(ReduceChunk {
            op,
            axes: axes.to_vec(),
            skipna,
        })),
        combine: Arc::new(ReduceCombine { op, skipna }),
        aggregate: Arc::new(ReduceAggregate {
            op,
            axes: axes.to_vec(),
            skipna,
            keepdims,
        }),
    }
}

/// Kernel triple for mean reductions carrying `(sum, count)` pairs.
pub fn mean_kernels(axes: &[usize], skipna: bool, keepdims: bool) -> ReductionKernels {
    ReductionKernels {
        chunk: ChunkPhase::Blockwise(Arc::new(MeanChunk {
            axes: axes.to_vec(),
            skipna,
        })),
        combine: Arc::new(MeanCombine),
        aggregate: Arc::new(MeanAggregate {
            axes: axes.to_vec(),
            skipna,
            keepdims,
        }),
    }
}

/// Kernel triple for variance reductions carrying `(count, total, m2)`.
pub fn moment_kernels(axes: &[usize], ddof: f64, skipna: bool, keepdims: bool) -> ReductionKernels {
    ReductionKernels {
        chunk: ChunkPhase::Blockwise(Arc::new(MomentChunk {
            axes: axes.to_vec(),
            skipna,
        })),
        combine: Arc::new(MomentCombine),
        aggregate: Arc::new(MomentAggregate {
            axes: axes.to_vec(),
            ddof,
            skipna,
            keepdims,
        }),
    }
}

/// Kernel triple for arg reductions along one axis. `starts` holds the
/// global start offset of every block along that axis, consulted per block
/// so combined indices live in the source coordinate space.
pub fn arg_kernels(
    op: ArgOp,
    axis: usize,
    skipna: bool,
    keepdims: bool,
    starts: Vec<u64>,
) -> ReductionKernels {
    ReductionKernels {
        chunk: ChunkPhase::PerBlock(Arc::new(move |index: &[usize]| {
            Arc::new(ArgChunk {
                op,
                axis,
                skipna,
                offset: starts[index[axis]] as i64,
            }) as Arc<dyn Kernel>
        })),
        combine: Arc::new(ArgCombine { op, skipna }),
        aggregate: Arc::new(ArgAggregate {
            op,
            axis,
            skipna,
            keepdims,
        }),
    }
}
