//! The lazily planned chunked-array handle.
//!
//! An [`ArrayPlan`] carries a name, the chunk structure of the array it
//! denotes and the accumulated task graph that computes its blocks. Every
//! operation derives a new handle; nothing is evaluated until [`compute`]
//! hands the (fused) graph to the executor.
//!
//! [`compute`]: ArrayPlan::compute

use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice as NdSlice};
use std::sync::Arc;

use crate::executor;
use crate::kernels::{
    arg_kernels, mean_kernels, moment_kernels, reduce_kernels, ArgOp, BinOp, BinaryOp, Const,
    MapOp, ReduceOp, UnaryOp,
};
use crate::naming::deterministic_name;
use crate::planner::{
    blockwise, coordinates, normalize_axes, optimize_blockwise, slice_array, tree_reduce,
    BlockwiseArg, DynamicIndex, DynamicKind, IndexTerm, Plan, SplitEvery,
};
use crate::prelude::*;
use crate::types::{
    known_sizes, BlockLen, Chunks, Key, Layer, Task, TaskGraph, TaskMap, Value,
};
use tessera_core::util::bounded_range;

/// The shipped reduction family. Nan-skipping behavior is selected
/// separately so every member has a strict and a nan-aware form.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Reduction {
    Sum,
    Prod,
    Min,
    Max,
    Mean,
    Var { ddof: f64 },
}

#[derive(Clone, Debug)]
pub struct ArrayPlan {
    name: Arc<str>,
    chunks: Chunks,
    graph: TaskGraph,
}

impl ArrayPlan {
    /// Builds a source array from in-memory blocks, one per block
    /// coordinate in row-major order.
    pub fn from_blocks(label: &str, chunks: Chunks, blocks: Vec<ArrayD<f64>>) -> Result<Self> {
        Self::from_values(label, chunks, blocks.into_iter().map(Value::Block).collect())
    }

    /// Boolean source blocks, for use as dynamic mask indices.
    pub fn from_bool_blocks(
        label: &str,
        chunks: Chunks,
        blocks: Vec<ArrayD<bool>>,
    ) -> Result<Self> {
        Self::from_values(label, chunks, blocks.into_iter().map(Value::BoolBlock).collect())
    }

    /// Integer source blocks, for use as dynamic position indices.
    pub fn from_int_blocks(label: &str, chunks: Chunks, blocks: Vec<ArrayD<i64>>) -> Result<Self> {
        Self::from_values(label, chunks, blocks.into_iter().map(Value::IntBlock).collect())
    }

    fn from_values(label: &str, chunks: Chunks, values: Vec<Value>) -> Result<Self> {
        let coords = coordinates(&chunks.numblocks());
        if coords.len() != values.len() {
            bail!(
                "chunk structure describes {} blocks but {} were provided",
                coords.len(),
                values.len()
            );
        }

        let mut parts = vec![format!("{:?}", chunks)];
        parts.extend(values.iter().map(|v| v.canonical_token()));
        let name: Arc<str> = deterministic_name(label, &parts).into();

        let mut tasks = TaskMap::default();
        for (coord, value) in coords.into_iter().zip(values) {
            tasks.insert(
                Key::new(name.clone(), coord),
                Task::new(Arc::new(Const::new(value)), vec![]),
            );
        }

        let mut graph = TaskGraph::new();
        graph.insert(name.to_string(), Layer::Tasks(tasks), vec![]);

        Ok(Self {
            name,
            chunks,
            graph,
        })
    }

    /// Splits a dense array into regular blocks.
    pub fn from_array(label: &str, data: &ArrayD<f64>, block_shape: &[u64]) -> Result<Self> {
        let shape = data.shape().iter().map(|&s| s as u64).collect_vec();
        let chunks = Chunks::regular(&shape, block_shape)?;

        let mut blocks = Vec::with_capacity(chunks.block_count());
        for coord in coordinates(&chunks.numblocks()) {
            let mut view = data.view();
            for (axis, &block) in coord.iter().enumerate() {
                let bounds = known_sizes(&chunks.boundaries(axis));
                let stop = bounds[block] as isize;
                let start = if block > 0 { bounds[block - 1] as isize } else { 0 };
                view.slice_axis_inplace(Axis(axis), NdSlice::new(start, Some(stop), 1));
            }
            blocks.push(view.to_owned());
        }

        Self::from_blocks(label, chunks, blocks)
    }

    /// A chunked `start..stop` range with the given step, capped so a typo
    /// cannot enumerate an absurd element count.
    pub fn range(label: &str, start: i64, stop: i64, step: i64, block_len: u64) -> Result<Self> {
        let values = bounded_range(start, stop, step).map_err(PlanError::from)?;
        let data = ArrayD::from_shape_vec(
            IxDyn(&[values.len()]),
            values.into_iter().map(|v| v as f64).collect(),
        )?;
        Self::from_array(label, &data, &[max(block_len, 1)])
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn chunks(&self) -> &Chunks {
        &self.chunks
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn ndim(&self) -> usize {
        self.chunks.ndim()
    }

    pub fn shape(&self) -> Vec<BlockLen> {
        self.chunks.shape().to_vec()
    }

    fn with_plan(&self, plan: Plan, others: &[&ArrayPlan]) -> Self {
        let mut graph = self.graph.clone();
        for other in others {
            graph.merge(&other.graph);
        }
        graph.merge(&plan.graph);

        Self {
            name: plan.name,
            chunks: plan.chunks,
            graph,
        }
    }

    fn index_symbols(&self) -> Vec<char> {
        "abcdefghijklmnopqrstuvwxyz"
            .chars()
            .take(self.ndim())
            .collect()
    }

    /// Applies a multi-dimensional index expression.
    pub fn index(&self, terms: &[IndexTerm]) -> Result<Self> {
        let plan = slice_array("getitem", &self.name, &self.chunks, terms)?;
        Ok(self.with_plan(plan, &[]))
    }

    /// Filters `axis` through a chunked boolean mask that has not been
    /// computed yet. The result's sizes along that axis stay unknown.
    pub fn index_by_mask(&self, axis: usize, mask: &ArrayPlan) -> Result<Self> {
        let mut terms = vec![IndexTerm::full(); self.ndim()];
        terms[axis] = IndexTerm::Array(DynamicIndex {
            name: mask.name.clone(),
            chunks: mask.chunks.clone(),
            kind: DynamicKind::Bool,
        });

        let plan = slice_array("getitem", &self.name, &self.chunks, &terms)?;
        Ok(self.with_plan(plan, &[mask]))
    }

    /// Gathers positions along `axis` from a chunked integer index array.
    /// Bounds are checked when the index values are known, at compute time.
    pub fn index_by_positions(&self, axis: usize, positions: &ArrayPlan) -> Result<Self> {
        let mut terms = vec![IndexTerm::full(); self.ndim()];
        terms[axis] = IndexTerm::Array(DynamicIndex {
            name: positions.name.clone(),
            chunks: positions.chunks.clone(),
            kind: DynamicKind::Int,
        });

        let plan = slice_array("getitem", &self.name, &self.chunks, &terms)?;
        Ok(self.with_plan(plan, &[positions]))
    }

    /// Elementwise unary operation.
    pub fn map(&self, op: UnaryOp) -> Result<Self> {
        let symbols = self.index_symbols();
        let plan = blockwise(
            "map",
            &symbols,
            Arc::new(MapOp::new(op)),
            &[BlockwiseArg::Array {
                name: self.name.clone(),
                chunks: self.chunks.clone(),
                symbols: symbols.clone(),
            }],
            &[],
            &[],
        )?;
        Ok(self.with_plan(plan, &[]))
    }

    /// Elementwise binary operation over two aligned arrays.
    pub fn zip_with(&self, other: &ArrayPlan, op: BinaryOp) -> Result<Self> {
        let symbols = self.index_symbols();
        let plan = blockwise(
            "zip",
            &symbols,
            Arc::new(BinOp::new(op)),
            &[
                BlockwiseArg::Array {
                    name: self.name.clone(),
                    chunks: self.chunks.clone(),
                    symbols: symbols.clone(),
                },
                BlockwiseArg::Array {
                    name: other.name.clone(),
                    chunks: other.chunks.clone(),
                    symbols: symbols.clone(),
                },
            ],
            &[],
            &[],
        )?;
        Ok(self.with_plan(plan, &[other]))
    }

    /// Elementwise binary operation against a scalar literal.
    pub fn apply_scalar(&self, op: BinaryOp, value: f64) -> Result<Self> {
        let symbols = self.index_symbols();
        let plan = blockwise(
            "scalar",
            &symbols,
            Arc::new(BinOp::new(op)),
            &[
                BlockwiseArg::Array {
                    name: self.name.clone(),
                    chunks: self.chunks.clone(),
                    symbols: symbols.clone(),
                },
                BlockwiseArg::Literal(Value::Float(value)),
            ],
            &[],
            &[],
        )?;
        Ok(self.with_plan(plan, &[]))
    }

    /// Tree reduction over the given axes (all axes when `None`).
    pub fn reduce(
        &self,
        op: Reduction,
        skipna: bool,
        axes: Option<&[i64]>,
        split_every: &SplitEvery,
        keepdims: bool,
    ) -> Result<Self> {
        let all_axes: Vec<i64>;
        let axes = match axes {
            Some(axes) => axes,
            None => {
                all_axes = (0..self.ndim() as i64).collect();
                &all_axes
            }
        };
        let resolved = normalize_axes(axes, self.ndim())?;

        let (label, kernels) = match op {
            Reduction::Sum => (
                if skipna { "nansum" } else { "sum" },
                reduce_kernels(ReduceOp::Sum, &resolved, skipna, keepdims),
            ),
            Reduction::Prod => (
                if skipna { "nanprod" } else { "prod" },
                reduce_kernels(ReduceOp::Prod, &resolved, skipna, keepdims),
            ),
            Reduction::Min => (
                if skipna { "nanmin" } else { "min" },
                reduce_kernels(ReduceOp::Min, &resolved, skipna, keepdims),
            ),
            Reduction::Max => (
                if skipna { "nanmax" } else { "max" },
                reduce_kernels(ReduceOp::Max, &resolved, skipna, keepdims),
            ),
            Reduction::Mean => (
                if skipna { "nanmean" } else { "mean" },
                mean_kernels(&resolved, skipna, keepdims),
            ),
            Reduction::Var { ddof } => (
                if skipna { "nanvar" } else { "var" },
                moment_kernels(&resolved, ddof, skipna, keepdims),
            ),
        };

        let plan = tree_reduce(
            label,
            &self.name,
            &self.chunks,
            axes,
            split_every,
            &kernels,
            keepdims,
        )?;
        Ok(self.with_plan(plan, &[]))
    }

    pub fn sum(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Sum, false, axes, &SplitEvery::default(), keepdims)
    }

    pub fn nansum(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Sum, true, axes, &SplitEvery::default(), keepdims)
    }

    pub fn prod(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Prod, false, axes, &SplitEvery::default(), keepdims)
    }

    pub fn min(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Min, false, axes, &SplitEvery::default(), keepdims)
    }

    pub fn nanmin(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Min, true, axes, &SplitEvery::default(), keepdims)
    }

    pub fn max(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Max, false, axes, &SplitEvery::default(), keepdims)
    }

    pub fn nanmax(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Max, true, axes, &SplitEvery::default(), keepdims)
    }

    pub fn mean(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Mean, false, axes, &SplitEvery::default(), keepdims)
    }

    pub fn nanmean(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(Reduction::Mean, true, axes, &SplitEvery::default(), keepdims)
    }

    pub fn var(&self, ddof: f64, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(
            Reduction::Var { ddof },
            false,
            axes,
            &SplitEvery::default(),
            keepdims,
        )
    }

    pub fn nanvar(&self, ddof: f64, axes: Option<&[i64]>, keepdims: bool) -> Result<Self> {
        self.reduce(
            Reduction::Var { ddof },
            true,
            axes,
            &SplitEvery::default(),
            keepdims,
        )
    }

    pub fn argmin(&self, axes: &[i64], keepdims: bool) -> Result<Self> {
        self.arg_reduce(ArgOp::Min, false, axes, keepdims)
    }

    pub fn argmax(&self, axes: &[i64], keepdims: bool) -> Result<Self> {
        self.arg_reduce(ArgOp::Max, false, axes, keepdims)
    }

    pub fn nanargmin(&self, axes: &[i64], keepdims: bool) -> Result<Self> {
        self.arg_reduce(ArgOp::Min, true, axes, keepdims)
    }

    pub fn nanargmax(&self, axes: &[i64], keepdims: bool) -> Result<Self> {
        self.arg_reduce(ArgOp::Max, true, axes, keepdims)
    }

    fn arg_reduce(&self, op: ArgOp, skipna: bool, axes: &[i64], keepdims: bool) -> Result<Self> {
        // Arg reductions take a single scalar axis.
        if axes.len() != 1 {
            return Err(PlanError::AxisNotScalar { got: axes.len() }.into());
        }
        let axis = normalize_axes(axes, self.ndim())?[0];
        if !self.chunks.dim_is_known(axis) {
            return Err(PlanError::UnknownChunks { axis }.into());
        }

        // Global start offset of every block along the reduced axis, so the
        // combined index lives in the source coordinate space.
        let bounds = known_sizes(&self.chunks.boundaries(axis));
        let mut starts = vec![0];
        starts.extend_from_slice(&bounds[..bounds.len().saturating_sub(1)]);

        let label = match (op, skipna) {
            (ArgOp::Min, false) => "argmin",
            (ArgOp::Min, true) => "nanargmin",
            (ArgOp::Max, false) => "argmax",
            (ArgOp::Max, true) => "nanargmax",
        };

        let kernels = arg_kernels(op, axis, skipna, keepdims, starts);
        let plan = tree_reduce(
            label,
            &self.name,
            &self.chunks,
            axes,
            &SplitEvery::default(),
            &kernels,
            keepdims,
        )?;
        Ok(self.with_plan(plan, &[]))
    }

    /// Fuses the accumulated graph, evaluates every output block through
    /// the synchronous executor and assembles them into one dense array.
    pub fn compute(&self) -> Result<ArrayD<f64>> {
        let blocks = self
            .compute_values()?
            .into_iter()
            .map(|v| v.into_block())
            .collect::<Result<Vec<_>>>()?;
        assemble(&self.chunks.numblocks(), blocks)
    }

    /// As [`compute`](Self::compute), for integer-valued results such as
    /// arg reductions.
    pub fn compute_int(&self) -> Result<ArrayD<i64>> {
        let blocks = self
            .compute_values()?
            .into_iter()
            .map(|v| match v {
                Value::IntBlock(block) => Ok(block),
                other => bail!("expected an integer block, found {}", other.kind_name()),
            })
            .collect::<Result<Vec<_>>>()?;
        assemble(&self.chunks.numblocks(), blocks)
    }

    fn compute_values(&self) -> Result<Vec<Value>> {
        let graph = optimize_blockwise(&self.graph, &[&*self.name])?;

        let keys = coordinates(&self.chunks.numblocks())
            .into_iter()
            .map(|coord| Key::new(self.name.clone(), coord))
            .collect_vec();

        executor::submit(&graph, &keys)
    }
}

/// Concatenates row-major ordered blocks back into one dense array.
fn assemble<T: Clone>(counts: &[usize], mut blocks: Vec<ArrayD<T>>) -> Result<ArrayD<T>> {
    match counts.split_first() {
        None => match blocks.pop() {
            Some(block) if blocks.is_empty() => Ok(block),
            _ => bail!("scalar assembly expects exactly one block"),
        },
        Some((&first, rest)) => {
            let per_group = blocks.len() / max(first, 1);
            let parts = blocks
                .chunks(per_group)
                .map(|group| assemble(rest, group.to_vec()))
                .collect::<Result<Vec<_>>>()?;
            let views = parts.iter().map(|p| p.view()).collect_vec();
            Ok(concatenate(Axis(0), &views)?)
        }
    }
}
