//! Tree-structured reduction planning.
//!
//! An axis-restricted aggregation is compiled into three phases: a per-block
//! chunk phase producing partials, zero or more combine levels that group
//! partials along each reduced axis into buckets of bounded fan-in, and a
//! final aggregate per output coordinate. Axes outside the reduced set are
//! carried through untouched, so the reduction is embarrassingly parallel
//! across them.

use std::fmt::{self, Debug};
use std::sync::Arc;

use super::{coordinates, Plan};
use crate::kernels::Kernel;
use crate::naming::deterministic_name;
use crate::prelude::*;
use crate::types::{
    BlockIndex, BlockLen, Chunks, Key, Layer, Task, TaskArg, TaskGraph, TaskMap,
};
use crate::planner::blockwise::{BlockwiseStage, TaskTemplate, TemplateArg};
use tessera_core::util::div_ceil;

/// Default fan-in per reduced axis, balancing tree depth against per-node
/// argument count.
pub const DEFAULT_SPLIT_EVERY: usize = 4;

/// Fan-in configuration: one bound for every reduced axis, or a per-axis
/// mapping (missing axes fall back to the default). A fan-in of one turns
/// the tree into a flat reduction along that axis.
#[derive(Clone, Debug)]
pub enum SplitEvery {
    Uniform(usize),
    PerAxis(HashMap<usize, usize>),
}

impl Default for SplitEvery {
    fn default() -> Self {
        SplitEvery::Uniform(DEFAULT_SPLIT_EVERY)
    }
}

impl SplitEvery {
    pub fn for_axis(&self, axis: usize) -> usize {
        match self {
            SplitEvery::Uniform(split) => *split,
            SplitEvery::PerAxis(map) => map.get(&axis).copied().unwrap_or(DEFAULT_SPLIT_EVERY),
        }
    }

    fn token(&self) -> String {
        match self {
            SplitEvery::Uniform(split) => format!("uniform({})", split),
            SplitEvery::PerAxis(map) => {
                let mut entries = map.iter().map(|(a, s)| (*a, *s)).collect_vec();
                entries.sort_unstable();
                format!("per-axis({:?})", entries)
            }
        }
    }
}

/// How the chunk phase is emitted. A single kernel applied uniformly stays
/// declarative (a blockwise layer the fusion pass can absorb upstream
/// stages into); a per-block factory is used when the kernel depends on the
/// block's coordinate, as for arg reductions carrying global offsets.
#[derive(Clone)]
pub enum ChunkPhase {
    Blockwise(Arc<dyn Kernel>),
    PerBlock(Arc<dyn Fn(&[usize]) -> Arc<dyn Kernel> + Send + Sync>),
}

impl Debug for ChunkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkPhase::Blockwise(kernel) => write!(f, "blockwise({:?})", kernel),
            ChunkPhase::PerBlock(_) => write!(f, "per-block"),
        }
    }
}

impl ChunkPhase {
    fn token(&self) -> String {
        match self {
            ChunkPhase::Blockwise(kernel) => kernel.token(),
            ChunkPhase::PerBlock(_) => "per-block".to_string(),
        }
    }
}

/// The kernel triple of one reduction.
#[derive(Clone, Debug)]
pub struct ReductionKernels {
    pub chunk: ChunkPhase,
    pub combine: Arc<dyn Kernel>,
    pub aggregate: Arc<dyn Kernel>,
}

/// Resolves negative axes, bounds-checks against `[-ndim, ndim)` and rejects
/// repeats. The result is sorted ascending.
pub fn normalize_axes(axes: &[i64], ndim: usize) -> Result<Vec<usize>, PlanError> {
    let mut resolved = Vec::with_capacity(axes.len());

    for &axis in axes {
        let n = ndim as i64;
        let r = if axis < 0 { axis + n } else { axis };
        if r < 0 || r >= n {
            return Err(PlanError::AxisOutOfBounds { axis, ndim });
        }
        if resolved.contains(&(r as usize)) {
            return Err(PlanError::RepeatedAxis { axis: r as usize });
        }
        resolved.push(r as usize);
    }

    resolved.sort_unstable();
    Ok(resolved)
}

/// Compiles an axis-restricted aggregation over a chunked array into a tree
/// of partial-aggregation tasks with bounded fan-in.
///
/// An empty `axes` set is a valid identity-shaped pass-through that still
/// applies the chunk and aggregate kernels once per block.
pub fn tree_reduce(
    label: &str,
    in_name: &Arc<str>,
    chunks: &Chunks,
    axes: &[i64],
    split_every: &SplitEvery,
    kernels: &ReductionKernels,
    keepdims: bool,
) -> Result<Plan, PlanError> {
    let ndim = chunks.ndim();
    let axes = normalize_axes(axes, ndim)?;

    for &axis in &axes {
        if !chunks.dim_is_known(axis) {
            return Err(PlanError::UnknownChunks { axis });
        }
        if split_every.for_axis(axis) == 0 {
            return Err(PlanError::InvalidSplitEvery { got: 0 });
        }
    }

    let parts = vec![
        in_name.to_string(),
        format!("axes{:?}", axes),
        split_every.token(),
        kernels.chunk.token(),
        kernels.combine.token(),
        kernels.aggregate.token(),
        format!("keepdims={}", keepdims),
    ];
    let name: Arc<str> = deterministic_name(label, &parts).into();

    let counts = chunks.numblocks();
    let mut graph = TaskGraph::new();

    // Chunk phase: one partial per source block, reduced axes folded to
    // unit extent.
    let chunk_name: Arc<str> = format!("{}-chunk", name).into();
    match &kernels.chunk {
        ChunkPhase::Blockwise(kernel) => {
            let symbols: Vec<char> = "abcdefghijklmnopqrstuvwxyz"
                .chars()
                .take(ndim)
                .collect();
            let stage = BlockwiseStage {
                name: chunk_name.clone(),
                symbols: symbols.clone(),
                counts: symbols.iter().copied().zip(counts.iter().copied()).collect(),
                template: TaskTemplate {
                    kernel: kernel.clone(),
                    args: vec![TemplateArg::Block {
                        name: in_name.clone(),
                        symbols: symbols.iter().copied().collect(),
                        counts: counts.iter().copied().collect(),
                    }],
                },
            };
            graph.insert(
                chunk_name.to_string(),
                Layer::Blockwise(stage),
                vec![in_name.to_string()],
            );
        }
        ChunkPhase::PerBlock(factory) => {
            let mut tasks = TaskMap::default();
            for coord in coordinates(&counts) {
                tasks.insert(
                    Key::new(chunk_name.clone(), coord.clone()),
                    Task::new(
                        factory(&coord),
                        vec![TaskArg::Key(Key::new(in_name.clone(), coord))],
                    ),
                );
            }
            graph.insert(
                chunk_name.to_string(),
                Layer::Tasks(tasks),
                vec![in_name.to_string()],
            );
        }
    }

    // Combine levels: bucket the partials along every reduced axis until
    // each axis fits a single aggregate. A fan-in of one skips bucketing
    // entirely (flat reduction along that axis).
    let mut remaining: Vec<usize> = counts.to_vec();
    let mut prev_name = chunk_name;
    let mut level = 1;

    loop {
        let needs_level = axes
            .iter()
            .any(|&a| split_every.for_axis(a) >= 2 && remaining[a] > split_every.for_axis(a));
        if !needs_level {
            break;
        }

        let mut next = remaining.clone();
        for &axis in &axes {
            let split = split_every.for_axis(axis);
            if split >= 2 {
                next[axis] = div_ceil(remaining[axis] as i64, split as i64) as usize;
            }
        }

        let level_name: Arc<str> = format!("{}-combine-{}", name, level).into();
        let mut tasks = TaskMap::default();
        for coord in coordinates(&next) {
            let args = bucket_args(&prev_name, &coord, &remaining, &axes, split_every, false);
            tasks.insert(
                Key::new(level_name.clone(), coord),
                Task::new(kernels.combine.clone(), args),
            );
        }
        graph.insert(
            level_name.to_string(),
            Layer::Tasks(tasks),
            vec![prev_name.to_string()],
        );

        prev_name = level_name;
        remaining = next;
        level += 1;
    }

    // Aggregate: one task per output coordinate, consuming every partial
    // left along the reduced axes.
    let out_counts = (0..ndim)
        .filter(|d| !axes.contains(d))
        .map(|d| counts[d])
        .collect_vec();

    let mut tasks = TaskMap::default();
    for out_coord in coordinates(&out_counts) {
        // Rebuild the full-rank coordinate with reduced axes pinned to
        // zero, then expand them over all remaining partials.
        let mut full = BlockIndex::new();
        let mut taken = 0;
        for d in 0..ndim {
            if axes.contains(&d) {
                full.push(0);
            } else {
                full.push(out_coord[taken]);
                taken += 1;
            }
        }

        let args = bucket_args(&prev_name, &full, &remaining, &axes, split_every, true);

        let key_coord: BlockIndex = if keepdims {
            full
        } else {
            out_coord.clone()
        };
        tasks.insert(
            Key::new(name.clone(), key_coord),
            Task::new(kernels.aggregate.clone(), args),
        );
    }
    graph.insert(
        name.to_string(),
        Layer::Tasks(tasks),
        vec![prev_name.to_string()],
    );

    let out_chunks = Chunks::from_dims((0..ndim).filter_map(|d| {
        if !axes.contains(&d) {
            Some(chunks.dim(d).clone())
        } else if keepdims {
            Some(vec![BlockLen::Known(1)].into())
        } else {
            None
        }
    }));

    Ok(Plan {
        name,
        chunks: out_chunks,
        graph,
    })
}

/// The ordered upstream keys one combine or aggregate task consumes: the
/// Cartesian product of each reduced axis's bucket range (the whole axis for
/// the aggregate), ascending so first-occurrence tie-breaks are preserved.
fn bucket_args(
    prev: &Arc<str>,
    coord: &BlockIndex,
    remaining: &[usize],
    axes: &[usize],
    split_every: &SplitEvery,
    whole_axis: bool,
) -> Vec<TaskArg> {
    let ranges = coord
        .iter()
        .enumerate()
        .map(|(d, &c)| {
            if !axes.contains(&d) {
                c..c + 1
            } else if whole_axis {
                0..remaining[d]
            } else {
                let split = split_every.for_axis(d);
                if split >= 2 {
                    let lo = c * split;
                    lo..min(lo + split, remaining[d])
                } else {
                    c..c + 1
                }
            }
        })
        .collect_vec();

    let range_counts = ranges.iter().map(|r| r.len()).collect_vec();
    coordinates(&range_counts)
        .into_iter()
        .map(|offsets| {
            let index: BlockIndex = ranges
                .iter()
                .zip(&offsets)
                .map(|(range, &offset)| range.start + offset)
                .collect();
            TaskArg::Key(Key::new(prev.clone(), index))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::{reduce_kernels, ReduceOp};
    use crate::types::dependencies_and_dependents;

    fn fan_in_bound(graph: &TaskGraph, out_name: &str, bound: usize) {
        let tasks = graph.materialize().unwrap();
        let (deps, _) = dependencies_and_dependents(&tasks);

        for (key, key_deps) in &deps {
            if key.name.starts_with(out_name) && !key.name.contains("chunk") {
                assert!(
                    key_deps.len() <= bound,
                    "task {:?} has fan-in {} over bound {}",
                    key,
                    key_deps.len(),
                    bound
                );
            }
        }
    }

    fn sum_plan(sizes: &[Vec<u64>], axes: &[i64], split: usize, keepdims: bool) -> Plan {
        let chunks = Chunks::from_sizes(sizes);
        let name: Arc<str> = Arc::from("x");
        let resolved = normalize_axes(axes, chunks.ndim()).unwrap();
        let kernels = reduce_kernels(ReduceOp::Sum, &resolved, false, keepdims);

        tree_reduce(
            "sum",
            &name,
            &chunks,
            axes,
            &SplitEvery::Uniform(split),
            &kernels,
            keepdims,
        )
        .unwrap()
    }

    #[test]
    fn test_tree_depth_and_fan_in() {
        // Sixteen blocks with fan-in four: chunk, one combine level, one
        // aggregate, and a single output block.
        let plan = sum_plan(&[vec![2; 16]], &[0], 4, false);

        assert_eq!(plan.graph.num_layers(), 3);
        assert_eq!(plan.chunks.ndim(), 0);
        assert_eq!(plan.graph.layer(&plan.name).unwrap().len(), 1);

        fan_in_bound(&plan.graph, &plan.name, 4);

        // 16 chunk + 4 combine + 1 aggregate.
        assert_eq!(plan.graph.task_count(), 21);
    }

    #[test]
    fn test_split_at_least_block_count_is_single_level() {
        let plan = sum_plan(&[vec![2; 3]], &[0], 8, false);
        assert_eq!(plan.graph.num_layers(), 2);
        assert_eq!(plan.graph.task_count(), 4);
    }

    #[test]
    fn test_split_of_one_is_flat() {
        // A fan-in of one degenerates into a flat reduction: no combine
        // levels, the aggregate consumes every partial at once.
        let plan = sum_plan(&[vec![2; 10]], &[0], 1, false);
        assert_eq!(plan.graph.num_layers(), 2);

        let tasks = plan.graph.materialize().unwrap();
        let aggregate = &tasks[&Key::new(plan.name.clone(), BlockIndex::new())];
        assert_eq!(aggregate.args.len(), 10);
    }

    #[test]
    fn test_untouched_axes_stay_parallel() {
        // Reducing axis 1 of a 3x8 block grid leaves axis 0 independent.
        let plan = sum_plan(&[vec![4; 3], vec![4; 8]], &[1], 4, false);

        assert_eq!(plan.chunks.ndim(), 1);
        assert_eq!(plan.chunks.nblocks(0), 3);
        assert_eq!(&crate::types::known_sizes(plan.chunks.dim(0)), &[4, 4, 4]);

        fan_in_bound(&plan.graph, &plan.name, 4);

        // 24 chunk + 6 combine + 3 aggregate.
        assert_eq!(plan.graph.task_count(), 33);
    }

    #[test]
    fn test_multi_axis_fan_in_is_product_bounded() {
        let plan = sum_plan(&[vec![1; 4], vec![1; 4]], &[0, 1], 2, false);
        // Fan-in is bounded by the product of per-axis fan-ins.
        fan_in_bound(&plan.graph, &plan.name, 4);
        assert_eq!(plan.graph.layer(&plan.name).unwrap().len(), 1);
    }

    #[test]
    fn test_keepdims_keeps_unit_axes() {
        let plan = sum_plan(&[vec![4; 3], vec![4; 2]], &[1], 4, true);

        assert_eq!(plan.chunks.ndim(), 2);
        assert_eq!(plan.chunks.nblocks(1), 1);
        assert_eq!(&crate::types::known_sizes(plan.chunks.dim(1)), &[1]);

        let tasks = plan.graph.materialize().unwrap();
        assert!(tasks.contains_key(&Key::new(plan.name.clone(), vec![2, 0])));
    }

    #[test]
    fn test_empty_axis_set_is_per_block_pass_through() {
        let plan = sum_plan(&[vec![3, 3]], &[], 4, false);

        assert_eq!(&crate::types::known_sizes(plan.chunks.dim(0)), &[3, 3]);
        assert_eq!(plan.graph.num_layers(), 2);

        // One chunk call and one aggregate call per block.
        assert_eq!(plan.graph.task_count(), 4);

        let tasks = plan.graph.materialize().unwrap();
        let aggregate = &tasks[&Key::new(plan.name.clone(), vec![1])];
        assert_eq!(aggregate.args.len(), 1);
    }

    #[test]
    fn test_axis_validation() {
        let chunks = Chunks::from_sizes(&[vec![2, 2], vec![2, 2]]);
        let name: Arc<str> = Arc::from("x");
        let kernels = reduce_kernels(ReduceOp::Sum, &[0], false, false);

        let err = tree_reduce(
            "sum",
            &name,
            &chunks,
            &[2],
            &SplitEvery::default(),
            &kernels,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::AxisOutOfBounds { axis: 2, ndim: 2 }));

        let err = tree_reduce(
            "sum",
            &name,
            &chunks,
            &[-3],
            &SplitEvery::default(),
            &kernels,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::AxisOutOfBounds { axis: -3, .. }));

        let err = tree_reduce(
            "sum",
            &name,
            &chunks,
            &[0, -2],
            &SplitEvery::default(),
            &kernels,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::RepeatedAxis { axis: 0 }));

        // Negative axes resolve before sorting.
        assert_eq!(normalize_axes(&[-1, 0], 2).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_unknown_chunks_fail_fast() {
        let chunks = Chunks::from_dims(vec![
            vec![BlockLen::Known(2), BlockLen::Unknown].into(),
        ]);
        let name: Arc<str> = Arc::from("x");
        let kernels = reduce_kernels(ReduceOp::Sum, &[0], false, false);

        let err = tree_reduce(
            "sum",
            &name,
            &chunks,
            &[0],
            &SplitEvery::default(),
            &kernels,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownChunks { axis: 0 }));
    }

    #[test]
    fn test_invalid_split_every() {
        let chunks = Chunks::from_sizes(&[vec![2, 2]]);
        let name: Arc<str> = Arc::from("x");
        let kernels = reduce_kernels(ReduceOp::Sum, &[0], false, false);

        let err = tree_reduce(
            "sum",
            &name,
            &chunks,
            &[0],
            &SplitEvery::Uniform(0),
            &kernels,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidSplitEvery { got: 0 }));
    }

    #[test]
    fn test_per_axis_split() {
        let split = SplitEvery::PerAxis(
            vec![(0, 2), (1, 8)].into_iter().collect(),
        );
        assert_eq!(split.for_axis(0), 2);
        assert_eq!(split.for_axis(1), 8);
        assert_eq!(split.for_axis(5), DEFAULT_SPLIT_EVERY);

        let chunks = Chunks::from_sizes(&[vec![1; 8], vec![1; 8]]);
        let name: Arc<str> = Arc::from("x");
        let resolved = normalize_axes(&[0, 1], 2).unwrap();
        let kernels = reduce_kernels(ReduceOp::Sum, &resolved, false, false);

        let plan =
            tree_reduce("sum", &name, &chunks, &[0, 1], &split, &kernels, false).unwrap();
        fan_in_bound(&plan.graph, &plan.name, 2 * 8);
    }

    #[test]
    fn test_plan_names_distinguish() {
        let a = sum_plan(&[vec![2; 4]], &[0], 4, false);
        let b = sum_plan(&[vec![2; 4]], &[0], 4, false);
        let c = sum_plan(&[vec![2; 4]], &[0], 2, false);

        assert_eq!(a.name, b.name);
        assert_ne!(a.name, c.name);
    }
}
