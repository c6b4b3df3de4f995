//! Translation of multi-dimensional index expressions into per-block
//! sub-slice tasks.
//!
//! An index expression is first normalized (ellipsis expansion, bounds
//! resolution, mask conversion) and then dispatched per dimension: integers
//! and slices compose through a Cartesian product of the per-dimension block
//! mappings, integer lists route through the fancy-take path, and indexing
//! by a not-yet-computed chunked array defers the output shape.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{coordinates, Plan};
use crate::kernels::{Compress, GatherBlocks, Kernel, Reorder, Subset, SubsetOp, Take};
use crate::naming::deterministic_name;
use crate::prelude::*;
use crate::types::{
    block_sizes, known_sizes, locate, translate_slice, BlockIndex, BlockLen, Chunks, DimSizes,
    Key, Layer, Slice, Task, TaskArg, TaskGraph, TaskMap,
};
use tessera_core::util::div_ceil;

/// One term of a multi-dimensional index expression.
#[derive(Clone, Debug)]
pub enum IndexTerm {
    /// Single position; drops the dimension.
    At(i64),
    /// Slice with arbitrary non-zero step.
    Range(Slice),
    /// Explicit positions along the dimension.
    List(Vec<i64>),
    /// Static boolean mask; converted to positions during normalization.
    Mask(Vec<bool>),
    /// Insert a new unit dimension.
    NewAxis,
    /// Expands to full slices over the unindexed dimensions.
    Ellipsis,
    /// A chunked array of positions or mask flags that has not been
    /// computed yet.
    Array(DynamicIndex),
}

/// Reference to a chunked one-dimensional index array.
#[derive(Clone, Debug)]
pub struct DynamicIndex {
    pub name: Arc<str>,
    pub chunks: Chunks,
    pub kind: DynamicKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DynamicKind {
    Int,
    Bool,
}

impl IndexTerm {
    pub fn full() -> Self {
        IndexTerm::Range(Slice::full())
    }

    pub fn range(
        start: impl Into<Option<i64>>,
        stop: impl Into<Option<i64>>,
        step: i64,
    ) -> Self {
        IndexTerm::Range(Slice::new(start, stop, step))
    }

    fn consumes_dim(&self) -> bool {
        !matches!(self, IndexTerm::NewAxis | IndexTerm::Ellipsis)
    }

    fn is_full_range(&self) -> bool {
        matches!(self, IndexTerm::Range(s) if s.is_full())
    }

    fn token(&self) -> String {
        match self {
            IndexTerm::At(position) => format!("at({})", position),
            IndexTerm::Range(slice) => format!("{:?}", slice),
            IndexTerm::List(positions) => format!("list{:?}", positions),
            IndexTerm::Mask(mask) => format!("mask{:?}", mask),
            IndexTerm::NewAxis => "newaxis".to_string(),
            IndexTerm::Ellipsis => "ellipsis".to_string(),
            IndexTerm::Array(dynamic) => format!("array({}:{:?})", dynamic.name, dynamic.kind),
        }
    }
}

/// Normalizes an index expression against the array's chunk structure:
/// expands the (single) ellipsis, pads omitted trailing dimensions with full
/// slices, resolves negative positions, bounds-checks scalar and list
/// indices against `[-n, n)` and converts boolean masks into position lists.
pub fn normalize_index(terms: &[IndexTerm], chunks: &Chunks) -> Result<Vec<IndexTerm>, PlanError> {
    let ndim = chunks.ndim();

    let ellipses = terms
        .iter()
        .filter(|t| matches!(t, IndexTerm::Ellipsis))
        .count();
    if ellipses > 1 {
        return Err(PlanError::MultipleEllipsis);
    }

    let consumed = terms.iter().filter(|t| t.consumes_dim()).count();
    if consumed > ndim {
        return Err(PlanError::TooManyIndices {
            ndim,
            got: consumed,
        });
    }
    let missing = ndim - consumed;

    let mut out = Vec::with_capacity(terms.len() + missing);
    let mut dim = 0;

    for term in terms {
        match term {
            IndexTerm::Ellipsis => {
                for _ in 0..missing {
                    out.push(IndexTerm::full());
                    dim += 1;
                }
            }
            IndexTerm::NewAxis => out.push(IndexTerm::NewAxis),
            other => {
                out.push(normalize_term(other, dim, chunks)?);
                dim += 1;
            }
        }
    }

    if ellipses == 0 {
        for _ in 0..missing {
            out.push(IndexTerm::full());
        }
    }

    Ok(out)
}

fn normalize_term(term: &IndexTerm, axis: usize, chunks: &Chunks) -> Result<IndexTerm, PlanError> {
    let extent = chunks.extent(axis);
    let known = || extent.known().ok_or(PlanError::UnknownChunks { axis });

    match term {
        IndexTerm::At(position) => Ok(IndexTerm::At(resolve_position(*position, known()?, axis)?)),
        IndexTerm::Range(slice) => {
            if !slice.is_full() && !chunks.dim_is_known(axis) {
                return Err(PlanError::UnknownChunks { axis });
            }
            Ok(IndexTerm::Range(*slice))
        }
        IndexTerm::List(positions) => {
            let size = known()?;
            let resolved = positions
                .iter()
                .map(|&p| resolve_position(p, size, axis))
                .collect::<Result<_, _>>()?;
            Ok(IndexTerm::List(resolved))
        }
        IndexTerm::Mask(mask) => {
            let size = known()?;
            if mask.len() as u64 != size {
                return Err(PlanError::MaskLengthMismatch {
                    mask: mask.len() as u64,
                    axis,
                    size,
                });
            }
            Ok(IndexTerm::List(
                mask.iter()
                    .enumerate()
                    .filter(|(_, &keep)| keep)
                    .map(|(i, _)| i as i64)
                    .collect(),
            ))
        }
        IndexTerm::Array(dynamic) => {
            if dynamic.chunks.ndim() != 1 {
                return Err(PlanError::InvalidIndexArray);
            }
            Ok(term.clone())
        }
        IndexTerm::NewAxis | IndexTerm::Ellipsis => unreachable!("handled by the caller"),
    }
}

fn resolve_position(position: i64, size: u64, axis: usize) -> Result<i64, PlanError> {
    let n = size as i64;
    let resolved = if position < 0 { position + n } else { position };

    if resolved < 0 || resolved >= n {
        return Err(PlanError::IndexOutOfBounds {
            index: position,
            axis,
            size,
        });
    }

    Ok(resolved)
}

/// Compiles an index expression over a chunked array into a task graph
/// fragment plus the chunk structure of the result.
pub fn slice_array(
    label: &str,
    in_name: &Arc<str>,
    chunks: &Chunks,
    terms: &[IndexTerm],
) -> Result<Plan, PlanError> {
    let terms = normalize_index(terms, chunks)?;

    // Slicing every dimension with the full default slice is free: the
    // result aliases the input blocks and emits no tasks at all.
    if terms.iter().all(|t| t.is_full_range()) {
        return Ok(Plan {
            name: in_name.clone(),
            chunks: chunks.clone(),
            graph: TaskGraph::new(),
        });
    }

    let mut parts = vec![in_name.to_string()];
    parts.extend(terms.iter().map(|t| t.token()));
    let name: Arc<str> = deterministic_name(label, &parts).into();

    if terms.iter().any(|t| matches!(t, IndexTerm::Array(_))) {
        return plan_dynamic(name, in_name, chunks, &terms);
    }

    let lists = terms
        .iter()
        .filter(|t| matches!(t, IndexTerm::List(_)))
        .count();
    if lists > 1 {
        return Err(PlanError::MultipleListIndices);
    }

    if let Some(term_index) = terms.iter().position(|t| matches!(t, IndexTerm::List(_))) {
        let axis = terms[..term_index]
            .iter()
            .filter(|t| t.consumes_dim())
            .count();
        let positions = match &terms[term_index] {
            IndexTerm::List(positions) => positions,
            _ => unreachable!(),
        };

        let runs = build_runs(chunks.dim(axis), positions);
        let touched: IndexSet<usize> = runs.iter().map(|r| r.block).collect();

        let factor = runs.len() / max(chunks.nblocks(axis), 1);
        if factor >= 8 {
            warn!(
                "take along axis {} increases the block count by a factor of {}",
                axis, factor
            );
        }

        if runs.len() > 2 * max(touched.len(), 1) {
            warn!(
                "take of {} positions along axis {} falls into {} runs over {} blocks \
                 and degrades into a shuffle",
                positions.len(),
                axis,
                runs.len(),
                touched.len()
            );

            let others_trivial = terms
                .iter()
                .enumerate()
                .all(|(i, t)| i == term_index || t.is_full_range());
            if others_trivial {
                return plan_shuffle(name, in_name, chunks, axis, positions);
            }
        }
    }

    plan_subset(name, in_name, chunks, &terms)
}

/// Per-dimension dispatch result used by the subset path.
enum DimPlan {
    At { block: usize, local: u64 },
    Blocks(Vec<(usize, Slice, BlockLen)>),
    Runs(Vec<Run>),
    NewAxis,
}

struct Run {
    block: usize,
    locals: Vec<usize>,
    sorted: bool,
}

/// The Cartesian composition of integer, slice, list and new-axis terms:
/// every output block reads exactly one source block, applying all local
/// slices and indices in a single call.
fn plan_subset(
    name: Arc<str>,
    in_name: &Arc<str>,
    chunks: &Chunks,
    terms: &[IndexTerm],
) -> Result<Plan, PlanError> {
    let mut dims = Vec::with_capacity(terms.len());
    let mut dim = 0;

    for term in terms {
        match term {
            IndexTerm::At(position) => {
                let (block, local) = locate(chunks.dim(dim), *position as u64);
                dims.push(DimPlan::At { block, local });
                dim += 1;
            }
            IndexTerm::Range(slice) => {
                dims.push(DimPlan::Blocks(translate_dim(chunks.dim(dim), *slice)));
                dim += 1;
            }
            IndexTerm::List(positions) => {
                dims.push(DimPlan::Runs(build_runs(chunks.dim(dim), positions)));
                dim += 1;
            }
            IndexTerm::NewAxis => dims.push(DimPlan::NewAxis),
            _ => unreachable!("unnormalized index term"),
        }
    }

    let out_chunks = Chunks::from_dims(dims.iter().filter_map(|plan| match plan {
        DimPlan::At { .. } => None,
        DimPlan::Blocks(entries) => Some(entries.iter().map(|(_, _, size)| *size).collect()),
        DimPlan::Runs(runs) => Some(
            runs.iter()
                .map(|r| BlockLen::Known(r.locals.len() as u64))
                .collect(),
        ),
        DimPlan::NewAxis => Some(DimSizes::from(vec![BlockLen::Known(1)])),
    }));

    let option_counts = dims
        .iter()
        .map(|plan| match plan {
            DimPlan::At { .. } | DimPlan::NewAxis => 1,
            DimPlan::Blocks(entries) => entries.len(),
            DimPlan::Runs(runs) => runs.len(),
        })
        .collect_vec();

    let mut tasks = TaskMap::default();

    for combo in coordinates(&option_counts) {
        let mut out_coord = BlockIndex::new();
        let mut src_coord = BlockIndex::new();
        let mut ops = Vec::with_capacity(dims.len());
        let mut take: Option<Take> = None;
        let mut others_full = true;
        let mut source_dim = 0;

        for (plan, &choice) in dims.iter().zip(&combo) {
            match plan {
                DimPlan::At { block, local } => {
                    src_coord.push(*block);
                    ops.push(SubsetOp::At(*local as i64));
                    others_full = false;
                    source_dim += 1;
                }
                DimPlan::Blocks(entries) => {
                    let (block, slice, _) = &entries[choice];
                    out_coord.push(choice);
                    src_coord.push(*block);
                    if slice.is_full() {
                        ops.push(SubsetOp::Full);
                    } else {
                        ops.push(SubsetOp::Range(*slice));
                        others_full = false;
                    }
                    source_dim += 1;
                }
                DimPlan::Runs(runs) => {
                    let run = &runs[choice];
                    out_coord.push(choice);
                    src_coord.push(run.block);
                    ops.push(SubsetOp::Pick(
                        run.locals.iter().map(|&p| p as i64).collect(),
                    ));
                    take = Some(Take {
                        axis: source_dim,
                        positions: run.locals.clone(),
                        sorted: run.sorted,
                    });
                    source_dim += 1;
                }
                DimPlan::NewAxis => {
                    out_coord.push(0);
                    ops.push(SubsetOp::NewAxis);
                    others_full = false;
                }
            }
        }

        // A run with every other dimension untouched is served by the
        // simpler take path; anything else goes through the general subset.
        let kernel: Arc<dyn Kernel> = match take {
            Some(take) if others_full => Arc::new(take),
            _ => Arc::new(Subset::new(ops)),
        };

        tasks.insert(
            Key::new(name.clone(), out_coord),
            Task::new(kernel, vec![TaskArg::Key(Key::new(in_name.clone(), src_coord))]),
        );
    }

    let mut graph = TaskGraph::new();
    graph.insert(name.to_string(), Layer::Tasks(tasks), vec![in_name.to_string()]);

    Ok(Plan {
        name,
        chunks: out_chunks,
        graph,
    })
}

/// Translates one dimension's slice into output-ordered block entries
/// `(source block, local slice, output size)`. For a negative step the
/// blocks appear in reversed order.
fn translate_dim(sizes: &DimSizes, slice: Slice) -> Vec<(usize, Slice, BlockLen)> {
    if slice.is_full() {
        return sizes
            .iter()
            .enumerate()
            .map(|(block, &size)| (block, Slice::full(), size))
            .collect();
    }

    let map = translate_slice(sizes, slice);
    if map.is_empty() {
        // An empty selection still produces a single empty block.
        return vec![(0, Slice::new(0, 0, 1), BlockLen::Known(0))];
    }

    let lengths = known_sizes(sizes);
    let entry = |(&block, &local): (&usize, &Slice)| {
        let size = if local.is_full() {
            lengths[block]
        } else {
            local.selected_len()
        };
        (block, local, BlockLen::Known(size))
    };

    if slice.step > 0 {
        map.iter().map(entry).collect()
    } else {
        map.iter().rev().map(entry).collect()
    }
}

/// Groups requested positions into maximal runs owned by a single source
/// block. Runs are the output chunking of a fancy take.
fn build_runs(sizes: &DimSizes, positions: &[i64]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();

    for &position in positions {
        let (block, local) = locate(sizes, position as u64);
        match runs.last_mut() {
            Some(run) if run.block == block => run.locals.push(local as usize),
            _ => runs.push(Run {
                block,
                locals: vec![local as usize],
                sorted: true,
            }),
        }
    }

    for run in &mut runs {
        run.sorted = run.locals.windows(2).all(|w| w[0] <= w[1]);
    }

    if runs.is_empty() {
        runs.push(Run {
            block: 0,
            locals: Vec::new(),
            sorted: true,
        });
    }

    runs
}

/// Two-phase sort-then-gather plan for heavily out-of-order takes: a first
/// pass re-buckets each touched source block's requested rows in ascending
/// order, a second pass reorders within fixed-size output segments to the
/// exact requested order. This trades one intermediate materialization for
/// avoiding a task count quadratic in the block count.
fn plan_shuffle(
    name: Arc<str>,
    in_name: &Arc<str>,
    chunks: &Chunks,
    axis: usize,
    positions: &[i64],
) -> Result<Plan, PlanError> {
    let sizes = chunks.dim(axis);
    let lengths = known_sizes(sizes);

    let located = positions
        .iter()
        .map(|&p| locate(sizes, p as u64))
        .collect_vec();

    let mut bucket_locals: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(block, local) in &located {
        bucket_locals.entry(block).or_default().push(local as usize);
    }
    for locals in bucket_locals.values_mut() {
        locals.sort_unstable();
        locals.dedup();
    }
    let ranks: HashMap<usize, usize> = bucket_locals
        .keys()
        .enumerate()
        .map(|(rank, &block)| (block, rank))
        .collect();

    let bucket_name: Arc<str> = format!("{}-bucket", name).into();
    let other_counts = (0..chunks.ndim())
        .filter(|&d| d != axis)
        .map(|d| chunks.nblocks(d))
        .collect_vec();

    let mut bucket_tasks = TaskMap::default();
    for combo in coordinates(&other_counts) {
        for (&block, locals) in &bucket_locals {
            let mut src = combo.clone();
            src.insert(axis, block);
            let mut dst = combo.clone();
            dst.insert(axis, ranks[&block]);

            bucket_tasks.insert(
                Key::new(bucket_name.clone(), dst),
                Task::new(
                    Arc::new(Take {
                        axis,
                        positions: locals.clone(),
                        sorted: true,
                    }),
                    vec![TaskArg::Key(Key::new(in_name.clone(), src))],
                ),
            );
        }
    }

    // Output segments sized to the largest source block, last one ragged.
    let segment = max(lengths.iter().copied().max().unwrap_or(1), 1) as usize;
    let total = positions.len();
    let nsegments = max(div_ceil(total as i64, segment as i64), 1) as usize;

    let mut out_sizes = Vec::with_capacity(nsegments);
    let mut out_tasks = TaskMap::default();

    for combo in coordinates(&other_counts) {
        for s in 0..nsegments {
            let lo = s * segment;
            let hi = min(lo + segment, total);
            if combo.iter().all(|&c| c == 0) {
                out_sizes.push((hi - lo) as u64);
            }

            let mut arg_of: IndexMap<usize, usize> = default();
            let mut picks = Vec::with_capacity(hi - lo);
            for &(block, local) in &located[lo..hi] {
                let next = arg_of.len();
                let arg = *arg_of.entry(ranks[&block]).or_insert(next);
                let row = bucket_locals[&block]
                    .binary_search(&(local as usize))
                    .expect("requested row missing from its bucket");
                picks.push((arg, row));
            }

            let args = arg_of
                .keys()
                .map(|&rank| {
                    let mut index = combo.clone();
                    index.insert(axis, rank);
                    TaskArg::Key(Key::new(bucket_name.clone(), index))
                })
                .collect_vec();

            let mut dst = combo.clone();
            dst.insert(axis, s);
            out_tasks.insert(
                Key::new(name.clone(), dst),
                Task::new(Arc::new(Reorder { axis, picks }), args),
            );
        }
    }

    let out_chunks = Chunks::from_dims((0..chunks.ndim()).map(|d| {
        if d == axis {
            block_sizes(&out_sizes)
        } else {
            chunks.dim(d).clone()
        }
    }));

    let mut graph = TaskGraph::new();
    graph.insert(
        bucket_name.to_string(),
        Layer::Tasks(bucket_tasks),
        vec![in_name.to_string()],
    );
    graph.insert(
        name.to_string(),
        Layer::Tasks(out_tasks),
        vec![bucket_name.to_string()],
    );

    Ok(Plan {
        name,
        chunks: out_chunks,
        graph,
    })
}

/// Indexing by a chunked array whose values are unknown at planning time.
/// The output shape along the indexed axis is deferred: unknown for boolean
/// masks, the index array's own chunking for integer indices. The index
/// array is never materialized to plan shapes.
fn plan_dynamic(
    name: Arc<str>,
    in_name: &Arc<str>,
    chunks: &Chunks,
    terms: &[IndexTerm],
) -> Result<Plan, PlanError> {
    let dynamics = terms
        .iter()
        .filter(|t| matches!(t, IndexTerm::Array(_)))
        .count();
    let term_index = terms
        .iter()
        .position(|t| matches!(t, IndexTerm::Array(_)))
        .expect("no dynamic index term");

    let others_trivial = terms
        .iter()
        .enumerate()
        .all(|(i, t)| i == term_index || t.is_full_range());
    if dynamics > 1 || !others_trivial {
        return Err(PlanError::MixedDynamicIndex);
    }

    let axis = term_index;
    let index = match &terms[term_index] {
        IndexTerm::Array(dynamic) => dynamic,
        _ => unreachable!(),
    };

    let counts = chunks.numblocks();
    let mut graph = TaskGraph::new();
    let deps = vec![in_name.to_string(), index.name.to_string()];

    match index.kind {
        DynamicKind::Bool => {
            if chunks.dim(axis) != index.chunks.dim(0) {
                return Err(PlanError::MismatchedIndexChunks { axis });
            }

            let mut tasks = TaskMap::default();
            for coord in coordinates(&counts) {
                tasks.insert(
                    Key::new(name.clone(), coord.clone()),
                    Task::new(
                        Arc::new(Compress { axis }),
                        vec![
                            TaskArg::Key(Key::new(in_name.clone(), coord.clone())),
                            TaskArg::Key(Key::new(index.name.clone(), vec![coord[axis]])),
                        ],
                    ),
                );
            }
            graph.insert(name.to_string(), Layer::Tasks(tasks), deps);

            // Selected counts are data-dependent; sizes stay unknown until
            // the mask is computed.
            let out_chunks = Chunks::from_dims((0..chunks.ndim()).map(|d| {
                if d == axis {
                    chunks.dim(d).iter().map(|_| BlockLen::Unknown).collect()
                } else {
                    chunks.dim(d).clone()
                }
            }));

            Ok(Plan {
                name,
                chunks: out_chunks,
                graph,
            })
        }
        DynamicKind::Int => {
            if !chunks.dim_is_known(axis) {
                return Err(PlanError::UnknownChunks { axis });
            }
            let boundaries = known_sizes(&chunks.boundaries(axis));

            let mut out_counts = counts.clone();
            out_counts[axis] = index.chunks.nblocks(0);

            let mut tasks = TaskMap::default();
            for coord in coordinates(&out_counts) {
                let mut args = vec![TaskArg::Key(Key::new(
                    index.name.clone(),
                    vec![coord[axis]],
                ))];
                for block in 0..chunks.nblocks(axis) {
                    let mut src = coord.clone();
                    src[axis] = block;
                    args.push(TaskArg::Key(Key::new(in_name.clone(), src)));
                }

                tasks.insert(
                    Key::new(name.clone(), coord),
                    Task::new(
                        Arc::new(GatherBlocks {
                            axis,
                            boundaries: boundaries.clone(),
                        }),
                        args,
                    ),
                );
            }
            graph.insert(name.to_string(), Layer::Tasks(tasks), deps);

            let out_chunks = Chunks::from_dims((0..chunks.ndim()).map(|d| {
                if d == axis {
                    index.chunks.dim(0).clone()
                } else {
                    chunks.dim(d).clone()
                }
            }));

            Ok(Plan {
                name,
                chunks: out_chunks,
                graph,
            })
        }
    }
}
