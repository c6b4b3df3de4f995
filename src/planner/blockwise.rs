//! Declarative blockwise stages and their algebraic fusion.
//!
//! A stage maps every output block coordinate to one task by substituting
//! the coordinate into each input's index-symbol sequence. The symbols form
//! a small index algebra: an input missing an output symbol broadcasts along
//! it, an input symbol absent from the output is a contraction consumed
//! entirely by the kernel, and `new_axes` introduces output symbols backed
//! by no input at all.
//!
//! Stages stay declarative inside the graph so the fusion pass can rewrite
//! chains of them into a single composite stage before any task is
//! materialized.

use smallvec::SmallVec;
use std::fmt::{self, Debug};
use std::sync::Arc;

use super::{coordinates, Plan};
use crate::kernels::Kernel;
use crate::naming::deterministic_name;
use crate::prelude::*;
use crate::types::{
    block_sizes, BlockLen, Chunks, DimSizes, Key, Layer, Task, TaskArg, TaskGraph, TaskMap, Value,
};

pub type Symbol = char;

/// Pool drawn from when fusion must rename a producer-private symbol.
const SYMBOL_POOL: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// One argument of a blockwise operation, as supplied by the caller.
#[derive(Clone, Debug)]
pub enum BlockwiseArg {
    /// A chunked array, with one index symbol per dimension.
    Array {
        name: Arc<str>,
        chunks: Chunks,
        symbols: Vec<Symbol>,
    },
    /// A literal configuration value, passed to the kernel unchanged.
    Literal(Value),
}

impl BlockwiseArg {
    pub fn array(name: &Arc<str>, chunks: &Chunks, symbols: &str) -> Self {
        BlockwiseArg::Array {
            name: name.clone(),
            chunks: chunks.clone(),
            symbols: symbols.chars().collect(),
        }
    }
}

/// Chunking of an output symbol introduced through `new_axes`.
#[derive(Clone, Debug)]
pub enum NewAxisChunks {
    /// A single block of the given length.
    Single(u64),
    /// A pre-chunked new axis with explicit block lengths.
    Sizes(Vec<u64>),
}

/// Per-symbol block-size override for stages whose kernel changes block
/// extents in a way the index algebra cannot express.
#[derive(Clone)]
pub enum AdjustChunks {
    /// Every block ends up with this length.
    Constant(u64),
    /// Explicit per-block lengths; must match the block count.
    Sizes(Vec<u64>),
    /// Transform applied to each existing block length.
    Transform(Arc<dyn Fn(BlockLen) -> BlockLen + Send + Sync>),
}

impl Debug for AdjustChunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustChunks::Constant(c) => write!(f, "constant({})", c),
            AdjustChunks::Sizes(v) => write!(f, "sizes({:?})", v),
            AdjustChunks::Transform(_) => write!(f, "transform"),
        }
    }
}

/// Argument slot of a stage's task template.
#[derive(Clone, Debug)]
pub enum TemplateArg {
    /// Block of a source array. `counts` holds the per-dimension block
    /// counts of that array; a count of one broadcasts.
    Block {
        name: Arc<str>,
        symbols: SmallVec<[Symbol; 4]>,
        counts: SmallVec<[usize; 4]>,
    },
    Literal(Value),
    /// Inlined producer stage. Shared `Arc`s denote shared intermediates
    /// and materialize into shared inline tasks.
    Subtask(Arc<TaskTemplate>),
}

/// The body every output block's task is instantiated from.
#[derive(Clone, Debug)]
pub struct TaskTemplate {
    pub kernel: Arc<dyn Kernel>,
    pub args: Vec<TemplateArg>,
}

/// A declarative blockwise computation: output symbols, per-symbol block
/// counts (including contraction symbols) and the task template.
#[derive(Clone, Debug)]
pub struct BlockwiseStage {
    pub name: Arc<str>,
    pub symbols: Vec<Symbol>,
    pub counts: IndexMap<Symbol, usize>,
    pub template: TaskTemplate,
}

impl BlockwiseStage {
    pub fn output_block_count(&self) -> usize {
        self.symbols.iter().map(|s| self.counts[s]).product()
    }

    /// Expands the stage into its flat per-block task mapping: the Cartesian
    /// product over the output symbols' block-count ranges.
    pub fn materialize(&self) -> Result<TaskMap> {
        let counts = self.symbols.iter().map(|s| self.counts[s]).collect_vec();
        let mut out = TaskMap::default();

        for coord in coordinates(&counts) {
            let mut env: HashMap<Symbol, usize> = default();
            for (&symbol, &index) in self.symbols.iter().zip(&coord) {
                env.insert(symbol, index);
            }

            let mut shared: HashMap<*const TaskTemplate, Arc<Task>> = default();
            let task = self.instantiate(&self.template, &env, &mut shared)?;
            out.insert(Key::new(self.name.clone(), coord), task);
        }

        Ok(out)
    }

    fn instantiate(
        &self,
        template: &TaskTemplate,
        env: &HashMap<Symbol, usize>,
        shared: &mut HashMap<*const TaskTemplate, Arc<Task>>,
    ) -> Result<Task> {
        let mut args = Vec::with_capacity(template.args.len());

        for arg in &template.args {
            match arg {
                TemplateArg::Literal(value) => args.push(TaskArg::Literal(value.clone())),
                TemplateArg::Block {
                    name,
                    symbols,
                    counts,
                } => self.expand_block(name, symbols, counts, env, &mut args),
                TemplateArg::Subtask(sub) => {
                    let ptr = Arc::as_ptr(sub);
                    let task = if let Some(task) = shared.get(&ptr) {
                        task.clone()
                    } else {
                        let task = Arc::new(self.instantiate(sub, env, shared)?);
                        shared.insert(ptr, task.clone());
                        task
                    };
                    args.push(TaskArg::Inline(task));
                }
            }
        }

        Ok(Task::new(template.kernel.clone(), args))
    }

    /// Emits the key of one block argument under the current coordinate, or
    /// the ordered run of keys when the argument carries contraction
    /// symbols.
    fn expand_block(
        &self,
        name: &Arc<str>,
        symbols: &[Symbol],
        counts: &[usize],
        env: &HashMap<Symbol, usize>,
        out: &mut Vec<TaskArg>,
    ) {
        let select = |env: &HashMap<Symbol, usize>| {
            symbols
                .iter()
                .zip(counts)
                .map(|(s, &c)| if c == 1 { 0 } else { env[s] })
                .collect::<SmallVec<[usize; 4]>>()
        };

        let free = symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| !env.contains_key(s))
            .map(|(d, _)| d)
            .collect_vec();

        if free.is_empty() {
            out.push(TaskArg::Key(Key::new(name.clone(), select(env))));
            return;
        }

        let free_counts = free.iter().map(|&d| counts[d]).collect_vec();
        for combo in coordinates(&free_counts) {
            let mut env = env.clone();
            for (&d, &index) in free.iter().zip(&combo) {
                env.insert(symbols[d], index);
            }
            out.push(TaskArg::Key(Key::new(name.clone(), select(&env))));
        }
    }
}

/// Builds a blockwise stage over the given arguments, validating the index
/// algebra, and returns it as a one-layer plan.
pub fn blockwise(
    label: &str,
    symbols: &[Symbol],
    kernel: Arc<dyn Kernel>,
    args: &[BlockwiseArg],
    new_axes: &[(Symbol, NewAxisChunks)],
    adjust_chunks: &[(Symbol, AdjustChunks)],
) -> Result<Plan, PlanError> {
    let mut counts: IndexMap<Symbol, usize> = default();
    let mut sizes: HashMap<Symbol, DimSizes> = default();

    for arg in args {
        let (name, chunks, input_symbols) = match arg {
            BlockwiseArg::Array {
                name,
                chunks,
                symbols,
            } => (name, chunks, symbols),
            BlockwiseArg::Literal(_) => continue,
        };

        if input_symbols.len() != chunks.ndim() {
            return Err(PlanError::SymbolCountMismatch {
                input: name.to_string(),
                symbols: input_symbols.len(),
                ndim: chunks.ndim(),
            });
        }

        for (d, &symbol) in enumerate(input_symbols) {
            if input_symbols[..d].contains(&symbol) {
                return Err(PlanError::RepeatedSymbol {
                    symbol,
                    input: name.to_string(),
                });
            }

            let count = chunks.nblocks(d);
            match counts.get(&symbol).copied() {
                None => {
                    counts.insert(symbol, count);
                    sizes.insert(symbol, chunks.dim(d).clone());
                }
                Some(existing) if existing == count => {}
                Some(1) => {
                    counts.insert(symbol, count);
                    sizes.insert(symbol, chunks.dim(d).clone());
                }
                Some(_) if count == 1 => {}
                Some(existing) => {
                    return Err(PlanError::BlockCountMismatch {
                        symbol,
                        left: existing,
                        right: count,
                    });
                }
            }
        }
    }

    for (symbol, chunking) in new_axes {
        if counts.contains_key(symbol) {
            return Err(PlanError::NewAxisConflict { symbol: *symbol });
        }

        let dim = match chunking {
            NewAxisChunks::Single(size) => block_sizes(&[*size]),
            NewAxisChunks::Sizes(lengths) => block_sizes(lengths),
        };
        counts.insert(*symbol, dim.len());
        sizes.insert(*symbol, dim);
    }

    for (d, &symbol) in enumerate(symbols) {
        if symbols[..d].contains(&symbol) {
            return Err(PlanError::RepeatedSymbol {
                symbol,
                input: label.to_string(),
            });
        }
        if !counts.contains_key(&symbol) {
            return Err(PlanError::UnknownDimension { symbol });
        }
    }

    for (symbol, adjust) in adjust_chunks {
        if !symbols.contains(symbol) {
            return Err(PlanError::UnknownDimension { symbol: *symbol });
        }

        let current = sizes[symbol].clone();
        let adjusted: DimSizes = match adjust {
            AdjustChunks::Constant(length) => {
                current.iter().map(|_| BlockLen::Known(*length)).collect()
            }
            AdjustChunks::Sizes(lengths) => {
                if lengths.len() != current.len() {
                    return Err(PlanError::AdjustLengthMismatch {
                        symbol: *symbol,
                        got: lengths.len(),
                        expected: current.len(),
                    });
                }
                block_sizes(lengths)
            }
            AdjustChunks::Transform(f) => current.iter().map(|&s| f(s)).collect(),
        };
        sizes.insert(*symbol, adjusted);
    }

    let mut parts: Vec<String> = vec![symbols.iter().collect(), kernel.token()];
    for arg in args {
        match arg {
            BlockwiseArg::Array { name, symbols, .. } => {
                parts.push(format!("{}[{}]", name, symbols.iter().collect::<String>()));
            }
            BlockwiseArg::Literal(value) => parts.push(value.canonical_token()),
        }
    }
    for (symbol, chunking) in new_axes {
        parts.push(format!("new:{}={:?}", symbol, chunking));
    }
    for (symbol, adjust) in adjust_chunks {
        parts.push(format!("adjust:{}={:?}", symbol, adjust));
    }
    let name: Arc<str> = deterministic_name(label, &parts).into();

    let template_args = args
        .iter()
        .map(|arg| match arg {
            BlockwiseArg::Array {
                name,
                chunks,
                symbols,
            } => TemplateArg::Block {
                name: name.clone(),
                symbols: symbols.iter().copied().collect(),
                counts: (0..chunks.ndim()).map(|d| chunks.nblocks(d)).collect(),
            },
            BlockwiseArg::Literal(value) => TemplateArg::Literal(value.clone()),
        })
        .collect();

    let stage = BlockwiseStage {
        name: name.clone(),
        symbols: symbols.to_vec(),
        counts,
        template: TaskTemplate {
            kernel,
            args: template_args,
        },
    };

    let chunks = Chunks::from_dims(symbols.iter().map(|s| sizes[s].clone()));

    let deps = args
        .iter()
        .filter_map(|arg| match arg {
            BlockwiseArg::Array { name, .. } => Some(name.to_string()),
            BlockwiseArg::Literal(_) => None,
        })
        .unique()
        .collect_vec();

    let mut graph = TaskGraph::new();
    graph.insert(name.to_string(), Layer::Blockwise(stage), deps);

    Ok(Plan {
        name,
        chunks,
        graph,
    })
}

/// Fuses a dependency-ordered chain of stages, where each later stage
/// consumes only outputs of earlier ones or original inputs, into a single
/// composite stage with the last stage's output symbols.
///
/// Producers are inlined into their consumers through a symbol-substitution
/// table built by matching each producer's own output symbols against how
/// the consumer refers to it; producer-private contraction symbols are
/// renamed to fresh symbols. Two references to the same producer under the
/// same substitution share one inlined subexpression by identity.
pub fn rewrite_blockwise(stages: &[BlockwiseStage]) -> Result<BlockwiseStage, PlanError> {
    let (last, earlier) = stages.split_last().expect("no stages to fuse");

    let mut fuser = Fuser {
        producers: earlier.iter().map(|s| (s.name.clone(), s)).collect(),
        used: stages.iter().flat_map(|s| s.counts.keys().copied()).collect(),
        counts: last.counts.clone(),
        shared: default(),
    };

    let template = fuser.inline(&last.template)?;

    Ok(BlockwiseStage {
        name: last.name.clone(),
        symbols: last.symbols.clone(),
        counts: fuser.counts,
        template,
    })
}

struct Fuser<'a> {
    producers: HashMap<Arc<str>, &'a BlockwiseStage>,
    used: HashSet<Symbol>,
    counts: IndexMap<Symbol, usize>,
    shared: HashMap<(Arc<str>, SmallVec<[Symbol; 4]>), Arc<TaskTemplate>>,
}

impl Fuser<'_> {
    fn inline(&mut self, template: &TaskTemplate) -> Result<TaskTemplate, PlanError> {
        let mut args = Vec::with_capacity(template.args.len());

        for arg in &template.args {
            match arg {
                TemplateArg::Literal(value) => args.push(TemplateArg::Literal(value.clone())),
                TemplateArg::Subtask(sub) => {
                    args.push(TemplateArg::Subtask(Arc::new(self.inline(sub)?)));
                }
                TemplateArg::Block { name, symbols, .. } => {
                    let producer = match self.producers.get(name) {
                        Some(&producer) => producer,
                        None => {
                            args.push(arg.clone());
                            continue;
                        }
                    };

                    let reference = (name.clone(), symbols.clone());
                    let sub = if let Some(sub) = self.shared.get(&reference) {
                        sub.clone()
                    } else {
                        let sub = Arc::new(self.instantiate_producer(producer, symbols)?);
                        self.shared.insert(reference, sub.clone());
                        sub
                    };
                    args.push(TemplateArg::Subtask(sub));
                }
            }
        }

        Ok(TaskTemplate {
            kernel: template.kernel.clone(),
            args,
        })
    }

    fn instantiate_producer(
        &mut self,
        producer: &BlockwiseStage,
        reference: &[Symbol],
    ) -> Result<TaskTemplate, PlanError> {
        let mut rename: HashMap<Symbol, Symbol> = default();
        for (&own, &outer) in producer.symbols.iter().zip(reference) {
            rename.insert(own, outer);
            if !self.counts.contains_key(&outer) {
                self.counts.insert(outer, producer.counts[&own]);
            }
        }

        for (&symbol, &count) in &producer.counts {
            if rename.contains_key(&symbol) {
                continue;
            }
            let fresh = self.fresh_symbol()?;
            rename.insert(symbol, fresh);
            self.counts.insert(fresh, count);
        }

        let renamed = rename_template(&producer.template, &rename, &mut default());
        self.inline(&renamed)
    }

    fn fresh_symbol(&mut self) -> Result<Symbol, PlanError> {
        for candidate in SYMBOL_POOL.chars() {
            if !self.used.contains(&candidate) {
                self.used.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(PlanError::SymbolsExhausted)
    }
}

fn rename_template(
    template: &TaskTemplate,
    rename: &HashMap<Symbol, Symbol>,
    memo: &mut HashMap<*const TaskTemplate, Arc<TaskTemplate>>,
) -> TaskTemplate {
    let args = template
        .args
        .iter()
        .map(|arg| match arg {
            TemplateArg::Block {
                name,
                symbols,
                counts,
            } => TemplateArg::Block {
                name: name.clone(),
                symbols: symbols
                    .iter()
                    .map(|s| rename.get(s).copied().unwrap_or(*s))
                    .collect(),
                counts: counts.clone(),
            },
            TemplateArg::Literal(value) => TemplateArg::Literal(value.clone()),
            TemplateArg::Subtask(sub) => {
                let ptr = Arc::as_ptr(sub);
                let renamed = if let Some(renamed) = memo.get(&ptr) {
                    renamed.clone()
                } else {
                    let renamed = Arc::new(rename_template(sub, rename, memo));
                    memo.insert(ptr, renamed.clone());
                    renamed
                };
                TemplateArg::Subtask(renamed)
            }
        })
        .collect();

    TaskTemplate {
        kernel: template.kernel.clone(),
        args,
    }
}

/// Graph-level fusion: walks the layer dependency structure and greedily
/// merges chains and diamonds of blockwise layers into single fused layers.
///
/// A producer is absorbed only when every one of its dependents lies inside
/// the fused group, so a stage consumed by any non-blockwise layer (a
/// reduction combine, a shuffle pass) stays materialized. Layers named in
/// `outputs` are never absorbed into a consumer.
pub fn optimize_blockwise(graph: &TaskGraph, outputs: &[&str]) -> Result<TaskGraph, PlanError> {
    let order = topological_layers(graph);
    let dependents = graph.layer_dependents();
    let outputs: HashSet<&str> = outputs.iter().copied().collect();

    let mut group_of: HashMap<String, usize> = default();
    let mut groups: Vec<IndexSet<String>> = Vec::new();

    for name in order.iter().rev() {
        if group_of.contains_key(name) {
            continue;
        }
        if !matches!(graph.layer(name), Some(Layer::Blockwise(_))) {
            continue;
        }

        let id = groups.len();
        let mut group: IndexSet<String> = default();
        group.insert(name.clone());

        loop {
            let mut candidate = None;

            'search: for member in &group {
                for dep in graph.layer_dependencies(member) {
                    if group.contains(dep) || group_of.contains_key(dep) {
                        continue;
                    }
                    if outputs.contains(dep.as_str()) {
                        continue;
                    }
                    let producer = match graph.layer(dep) {
                        Some(Layer::Blockwise(stage)) => stage,
                        _ => continue,
                    };
                    if !dependents[dep].iter().all(|d| group.contains(d)) {
                        continue;
                    }
                    if !group.iter().all(|m| fusable_reference(graph, m, producer)) {
                        continue;
                    }

                    candidate = Some(dep.clone());
                    break 'search;
                }
            }

            match candidate {
                Some(dep) => {
                    group.insert(dep);
                }
                None => break,
            }
        }

        for member in &group {
            group_of.insert(member.clone(), id);
        }
        groups.push(group);
    }

    let mut out = TaskGraph::new();
    for name in &order {
        let group = match group_of.get(name) {
            Some(&id) if groups[id].len() > 1 => &groups[id],
            _ => {
                out.insert(
                    name.clone(),
                    graph.layer(name).expect("layer vanished").clone(),
                    graph.layer_dependencies(name).to_vec(),
                );
                continue;
            }
        };

        // The group's starting layer is its sink; everything else is
        // emitted as part of the fused layer at the sink's position.
        let sink = group.get_index(0).expect("empty fusion group");
        if name != sink {
            continue;
        }

        let stages = order
            .iter()
            .filter(|n| group.contains(*n))
            .map(|n| match graph.layer(n) {
                Some(Layer::Blockwise(stage)) => stage.clone(),
                _ => unreachable!("fusion group holds a non-blockwise layer"),
            })
            .collect_vec();

        let fused = rewrite_blockwise(&stages)?;
        let deps = group
            .iter()
            .flat_map(|m| graph.layer_dependencies(m).iter().cloned())
            .filter(|d| !group.contains(d))
            .unique()
            .collect_vec();

        out.insert(sink.clone(), Layer::Blockwise(fused), deps);
    }

    Ok(out)
}

/// Whether every reference `consumer` makes to `producer`'s output is
/// block-count compatible with inlining (counts agree, or the producer
/// broadcasts).
fn fusable_reference(graph: &TaskGraph, consumer: &str, producer: &BlockwiseStage) -> bool {
    let consumer = match graph.layer(consumer) {
        Some(Layer::Blockwise(stage)) => stage,
        _ => return false,
    };

    let mut references = Vec::new();
    collect_references(&consumer.template, &producer.name, &mut references);

    references.iter().all(|symbols| {
        symbols.len() == producer.symbols.len()
            && producer.symbols.iter().zip(symbols.iter()).all(|(own, outer)| {
                let count = producer.counts[own];
                count == 1 || consumer.counts.get(outer) == Some(&count)
            })
    })
}

fn collect_references<'t>(
    template: &'t TaskTemplate,
    name: &str,
    out: &mut Vec<&'t [Symbol]>,
) {
    for arg in &template.args {
        match arg {
            TemplateArg::Block {
                name: arg_name,
                symbols,
                ..
            } if &**arg_name == name => out.push(symbols),
            TemplateArg::Subtask(sub) => collect_references(sub, name, out),
            _ => {}
        }
    }
}

fn topological_layers(graph: &TaskGraph) -> Vec<String> {
    let mut order = Vec::with_capacity(graph.num_layers());
    let mut done: HashSet<String> = default();

    while order.len() < graph.num_layers() {
        let mut progressed = false;
        for (name, _) in graph.layers() {
            if done.contains(name) {
                continue;
            }
            let ready = graph
                .layer_dependencies(name)
                .iter()
                .all(|d| done.contains(d) || graph.layer(d).is_none());
            if ready {
                done.insert(name.clone());
                order.push(name.clone());
                progressed = true;
            }
        }
        assert!(progressed, "layer dependencies contain a cycle");
    }

    order
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::{BinOp, BinaryOp, Const, SumArgs};
    use crate::types::Task;
    use ndarray::{ArrayD, IxDyn};

    fn source(label: &str, sizes: &[u64]) -> (Arc<str>, Chunks, TaskGraph) {
        let name: Arc<str> = format!("{}-src", label).into();
        let chunks = Chunks::from_sizes(&[sizes.to_vec()]);

        let mut tasks = TaskMap::default();
        for (i, &size) in enumerate(sizes) {
            let block = ArrayD::from_elem(IxDyn(&[size as usize]), i as f64);
            tasks.insert(
                Key::new(name.clone(), vec![i]),
                Task::new(Arc::new(Const::new(Value::Block(block))), vec![]),
            );
        }

        let mut graph = TaskGraph::new();
        graph.insert(name.to_string(), Layer::Tasks(tasks), vec![]);
        (name, chunks, graph)
    }

    fn add_scalar(name: &Arc<str>, chunks: &Chunks, amount: f64) -> Plan {
        blockwise(
            "add",
            &['i'],
            Arc::new(BinOp::new(BinaryOp::Add)),
            &[
                BlockwiseArg::array(name, chunks, "i"),
                BlockwiseArg::Literal(Value::Float(amount)),
            ],
            &[],
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_dimension_cites_only_the_bad_symbol() {
        let (name, chunks, _) = source("x", &[5, 5]);
        let chunks2 = Chunks::from_sizes(&[vec![5, 5], vec![4]]);
        let _ = chunks;

        let err = blockwise(
            "op",
            &['j', 'k'],
            Arc::new(SumArgs),
            &[BlockwiseArg::array(&name, &chunks2, "ij")],
            &[],
            &[],
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("unknown dimension"));
        assert!(message.contains('k'));
        assert!(!message.contains('j'));
    }

    #[test]
    fn test_repeated_symbol_rejected() {
        let (name, _, _) = source("x", &[5]);
        let chunks = Chunks::from_sizes(&[vec![5], vec![5]]);

        let err = blockwise(
            "op",
            &['i'],
            Arc::new(SumArgs),
            &[BlockwiseArg::array(&name, &chunks, "ii")],
            &[],
            &[],
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("repeated"));
        assert!(message.contains('i'));
    }

    #[test]
    fn test_block_count_mismatch() {
        let (a, ca, _) = source("a", &[5, 5]);
        let (b, cb, _) = source("b", &[4, 4, 4]);

        let err = blockwise(
            "op",
            &['i'],
            Arc::new(SumArgs),
            &[
                BlockwiseArg::array(&a, &ca, "i"),
                BlockwiseArg::array(&b, &cb, "i"),
            ],
            &[],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::BlockCountMismatch { symbol: 'i', .. }));
    }

    #[test]
    fn test_deterministic_and_distinguishing_names() {
        let (name, chunks, _) = source("x", &[3, 3]);

        let a = add_scalar(&name, &chunks, 2.0);
        let b = add_scalar(&name, &chunks, 2.0);
        let c = add_scalar(&name, &chunks, 3.0);

        assert_eq!(a.name, b.name);
        assert_ne!(a.name, c.name);
    }

    #[test]
    fn test_materialize_selects_and_broadcasts() {
        let (a, ca, _) = source("a", &[2, 2, 2]);
        let (b, cb, _) = source("b", &[6]);

        // `b` has one block along `i` and broadcasts it to all three
        // coordinates.
        let plan = blockwise(
            "add",
            &['i'],
            Arc::new(BinOp::new(BinaryOp::Add)),
            &[
                BlockwiseArg::array(&a, &ca, "i"),
                BlockwiseArg::array(&b, &cb, "i"),
            ],
            &[],
            &[],
        )
        .unwrap();

        let stage = match plan.graph.layer(&plan.name).unwrap() {
            Layer::Blockwise(stage) => stage.clone(),
            _ => panic!("expected a blockwise layer"),
        };

        let tasks = stage.materialize().unwrap();
        assert_eq!(tasks.len(), 3);

        let task = &tasks[&Key::new(plan.name.clone(), vec![2])];
        match &task.args[..] {
            [TaskArg::Key(first), TaskArg::Key(second)] => {
                assert_eq!(first, &Key::new(a.clone(), vec![2]));
                assert_eq!(second, &Key::new(b.clone(), vec![0]));
            }
            other => panic!("unexpected args {:?}", other),
        }
    }

    #[test]
    fn test_contraction_expands_ordered() {
        let (a, ca, _) = source("a", &[2, 2]);
        let chunks = Chunks::from_sizes(&[vec![2, 2], vec![3, 3, 3]]);
        let _ = ca;

        // `j` is consumed by the kernel: absent from the output, present in
        // the input.
        let plan = blockwise(
            "sum-over-j",
            &['i'],
            Arc::new(SumArgs),
            &[BlockwiseArg::array(&a, &chunks, "ij")],
            &[],
            &[],
        )
        .unwrap();

        let stage = match plan.graph.layer(&plan.name).unwrap() {
            Layer::Blockwise(stage) => stage.clone(),
            _ => panic!("expected a blockwise layer"),
        };

        let tasks = stage.materialize().unwrap();
        assert_eq!(tasks.len(), 2);

        let task = &tasks[&Key::new(plan.name.clone(), vec![1])];
        let keys = task
            .args
            .iter()
            .map(|arg| match arg {
                TaskArg::Key(key) => key.index.to_vec(),
                other => panic!("unexpected arg {:?}", other),
            })
            .collect_vec();
        assert_eq!(keys, vec![vec![1, 0], vec![1, 1], vec![1, 2]]);
    }

    #[test]
    fn test_new_axes_and_adjust_chunks() {
        let (a, ca, _) = source("a", &[4, 4]);

        let plan = blockwise(
            "expand",
            &['i', 'j'],
            Arc::new(SumArgs),
            &[BlockwiseArg::array(&a, &ca, "i")],
            &[('j', NewAxisChunks::Sizes(vec![2, 2, 2]))],
            &[('i', AdjustChunks::Transform(Arc::new(|s| s + s)))],
        )
        .unwrap();

        assert_eq!(plan.chunks.ndim(), 2);
        assert_eq!(&crate::types::known_sizes(plan.chunks.dim(0)), &[8, 8]);
        assert_eq!(&crate::types::known_sizes(plan.chunks.dim(1)), &[2, 2, 2]);

        let err = blockwise(
            "expand",
            &['i', 'j'],
            Arc::new(SumArgs),
            &[BlockwiseArg::array(&a, &ca, "i")],
            &[('i', NewAxisChunks::Single(1))],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::NewAxisConflict { symbol: 'i' }));

        let err = blockwise(
            "expand",
            &['i'],
            Arc::new(SumArgs),
            &[BlockwiseArg::array(&a, &ca, "i")],
            &[],
            &[('i', AdjustChunks::Sizes(vec![1, 2, 3]))],
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::AdjustLengthMismatch { got: 3, expected: 2, .. }));
    }

    #[test]
    fn test_rewrite_inlines_chain() {
        let (x, chunks, _) = source("x", &[2, 2]);

        let a = add_scalar(&x, &chunks, 1.0);
        let b = add_scalar(&a.name, &a.chunks, 2.0);

        let stages = [
            match a.graph.layer(&a.name).unwrap() {
                Layer::Blockwise(s) => s.clone(),
                _ => unreachable!(),
            },
            match b.graph.layer(&b.name).unwrap() {
                Layer::Blockwise(s) => s.clone(),
                _ => unreachable!(),
            },
        ];

        let fused = rewrite_blockwise(&stages).unwrap();
        assert_eq!(fused.name, b.name);
        assert_eq!(fused.symbols, vec!['i']);

        // The producer became an inlined subtask over the original source.
        match &fused.template.args[..] {
            [TemplateArg::Subtask(sub), TemplateArg::Literal(_)] => match &sub.args[..] {
                [TemplateArg::Block { name, .. }, TemplateArg::Literal(_)] => {
                    assert_eq!(name, &x);
                }
                other => panic!("unexpected inner args {:?}", other),
            },
            other => panic!("unexpected args {:?}", other),
        }

        // Materialization produces one task per block, each carrying the
        // fused body.
        let tasks = fused.materialize().unwrap();
        assert_eq!(tasks.len(), 2);
        let task = &tasks[&Key::new(fused.name.clone(), vec![0])];
        match &task.args[0] {
            TaskArg::Inline(inner) => match &inner.args[0] {
                TaskArg::Key(key) => assert_eq!(key, &Key::new(x.clone(), vec![0])),
                other => panic!("unexpected inner arg {:?}", other),
            },
            other => panic!("unexpected arg {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_shares_diamond_producer() {
        let (x, chunks, _) = source("x", &[2, 2]);

        let shared = add_scalar(&x, &chunks, 1.0);
        let join = blockwise(
            "join",
            &['i'],
            Arc::new(BinOp::new(BinaryOp::Mul)),
            &[
                BlockwiseArg::array(&shared.name, &shared.chunks, "i"),
                BlockwiseArg::array(&shared.name, &shared.chunks, "i"),
            ],
            &[],
            &[],
        )
        .unwrap();

        let stages = [
            match shared.graph.layer(&shared.name).unwrap() {
                Layer::Blockwise(s) => s.clone(),
                _ => unreachable!(),
            },
            match join.graph.layer(&join.name).unwrap() {
                Layer::Blockwise(s) => s.clone(),
                _ => unreachable!(),
            },
        ];
        let fused = rewrite_blockwise(&stages).unwrap();

        // Both references resolve to one shared subexpression, by identity.
        match &fused.template.args[..] {
            [TemplateArg::Subtask(left), TemplateArg::Subtask(right)] => {
                assert!(Arc::ptr_eq(left, right));
            }
            other => panic!("unexpected args {:?}", other),
        }

        // The shared identity survives materialization.
        let tasks = fused.materialize().unwrap();
        let task = &tasks[&Key::new(fused.name.clone(), vec![1])];
        match &task.args[..] {
            [TaskArg::Inline(left), TaskArg::Inline(right)] => {
                assert!(Arc::ptr_eq(left, right));
            }
            other => panic!("unexpected args {:?}", other),
        }
    }

    #[test]
    fn test_optimize_fuses_chain_to_one_layer() {
        let (x, chunks, mut graph) = source("x", &[3, 3, 3, 3]);

        let mut name = x.clone();
        let mut current = chunks;
        for level in 0..5 {
            let plan = add_scalar(&name, &current, level as f64);
            graph.merge(&plan.graph);
            name = plan.name;
            current = plan.chunks;
        }
        assert_eq!(graph.blockwise_layer_count(), 5);

        let optimized = optimize_blockwise(&graph, &[&*name]).unwrap();
        assert_eq!(optimized.blockwise_layer_count(), 1);

        // One fused task per block plus the sources: 4 + 4.
        assert_eq!(optimized.task_count(), 8);
        assert!(optimized.layer(&name).is_some());
        optimized.validate().unwrap();
    }

    #[test]
    fn test_optimize_fuses_diamond() {
        let (x, chunks, mut graph) = source("x", &[3, 3]);

        let shared = add_scalar(&x, &chunks, 1.0);
        let left = add_scalar(&shared.name, &shared.chunks, 2.0);
        let right = add_scalar(&shared.name, &shared.chunks, 3.0);
        let join = blockwise(
            "join",
            &['i'],
            Arc::new(BinOp::new(BinaryOp::Add)),
            &[
                BlockwiseArg::array(&left.name, &left.chunks, "i"),
                BlockwiseArg::array(&right.name, &right.chunks, "i"),
            ],
            &[],
            &[],
        )
        .unwrap();

        for plan in [&shared, &left, &right, &join] {
            graph.merge(&plan.graph);
        }
        assert_eq!(graph.blockwise_layer_count(), 4);

        let optimized = optimize_blockwise(&graph, &[&*join.name]).unwrap();
        assert_eq!(optimized.blockwise_layer_count(), 1);
        optimized.validate().unwrap();
    }

    #[test]
    fn test_optimize_stops_at_non_blockwise_consumer() {
        let (x, chunks, mut graph) = source("x", &[3, 3]);

        let partial = add_scalar(&x, &chunks, 1.0);
        let downstream = add_scalar(&partial.name, &partial.chunks, 2.0);
        graph.merge(&partial.graph);
        graph.merge(&downstream.graph);

        // A materialized consumer (a reduction combine, say) pins the
        // producer: fusing through it would destroy tree-depth control.
        let mut tasks = TaskMap::default();
        tasks.insert(
            Key::new("agg", vec![0]),
            Task::new(
                Arc::new(SumArgs),
                vec![
                    TaskArg::Key(Key::new(partial.name.clone(), vec![0])),
                    TaskArg::Key(Key::new(partial.name.clone(), vec![1])),
                ],
            ),
        );
        graph.insert("agg", Layer::Tasks(tasks), vec![partial.name.to_string()]);

        let optimized = optimize_blockwise(&graph, &[&*downstream.name, "agg"]).unwrap();

        // Neither blockwise layer may be absorbed: the producer feeds a
        // non-blockwise consumer and the sink is a requested output.
        assert_eq!(optimized.blockwise_layer_count(), 2);
        assert!(optimized.layer(&partial.name).is_some());
        optimized.validate().unwrap();
    }
}
