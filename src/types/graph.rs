use smallvec::SmallVec;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::kernels::Kernel;
use crate::planner::blockwise::BlockwiseStage;
use crate::prelude::*;
use crate::types::Value;

/// Block coordinate within a logical array, one entry per dimension.
pub type BlockIndex = SmallVec<[usize; 4]>;

/// Identifies one block of one logical array within a task graph.
///
/// Two keys with the same name and coordinate denote the same computation:
/// names are derived from the operation that produces the array (see
/// [`crate::naming`]), so structurally equal plans collide on purpose.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub name: Arc<str>,
    pub index: BlockIndex,
}

impl Key {
    pub fn new(name: impl Into<Arc<str>>, index: impl IntoIterator<Item = usize>) -> Self {
        Self {
            name: name.into(),
            index: index.into_iter().collect(),
        }
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.name, &self.index[..])
    }
}

/// One positional argument of a task.
#[derive(Clone, Debug)]
pub enum TaskArg {
    /// Reference to another block in the graph.
    Key(Key),
    /// Literal configuration value, passed through unchanged.
    Literal(Value),
    /// Inlined subexpression produced by stage fusion. A shared `Arc` means
    /// a shared intermediate: executors evaluate it once per task.
    Inline(Arc<Task>),
}

/// A single pure-function call over block values.
#[derive(Clone, Debug)]
pub struct Task {
    pub kernel: Arc<dyn Kernel>,
    pub args: Vec<TaskArg>,
}

impl Task {
    pub fn new(kernel: Arc<dyn Kernel>, args: Vec<TaskArg>) -> Self {
        Self { kernel, args }
    }

    /// All graph keys this task (transitively through inlined subexpressions)
    /// depends on.
    pub fn dependencies(&self) -> Vec<Key> {
        let mut out = Vec::new();
        self.collect_dependencies(&mut out);
        out
    }

    fn collect_dependencies(&self, out: &mut Vec<Key>) {
        for arg in &self.args {
            match arg {
                TaskArg::Key(key) => out.push(key.clone()),
                TaskArg::Literal(_) => {}
                TaskArg::Inline(task) => task.collect_dependencies(out),
            }
        }
    }
}

pub type TaskMap = IndexMap<Key, Task>;

/// One named layer of a task graph.
///
/// Blockwise layers stay declarative until materialization so that the
/// fusion pass can rewrite them; everything else (reduction levels, shuffle
/// passes, source blocks) is a plain key-to-task mapping.
#[derive(Clone, Debug)]
pub enum Layer {
    Blockwise(BlockwiseStage),
    Tasks(TaskMap),
}

impl Layer {
    pub fn is_blockwise(&self) -> bool {
        matches!(self, Layer::Blockwise(_))
    }

    pub fn materialize(&self) -> Result<TaskMap> {
        match self {
            Layer::Blockwise(stage) => Ok(stage.materialize()?),
            Layer::Tasks(tasks) => Ok(tasks.clone()),
        }
    }

    /// The number of tasks this layer expands to.
    pub fn len(&self) -> usize {
        match self {
            Layer::Blockwise(stage) => stage.output_block_count(),
            Layer::Tasks(tasks) => tasks.len(),
        }
    }
}

/// A task graph as a mapping of named layers plus their layer-level
/// dependencies.
///
/// Merging is set-union over layer names. Layer names are content-derived,
/// so overlapping names denote the same layer and the first copy wins.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    layers: IndexMap<String, Layer>,
    dependencies: HashMap<String, IndexSet<String>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        layer: Layer,
        deps: impl IntoIterator<Item = String>,
    ) {
        let name = name.into();
        self.dependencies
            .insert(name.clone(), deps.into_iter().collect());
        self.layers.insert(name, layer);
    }

    pub fn merge(&mut self, other: &TaskGraph) {
        for (name, layer) in &other.layers {
            if !self.layers.contains_key(name) {
                self.layers.insert(name.clone(), layer.clone());
                self.dependencies.insert(
                    name.clone(),
                    other.dependencies.get(name).cloned().unwrap_or_default(),
                );
            }
        }
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn layers(&self) -> impl Iterator<Item = (&String, &Layer)> {
        self.layers.iter()
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &String> {
        self.layers.keys()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn blockwise_layer_count(&self) -> usize {
        self.layers.values().filter(|l| l.is_blockwise()).count()
    }

    pub fn layer_dependencies(&self, name: &str) -> &[String] {
        self.dependencies
            .get(name)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Reverse of the layer dependency relation.
    pub fn layer_dependents(&self) -> HashMap<String, IndexSet<String>> {
        let mut out: HashMap<String, IndexSet<String>> = default();
        for name in self.layers.keys() {
            out.entry(name.clone()).or_default();
        }

        for (name, deps) in &self.dependencies {
            for dep in deps {
                out.entry(dep.clone()).or_default().insert(name.clone());
            }
        }

        out
    }

    /// Expands every layer into one flat key-to-task mapping.
    pub fn materialize(&self) -> Result<TaskMap> {
        let mut out = TaskMap::default();
        for layer in self.layers.values() {
            out.extend(layer.materialize()?);
        }
        Ok(out)
    }

    /// The total number of tasks across all layers, without materializing.
    pub fn task_count(&self) -> usize {
        self.layers.values().map(|l| l.len()).sum()
    }

    /// Checks the obligations this graph owes its executor: every referenced
    /// key resolves to a task, and the dependency relation is acyclic.
    pub fn validate(&self) -> Result {
        let tasks = self.materialize()?;
        let (deps, _) = dependencies_and_dependents(&tasks);

        for (key, key_deps) in &deps {
            for dep in key_deps {
                if !tasks.contains_key(dep) {
                    bail!("task {:?} references missing key {:?}", key, dep);
                }
            }
        }

        // Depth-first cycle check over the flat mapping.
        #[derive(Copy, Clone, PartialEq)]
        enum State {
            Visiting,
            Done,
        }

        let mut states: HashMap<&Key, State> = default();
        for start in tasks.keys() {
            if states.contains_key(start) {
                continue;
            }

            let mut stack = vec![(start, 0usize)];
            states.insert(start, State::Visiting);

            while let Some((key, child)) = stack.pop() {
                let key_deps = &deps[key];
                if child < key_deps.len() {
                    stack.push((key, child + 1));
                    let dep = key_deps.get_index(child).unwrap();

                    match states.get(dep) {
                        Some(State::Visiting) => {
                            bail!("task graph contains a cycle through {:?}", dep)
                        }
                        Some(State::Done) => {}
                        None => {
                            states.insert(dep, State::Visiting);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    states.insert(key, State::Done);
                }
            }
        }

        Ok(())
    }
}

/// Builds both directions of the key adjacency relation in one pass over the
/// task argument trees.
pub fn dependencies_and_dependents(
    tasks: &TaskMap,
) -> (HashMap<Key, IndexSet<Key>>, HashMap<Key, IndexSet<Key>>) {
    let mut deps: HashMap<Key, IndexSet<Key>> = default();
    let mut rdeps: HashMap<Key, IndexSet<Key>> = default();

    for (key, task) in tasks {
        let entry = deps.entry(key.clone()).or_default();
        for dep in task.dependencies() {
            entry.insert(dep.clone());
            rdeps.entry(dep).or_default().insert(key.clone());
        }
        rdeps.entry(key.clone()).or_default();
    }

    (deps, rdeps)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::Const;

    fn constant(v: f64) -> Task {
        Task::new(Arc::new(Const::new(Value::Float(v))), vec![])
    }

    fn passthrough(deps: &[Key]) -> Task {
        Task::new(
            Arc::new(Const::new(Value::Float(0.0))),
            deps.iter().map(|k| TaskArg::Key(k.clone())).collect(),
        )
    }

    #[test]
    fn test_adjacency() {
        let a = Key::new("a", vec![0]);
        let b = Key::new("b", vec![0]);
        let c = Key::new("c", vec![0]);

        let mut tasks = TaskMap::default();
        tasks.insert(a.clone(), constant(1.0));
        tasks.insert(b.clone(), passthrough(&[a.clone()]));
        tasks.insert(c.clone(), passthrough(&[a.clone(), b.clone()]));

        let (deps, rdeps) = dependencies_and_dependents(&tasks);
        assert!(deps[&a].is_empty());
        assert_eq!(deps[&c].len(), 2);
        assert_eq!(rdeps[&a].len(), 2);
        assert!(rdeps[&c].is_empty());
    }

    #[test]
    fn test_validate_rejects_missing_key() {
        let a = Key::new("a", vec![0]);
        let ghost = Key::new("ghost", vec![0]);

        let mut tasks = TaskMap::default();
        tasks.insert(a, passthrough(&[ghost]));

        let mut graph = TaskGraph::new();
        graph.insert("a", Layer::Tasks(tasks), vec![]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let a = Key::new("a", vec![0]);
        let b = Key::new("b", vec![0]);

        let mut tasks = TaskMap::default();
        tasks.insert(a.clone(), passthrough(&[b.clone()]));
        tasks.insert(b, passthrough(&[a]));

        let mut graph = TaskGraph::new();
        graph.insert("ab", Layer::Tasks(tasks), vec![]);

        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_merge_is_union() {
        let a = Key::new("a", vec![0]);
        let mut tasks = TaskMap::default();
        tasks.insert(a, constant(1.0));

        let mut left = TaskGraph::new();
        left.insert("a", Layer::Tasks(tasks.clone()), vec![]);

        let mut right = TaskGraph::new();
        right.insert("a", Layer::Tasks(tasks), vec![]);

        left.merge(&right);
        assert_eq!(left.num_layers(), 1);
        assert_eq!(left.materialize().unwrap().len(), 1);
    }
}
