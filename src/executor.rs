//! Synchronous single-threaded graph evaluator.
//!
//! This is the reference consumer of the `submit(graph, keys) -> results`
//! contract, used for local debugging and by the test-suite. It is not the
//! parallel executor: scheduling, retries and distribution live outside this
//! crate, behind the same contract.

use crate::prelude::*;
use crate::types::{Key, Task, TaskArg, TaskGraph, TaskMap, Value};

/// Evaluates the requested keys of a graph, returning their values in
/// request order. Failures are propagated tagged with the originating key.
pub fn submit(graph: &TaskGraph, keys: &[Key]) -> Result<Vec<Value>> {
    let tasks = graph.materialize()?;
    let mut cache: HashMap<Key, Value> = default();

    keys.iter()
        .map(|key| evaluate_key(key, &tasks, &mut cache))
        .collect()
}

fn evaluate_key(key: &Key, tasks: &TaskMap, cache: &mut HashMap<Key, Value>) -> Result<Value> {
    if let Some(value) = cache.get(key) {
        return Ok(value.clone());
    }

    let task = tasks
        .get(key)
        .ok_or_else(|| anyhow!("graph holds no task for key {:?}", key))?;

    let mut inlined: HashMap<*const Task, Value> = default();
    let value = evaluate_task(task, tasks, cache, &mut inlined)
        .with_context(|| format!("failure originating at key {:?}", key))?;

    cache.insert(key.clone(), value.clone());
    Ok(value)
}

fn evaluate_task(
    task: &Task,
    tasks: &TaskMap,
    cache: &mut HashMap<Key, Value>,
    inlined: &mut HashMap<*const Task, Value>,
) -> Result<Value> {
    let mut args = Vec::with_capacity(task.args.len());

    for arg in &task.args {
        match arg {
            TaskArg::Literal(value) => args.push(value.clone()),
            TaskArg::Key(key) => args.push(evaluate_key(key, tasks, cache)?),
            TaskArg::Inline(sub) => {
                // Shared intermediates from stage fusion are evaluated once
                // per enclosing task.
                let ptr = std::sync::Arc::as_ptr(sub);
                let value = if let Some(value) = inlined.get(&ptr) {
                    value.clone()
                } else {
                    let value = evaluate_task(sub, tasks, cache, inlined)?;
                    inlined.insert(ptr, value.clone());
                    value
                };
                args.push(value);
            }
        }
    }

    task.kernel.execute(&args)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::{BinOp, BinaryOp, Const};
    use crate::types::Layer;
    use std::sync::Arc;

    fn literal(v: f64) -> Task {
        Task::new(Arc::new(Const::new(Value::Float(v))), vec![])
    }

    #[test]
    fn test_evaluates_dependencies() {
        let a = Key::new("a", vec![0]);
        let b = Key::new("b", vec![0]);

        let mut tasks = TaskMap::default();
        tasks.insert(a.clone(), literal(2.0));
        tasks.insert(
            b.clone(),
            Task::new(
                Arc::new(BinOp::new(BinaryOp::Add)),
                vec![TaskArg::Key(a.clone()), TaskArg::Literal(Value::Float(3.0))],
            ),
        );

        let mut graph = TaskGraph::new();
        graph.insert("all", Layer::Tasks(tasks), vec![]);

        let values = submit(&graph, &[b, a]).unwrap();
        assert_eq!(values[0].float().unwrap(), 5.0);
        assert_eq!(values[1].float().unwrap(), 2.0);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let graph = TaskGraph::new();
        let err = submit(&graph, &[Key::new("ghost", vec![0])]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_failure_tagged_with_origin() {
        let bad = Key::new("bad", vec![0]);

        let mut tasks = TaskMap::default();
        // Const with arguments fails at execution time.
        tasks.insert(
            bad.clone(),
            Task::new(
                Arc::new(Const::new(Value::Float(0.0))),
                vec![TaskArg::Literal(Value::Float(1.0))],
            ),
        );

        let mut graph = TaskGraph::new();
        graph.insert("bad", Layer::Tasks(tasks), vec![]);

        let err = submit(&graph, &[bad]).unwrap_err();
        assert!(format!("{:#}", err).contains("originating at key bad[0]"));
    }

    #[test]
    fn test_shared_inline_evaluated_once_per_task() {
        let shared = Arc::new(literal(4.0));
        let task = Task::new(
            Arc::new(BinOp::new(BinaryOp::Mul)),
            vec![
                TaskArg::Inline(shared.clone()),
                TaskArg::Inline(shared.clone()),
            ],
        );

        let out = Key::new("out", vec![0]);
        let mut tasks = TaskMap::default();
        tasks.insert(out.clone(), task);

        let mut graph = TaskGraph::new();
        graph.insert("out", Layer::Tasks(tasks), vec![]);

        let values = submit(&graph, &[out]).unwrap();
        assert_eq!(values[0].float().unwrap(), 16.0);
    }
}
