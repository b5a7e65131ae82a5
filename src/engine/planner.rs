//! Compiles a step graph into a Fork/Run/Join task graph.
//!
//! Planning happens once per program. Steps that always execute one after
//! another are coalesced into a single run task so they execute on one worker
//! without any synchronization, and a join task is only placed where several
//! branches actually meet.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::core::ArcStr;
use crate::engine::{StepGraph, StepId, Task, TaskGraph, TaskId, TaskKind, ValueId};
use crate::error::PlanError;

/// A group of steps planned as one unit, keyed by the index of its last step.
#[derive(Debug)]
struct PlanNode {
    steps: Vec<StepId>,
    preds: BTreeSet<usize>,
    succs: BTreeSet<usize>,
    available: HashSet<ValueId>,
}

pub struct GraphPlanner;

impl GraphPlanner {
    /// Plans everything `terminal` transitively depends on. The returned
    /// graph is rooted at a fork task.
    pub fn plan(graph: &StepGraph, terminal: StepId) -> Result<TaskGraph, PlanError> {
        let (mut nodes, order) = discover(graph, terminal)?;

        propagate_availability(&mut nodes, &order);
        coalesce(&mut nodes, graph);

        let plan = build(graph, &nodes, terminal);

        tracing::debug!(
            steps = order.len(),
            tasks = plan.len(),
            joins = plan.joins().count(),
            "planned step graph"
        );

        Ok(plan)
    }
}

fn discover(
    graph: &StepGraph,
    terminal: StepId,
) -> Result<(BTreeMap<usize, PlanNode>, Vec<usize>), PlanError> {
    if graph.get(terminal).is_none() {
        return Err(PlanError::UnknownStep {
            step: ArcStr::from("<terminal>"),
            input: terminal.index(),
        });
    }

    let mut nodes = BTreeMap::new();
    let mut edges = DiGraphMap::<usize, ()>::new();
    let mut stack = vec![terminal.index()];
    edges.add_node(terminal.index());

    while let Some(index) = stack.pop() {
        if nodes.contains_key(&index) {
            continue;
        }

        let id = StepId::new(index);
        let Some(node) = graph.get(id) else { continue };

        let mut preds = BTreeSet::new();
        for input in node.step.inputs() {
            let source = input.source();

            if source == id {
                return Err(PlanError::SelfInput(node.name.clone()));
            }
            if graph.get(source).is_none() {
                return Err(PlanError::UnknownStep {
                    step: node.name.clone(),
                    input: source.index(),
                });
            }

            preds.insert(source.index());
            edges.add_edge(source.index(), index, ());

            if !nodes.contains_key(&source.index()) {
                stack.push(source.index());
            }
        }

        nodes.insert(
            index,
            PlanNode {
                steps: vec![id],
                preds,
                succs: BTreeSet::new(),
                available: HashSet::new(),
            },
        );
    }

    let order = toposort(&edges, None)
        .map_err(|cycle| PlanError::Cycle(graph.name(StepId::new(cycle.node_id()))))?;

    let links: Vec<(usize, usize)> = nodes
        .iter()
        .flat_map(|(&key, node)| node.preds.iter().map(move |&pred| (pred, key)))
        .collect();

    for (pred, key) in links {
        if let Some(node) = nodes.get_mut(&pred) {
            node.succs.insert(key);
        }
    }

    Ok((nodes, order))
}

/// Everything computed on the way into a node: its own output plus the
/// outputs of all of its transitive predecessors.
fn propagate_availability(nodes: &mut BTreeMap<usize, PlanNode>, order: &[usize]) {
    for &index in order {
        let Some(node) = nodes.get(&index) else { continue };

        let mut available = HashSet::from([ValueId::new(index)]);
        for pred in &node.preds {
            if let Some(pred) = nodes.get(pred) {
                available.extend(pred.available.iter().copied());
            }
        }

        if let Some(node) = nodes.get_mut(&index) {
            node.available = available;
        }
    }
}

/// The successor `key` can be merged into, if any.
fn merge_target(nodes: &BTreeMap<usize, PlanNode>, graph: &StepGraph, key: usize) -> Option<usize> {
    let node = nodes.get(&key)?;
    if node.succs.len() != 1 {
        return None;
    }

    let succ = *node.succs.first()?;
    let target = nodes.get(&succ)?;

    // Fan-in needs a join, and an async step starts a task of its own so the
    // worker is released before it suspends.
    let single = target.preds.len() == 1 && target.preds.contains(&key);
    let suspends = target
        .steps
        .first()
        .and_then(|&step| graph.get(step))
        .is_some_and(|node| node.step.is_async());

    (single && !suspends).then_some(succ)
}

fn coalesce(nodes: &mut BTreeMap<usize, PlanNode>, graph: &StepGraph) {
    loop {
        let mut merged = false;
        let keys: Vec<usize> = nodes.keys().copied().collect();

        for key in keys {
            let Some(succ) = merge_target(nodes, graph, key) else {
                continue;
            };
            let Some(node) = nodes.remove(&key) else {
                continue;
            };

            for pred in &node.preds {
                if let Some(pred) = nodes.get_mut(pred) {
                    pred.succs.remove(&key);
                    pred.succs.insert(succ);
                }
            }

            if let Some(target) = nodes.get_mut(&succ) {
                let mut steps = node.steps;
                steps.append(&mut target.steps);
                target.steps = steps;
                target.preds = node.preds;
            }

            merged = true;
        }

        if !merged {
            break;
        }
    }
}

fn build(graph: &StepGraph, nodes: &BTreeMap<usize, PlanNode>, terminal: StepId) -> TaskGraph {
    let root = TaskId(0);
    let mut tasks = vec![Task::new(TaskKind::Fork)];

    let mut runs = BTreeMap::new();
    for (&key, node) in nodes {
        let mut task = Task::new(TaskKind::Run {
            steps: node.steps.clone(),
        });
        task.available = node.available.clone();

        runs.insert(key, TaskId(tasks.len()));
        tasks.push(task);
    }

    // Nodes waiting on exactly the same predecessors share one join.
    let mut joins: BTreeMap<&BTreeSet<usize>, TaskId> = BTreeMap::new();
    let mut entries = BTreeMap::new();
    for (&key, node) in nodes {
        if node.preds.len() <= 1 {
            entries.insert(key, runs[&key]);
            continue;
        }

        let join = match joins.get(&node.preds) {
            Some(&join) => join,
            None => {
                let priors = node.preds.iter().map(|pred| runs[pred]).collect();
                let mut task = Task::new(TaskKind::Join { priors });
                for pred in &node.preds {
                    task.available.extend(nodes[pred].available.iter().copied());
                }

                let join = TaskId(tasks.len());
                tasks.push(task);
                joins.insert(&node.preds, join);
                join
            }
        };

        tasks[join.0].next.insert(runs[&key]);
        entries.insert(key, join);
    }

    for (&key, node) in nodes {
        if node.preds.is_empty() {
            tasks[root.0].next.insert(entries[&key]);
        }

        let run = runs[&key];
        for succ in &node.succs {
            tasks[run.0].next.insert(entries[succ]);
        }
    }

    let mut memo = HashMap::new();
    live_inputs(&tasks, graph, root, &mut memo);
    for (id, inputs) in memo {
        tasks[id.0].inputs = inputs;
    }

    let sink = nodes
        .iter()
        .find(|(_, node)| node.steps.contains(&terminal))
        .map(|(key, _)| runs[key])
        .unwrap_or(root);

    TaskGraph {
        tasks,
        root,
        sink,
        terminal,
    }
}

fn live_inputs(
    tasks: &[Task],
    graph: &StepGraph,
    id: TaskId,
    memo: &mut HashMap<TaskId, HashSet<ValueId>>,
) -> HashSet<ValueId> {
    if let Some(inputs) = memo.get(&id) {
        return inputs.clone();
    }

    let task = &tasks[id.0];
    let mut wanted = HashSet::new();
    for &next in &task.next {
        wanted.extend(live_inputs(tasks, graph, next, memo));
    }

    let inputs: HashSet<ValueId> = match &task.kind {
        TaskKind::Fork => HashSet::new(),
        TaskKind::Join { .. } => wanted.intersection(&task.available).copied().collect(),
        TaskKind::Run { steps } => {
            for &step in steps {
                if let Some(node) = graph.get(step) {
                    wanted.extend(node.step.inputs());
                }
            }
            for step in steps {
                wanted.remove(&step.value());
            }
            wanted.intersection(&task.available).copied().collect()
        }
    };

    memo.insert(id, inputs.clone());
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepContext;
    use crate::core::Dynamic;
    use crate::engine::{Execution, Step};

    struct Fixture {
        name: &'static str,
        inputs: Vec<ValueId>,
        suspends: bool,
    }

    impl Step for Fixture {
        fn name(&self) -> &str {
            self.name
        }

        fn inputs(&self) -> Vec<ValueId> {
            self.inputs.clone()
        }

        fn is_async(&self) -> bool {
            self.suspends
        }

        fn execute(&self, _: &StepContext, _: &[Dynamic]) -> Execution {
            Execution::Ready(Ok(std::sync::Arc::new(())))
        }
    }

    /// Builds a graph from `(name, inputs, async)` triples; inputs are
    /// positions in the list.
    fn graph(steps: &[(&'static str, &[usize], bool)]) -> StepGraph {
        let mut graph = StepGraph::new();
        for &(name, inputs, suspends) in steps {
            graph.add(Fixture {
                name,
                inputs: inputs.iter().map(|&i| ValueId::new(i)).collect(),
                suspends,
            });
        }
        graph
    }

    fn names(graph: &StepGraph, task: &Task) -> Vec<String> {
        task.steps()
            .iter()
            .map(|&step| graph.name(step).to_string())
            .collect()
    }

    fn run_with(plan: &TaskGraph, graph: &StepGraph, first: &str) -> TaskId {
        plan.runs()
            .find(|(_, task)| names(graph, task).first().map(String::as_str) == Some(first))
            .map(|(id, _)| id)
            .unwrap()
    }

    fn assert_fixpoint(plan: &TaskGraph, graph: &StepGraph) {
        for (_, task) in plan.runs() {
            if task.next.len() != 1 {
                continue;
            }
            let next = plan.task(*task.next.first().unwrap());
            if let TaskKind::Run { steps } = &next.kind {
                let head = graph.get(steps[0]).unwrap();
                assert!(head.step.is_async(), "{:?} could still be merged", names(graph, next));
            }
        }
    }

    #[test]
    fn chain_coalesces_into_one_run() {
        let graph = graph(&[("a", &[], false), ("b", &[0], false), ("c", &[1], false)]);
        let plan = GraphPlanner::plan(&graph, StepId::new(2)).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.joins().count(), 0);

        let fork = plan.task(plan.root());
        assert_eq!(fork.kind, TaskKind::Fork);
        assert_eq!(fork.next, BTreeSet::from([plan.sink()]));
        assert_eq!(names(&graph, plan.task(plan.sink())), ["a", "b", "c"]);
        assert!(plan.task(plan.sink()).next.is_empty());
    }

    #[test]
    fn fan_in_then_async_step() {
        let graph = graph(&[
            ("a", &[], false),
            ("b", &[], false),
            ("c", &[0, 1], false),
            ("d", &[2], true),
        ]);
        let plan = GraphPlanner::plan(&graph, StepId::new(3)).unwrap();

        let a = run_with(&plan, &graph, "a");
        let b = run_with(&plan, &graph, "b");
        let c = run_with(&plan, &graph, "c");
        let d = run_with(&plan, &graph, "d");

        assert_eq!(plan.task(plan.root()).next, BTreeSet::from([a, b]));

        let (join, task) = plan.joins().next().unwrap();
        assert_eq!(plan.joins().count(), 1);
        assert_eq!(task.kind, TaskKind::Join { priors: BTreeSet::from([a, b]) });
        assert_eq!(task.next, BTreeSet::from([c]));

        assert_eq!(plan.task(a).next, BTreeSet::from([join]));
        assert_eq!(plan.task(b).next, BTreeSet::from([join]));
        assert_eq!(plan.task(c).next, BTreeSet::from([d]));
        assert_eq!(names(&graph, plan.task(c)), ["c"]);
        assert_eq!(names(&graph, plan.task(d)), ["d"]);
        assert_eq!(plan.sink(), d);
    }

    #[test]
    fn diamond_keeps_branches_apart() {
        let graph = graph(&[
            ("a", &[], false),
            ("b", &[0], false),
            ("c", &[0], false),
            ("d", &[1, 2], false),
        ]);
        let plan = GraphPlanner::plan(&graph, StepId::new(3)).unwrap();

        let a = run_with(&plan, &graph, "a");
        let b = run_with(&plan, &graph, "b");
        let c = run_with(&plan, &graph, "c");

        assert_eq!(plan.task(plan.root()).next, BTreeSet::from([a]));
        assert_eq!(plan.task(a).next, BTreeSet::from([b, c]));
        assert_eq!(plan.joins().count(), 1);
        assert_fixpoint(&plan, &graph);
    }

    #[test]
    fn identical_predecessor_sets_share_a_join() {
        let graph = graph(&[
            ("a", &[], false),
            ("b", &[], false),
            ("x", &[0, 1], false),
            ("y", &[1, 0], false),
            ("z", &[2, 3], false),
        ]);
        let plan = GraphPlanner::plan(&graph, StepId::new(4)).unwrap();

        let x = run_with(&plan, &graph, "x");
        let y = run_with(&plan, &graph, "y");
        let shared = plan
            .joins()
            .find(|(_, task)| task.next.contains(&x))
            .map(|(id, task)| (id, task.next.clone()))
            .unwrap();

        assert_eq!(shared.1, BTreeSet::from([x, y]));
        assert_eq!(plan.joins().count(), 2);

        let a = run_with(&plan, &graph, "a");
        assert_eq!(plan.task(a).next, BTreeSet::from([shared.0]));
    }

    #[test]
    fn every_step_lands_in_exactly_one_run() {
        let graph = graph(&[
            ("a", &[], false),
            ("b", &[0], false),
            ("c", &[1], true),
            ("d", &[2], false),
            ("e", &[0], false),
            ("f", &[3, 4], false),
            ("g", &[5, 5], false),
        ]);
        let plan = GraphPlanner::plan(&graph, StepId::new(6)).unwrap();

        let mut seen: Vec<StepId> = plan.runs().flat_map(|(_, task)| task.steps().to_vec()).collect();
        seen.sort();
        assert_eq!(seen, (0..7).map(StepId::new).collect::<Vec<_>>());
        assert_fixpoint(&plan, &graph);

        // c starts a new task because it suspends, d rides along with it
        let c = run_with(&plan, &graph, "c");
        assert_eq!(names(&graph, plan.task(c)), ["c", "d"]);
        // the duplicated input of g is a single predecessor
        let f = run_with(&plan, &graph, "f");
        assert_eq!(names(&graph, plan.task(f)), ["f", "g"]);
    }

    #[test]
    fn unreachable_steps_are_not_planned() {
        let graph = graph(&[("a", &[], false), ("stray", &[], false), ("b", &[0], false)]);
        let plan = GraphPlanner::plan(&graph, StepId::new(2)).unwrap();

        let steps: Vec<StepId> = plan.runs().flat_map(|(_, task)| task.steps().to_vec()).collect();
        assert_eq!(steps, vec![StepId::new(0), StepId::new(2)]);
    }

    #[test]
    fn live_inputs_cover_downstream_reads() {
        let graph = graph(&[("a", &[], false), ("b", &[0], false), ("c", &[0, 1], false)]);
        let plan = GraphPlanner::plan(&graph, StepId::new(2)).unwrap();

        let a = run_with(&plan, &graph, "a");
        let b = run_with(&plan, &graph, "b");
        let c = run_with(&plan, &graph, "c");
        let (_, join) = plan.joins().next().unwrap();

        let value = |i: usize| ValueId::new(i);
        assert_eq!(plan.task(c).inputs, HashSet::from([value(0), value(1)]));
        assert_eq!(join.inputs, HashSet::from([value(0), value(1)]));
        assert_eq!(plan.task(b).inputs, HashSet::from([value(0)]));
        assert!(plan.task(a).inputs.is_empty());
        assert!(plan.task(plan.root()).inputs.is_empty());

        assert_eq!(plan.task(c).available, HashSet::from([value(0), value(1), value(2)]));
        assert_eq!(join.available, HashSet::from([value(0), value(1)]));
    }

    #[test]
    fn malformed_graphs_are_rejected() {
        let cyclic = graph(&[("a", &[1], false), ("b", &[0], false), ("c", &[1], false)]);
        assert!(matches!(
            GraphPlanner::plan(&cyclic, StepId::new(2)),
            Err(PlanError::Cycle(_))
        ));

        let selfish = graph(&[("a", &[0], false)]);
        assert_eq!(
            GraphPlanner::plan(&selfish, StepId::new(0)).unwrap_err(),
            PlanError::SelfInput("a".into())
        );

        let dangling = graph(&[("a", &[9], false)]);
        assert_eq!(
            GraphPlanner::plan(&dangling, StepId::new(0)).unwrap_err(),
            PlanError::UnknownStep {
                step: "a".into(),
                input: 9
            }
        );

        assert!(GraphPlanner::plan(&dangling, StepId::new(5)).is_err());
    }
}
