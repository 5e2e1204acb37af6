use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{json, Map};
use spindle::compiler::compile;
use spindle::dsl::builder::ProcessBuilder;
use spindle::dsl::Process;
use spindle::runtime::blueprint::SpecRegistry;
use spindle::runtime::evaluator::EvalexprEvaluator;
use spindle::runtime::task::StateMask;
use spindle::serializer;
use spindle::Workflow;

/// A generated acyclic definition: node `i` only ever feeds nodes after it.
#[derive(Debug, Clone)]
struct Graph {
    kinds: Vec<u8>,
    edges: BTreeSet<(usize, usize)>,
    pick: i64,
}

fn graphs() -> impl Strategy<Value = Graph> {
    (1usize..8)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(0u8..4, n),
                prop::collection::vec((any::<Index>(), any::<u8>()), n),
                0i64..3,
            )
        })
        .prop_map(|(kinds, preds, pick)| {
            let mut edges = BTreeSet::new();
            for (i, (first, extra)) in preds.iter().enumerate().skip(1) {
                edges.insert((first.index(i), i));
                for j in (0..i).filter(|j| extra & (1 << j) != 0) {
                    edges.insert((j, i));
                }
            }
            Graph { kinds, edges, pick }
        })
}

fn node(i: usize) -> String {
    format!("n{i}")
}

fn to_process(graph: &Graph) -> Process {
    let mut builder = ProcessBuilder::new("generated").start("start").end("end");
    for (i, kind) in graph.kinds.iter().enumerate() {
        let id = node(i);
        builder = match kind {
            0 => builder.task(&id),
            1 => builder.script(&id, &format!("v{i} = {i}")),
            2 => builder.exclusive(&id),
            _ => builder.parallel_gateway(&id),
        };
    }
    builder = builder.connect("start", &node(0));

    for (i, kind) in graph.kinds.iter().enumerate() {
        let mut targets: Vec<String> = graph.edges.iter().filter(|(from, _)| *from == i).map(|(_, to)| node(*to)).collect();
        if targets.is_empty() {
            targets.push("end".to_string());
        }
        let last = targets.len() - 1;
        for (k, target) in targets.iter().enumerate() {
            builder = match (kind, k == last) {
                (2, false) => builder.connect_if(&node(i), target, &format!("pick == {k}")),
                (2, true) => builder.connect_default(&node(i), target),
                _ => builder.connect(&node(i), target),
            };
        }
    }
    builder.build()
}

fn start(graph: &Graph) -> Workflow {
    let blueprint = compile(to_process(graph)).expect("Compilation failed");
    let mut data = Map::new();
    data.insert("pick".to_string(), json!(graph.pick));
    Workflow::new(Arc::new(blueprint), SpecRegistry::new(), Arc::new(EvalexprEvaluator::new()))
        .expect("Failed to create workflow")
        .with_data(data)
}

fn outcome(workflow: &Workflow) -> Vec<(String, u16)> {
    let mut seen: Vec<(String, u16)> = workflow
        .get_tasks(StateMask::ANY)
        .iter()
        .map(|t| (t.spec.clone(), t.state.code()))
        .collect();
    seen.sort();
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_acyclic_runs_end_in_terminal_states(graph in graphs()) {
        let mut workflow = start(&graph);
        workflow.advance_ready_tasks().expect("run failed");

        prop_assert!(workflow.is_completed());
        prop_assert!(workflow.get_tasks(StateMask::ANY).iter().all(|t| t.has_state(StateMask::FINISHED)));
        prop_assert!(workflow.ready_tasks().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_of_generated_trees(graph in graphs()) {
        let fresh = start(&graph);
        let mut finished = start(&graph);
        finished.advance_ready_tasks().expect("run failed");

        // 1. Finished trees come back exactly.
        let snapshot = serializer::serialize(&finished).expect("serialize failed");
        let restored = serializer::deserialize(snapshot.clone(), Arc::new(EvalexprEvaluator::new()))
            .expect("deserialize failed");
        prop_assert_eq!(restored.top().tasks(), finished.top().tasks());
        prop_assert_eq!(serializer::serialize(&restored).expect("serialize failed"), snapshot);

        // 2. A restored fresh tree runs to the same outcome.
        let snapshot = serializer::serialize(&fresh).expect("serialize failed");
        let mut resumed = serializer::deserialize(snapshot, Arc::new(EvalexprEvaluator::new()))
            .expect("deserialize failed");
        resumed.advance_ready_tasks().expect("run failed");
        prop_assert_eq!(outcome(&resumed), outcome(&finished));
        prop_assert_eq!(resumed.data(), finished.data());
    }
}
