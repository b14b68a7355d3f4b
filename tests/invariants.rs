//! Randomized sequences of mutating operations, checked against the quantified
//! invariants from the specification's testable-properties section after every step —
//! the teacher's `crates/graph/tests/test_proptest.rs` complements targeted unit tests
//! with exactly this style of check rather than substituting for them.

use std::collections::HashSet;

use cluster_graph::Cluster;
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Clone, Copy, Debug)]
enum Op {
    AddVertex,
    AddEdge(usize, usize),
    RemoveVertex(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::AddVertex),
        4 => (0usize..8, 0usize..8).prop_map(|(a, b)| Op::AddEdge(a, b)),
        2 => (0usize..8).prop_map(Op::RemoveVertex),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 0..60)
}

/// Invariant 1 (global uniqueness) plus invariant 2 (endpoint consistency), checked on
/// the single flat cluster these tests exercise.
fn assert_invariants(cluster: &Cluster) -> TestCaseResult {
    let globals = cluster.global_vertices();
    let unique: HashSet<_> = globals.iter().copied().collect();
    prop_assert_eq!(globals.len(), unique.len(), "duplicate global vertex id");

    for le in cluster.local_edges() {
        let (eu, ev) = cluster.edge_endpoints(le).unwrap();
        let entries = cluster.global_edges_of(le).unwrap();
        prop_assert!(!entries.is_empty(), "local edge with empty aggregate");
        for ge in &entries {
            let cs = cluster.containing_vertex(ge.source, false).unwrap();
            let ct = cluster.containing_vertex(ge.target, false).unwrap();
            prop_assert_ne!(cs, ct);
            let ok = (cs == eu && ct == ev) || (cs == ev && ct == eu);
            prop_assert!(ok, "edge endpoints don't match its local edge");
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn invariants_hold_after_every_mutation(ops in ops_strategy()) {
        let root = Cluster::root();
        let mut live: Vec<cluster_graph::LocalVertex> = Vec::new();
        let mut last_count = root.allocator().count();

        for op in ops {
            match op {
                Op::AddVertex => {
                    let (lv, _gv) = root.add_vertex().unwrap();
                    let count = root.allocator().count();
                    prop_assert!(count > last_count, "generate() must be strictly increasing");
                    last_count = count;
                    live.push(lv);
                }
                Op::AddEdge(i, j) => {
                    if live.is_empty() {
                        continue;
                    }
                    let u = live[i % live.len()];
                    let v = live[j % live.len()];
                    if u == v {
                        continue;
                    }
                    let before = root
                        .local_edges()
                        .into_iter()
                        .find(|&le| {
                            let (a, b) = root.edge_endpoints(le).unwrap();
                            (a == u && b == v) || (a == v && b == u)
                        })
                        .map(|le| root.global_edges_of(le).unwrap().len())
                        .unwrap_or(0);
                    root.add_edge_local(u, v).unwrap();
                    let le = root
                        .local_edges()
                        .into_iter()
                        .find(|&le| {
                            let (a, b) = root.edge_endpoints(le).unwrap();
                            (a == u && b == v) || (a == v && b == u)
                        })
                        .expect("just created");
                    let after = root.global_edges_of(le).unwrap().len();
                    prop_assert_eq!(after, before + 1, "edge aggregation must grow by exactly one");
                    let count = root.allocator().count();
                    prop_assert!(count > last_count);
                    last_count = count;
                }
                Op::RemoveVertex(i) => {
                    if live.is_empty() {
                        continue;
                    }
                    let idx = i % live.len();
                    let v = live.remove(idx);
                    let mut fired = Vec::new();
                    root.remove_vertex_local(v, |ge| fired.push(ge)).unwrap();

                    for le in root.local_edges() {
                        let entries = root.global_edges_of(le).unwrap();
                        for ge in entries {
                            prop_assert!(
                                !fired.contains(&ge),
                                "removed vertex's edges must not linger anywhere"
                            );
                        }
                    }
                }
            }
            assert_invariants(&root)?;
        }
    }
}
