use super::*;

fn linear_graph() -> DependencyGraph {
    let mut g = DependencyGraph::new();
    g.add_edge("a", "b", EdgeType::Hard);
    g.add_edge("b", "c", EdgeType::Hard);
    g
}

#[test]
fn test_add_node_is_idempotent() {
    let mut g = DependencyGraph::new();
    g.add_node("a");
    g.add_node("a");

    assert_eq!(g.node_count(), 1);
}

#[test]
fn test_add_edge_creates_endpoints() {
    let g = linear_graph();

    assert_eq!(g.node_count(), 3);
    assert_eq!(g.edge_count(), 2);
}

#[test]
fn test_topological_sort_linear() {
    let g = linear_graph();

    let topo = g.topological_sort();

    assert!(!topo.has_cycle);
    assert_eq!(topo.order, vec!["a", "b", "c"]);
    assert!(topo.cycle_path.is_empty());
}

#[test]
fn test_topological_sort_diamond() {
    let mut g = DependencyGraph::new();
    g.add_edge("root", "left", EdgeType::Hard);
    g.add_edge("root", "right", EdgeType::Hard);
    g.add_edge("left", "sink", EdgeType::Hard);
    g.add_edge("right", "sink", EdgeType::Hard);

    let topo = g.topological_sort();

    assert!(!topo.has_cycle);
    assert_eq!(topo.order.len(), 4);
    assert!(g.is_valid_execution_order(&topo.order));
}

// A->B->C->A yields a closed, reconstructable cycle path.
#[test]
fn test_cycle_detection_reports_path() {
    let mut g = DependencyGraph::new();
    g.add_edge("a", "b", EdgeType::Hard);
    g.add_edge("b", "c", EdgeType::Hard);
    g.add_edge("c", "a", EdgeType::Hard);

    let topo = g.topological_sort();

    assert!(topo.has_cycle);
    // order is shorter than V exactly when a cycle exists
    assert!(topo.order.len() < g.node_count());

    let path = &topo.cycle_path;
    assert_eq!(path.first(), path.last(), "cycle path must be closed");
    assert_eq!(path.len(), 4);
    // Every hop is a real edge
    for pair in path.windows(2) {
        let from = &pair[0];
        let to = &pair[1];
        assert!(
            g.successors_for_test(from).iter().any(|(t, _)| t == to),
            "{} -> {} must be an edge",
            from,
            to
        );
    }
}

#[test]
fn test_self_loop_is_a_cycle() {
    let mut g = DependencyGraph::new();
    g.add_edge("a", "a", EdgeType::Hard);

    let topo = g.topological_sort();
    assert!(topo.has_cycle);
    assert_eq!(topo.cycle_path, vec!["a", "a"]);
}

// Soft edges participate in ordering and cycle detection; a cycle is
// reported, never silently broken.
#[test]
fn test_soft_edge_cycle_is_still_reported() {
    let mut g = DependencyGraph::new();
    g.add_edge("a", "b", EdgeType::Hard);
    g.add_edge("b", "a", EdgeType::Soft);

    let err = g.execution_order().unwrap_err();
    assert!(matches!(err, GraphError::CycleDetected { .. }));
}

#[test]
fn test_execution_order_levels() {
    let mut g = DependencyGraph::new();
    // Two roots; d depends on both branches meeting
    g.add_edge("a", "c", EdgeType::Hard);
    g.add_edge("b", "c", EdgeType::Hard);
    g.add_edge("c", "d", EdgeType::Hard);
    g.add_node("standalone");

    let plan = g.execution_order().unwrap();

    assert_eq!(plan.phases.len(), 3);
    // Level 0: both roots plus the disconnected node
    let level0: Vec<&str> = plan.phases[0].iter().map(String::as_str).collect();
    assert!(level0.contains(&"a"));
    assert!(level0.contains(&"b"));
    assert!(level0.contains(&"standalone"));
    assert_eq!(plan.phases[1], vec!["c"]);
    assert_eq!(plan.phases[2], vec!["d"]);
    assert_eq!(plan.node_count(), 5);
}

#[test]
fn test_execution_order_cycle_error_carries_path() {
    let mut g = DependencyGraph::new();
    g.add_edge("x", "y", EdgeType::Hard);
    g.add_edge("y", "x", EdgeType::Hard);

    match g.execution_order() {
        Err(GraphError::CycleDetected { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 3);
        }
        other => panic!("expected CycleDetected, got {:?}", other),
    }
}

#[test]
fn test_is_valid_execution_order() {
    let g = linear_graph();

    let good = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    assert!(g.is_valid_execution_order(&good));

    let reversed = vec!["c".to_string(), "b".to_string(), "a".to_string()];
    assert!(!g.is_valid_execution_order(&reversed));

    let incomplete = vec!["a".to_string(), "b".to_string()];
    assert!(!g.is_valid_execution_order(&incomplete));

    let duplicated = vec!["a".to_string(), "a".to_string(), "c".to_string()];
    assert!(!g.is_valid_execution_order(&duplicated));
}

#[test]
fn test_empty_graph() {
    let g = DependencyGraph::new();

    let topo = g.topological_sort();
    assert!(!topo.has_cycle);
    assert!(topo.order.is_empty());

    let plan = g.execution_order().unwrap();
    assert_eq!(plan.phases.len(), 1);
    assert!(plan.phases[0].is_empty());
}
