//! Property checks for closure and ordering on generated graphs.

use fernbau_graph::DependencyGraph;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

fn random_graph(seed: u64, nodes: usize, edges: usize, acyclic: bool) -> DependencyGraph<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut graph = DependencyGraph::new();

    for _ in 0..edges {
        let a = rng.gen_range(0..nodes);
        let b = rng.gen_range(0..nodes);
        if a == b {
            continue;
        }
        // Only point from higher to lower index when an acyclic graph is wanted
        let (source, dependency) = if acyclic { (a.max(b), a.min(b)) } else { (a, b) };
        let _ = graph
            .add_dependency(format!("src/{source}.c"), format!("src/{dependency}.c"))
            .unwrap();
    }

    graph
}

fn all_sources(nodes: usize) -> Vec<String> {
    (0..nodes).map(|i| format!("src/{i}.c")).collect()
}

#[test]
fn test_acyclic_order_respects_every_edge() {
    for seed in 0..20 {
        let graph = random_graph(seed, 30, 60, true);
        let targets = all_sources(30);
        let order = graph.order(&targets, |k| k.len() % 3);

        assert!(!order.has_cycles(), "seed {seed} produced a cycle");
        assert_eq!(order.targets.len(), targets.len());

        let position = |k: &String| order.targets.iter().position(|t| t == k).unwrap();
        for source in &targets {
            for dependency in graph.dependencies(source) {
                assert!(
                    position(dependency) < position(source),
                    "seed {seed}: {dependency} must precede {source}"
                );
            }
        }
    }
}

#[test]
fn test_cyclic_order_is_complete_and_unique() {
    for seed in 0..20 {
        let graph = random_graph(seed, 25, 80, false);
        let targets = all_sources(25);
        let order = graph.order(&targets, |_| 0);

        assert_eq!(order.targets.len(), targets.len());
        let unique: HashSet<_> = order.targets.iter().collect();
        assert_eq!(unique.len(), targets.len(), "seed {seed} emitted a duplicate");
    }
}

#[test]
fn test_closure_contains_seeds_and_is_closed() {
    for seed in 0..20 {
        let graph = random_graph(seed, 40, 90, false);
        let seeds = vec!["src/0.c".to_string(), "src/7.c".to_string()];
        let closure = graph.forward_closure(seeds.iter());

        assert_eq!(&closure[..2], &seeds[..]);

        let members: HashSet<_> = closure.iter().collect();
        assert_eq!(members.len(), closure.len());
        for member in &closure {
            for dependent in graph.dependents(member) {
                assert!(members.contains(dependent), "seed {seed}: {dependent} missing");
            }
        }
    }
}

#[test]
fn test_order_is_stable_across_runs() {
    let graph = random_graph(42, 30, 100, false);
    let targets = all_sources(30);
    let first = graph.order(&targets, |k| k.len());
    for _ in 0..5 {
        assert_eq!(graph.order(&targets, |k| k.len()), first);
    }
}
