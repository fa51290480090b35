//! Cycle detection over adjacency maps.
//!
//! Used both for the task dependency graph and for the coordinator's
//! wait-for graph. Iteration follows the `BTreeMap` key order and the
//! neighbour order given by the caller, so results are deterministic.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Find cycles with an iterative depth-first search.
///
/// Every back edge to a node on the current recursion stack yields one
/// cycle: the suffix of the DFS path starting at the revisited node. The
/// closing edge back to the first element is implied. Nodes that appear
/// only as neighbours are treated as having no outgoing edges.
pub fn find_cycles<N: Ord + Clone>(adjacency: &BTreeMap<N, Vec<N>>) -> Vec<Vec<N>> {
    let mut marks: BTreeMap<&N, Mark> = BTreeMap::new();
    let mut cycles = Vec::new();

    for root in adjacency.keys() {
        if marks.contains_key(root) {
            continue;
        }

        // (node, index of the next neighbour to visit)
        let mut stack: Vec<(&N, usize)> = vec![(root, 0)];
        let mut path: Vec<&N> = vec![root];
        marks.insert(root, Mark::OnStack);

        while let Some((node, next)) = stack.last_mut() {
            let neighbours = adjacency.get(*node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(neighbour) = neighbours.get(*next) {
                *next += 1;
                match marks.get(neighbour) {
                    Some(Mark::OnStack) => {
                        if let Some(start) = path.iter().position(|n| *n == neighbour) {
                            cycles.push(path[start..].iter().map(|n| (*n).clone()).collect());
                        }
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(neighbour, Mark::OnStack);
                        path.push(neighbour);
                        stack.push((neighbour, 0));
                    }
                }
            } else {
                marks.insert(*node, Mark::Done);
                path.pop();
                stack.pop();
            }
        }
    }

    cycles
}

/// Every node that participates in some cycle, sorted.
pub fn nodes_on_cycles<N: Ord + Clone>(adjacency: &BTreeMap<N, Vec<N>>) -> BTreeSet<N> {
    find_cycles(adjacency).into_iter().flatten().collect()
}
