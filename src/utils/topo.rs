use std::collections::BTreeSet;

/// Result of [`topological_order`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TopoOrder {
    /// Nodes in dependency order
    pub(crate) ordered: Vec<usize>,
    /// Nodes left on (or behind) a cycle, ascending
    pub(crate) cyclic: Vec<usize>,
}

/// Kahn's algorithm over nodes `0..n`; `(before, after)` edges. Among ready
/// nodes the lowest index goes first, so input order breaks ties.
pub(crate) fn topological_order(
    n: usize,
    edges: &[(usize, usize)],
) -> TopoOrder {
    let mut indegree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(before, after) in edges {
        if before == after || before >= n || after >= n {
            continue;
        }
        successors[before].push(after);
        indegree[after] += 1;
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        ordered.push(next);
        for &succ in &successors[next] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    let cyclic = (0..n).filter(|&i| indegree[i] > 0).collect();
    TopoOrder { ordered, cyclic }
}
