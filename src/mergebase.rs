//! Bidirectional BFS over the revision parent DAG to find a common
//! ancestor ("merge base") of two revisions. Expands one side's frontier
//! one generation per step, alternating sides, until a parent already
//! visited (or currently frontier) on the other side is found, or both
//! frontiers run dry.

use crate::error::{Error, Result};
use crate::refs::Ref;
use std::collections::HashSet;

/// Which side's expansion produced a traversal edge, for the diagnostic
/// graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

#[derive(Debug, Clone)]
struct Edge {
    from: Ref,
    to: Ref,
    side: Side,
}

/// Traversal edges recorded during the search, serializable as a
/// Graphviz digraph for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    edges: Vec<Edge>,
}

impl Graph {
    fn add_edge(&mut self, from: Ref, to: Ref, side: Side) {
        self.edges.push(Edge { from, to, side });
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&Ref, &Ref, Side)> {
        self.edges.iter().map(|e| (&e.from, &e.to, e.side))
    }

    pub fn to_graphviz(&self) -> String {
        let mut out = String::from("digraph mergebase {\n");
        for e in &self.edges {
            let color = match e.side {
                Side::A => "blue",
                Side::B => "red",
            };
            out.push_str(&format!(
                "  \"{}\" -> \"{}\" [color={color}];\n",
                e.from.key(),
                e.to.key()
            ));
        }
        out.push_str("}\n");
        out
    }
}

/// Expands every node in `frontier` by one generation via `parent_fn`.
/// Returns the next frontier and, if any newly discovered parent is
/// already visited or frontier on the other side, that shared ancestor.
/// A `NotFound` from `parent_fn` prunes that branch rather than failing
/// the whole search.
fn expand_side(
    frontier: &HashSet<Ref>,
    parent_fn: &mut dyn FnMut(&Ref) -> Result<Vec<Ref>>,
    visited_mine: &mut HashSet<Ref>,
    visited_other: &HashSet<Ref>,
    frontier_other: &HashSet<Ref>,
    graph: &mut Graph,
    side: Side,
) -> Result<(HashSet<Ref>, Option<Ref>)> {
    let mut next = HashSet::new();
    for node in frontier {
        let parents = match parent_fn(node) {
            Ok(parents) => parents,
            Err(Error::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        for p in parents {
            graph.add_edge(node.clone(), p.clone(), side);
            if visited_other.contains(&p) || frontier_other.contains(&p) {
                return Ok((next, Some(p)));
            }
            if visited_mine.insert(p.clone()) {
                next.insert(p);
            }
        }
    }
    Ok((next, None))
}

/// Finds a common ancestor of `a` and `b` using `parent_fn` to fetch a
/// revision's parents. Returns the ancestor plus the traversal graph. The
/// first ancestor discovered across both frontiers is returned: this does
/// not minimize total edge distance (a documented limitation, not a bug).
pub fn find_merge_base(
    a: &Ref,
    b: &Ref,
    mut parent_fn: impl FnMut(&Ref) -> Result<Vec<Ref>>,
) -> Result<(Ref, Graph)> {
    if a == b {
        return Ok((a.clone(), Graph::default()));
    }

    let mut graph = Graph::default();
    let mut frontier_a: HashSet<Ref> = [a.clone()].into_iter().collect();
    let mut frontier_b: HashSet<Ref> = [b.clone()].into_iter().collect();
    let mut visited_a = frontier_a.clone();
    let mut visited_b = frontier_b.clone();
    let mut turn_a = true;

    loop {
        if frontier_a.is_empty() && frontier_b.is_empty() {
            return Err(Error::NoMergeBase {
                a: a.key(),
                b: b.key(),
            });
        }

        if turn_a {
            if !frontier_a.is_empty() {
                let (next, found) = expand_side(
                    &frontier_a,
                    &mut parent_fn,
                    &mut visited_a,
                    &visited_b,
                    &frontier_b,
                    &mut graph,
                    Side::A,
                )?;
                frontier_a = next;
                if let Some(base) = found {
                    return Ok((base, graph));
                }
            }
        } else if !frontier_b.is_empty() {
            let (next, found) = expand_side(
                &frontier_b,
                &mut parent_fn,
                &mut visited_b,
                &visited_a,
                &frontier_a,
                &mut graph,
                Side::B,
            )?;
            frontier_b = next;
            if let Some(base) = found {
                return Ok((base, graph));
            }
        }

        turn_a = !turn_a;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn r(tag: &str) -> Ref {
        Ref::repository_of(tag.as_bytes())
    }

    fn parent_fn_from(graph: HashMap<Ref, Vec<Ref>>) -> impl FnMut(&Ref) -> Result<Vec<Ref>> {
        move |node: &Ref| {
            graph
                .get(node)
                .cloned()
                .ok_or_else(|| Error::NotFound(node.key()))
        }
    }

    #[test]
    fn identical_revisions_return_immediately_with_empty_graph() {
        let a = r("rev");
        let (base, graph) = find_merge_base(&a, &a, |_| Ok(vec![])).unwrap();
        assert_eq!(base, a);
        assert!(graph.is_empty());
    }

    #[test]
    fn scenario_f_simple_common_parent() {
        let a0 = r("a0");
        let b0 = r("b0");
        let c = r("c");

        let mut parents = HashMap::new();
        parents.insert(a0.clone(), vec![c.clone()]);
        parents.insert(b0.clone(), vec![c.clone()]);

        let (base, graph) = find_merge_base(&a0, &b0, parent_fn_from(parents)).unwrap();
        assert_eq!(base, c);

        let edges: Vec<_> = graph.edges().collect();
        assert!(edges
            .iter()
            .any(|(from, to, side)| **from == a0 && **to == c && *side == Side::A));
        assert!(edges
            .iter()
            .any(|(from, to, side)| **from == b0 && **to == c && *side == Side::B));
    }

    #[test]
    fn disjoint_dags_have_no_merge_base() {
        let a0 = r("a0");
        let b0 = r("b0");
        let err = find_merge_base(&a0, &b0, |_| Ok(vec![])).unwrap_err();
        assert!(matches!(err, Error::NoMergeBase { .. }));
    }

    #[test]
    fn not_found_prunes_branch_without_failing_search() {
        let a0 = r("a0");
        let a1 = r("a1"); // a0's other parent, dead end
        let b0 = r("b0");
        let c = r("c");

        let mut parents = HashMap::new();
        parents.insert(a0.clone(), vec![a1.clone(), c.clone()]);
        // a1 has no entry: parent_fn returns NotFound for it.
        parents.insert(b0.clone(), vec![c.clone()]);

        let (base, _graph) = find_merge_base(&a0, &b0, parent_fn_from(parents)).unwrap();
        assert_eq!(base, c);
    }

    #[test]
    fn deeper_common_ancestor_found_via_alternation() {
        // a0 -> a1 -> root ; b0 -> root. Bidirectional search should
        // still land on root even though a's chain is longer.
        let a0 = r("a0");
        let a1 = r("a1");
        let b0 = r("b0");
        let root = r("root");

        let mut parents = HashMap::new();
        parents.insert(a0.clone(), vec![a1.clone()]);
        parents.insert(a1.clone(), vec![root.clone()]);
        parents.insert(b0.clone(), vec![root.clone()]);

        let (base, _graph) = find_merge_base(&a0, &b0, parent_fn_from(parents)).unwrap();
        assert_eq!(base, root);
    }
}
