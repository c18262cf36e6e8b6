//! Strongly-connected components of the call graph, emitted leaves-first:
//! whenever component A has an edge into component B, B precedes A in the
//! output. The prototype engine relies on that order so callee signatures
//! are frozen before their callers are inferred.

use std::collections::BTreeMap;

use super::callgraph::CallGraph;

pub fn condense(graph: &CallGraph) -> Vec<Vec<u32>> {
    Tarjan::new(graph).run()
}

struct Frame {
    v: u32,
    succs: Vec<u32>,
    next: usize,
}

struct Tarjan<'a> {
    graph: &'a CallGraph,
    index: BTreeMap<u32, u32>,
    lowlink: BTreeMap<u32, u32>,
    on_stack: BTreeMap<u32, bool>,
    stack: Vec<u32>,
    next_index: u32,
    components: Vec<Vec<u32>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a CallGraph) -> Self {
        Tarjan {
            graph,
            index: BTreeMap::new(),
            lowlink: BTreeMap::new(),
            on_stack: BTreeMap::new(),
            stack: Vec::new(),
            next_index: 0,
            components: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<u32>> {
        let nodes: Vec<u32> = self.graph.nodes().collect();
        for v in nodes {
            if !self.index.contains_key(&v) {
                self.strong_connect(v);
            }
        }
        // Tarjan completes a component only after everything it reaches has
        // completed, so the natural emission order is already leaves-first.
        self.components
    }

    fn open_frame(&mut self, v: u32) -> Frame {
        self.index.insert(v, self.next_index);
        self.lowlink.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v, true);
        Frame {
            v,
            succs: self.graph.successors(v).collect(),
            next: 0,
        }
    }

    /// Iterative strongconnect with an explicit frame stack; call graphs of
    /// large scripts can chain deeply enough to overflow real recursion.
    fn strong_connect(&mut self, root: u32) {
        let mut frames = vec![self.open_frame(root)];
        while let Some(frame) = frames.last_mut() {
            if frame.next < frame.succs.len() {
                let w = frame.succs[frame.next];
                frame.next += 1;
                if !self.index.contains_key(&w) {
                    let new = self.open_frame(w);
                    frames.push(new);
                } else if self.on_stack.get(&w).copied().unwrap_or(false) {
                    let v = frames.last().unwrap().v;
                    let low = self.lowlink[&v].min(self.index[&w]);
                    self.lowlink.insert(v, low);
                }
                continue;
            }

            let v = frame.v;
            frames.pop();
            if let Some(parent) = frames.last() {
                let p = parent.v;
                let low = self.lowlink[&p].min(self.lowlink[&v]);
                self.lowlink.insert(p, low);
            }
            if self.lowlink[&v] == self.index[&v] {
                let mut component = Vec::new();
                loop {
                    let w = self.stack.pop().unwrap();
                    self.on_stack.insert(w, false);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort_unstable();
                self.components.push(component);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompile::callgraph::CallGraph;

    fn graph(edges: &[(u32, &[u32])]) -> CallGraph {
        CallGraph::from_edges(edges)
    }

    #[test]
    fn chain_emits_callees_first() {
        let g = graph(&[(1, &[2]), (2, &[3]), (3, &[])]);
        let sccs = condense(&g);
        assert_eq!(sccs, vec![vec![3], vec![2], vec![1]]);
    }

    #[test]
    fn mutual_recursion_collapses_into_one_component() {
        let g = graph(&[(1, &[2]), (2, &[3, 4]), (3, &[2]), (4, &[])]);
        let sccs = condense(&g);
        assert!(sccs.contains(&vec![2, 3]));
        // The recursive pair must come after its callee and before main.
        let pos = |c: &[u32]| sccs.iter().position(|s| s == c).unwrap();
        assert!(pos(&[4]) < pos(&[2, 3]));
        assert!(pos(&[2, 3]) < pos(&[1]));
    }

    #[test]
    fn self_loop_is_its_own_component() {
        let g = graph(&[(1, &[1])]);
        assert_eq!(condense(&g), vec![vec![1]]);
    }

    #[test]
    fn every_edge_points_at_an_earlier_or_same_component() {
        let g = graph(&[(1, &[2, 5]), (2, &[3]), (3, &[1, 4]), (4, &[]), (5, &[4])]);
        let sccs = condense(&g);
        let comp_of = |n: u32| sccs.iter().position(|s| s.contains(&n)).unwrap();
        for (from, tos) in g.edges() {
            for to in tos {
                assert!(comp_of(*to) <= comp_of(*from));
            }
        }
    }
}
