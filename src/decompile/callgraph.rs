//! Call-graph construction: one node per subroutine entry, one edge per
//! JSR site. STORESTATE references count as edges too, so closure bodies
//! stay reachable from their owners.

use std::collections::{BTreeMap, BTreeSet};

use crate::ncs::op;

use super::link::Program;

#[derive(Debug, Clone)]
pub struct CallGraph {
    forward: BTreeMap<u32, BTreeSet<u32>>,
}

impl CallGraph {
    /// Builds a graph directly from adjacency lists. Mostly useful for
    /// tests; the pipeline uses [`build`].
    pub fn from_edges(edges: &[(u32, &[u32])]) -> CallGraph {
        let mut forward: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for (from, tos) in edges {
            let entry = forward.entry(*from).or_default();
            entry.extend(tos.iter().copied());
            for to in *tos {
                forward.entry(*to).or_default();
            }
        }
        CallGraph { forward }
    }

    pub fn edges(&self) -> &BTreeMap<u32, BTreeSet<u32>> {
        &self.forward
    }

    pub fn successors(&self, node: u32) -> impl Iterator<Item = u32> + '_ {
        self.forward.get(&node).into_iter().flatten().copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.forward.keys().copied()
    }

    pub fn reachable_from(&self, start: u32) -> BTreeSet<u32> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            for s in self.successors(n) {
                if !seen.contains(&s) {
                    stack.push(s);
                }
            }
        }
        seen
    }
}

pub fn build(program: &Program) -> CallGraph {
    let mut forward: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for sub in &program.subroutines {
        forward.entry(sub.entry).or_default();
    }

    for (i, insn) in program.instructions.iter().enumerate() {
        if program.dead[i] {
            continue;
        }
        let from = program.owner[i];
        match insn.opcode {
            op::JSR => {
                let to = insn.jump_target().unwrap() as u32;
                forward.entry(from).or_default().insert(to);
            }
            op::STORESTATE => {
                if let Some(&body) = program.state_entry_of.get(&insn.offset) {
                    forward.entry(from).or_default().insert(body);
                }
            }
            _ => {}
        }
    }

    CallGraph { forward }
}
