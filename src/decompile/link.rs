//! Structural linker: resolves jump targets, discovers subroutine entries
//! and store-state bodies, assigns every instruction to its owning
//! subroutine, and marks dead code.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::DecompileError;
use crate::ncs::{op, Instruction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    Normal,
    /// Deferred-action closure body captured by STORESTATE.
    StateBody,
}

#[derive(Debug, Clone)]
pub struct Subroutine {
    pub entry: u32,
    pub kind: SubKind,
    /// Exclusive end offset; only known up front for state bodies, whose
    /// extent is delimited by the JMP that skips them.
    pub end: Option<u32>,
}

/// Shared analysis context produced by the linker and read by every later
/// stage.
#[derive(Debug)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub index_of: BTreeMap<u32, usize>,
    /// Entry subroutine offset (the first instruction of the stream).
    pub entry: u32,
    /// All discovered subroutines, sorted by entry offset.
    pub subroutines: Vec<Subroutine>,
    /// Owning subroutine entry per instruction.
    pub owner: Vec<u32>,
    pub dead: Vec<bool>,
    /// Targets of JMP/JZ/JNZ (not JSR).
    pub jump_targets: BTreeSet<u32>,
    /// STORESTATE offset -> closure body entry offset.
    pub state_entry_of: BTreeMap<u32, u32>,
}

impl Program {
    pub fn sub(&self, entry: u32) -> Option<&Subroutine> {
        self.subroutines.iter().find(|s| s.entry == entry)
    }

    /// Live instruction indices owned by the given subroutine, in offset
    /// order.
    pub fn instructions_of(&self, entry: u32) -> Vec<usize> {
        (0..self.instructions.len())
            .filter(|&i| self.owner[i] == entry && !self.dead[i])
            .collect()
    }
}

pub fn link(instructions: Vec<Instruction>) -> Result<Program, DecompileError> {
    if instructions.is_empty() {
        return Err(DecompileError::TruncatedBytecode { offset: 0 });
    }

    let mut index_of = BTreeMap::new();
    for (i, insn) in instructions.iter().enumerate() {
        index_of.insert(insn.offset, i);
    }
    let entry = instructions[0].offset;

    // Resolve every jump to an instruction boundary.
    let mut jump_targets = BTreeSet::new();
    let mut jsr_targets = BTreeSet::new();
    for insn in &instructions {
        if let Some(target) = insn.jump_target() {
            let resolved = u32::try_from(target)
                .ok()
                .filter(|t| index_of.contains_key(t));
            let Some(t) = resolved else {
                return Err(DecompileError::UnresolvedJump {
                    offset: insn.offset,
                    target,
                });
            };
            if insn.opcode == op::JSR {
                jsr_targets.insert(t);
            } else {
                jump_targets.insert(t);
            }
        }
    }

    // Store-state bodies: STORESTATE must be followed by the JMP that skips
    // the closure body; the body runs from the instruction after the JMP up
    // to the JMP target.
    let mut state_entry_of = BTreeMap::new();
    let mut state_bodies: Vec<(u32, u32)> = Vec::new();
    for (i, insn) in instructions.iter().enumerate() {
        if insn.opcode != op::STORESTATE {
            continue;
        }
        let jmp = instructions.get(i + 1).filter(|j| j.opcode == op::JMP);
        let Some(jmp) = jmp else {
            return Err(DecompileError::UnresolvedJump {
                offset: insn.offset,
                target: insn.next_offset() as i64,
            });
        };
        let body_entry = jmp.next_offset();
        let body_end = jmp.jump_target().unwrap() as u32;
        if body_entry >= body_end || !index_of.contains_key(&body_entry) {
            return Err(DecompileError::UnresolvedJump {
                offset: insn.offset,
                target: body_entry as i64,
            });
        }
        state_entry_of.insert(insn.offset, body_entry);
        state_bodies.push((body_entry, body_end));
    }

    // Subroutine entries: the program entry, every JSR target, and every
    // state body.
    let mut subroutines: Vec<Subroutine> = Vec::new();
    let mut entry_offsets = BTreeSet::new();
    entry_offsets.insert(entry);
    entry_offsets.extend(jsr_targets.iter().copied());
    let state_entries: BTreeMap<u32, u32> = state_bodies.iter().copied().collect();
    entry_offsets.extend(state_entries.keys().copied());
    for &e in &entry_offsets {
        match state_entries.get(&e) {
            Some(&end) => subroutines.push(Subroutine {
                entry: e,
                kind: SubKind::StateBody,
                end: Some(end),
            }),
            None => subroutines.push(Subroutine {
                entry: e,
                kind: SubKind::Normal,
                end: None,
            }),
        }
    }

    // Ownership: nearest preceding entry, except that a state body ends at
    // its delimiting JMP target, where ownership reverts to the enclosing
    // subroutine.
    let mut owner = vec![entry; instructions.len()];
    let mut cur = entry;
    let mut enclosing: Vec<(u32, u32)> = Vec::new(); // (owner, body end)
    for (i, insn) in instructions.iter().enumerate() {
        let o = insn.offset;
        while let Some(&(prev, end)) = enclosing.last() {
            if o >= end {
                cur = prev;
                enclosing.pop();
            } else {
                break;
            }
        }
        if entry_offsets.contains(&o) {
            if let Some(&end) = state_entries.get(&o) {
                enclosing.push((cur, end));
            } else {
                enclosing.clear();
            }
            cur = o;
        }
        owner[i] = cur;
    }

    // Dead marking: instructions following a RETN that are neither a
    // subroutine entry nor a branch target cannot execute.
    let mut dead = vec![false; instructions.len()];
    let mut after_ret = false;
    for (i, insn) in instructions.iter().enumerate() {
        let o = insn.offset;
        if entry_offsets.contains(&o) || jump_targets.contains(&o) {
            after_ret = false;
        }
        dead[i] = after_ret;
        if insn.opcode == op::RETN {
            after_ret = true;
        }
    }

    Ok(Program {
        instructions,
        index_of,
        entry,
        subroutines,
        owner,
        dead,
        jump_targets,
        state_entry_of,
    })
}

/// Basic block over a subroutine's live instructions.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: usize,
    pub start: u32,
    /// Instruction indices into `Program::instructions`.
    pub instrs: Vec<usize>,
    pub succ: Vec<usize>,
    pub pred: Vec<usize>,
}

/// Splits a subroutine into basic blocks between jumps and jump targets.
/// Successor edges only cover in-subroutine control flow; a jump that
/// leaves the subroutine has no edge and is handled as an unstructured
/// fallback downstream.
pub fn basic_blocks(program: &Program, entry: u32) -> Vec<Block> {
    let owned = program.instructions_of(entry);
    if owned.is_empty() {
        return Vec::new();
    }

    let in_sub: BTreeSet<u32> = owned
        .iter()
        .map(|&i| program.instructions[i].offset)
        .collect();

    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    leaders.insert(program.instructions[owned[0]].offset);
    for (k, &i) in owned.iter().enumerate() {
        let insn = &program.instructions[i];
        match insn.opcode {
            op::JMP | op::JZ | op::JNZ => {
                let t = insn.jump_target().unwrap() as u32;
                if in_sub.contains(&t) {
                    leaders.insert(t);
                }
                if let Some(&next) = owned.get(k + 1) {
                    leaders.insert(program.instructions[next].offset);
                }
            }
            op::RETN => {
                if let Some(&next) = owned.get(k + 1) {
                    leaders.insert(program.instructions[next].offset);
                }
            }
            _ => {}
        }
    }

    let mut block_of: BTreeMap<u32, usize> = BTreeMap::new();
    let mut blocks: Vec<Block> = Vec::new();
    for &i in &owned {
        let o = program.instructions[i].offset;
        if leaders.contains(&o) {
            let id = blocks.len();
            block_of.insert(o, id);
            blocks.push(Block {
                id,
                start: o,
                instrs: Vec::new(),
                succ: Vec::new(),
                pred: Vec::new(),
            });
        }
        blocks.last_mut().expect("first instruction is a leader").instrs.push(i);
    }

    // Successor edges from each block's final instruction.
    for b in 0..blocks.len() {
        let &last = blocks[b].instrs.last().unwrap();
        let insn = &program.instructions[last];
        let next_block = blocks.get(b + 1).map(|nb| nb.id);
        let mut succ = Vec::new();
        match insn.opcode {
            op::JMP => {
                let t = insn.jump_target().unwrap() as u32;
                if let Some(&id) = block_of.get(&t) {
                    succ.push(id);
                }
            }
            op::JZ | op::JNZ => {
                if let Some(id) = next_block {
                    succ.push(id);
                }
                let t = insn.jump_target().unwrap() as u32;
                if let Some(&id) = block_of.get(&t) {
                    if !succ.contains(&id) {
                        succ.push(id);
                    }
                }
            }
            op::RETN => {}
            _ => {
                if let Some(id) = next_block {
                    succ.push(id);
                }
            }
        }
        blocks[b].succ = succ;
    }

    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
    for b in &blocks {
        for &s in &b.succ {
            preds[s].push(b.id);
        }
    }
    for (id, p) in preds.into_iter().enumerate() {
        blocks[id].pred = p;
    }

    blocks
}
