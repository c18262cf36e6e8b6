//! Prototype engine: fixed-point inference of subroutine signatures.
//!
//! Components of the call graph are processed leaves-first, so a callee's
//! signature is frozen by the time its callers are inferred. Within a
//! component, members iterate with tentative signatures until a full pass
//! changes nothing (or the iteration cap is reached); leftover unknowns
//! freeze to `Any`. Deferring all inference to this globally ordered pass is
//! what lets the simulator assume every JSR target is prototyped.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use crate::actions::ActionTable;
use crate::error::{DecompileError, Diagnostic, DiagnosticCode};
use crate::ncs::{op, pair_types, scalar_type, ty, Operand};
use crate::types::Type;

use super::callgraph::CallGraph;
use super::link::{basic_blocks, Program};
use super::scc;
use super::{CancelToken, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoStatus {
    Unknown,
    Inferring,
    Prototyped,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Type>,
    pub return_type: Type,
    pub status: ProtoStatus,
}

impl Signature {
    fn empty() -> Self {
        Signature {
            params: Vec::new(),
            return_type: Type::Any,
            status: ProtoStatus::Unknown,
        }
    }

    pub fn returns_value(&self) -> bool {
        self.return_type != Type::Void
    }
}

#[derive(Debug)]
pub struct Prototypes {
    sigs: BTreeMap<u32, Signature>,
}

impl Prototypes {
    pub fn get(&self, entry: u32) -> &Signature {
        // The linker discovers every JSR target, so a missing signature
        // here is an implementation bug, not bad input.
        self.sigs
            .get(&entry)
            .expect("subroutine prototyped before use")
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Signature)> {
        self.sigs.iter().map(|(&k, v)| (k, v))
    }
}

pub fn infer(
    program: &Program,
    graph: &CallGraph,
    actions: &ActionTable,
    cfg: &Config,
    cancel: Option<&CancelToken>,
    diags: &mut Vec<Diagnostic>,
) -> Result<Prototypes, DecompileError> {
    let mut sigs: BTreeMap<u32, Signature> = program
        .subroutines
        .iter()
        .map(|s| (s.entry, Signature::empty()))
        .collect();

    for component in scc::condense(graph) {
        if let Some(c) = cancel {
            if c.is_cancelled() {
                return Err(DecompileError::Cancelled);
            }
        }
        for &m in &component {
            if let Some(sig) = sigs.get_mut(&m) {
                sig.status = ProtoStatus::Inferring;
            }
        }

        for pass in 0..cfg.max_iterations.max(1) {
            let mut changed = false;
            for &m in &component {
                let obs = observe(program, m, &sigs, actions)?;
                let sig = sigs.get_mut(&m).expect("component member is a subroutine");
                if obs.params.len() > sig.params.len() {
                    sig.params.resize(obs.params.len(), Type::Any);
                    changed = true;
                }
                for (i, t) in obs.params.iter().enumerate() {
                    let joined = sig.params[i].join(t);
                    if joined != sig.params[i] {
                        sig.params[i] = joined;
                        changed = true;
                    }
                }
                let joined = sig.return_type.join(&obs.ret);
                if joined != sig.return_type {
                    sig.return_type = joined;
                    changed = true;
                }
            }
            if !changed {
                debug!(
                    "component {:x?} converged after {} pass(es)",
                    component,
                    pass + 1
                );
                break;
            }
        }

        for &m in &component {
            if let Some(sig) = sigs.get_mut(&m) {
                sig.status = ProtoStatus::Prototyped;
            }
        }
    }

    // Surface remaining Any slots: diagnostics by default, fatal in strict
    // mode. Only reachable subroutines count.
    let reachable = graph.reachable_from(program.entry);
    for (&entry, sig) in &sigs {
        if !reachable.contains(&entry) {
            continue;
        }
        for (i, t) in sig.params.iter().enumerate() {
            if *t == Type::Any {
                if cfg.strict_signatures {
                    return Err(DecompileError::UnresolvedSignature {
                        sub: entry,
                        slot: format!("parameter {}", i),
                    });
                }
                diags.push(Diagnostic::warning(
                    DiagnosticCode::AnyParameter,
                    format!("parameter {} of subroutine {:#x} stayed `any`", i, entry),
                ));
            }
        }
        if sig.return_type == Type::Any {
            if cfg.strict_signatures {
                return Err(DecompileError::UnresolvedSignature {
                    sub: entry,
                    slot: "return".to_string(),
                });
            }
            diags.push(Diagnostic::warning(
                DiagnosticCode::AnyReturn,
                format!("return type of subroutine {:#x} stayed `any`", entry),
            ));
        }
    }

    Ok(Prototypes { sigs })
}

/// One slot-typed value on the abstract stack. Multi-slot values (vectors,
/// structs) stay as one entry; `param` marks values read straight out of
/// the parameter area.
#[derive(Debug, Clone)]
struct TEntry {
    ty: Type,
    param: Option<usize>,
}

impl TEntry {
    fn plain(ty: Type) -> Self {
        TEntry { ty, param: None }
    }

    fn slots(&self) -> usize {
        self.ty.slots().max(1)
    }
}

struct Obs {
    params: Vec<Type>,
    ret: Type,
}

/// Lightweight abstract interpretation of one subroutine under the current
/// tentative signatures. Deliberately lenient: while arities are still
/// converging the stack can be off, and a short pop must not abort the
/// fixed point.
fn observe(
    program: &Program,
    entry: u32,
    sigs: &BTreeMap<u32, Signature>,
    actions: &ActionTable,
) -> Result<Obs, DecompileError> {
    let blocks = basic_blocks(program, entry);
    let mut obs = Obs {
        params: Vec::new(),
        ret: Type::Any,
    };
    if blocks.is_empty() {
        obs.ret = Type::Void;
        return Ok(obs);
    }

    let mut entry_stacks: Vec<Option<Vec<TEntry>>> = vec![None; blocks.len()];
    entry_stacks[0] = Some(Vec::new());
    let mut visited = vec![false; blocks.len()];
    let mut work: VecDeque<usize> = VecDeque::new();
    work.push_back(0);

    while let Some(b) = work.pop_front() {
        if visited[b] {
            continue;
        }
        visited[b] = true;
        let mut stack = entry_stacks[b].clone().unwrap_or_default();
        for &i in &blocks[b].instrs {
            step_types(program, entry, i, &mut stack, &mut obs, sigs, actions)?;
        }
        for &s in &blocks[b].succ {
            if entry_stacks[s].is_none() {
                entry_stacks[s] = Some(stack.clone());
            }
            if !visited[s] {
                work.push_back(s);
            }
        }
    }

    Ok(obs)
}

fn step_types(
    program: &Program,
    entry: u32,
    index: usize,
    stack: &mut Vec<TEntry>,
    obs: &mut Obs,
    sigs: &BTreeMap<u32, Signature>,
    actions: &ActionTable,
) -> Result<(), DecompileError> {
    let insn = &program.instructions[index];
    match insn.opcode {
        op::CONST | op::RSADD => {
            if let Some(t) = scalar_type(insn.type_byte) {
                stack.push(TEntry::plain(t));
            }
        }
        op::CPTOPSP => {
            if let Operand::Stack { offset, size } = insn.operand {
                let copies = read_range(stack, offset, size);
                stack.extend(copies);
            }
        }
        op::CPDOWNSP => {
            // Copies down without popping; types of the targets are not
            // informative for signatures.
        }
        op::CPTOPBP => {
            if let Operand::Stack { offset, size } = insn.operand {
                let own = sigs.get(&entry);
                for k in 0..(size as usize / 4) {
                    let addr = offset + 4 * k as i32;
                    if addr >= 0 {
                        continue;
                    }
                    let idx = (-addr / 4 - 1) as usize;
                    if obs.params.len() <= idx {
                        obs.params.resize(idx + 1, Type::Any);
                    }
                    let tentative = own
                        .and_then(|s| s.params.get(idx))
                        .cloned()
                        .unwrap_or(Type::Any);
                    stack.push(TEntry {
                        ty: tentative,
                        param: Some(idx),
                    });
                }
            }
        }
        op::CPDOWNBP => {
            if let Operand::Stack { offset, size } = insn.operand {
                let slots = size as usize / 4;
                let top = peek_slot_types(stack, slots);
                for (j, slot_ty) in top.into_iter().enumerate() {
                    let addr = offset + 4 * j as i32;
                    if addr >= 0 {
                        continue;
                    }
                    let idx = (-addr / 4 - 1) as usize;
                    if obs.params.len() <= idx {
                        obs.params.resize(idx + 1, Type::Any);
                    }
                    obs.params[idx] = obs.params[idx].join(&slot_ty);
                }
            }
        }
        op::MOVSP => {
            if let Operand::Int(n) = insn.operand {
                if n < 0 {
                    pop_slots(stack, (-n / 4) as usize);
                }
            }
        }
        op::EQUAL | op::NEQUAL if insn.type_byte == ty::STRUCTSTRUCT => {
            if let Operand::Size(n) = insn.operand {
                let slots = n as usize / 4;
                pop_slots(stack, slots);
                pop_slots(stack, slots);
                stack.push(TEntry::plain(Type::Int));
            }
        }
        op::LOGAND
        | op::LOGOR
        | op::INCOR
        | op::EXCOR
        | op::BOOLAND
        | op::EQUAL
        | op::NEQUAL
        | op::GEQ
        | op::GT
        | op::LT
        | op::LEQ
        | op::SHLEFT
        | op::SHRIGHT
        | op::USHRIGHT
        | op::ADD
        | op::SUB
        | op::MUL
        | op::DIV
        | op::MOD => {
            if let Some((lt, rt)) = pair_types(insn.type_byte) {
                let rhs = pop_slots(stack, rt.slots());
                note_popped(obs, &rhs, &rt);
                let lhs = pop_slots(stack, lt.slots());
                note_popped(obs, &lhs, &lt);
                stack.push(TEntry::plain(result_type(insn.opcode, &lt, &rt)));
            }
        }
        op::NEG => {
            let t = scalar_type(insn.type_byte).unwrap_or(Type::Any);
            let popped = pop_slots(stack, 1);
            note_popped(obs, &popped, &t);
            stack.push(TEntry::plain(t));
        }
        op::COMP | op::NOT => {
            let popped = pop_slots(stack, 1);
            note_popped(obs, &popped, &Type::Int);
            stack.push(TEntry::plain(Type::Int));
        }
        op::JSR => {
            let callee = insn.jump_target().unwrap() as u32;
            let sig = sigs.get(&callee).cloned().unwrap_or_else(Signature::empty);
            for pt in &sig.params {
                let popped = pop_slots(stack, pt.slots().max(1));
                note_popped(obs, &popped, pt);
            }
            if sig.return_type.slots() > 0 {
                stack.push(TEntry::plain(sig.return_type));
            }
        }
        op::ACTION => {
            if let Operand::Action { index, argc } = insn.operand {
                let action = actions.get(index)?;
                for pt in action.param_types.iter().take(argc as usize) {
                    let popped = pop_slots(stack, pt.slots().max(1));
                    note_popped(obs, &popped, pt);
                }
                if action.return_type.slots() > 0 {
                    stack.push(TEntry::plain(action.return_type.clone()));
                }
            }
        }
        op::STORESTATE => {
            stack.push(TEntry::plain(Type::Action));
        }
        op::JZ | op::JNZ => {
            let popped = pop_slots(stack, 1);
            note_popped(obs, &popped, &Type::Int);
        }
        op::INCISP | op::DECISP => {}
        op::INCIBP | op::DECIBP => {
            if let Operand::Int(offset) = insn.operand {
                if offset < 0 {
                    let idx = (-offset / 4 - 1) as usize;
                    if obs.params.len() <= idx {
                        obs.params.resize(idx + 1, Type::Any);
                    }
                    obs.params[idx] = obs.params[idx].join(&Type::Int);
                }
            }
        }
        op::DESTRUCT => {
            if let Operand::Destruct {
                size,
                keep_offset,
                keep_size,
            } = insn.operand
            {
                let slots = size as usize / 4;
                let region = pop_slots(stack, slots);
                // Region in bottom-to-top slot order, then splice the kept
                // sub-range back in.
                let mut flat: Vec<TEntry> = Vec::new();
                for e in region.iter().rev() {
                    flat.extend(explode(e));
                }
                let keep_from = (keep_offset.max(0) as usize) / 4;
                let keep_to = keep_from + keep_size as usize / 4;
                for slot in flat.into_iter().skip(keep_from).take(keep_to - keep_from) {
                    stack.push(slot);
                }
            }
        }
        op::RETN => {
            let t = match stack.last() {
                Some(e) => e.ty.clone(),
                None => Type::Void,
            };
            obs.ret = obs.ret.join(&t);
        }
        op::JMP | op::SAVEBP | op::RESTOREBP | op::NOP => {}
        _ => {}
    }
    Ok(())
}

fn result_type(opcode: u8, lt: &Type, rt: &Type) -> Type {
    match opcode {
        op::ADD | op::SUB | op::MUL | op::DIV | op::MOD => match (lt, rt) {
            (Type::Int, Type::Int) => Type::Int,
            (Type::String, Type::String) => Type::String,
            (Type::Vector, _) | (_, Type::Vector) => Type::Vector,
            _ => Type::Float,
        },
        _ => Type::Int,
    }
}

/// Pops up to `slots` stack slots, whole entries at a time, returning them
/// top-first. Short pops are tolerated while arities converge.
fn pop_slots(stack: &mut Vec<TEntry>, slots: usize) -> Vec<TEntry> {
    let mut out = Vec::new();
    let mut taken = 0;
    while taken < slots {
        let Some(e) = stack.pop() else { break };
        taken += e.slots();
        out.push(e);
    }
    out
}

/// Copies the byte range `[SP+offset, SP+offset+size)` without popping,
/// returning the copies in push order.
fn read_range(stack: &[TEntry], offset: i32, size: u16) -> Vec<TEntry> {
    if offset >= 0 {
        return Vec::new();
    }
    let want = size as usize / 4;
    let depth = (-offset / 4) as usize;
    let total: usize = stack.iter().map(TEntry::slots).sum();
    if depth > total {
        return vec![TEntry::plain(Type::Any); want];
    }
    let start = total - depth;
    let mut flat: Vec<TEntry> = Vec::new();
    for e in stack {
        flat.extend(explode(e));
    }
    flat.into_iter().skip(start).take(want).collect()
}

/// Per-slot types of the top `slots` slots, bottom-to-top.
fn peek_slot_types(stack: &[TEntry], slots: usize) -> Vec<Type> {
    let mut flat: Vec<Type> = Vec::new();
    for e in stack {
        flat.extend(explode(e).into_iter().map(|s| s.ty));
    }
    let skip = flat.len().saturating_sub(slots);
    flat.into_iter().skip(skip).collect()
}

/// Flattens an entry into width-1 slots; vector components type as float.
fn explode(e: &TEntry) -> Vec<TEntry> {
    match &e.ty {
        Type::Vector => vec![TEntry::plain(Type::Float); 3],
        Type::Struct(fields) => fields
            .iter()
            .flat_map(|f| explode(&TEntry::plain(f.clone())))
            .collect(),
        _ => vec![e.clone()],
    }
}

/// Joins the expected consumption type into any parameter slots that were
/// popped. This is where parameter types actually come from: a parameter is
/// typed by the operations that consume it.
fn note_popped(obs: &mut Obs, popped: &[TEntry], expected: &Type) {
    let slot_expected = match expected {
        Type::Vector => Type::Float,
        Type::Struct(_) | Type::Any => return,
        t => t.clone(),
    };
    for e in popped {
        for slot in explode(e) {
            if let Some(i) = slot.param {
                if obs.params.len() <= i {
                    obs.params.resize(i + 1, Type::Any);
                }
                obs.params[i] = obs.params[i].join(&slot_expected);
            }
        }
    }
}
