//! Per-subroutine symbolic interpretation.
//!
//! Walks each basic block with an abstract stack of typed expressions,
//! materializing statements at observable effects (declarations,
//! assignments, discarded call results, returns) and a terminator per
//! block. Signatures are already frozen by the prototype engine, so every
//! JSR resolves without further inference.

use std::collections::BTreeMap;

use crate::actions::ActionTable;
use crate::error::DecompileError;
use crate::ncs::{op, pair_types, scalar_type, ty, Operand};
use crate::types::Type;

use super::ast::{BinOp, Expr, Stmt, UnOp};
use super::emit::{param_name, sub_name, var_name};
use super::link::{basic_blocks, Program};
use super::proto::Prototypes;
use super::stack::{StackEntry, SymStack, WriteTarget};

#[derive(Debug, Clone)]
pub enum Term {
    Jmp(usize),
    Br {
        cond: Expr,
        on_true: usize,
        on_false: usize,
    },
    Ret(Option<Expr>),
    Fallthrough(usize),
    Exit,
    /// Control leaves the subroutine; handled as an unstructured fallback.
    JmpOut(u32),
}

#[derive(Debug, Clone)]
pub struct SimBlock {
    pub id: usize,
    pub start: u32,
    pub stmts: Vec<Stmt>,
    pub term: Term,
    pub succ: Vec<usize>,
    pub pred: Vec<usize>,
}

pub fn simulate(
    program: &Program,
    entry: u32,
    protos: &Prototypes,
    actions: &ActionTable,
) -> Result<Vec<SimBlock>, DecompileError> {
    let blocks = basic_blocks(program, entry);
    if blocks.is_empty() {
        return Ok(Vec::new());
    }

    let block_of: BTreeMap<u32, usize> = blocks.iter().map(|b| (b.start, b.id)).collect();
    let sim = Sim {
        program,
        protos,
        actions,
        sig_entry: entry,
        block_of,
    };

    let mut out: Vec<SimBlock> = blocks
        .iter()
        .map(|b| SimBlock {
            id: b.id,
            start: b.start,
            stmts: Vec::new(),
            term: Term::Exit,
            succ: b.succ.clone(),
            pred: b.pred.clone(),
        })
        .collect();

    let mut entry_stacks: Vec<Option<SymStack>> = vec![None; blocks.len()];
    entry_stacks[0] = Some(SymStack::new());
    let mut work = std::collections::VecDeque::new();
    work.push_back(0usize);
    let mut visited = vec![false; blocks.len()];

    while let Some(b) = work.pop_front() {
        if visited[b] {
            continue;
        }
        let Some(mut stack) = entry_stacks[b].clone() else {
            continue;
        };
        visited[b] = true;

        let mut stmts = Vec::new();
        let mut term = None;
        let instrs = &blocks[b].instrs;
        for (k, &i) in instrs.iter().enumerate() {
            let last = k + 1 == instrs.len();
            if last {
                term = sim.step_terminator(i, b, &blocks[b].succ, &mut stack, &mut stmts)?;
            }
            if term.is_none() {
                sim.step(i, &mut stack, &mut stmts)?;
            }
        }
        let term = term.unwrap_or_else(|| match blocks[b].succ.first() {
            Some(&n) => Term::Fallthrough(n),
            None => Term::Exit,
        });

        merge_decl_init(&mut stmts);
        out[b].stmts = stmts;
        out[b].term = term;

        for &s in &blocks[b].succ {
            match &entry_stacks[s] {
                None => entry_stacks[s] = Some(stack.clone()),
                Some(existing) => {
                    if existing.depth_slots() != stack.depth_slots() {
                        return Err(DecompileError::StackDepthMismatch {
                            offset: blocks[s].start,
                        });
                    }
                }
            }
            if !visited[s] {
                work.push_back(s);
            }
        }
    }

    Ok(out)
}

struct Sim<'a> {
    program: &'a Program,
    protos: &'a Prototypes,
    actions: &'a ActionTable,
    sig_entry: u32,
    block_of: BTreeMap<u32, usize>,
}

impl<'a> Sim<'a> {
    /// Handles the instructions that end a block. Returns `None` when the
    /// instruction is an ordinary effect and the caller should fall back to
    /// `step`.
    fn step_terminator(
        &self,
        index: usize,
        _block: usize,
        succ: &[usize],
        stack: &mut SymStack,
        _stmts: &mut Vec<Stmt>,
    ) -> Result<Option<Term>, DecompileError> {
        let insn = &self.program.instructions[index];
        let at = insn.offset;
        match insn.opcode {
            op::JMP => {
                let target = insn.jump_target().unwrap() as u32;
                match self.block_of.get(&target) {
                    Some(&id) => Ok(Some(Term::Jmp(id))),
                    None => Ok(Some(Term::JmpOut(target))),
                }
            }
            op::JZ | op::JNZ => {
                let cond = stack.pop_value(&Type::Int, at)?;
                let target = insn.jump_target().unwrap() as u32;
                let Some(&target_id) = self.block_of.get(&target) else {
                    return Ok(Some(Term::JmpOut(target)));
                };
                // The fallthrough block is the first successor by
                // construction.
                let next_id = succ
                    .first()
                    .copied()
                    .ok_or(DecompileError::UnresolvedJump {
                        offset: at,
                        target: target as i64,
                    })?;
                let (on_true, on_false) = if insn.opcode == op::JZ {
                    (next_id, target_id)
                } else {
                    (target_id, next_id)
                };
                Ok(Some(Term::Br {
                    cond,
                    on_true,
                    on_false,
                }))
            }
            op::RETN => {
                let sig = self.protos.get(self.sig_entry);
                let value = if sig.returns_value() && !stack.entries.is_empty() {
                    Some(stack.pop_entry(at)?.expr())
                } else {
                    None
                };
                Ok(Some(Term::Ret(value)))
            }
            _ => Ok(None),
        }
    }

    fn step(
        &self,
        index: usize,
        stack: &mut SymStack,
        stmts: &mut Vec<Stmt>,
    ) -> Result<(), DecompileError> {
        let insn = &self.program.instructions[index];
        let at = insn.offset;
        match insn.opcode {
            op::CONST => {
                let (ty, expr) = match (&insn.operand, insn.type_byte) {
                    (Operand::Int(v), ty::INT) => (Type::Int, Expr::IntLit(*v)),
                    (Operand::Float(v), ty::FLOAT) => (Type::Float, Expr::FloatLit(*v)),
                    (Operand::String(s), ty::STRING) => {
                        (Type::String, Expr::StrLit(s.clone()))
                    }
                    (Operand::Int(v), ty::OBJECT) => (Type::Object, Expr::ObjectLit(*v)),
                    _ => {
                        return Err(DecompileError::UnsupportedType {
                            opcode: insn.opcode,
                            type_byte: insn.type_byte,
                            offset: at,
                        })
                    }
                };
                stack.push(StackEntry::Constant { ty, expr });
            }
            op::RSADD => {
                let ty = scalar_type(insn.type_byte).unwrap_or(Type::Any);
                let name = var_name(at);
                stmts.push(Stmt::VarDecl {
                    ty: ty.clone(),
                    name: name.clone(),
                    init: None,
                });
                stack.push(StackEntry::Variable { ty, id: at, name });
            }
            op::CPTOPSP => {
                if let Operand::Stack { offset, size } = insn.operand {
                    let copies = stack.read_range(offset, size, at)?;
                    for c in copies {
                        stack.push(c);
                    }
                }
            }
            op::CPDOWNSP => {
                if let Operand::Stack { offset, size } = insn.operand {
                    self.copy_down(stack, stmts, offset, size, at)?;
                }
            }
            op::CPTOPBP => {
                if let Operand::Stack { offset, size } = insn.operand {
                    let sig = self.protos.get(self.sig_entry);
                    for k in 0..(size as usize / 4) {
                        let addr = offset + 4 * k as i32;
                        if addr >= 0 {
                            return Err(DecompileError::StackUnderflow { offset: at });
                        }
                        let idx = (-addr / 4 - 1) as usize;
                        let ty = sig.params.get(idx).cloned().unwrap_or(Type::Any);
                        stack.push(StackEntry::Expression {
                            ty,
                            expr: Expr::Ident(param_name(idx)),
                            at,
                        });
                    }
                }
            }
            op::CPDOWNBP => {
                if let Operand::Stack { offset, size } = insn.operand {
                    let values = stack.read_range(-(size as i32), size, at)?;
                    for (j, v) in values.iter().enumerate() {
                        let addr = offset + 4 * j as i32;
                        if addr >= 0 {
                            return Err(DecompileError::StackUnderflow { offset: at });
                        }
                        let idx = (-addr / 4 - 1) as usize;
                        stmts.push(Stmt::Expr(Expr::Assign(
                            Box::new(Expr::Ident(param_name(idx))),
                            Box::new(v.expr()),
                        )));
                    }
                }
            }
            op::EQUAL | op::NEQUAL if insn.type_byte == ty::STRUCTSTRUCT => {
                if let Operand::Size(n) = insn.operand {
                    let slots = n as usize / 4;
                    let rhs = group_expr(stack.pop_slots(slots, at)?, at)?;
                    let lhs = group_expr(stack.pop_slots(slots, at)?, at)?;
                    let bin = if insn.opcode == op::EQUAL {
                        BinOp::Eq
                    } else {
                        BinOp::Ne
                    };
                    stack.push(StackEntry::Expression {
                        ty: Type::Int,
                        expr: Expr::Binary(bin, Box::new(lhs), Box::new(rhs)),
                        at,
                    });
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
                let (lt, rt) =
                    pair_types(insn.type_byte).ok_or(DecompileError::UnsupportedType {
                        opcode: insn.opcode,
                        type_byte: insn.type_byte,
                        offset: at,
                    })?;
                let rhs = stack.pop_value(&rt, at)?;
                let lhs = stack.pop_value(&lt, at)?;
                let result = binary_result(insn.opcode, &lt, &rt);
                let bin = binop_for(insn.opcode);
                stack.push(StackEntry::Expression {
                    ty: result,
                    expr: Expr::Binary(bin, Box::new(lhs), Box::new(rhs)),
                    at,
                });
            }
            op::NEG => {
                let t = scalar_type(insn.type_byte).unwrap_or(Type::Any);
                let v = stack.pop_value(&t, at)?;
                stack.push(StackEntry::Expression {
                    ty: t,
                    expr: Expr::Unary(UnOp::Neg, Box::new(v)),
                    at,
                });
            }
            op::COMP | op::NOT => {
                let v = stack.pop_value(&Type::Int, at)?;
                let unop = if insn.opcode == op::COMP {
                    UnOp::Comp
                } else {
                    UnOp::Not
                };
                stack.push(StackEntry::Expression {
                    ty: Type::Int,
                    expr: Expr::Unary(unop, Box::new(v)),
                    at,
                });
            }
            op::MOVSP => {
                if let Operand::Int(n) = insn.operand {
                    if n >= 0 {
                        return Err(DecompileError::StackUnderflow { offset: at });
                    }
                    let popped = stack.pop_slots((-n / 4) as usize, at)?;
                    // Popped list is top-first; emit discarded effects in
                    // program (push) order.
                    for e in popped.iter().rev() {
                        if let StackEntry::Expression { expr, .. } = e {
                            if expr.has_side_effects() {
                                stmts.push(Stmt::Expr(expr.clone()));
                            }
                        }
                    }
                }
            }
            op::JSR => {
                let callee = insn.jump_target().unwrap() as u32;
                let sig = self.protos.get(callee);
                let mut args = Vec::with_capacity(sig.params.len());
                for pt in &sig.params {
                    args.push(stack.pop_value(pt, at)?);
                }
                let call = Expr::UserCall {
                    name: sub_name(self.program, self.protos, callee),
                    entry: callee,
                    args,
                };
                if sig.returns_value() {
                    stack.push(StackEntry::Expression {
                        ty: sig.return_type.clone(),
                        expr: call,
                        at,
                    });
                } else {
                    stmts.push(Stmt::Expr(call));
                }
            }
            op::ACTION => {
                if let Operand::Action { index, argc } = insn.operand {
                    let action = self.actions.get(index)?;
                    let mut args = Vec::with_capacity(argc as usize);
                    for pt in action.param_types.iter().take(argc as usize) {
                        if *pt == Type::Action {
                            let e = stack.pop_entry(at)?;
                            if e.ty() != Type::Action {
                                return Err(DecompileError::TypeConflict {
                                    offset: at,
                                    expected: Type::Action,
                                    found: e.ty(),
                                });
                            }
                            args.push(e.expr());
                        } else {
                            args.push(stack.pop_value(pt, at)?);
                        }
                    }
                    let call = Expr::ActionCall {
                        name: action.name.clone(),
                        id: index,
                        args,
                    };
                    if action.return_type == Type::Void {
                        stmts.push(Stmt::Expr(call));
                    } else {
                        stack.push(StackEntry::Expression {
                            ty: action.return_type.clone(),
                            expr: call,
                            at,
                        });
                    }
                }
            }
            op::STORESTATE => {
                let body = self
                    .program
                    .state_entry_of
                    .get(&at)
                    .copied()
                    .expect("state bodies resolved by the linker");
                stack.push(StackEntry::Expression {
                    ty: Type::Action,
                    expr: Expr::UserCall {
                        name: sub_name(self.program, self.protos, body),
                        entry: body,
                        args: Vec::new(),
                    },
                    at,
                });
            }
            op::INCISP | op::DECISP => {
                if let Operand::Int(offset) = insn.operand {
                    let unop = if insn.opcode == op::INCISP {
                        UnOp::PostInc
                    } else {
                        UnOp::PostDec
                    };
                    match stack.locate_write(offset, 4, at)? {
                        WriteTarget::Whole(idx) => match &stack.entries[idx] {
                            StackEntry::Variable { name, .. } => {
                                stmts.push(Stmt::Expr(Expr::Unary(
                                    unop,
                                    Box::new(Expr::Ident(name.clone())),
                                )));
                            }
                            other => {
                                return Err(DecompileError::TypeConflict {
                                    offset: at,
                                    expected: Type::Int,
                                    found: other.ty(),
                                })
                            }
                        },
                        WriteTarget::VectorSlot(..) => {
                            return Err(DecompileError::TypeConflict {
                                offset: at,
                                expected: Type::Int,
                                found: Type::Vector,
                            })
                        }
                    }
                }
            }
            op::INCIBP | op::DECIBP => {
                if let Operand::Int(offset) = insn.operand {
                    if offset >= 0 {
                        return Err(DecompileError::StackUnderflow { offset: at });
                    }
                    let idx = (-offset / 4 - 1) as usize;
                    let unop = if insn.opcode == op::INCIBP {
                        UnOp::PostInc
                    } else {
                        UnOp::PostDec
                    };
                    stmts.push(Stmt::Expr(Expr::Unary(
                        unop,
                        Box::new(Expr::Ident(param_name(idx))),
                    )));
                }
            }
            op::DESTRUCT => {
                if let Operand::Destruct {
                    size,
                    keep_offset,
                    keep_size,
                } = insn.operand
                {
                    self.destruct(stack, stmts, size, keep_offset, keep_size, at)?;
                }
            }
            op::SAVEBP | op::RESTOREBP | op::NOP => {}
            op::JMP | op::JZ | op::JNZ | op::RETN => {
                // Handled by step_terminator; mid-block occurrences cannot
                // happen because they always end a block.
                unreachable!("control transfer inside a basic block");
            }
            _ => {
                return Err(DecompileError::UnknownOpcode {
                    opcode: insn.opcode,
                    offset: at,
                })
            }
        }
        Ok(())
    }

    fn copy_down(
        &self,
        stack: &mut SymStack,
        stmts: &mut Vec<Stmt>,
        offset: i32,
        size: u16,
        at: u32,
    ) -> Result<(), DecompileError> {
        let sources = stack.read_range(-(size as i32), size, at)?;
        let target = stack.locate_write(offset, size, at)?;
        let value = group_expr_refs(&sources, at)?;
        match target {
            WriteTarget::Whole(idx) => {
                let var = match &stack.entries[idx] {
                    StackEntry::Variable { name, .. } => Some(name.clone()),
                    _ => None,
                };
                match var {
                    Some(name) => {
                        stmts.push(Stmt::Expr(Expr::Assign(
                            Box::new(Expr::Ident(name)),
                            Box::new(value),
                        )));
                    }
                    None => {
                        let ty = if sources.len() == 1 {
                            sources[0].ty()
                        } else {
                            Type::Vector
                        };
                        stack.entries[idx] = StackEntry::Expression {
                            ty,
                            expr: value,
                            at,
                        };
                    }
                }
            }
            WriteTarget::VectorSlot(idx, comp) => match &stack.entries[idx] {
                StackEntry::Variable { name, .. } => {
                    stmts.push(Stmt::Expr(Expr::Assign(
                        Box::new(Expr::Field(
                            Box::new(Expr::Ident(name.clone())),
                            super::stack::VECTOR_FIELDS[comp].to_string(),
                        )),
                        Box::new(value),
                    )));
                }
                other => {
                    return Err(DecompileError::TypeConflict {
                        offset: at,
                        expected: Type::Vector,
                        found: other.ty(),
                    })
                }
            },
        }
        Ok(())
    }

    fn destruct(
        &self,
        stack: &mut SymStack,
        stmts: &mut Vec<Stmt>,
        size: u16,
        keep_offset: i16,
        keep_size: u16,
        at: u32,
    ) -> Result<(), DecompileError> {
        let slots = size as usize / 4;
        let keep_from = (keep_offset.max(0) as usize) / 4;
        let keep_to = keep_from + keep_size as usize / 4;

        let popped = stack.pop_slots(slots, at)?;
        let region: Vec<StackEntry> = popped.into_iter().rev().collect();

        let mut kept: Vec<StackEntry> = Vec::new();
        let mut dropped_effects: Vec<Expr> = Vec::new();
        let mut pos = 0usize;
        for e in region {
            let w = e.slots();
            let e_start = pos;
            let e_end = pos + w;
            pos = e_end;
            if e_start >= keep_from && e_end <= keep_to {
                kept.push(e);
            } else if e_end <= keep_from || e_start >= keep_to {
                if let StackEntry::Expression { expr, .. } = &e {
                    if expr.has_side_effects() {
                        dropped_effects.push(expr.clone());
                    }
                }
            } else if e.ty() == Type::Vector {
                let from = keep_from.max(e_start) - e_start;
                let to = keep_to.min(e_end) - e_start;
                for comp in from..to {
                    kept.push(StackEntry::Expression {
                        ty: Type::Float,
                        expr: Expr::Field(
                            Box::new(e.expr()),
                            super::stack::VECTOR_FIELDS[comp].to_string(),
                        ),
                        at,
                    });
                }
            } else {
                return Err(DecompileError::TypeConflict {
                    offset: at,
                    expected: Type::Vector,
                    found: e.ty(),
                });
            }
        }

        for expr in dropped_effects {
            stmts.push(Stmt::Expr(expr));
        }
        for e in kept {
            stack.push(e);
        }
        Ok(())
    }
}

fn binop_for(opcode: u8) -> BinOp {
    match opcode {
        op::LOGAND => BinOp::LogAnd,
        op::LOGOR => BinOp::LogOr,
        op::INCOR => BinOp::BitOr,
        op::EXCOR => BinOp::BitXor,
        op::BOOLAND => BinOp::BitAnd,
        op::EQUAL => BinOp::Eq,
        op::NEQUAL => BinOp::Ne,
        op::GEQ => BinOp::Ge,
        op::GT => BinOp::Gt,
        op::LT => BinOp::Lt,
        op::LEQ => BinOp::Le,
        op::SHLEFT => BinOp::Shl,
        op::SHRIGHT => BinOp::Shr,
        op::USHRIGHT => BinOp::UShr,
        op::ADD => BinOp::Add,
        op::SUB => BinOp::Sub,
        op::MUL => BinOp::Mul,
        op::DIV => BinOp::Div,
        op::MOD => BinOp::Mod,
        _ => unreachable!("not a two-operand opcode"),
    }
}

fn binary_result(opcode: u8, lt: &Type, rt: &Type) -> Type {
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

/// Builds the single expression a multi-slot group reads as.
fn group_expr(popped: Vec<StackEntry>, at: u32) -> Result<Expr, DecompileError> {
    let entries: Vec<StackEntry> = popped.into_iter().rev().collect();
    group_expr_refs(&entries, at)
}

fn group_expr_refs(entries: &[StackEntry], at: u32) -> Result<Expr, DecompileError> {
    match entries.len() {
        1 => Ok(entries[0].expr()),
        3 if entries.iter().all(|e| e.ty() == Type::Float) => Ok(Expr::VectorCtor(
            entries.iter().map(StackEntry::expr).collect(),
        )),
        _ => Err(DecompileError::TypeConflict {
            offset: at,
            expected: Type::Vector,
            found: Type::Struct(entries.iter().map(StackEntry::ty).collect()),
        }),
    }
}

/// Folds `int v; v = e;` into `int v = e;` when the assignment directly
/// follows the declaration.
fn merge_decl_init(stmts: &mut Vec<Stmt>) {
    let mut i = 0;
    while i + 1 < stmts.len() {
        let mergeable = match (&stmts[i], &stmts[i + 1]) {
            (
                Stmt::VarDecl {
                    name, init: None, ..
                },
                Stmt::Expr(Expr::Assign(lhs, _)),
            ) => matches!(lhs.as_ref(), Expr::Ident(n) if n == name),
            _ => false,
        };
        if mergeable {
            if let Stmt::Expr(Expr::Assign(_, rhs)) = stmts.remove(i + 1) {
                if let Stmt::VarDecl { init, .. } = &mut stmts[i] {
                    *init = Some(*rhs);
                }
            }
        } else {
            i += 1;
        }
    }
}
