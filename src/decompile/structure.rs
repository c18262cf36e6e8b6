//! Control-flow structuring: lifts the per-subroutine block graph produced
//! by the simulator into nested statements. Loops come from back edges over
//! the dominator tree, conditionals from immediate-postdominator joins,
//! switches from equality-comparison chains over a single discriminant.
//! A jump no construct explains degrades to a commented artifact plus a
//! diagnostic instead of miscompiling.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Diagnostic, DiagnosticCode};

use super::ast::{BinOp, Expr, Stmt, SwitchCase};
use super::emit::label_name;
use super::sim::{SimBlock, Term};

pub fn structure(blocks: &[SimBlock], diags: &mut Vec<Diagnostic>) -> Vec<Stmt> {
    if blocks.is_empty() {
        return Vec::new();
    }
    let mut s = Structurer::new(blocks, diags);
    let mut out = Vec::new();
    s.build_seq(0, None, Ctx::default(), &mut out);
    rewrite_for(&mut out);
    out
}

#[derive(Debug, Clone, Copy, Default)]
struct Ctx {
    continue_to: Option<usize>,
    break_to: Option<usize>,
}

struct Structurer<'a> {
    blocks: &'a [SimBlock],
    ipdom: Vec<Option<usize>>,
    loops: BTreeMap<usize, BTreeSet<usize>>,
    emitted: BTreeSet<usize>,
    /// Loop headers currently being expanded; suppresses re-dispatch while
    /// the header's own statements are laid down inside the loop body.
    building: BTreeSet<usize>,
    diags: &'a mut Vec<Diagnostic>,
}

impl<'a> Structurer<'a> {
    fn new(blocks: &'a [SimBlock], diags: &'a mut Vec<Diagnostic>) -> Self {
        let reachable = compute_reachable(blocks, 0);
        let dom = compute_dominators(blocks, 0, &reachable);
        let pdom = compute_postdominators(blocks, &reachable);
        let ipdom = compute_ipdom(&pdom, &reachable);
        let loops = compute_natural_loops(blocks, &dom, &reachable);
        Structurer {
            blocks,
            ipdom,
            loops,
            emitted: BTreeSet::new(),
            building: BTreeSet::new(),
            diags,
        }
    }

    /// Emits the region starting at `cur` until `stop` (exclusive).
    /// Returns whether control falls through to `stop`.
    fn build_seq(
        &mut self,
        mut cur: usize,
        stop: Option<usize>,
        ctx: Ctx,
        out: &mut Vec<Stmt>,
    ) -> bool {
        loop {
            if Some(cur) == stop {
                return true;
            }
            if self.emitted.contains(&cur) {
                self.unstructured(self.blocks[cur].start, out);
                return false;
            }
            if self.loops.contains_key(&cur) && !self.building.contains(&cur) {
                match self.build_loop(cur, ctx, out) {
                    Some(next) => {
                        cur = next;
                        continue;
                    }
                    None => return false,
                }
            }
            if let Some(after) = self.try_switch(cur, stop, ctx, out) {
                match after {
                    Some(next) => {
                        cur = next;
                        continue;
                    }
                    None => return false,
                }
            }

            self.emitted.insert(cur);
            out.extend(self.blocks[cur].stmts.iter().cloned());

            match self.blocks[cur].term.clone() {
                Term::Ret(e) => {
                    out.push(Stmt::Return(e));
                    return false;
                }
                Term::Exit => return false,
                Term::JmpOut(target) => {
                    self.unstructured(target, out);
                    return false;
                }
                Term::Jmp(t) | Term::Fallthrough(t) => {
                    if Some(t) == stop {
                        return true;
                    }
                    if ctx.continue_to == Some(t) {
                        out.push(Stmt::Continue);
                        return false;
                    }
                    if ctx.break_to == Some(t) {
                        out.push(Stmt::Break);
                        return false;
                    }
                    cur = t;
                }
                Term::Br {
                    cond,
                    on_true,
                    on_false,
                } => {
                    if on_true == on_false {
                        cur = on_true;
                        continue;
                    }
                    let t_special = self.blocks_ctx_stmt(ctx, on_true).is_some();
                    let f_special = self.blocks_ctx_stmt(ctx, on_false).is_some();
                    if t_special || f_special {
                        match self.branch_in_loop(cond, on_true, on_false, ctx, out) {
                            Some(next) => {
                                cur = next;
                                continue;
                            }
                            None => return false,
                        }
                    }

                    let join = self.ipdom[cur].or(stop);
                    let mut then_body = Vec::new();
                    let then_ft = if Some(on_true) == join {
                        true
                    } else {
                        self.build_seq(on_true, join, ctx, &mut then_body)
                    };
                    let mut else_body = Vec::new();
                    let else_ft = if Some(on_false) == join {
                        true
                    } else {
                        self.build_seq(on_false, join, ctx, &mut else_body)
                    };

                    if then_body.is_empty() && !else_body.is_empty() {
                        out.push(Stmt::If {
                            cond: cond.negate(),
                            then_body: else_body,
                            else_body: None,
                        });
                    } else if else_body.is_empty() {
                        out.push(Stmt::If {
                            cond,
                            then_body,
                            else_body: None,
                        });
                    } else {
                        out.push(Stmt::If {
                            cond,
                            then_body,
                            else_body: Some(else_body),
                        });
                    }

                    match join {
                        Some(j) if then_ft || else_ft => cur = j,
                        Some(_) => return false,
                        None => return then_ft || else_ft,
                    }
                }
            }
        }
    }

    fn blocks_ctx_stmt(&self, ctx: Ctx, target: usize) -> Option<Stmt> {
        if ctx.continue_to == Some(target) {
            Some(Stmt::Continue)
        } else if ctx.break_to == Some(target) {
            Some(Stmt::Break)
        } else {
            None
        }
    }

    /// A conditional where at least one arm is the enclosing loop's break
    /// or continue target.
    fn branch_in_loop(
        &mut self,
        cond: Expr,
        on_true: usize,
        on_false: usize,
        ctx: Ctx,
        out: &mut Vec<Stmt>,
    ) -> Option<usize> {
        let true_stmt = self.blocks_ctx_stmt(ctx, on_true);
        let false_stmt = self.blocks_ctx_stmt(ctx, on_false);
        match (true_stmt, false_stmt) {
            (Some(t), Some(f)) => {
                out.push(Stmt::If {
                    cond,
                    then_body: vec![t],
                    else_body: Some(vec![f]),
                });
                None
            }
            (Some(t), None) => {
                out.push(Stmt::If {
                    cond,
                    then_body: vec![t],
                    else_body: None,
                });
                Some(on_false)
            }
            (None, Some(f)) => {
                out.push(Stmt::If {
                    cond: cond.negate(),
                    then_body: vec![f],
                    else_body: None,
                });
                Some(on_true)
            }
            (None, None) => unreachable!("caller checked for a special arm"),
        }
    }

    fn term_targets(&self, b: usize) -> Vec<usize> {
        match &self.blocks[b].term {
            Term::Jmp(t) | Term::Fallthrough(t) => vec![*t],
            Term::Br {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => Vec::new(),
        }
    }

    /// Builds the loop headed at `header` and returns the block to resume
    /// at, if any.
    fn build_loop(&mut self, header: usize, _outer: Ctx, out: &mut Vec<Stmt>) -> Option<usize> {
        let body = self.loops.get(&header).cloned().unwrap_or_default();
        let header_term = self.blocks[header].term.clone();

        // Head with a conditional exit and no statements of its own is a
        // `while`.
        if self.blocks[header].stmts.is_empty() {
            if let Term::Br {
                cond,
                on_true,
                on_false,
            } = header_term.clone()
            {
                let t_in = body.contains(&on_true);
                let f_in = body.contains(&on_false);
                if t_in ^ f_in {
                    let (body_succ, exit, cond) = if t_in {
                        (on_true, on_false, cond)
                    } else {
                        (on_false, on_true, cond.negate())
                    };
                    self.emitted.insert(header);
                    let mut body_stmts = Vec::new();
                    self.build_seq(
                        body_succ,
                        Some(header),
                        Ctx {
                            continue_to: Some(header),
                            break_to: Some(exit),
                        },
                        &mut body_stmts,
                    );
                    out.push(Stmt::While {
                        cond,
                        body: body_stmts,
                    });
                    return Some(exit);
                }
            }
        }

        // Single-block loop whose branch closes on itself is a `do-while`
        // over the header's own statements.
        if let Term::Br {
            cond,
            on_true,
            on_false,
        } = header_term.clone()
        {
            if on_true == header || on_false == header {
                let (exit, cond) = if on_true == header {
                    (on_false, cond)
                } else {
                    (on_true, cond.negate())
                };
                self.emitted.insert(header);
                out.push(Stmt::DoWhile {
                    body: self.blocks[header].stmts.clone(),
                    cond,
                });
                return Some(exit);
            }
        }

        // Unconditional head with a single conditional latch is a
        // `do-while`.
        let latches: Vec<usize> = body
            .iter()
            .copied()
            .filter(|&n| n != header && self.term_targets(n).contains(&header))
            .collect();
        if latches.len() == 1 {
            let latch = latches[0];
            if let Term::Br {
                cond,
                on_true,
                on_false,
            } = self.blocks[latch].term.clone()
            {
                let exit = if on_true == header {
                    Some(on_false)
                } else if on_false == header {
                    Some(on_true)
                } else {
                    None
                };
                if let Some(exit) = exit {
                    let cond = if on_true == header {
                        cond
                    } else {
                        cond.negate()
                    };
                    self.building.insert(header);
                    let mut body_stmts = Vec::new();
                    let ft = self.build_seq(
                        header,
                        Some(latch),
                        Ctx {
                            continue_to: Some(latch),
                            break_to: Some(exit),
                        },
                        &mut body_stmts,
                    );
                    self.building.remove(&header);
                    if ft {
                        self.emitted.insert(latch);
                        body_stmts.extend(self.blocks[latch].stmts.iter().cloned());
                    }
                    out.push(Stmt::DoWhile {
                        body: body_stmts,
                        cond,
                    });
                    return Some(exit);
                }
            }
        }

        // Irreducible-looking shape: keep everything inside `while (TRUE)`
        // with explicit breaks rather than inventing gotos.
        let exit = body
            .iter()
            .flat_map(|&n| self.term_targets(n))
            .find(|t| !body.contains(t));
        self.building.insert(header);
        let mut body_stmts = Vec::new();
        self.build_seq(
            header,
            None,
            Ctx {
                continue_to: Some(header),
                break_to: exit,
            },
            &mut body_stmts,
        );
        self.building.remove(&header);
        out.push(Stmt::While {
            cond: Expr::Ident("TRUE".to_string()),
            body: body_stmts,
        });
        exit
    }

    /// Recognizes a chain of equality comparisons against one discriminant
    /// and rebuilds it as a `switch`. Returns the resume block when a chain
    /// of at least two cases matched.
    fn try_switch(
        &mut self,
        cur: usize,
        stop: Option<usize>,
        ctx: Ctx,
        out: &mut Vec<Stmt>,
    ) -> Option<Option<usize>> {
        let mut disc: Option<Expr> = None;
        let mut chain: Vec<usize> = Vec::new();
        let mut cases: Vec<(Expr, usize)> = Vec::new();
        let mut b = cur;
        loop {
            if self.emitted.contains(&b) || self.loops.contains_key(&b) {
                break;
            }
            if !chain.is_empty() && !self.blocks[b].stmts.is_empty() {
                break;
            }
            let Term::Br {
                cond: Expr::Binary(BinOp::Eq, lhs, rhs),
                on_true,
                on_false,
            } = &self.blocks[b].term
            else {
                break;
            };
            if !matches!(rhs.as_ref(), Expr::IntLit(_) | Expr::StrLit(_)) {
                break;
            }
            match &disc {
                None => disc = Some(lhs.as_ref().clone()),
                Some(d) if d == lhs.as_ref() => {}
                _ => break,
            }
            chain.push(b);
            cases.push((rhs.as_ref().clone(), *on_true));
            b = *on_false;
        }
        if cases.len() < 2 {
            return None;
        }
        let default_target = b;
        let merge = self.ipdom[cur].or(stop);

        out.extend(self.blocks[cur].stmts.iter().cloned());
        self.emitted.extend(chain.iter().copied());

        // Group labels sharing a body, then lay bodies out in block order
        // so genuine fall-through survives.
        let mut groups: Vec<(usize, Vec<Expr>)> = Vec::new();
        for (value, target) in cases {
            match groups.iter_mut().find(|g| g.0 == target) {
                Some(g) => g.1.push(value),
                None => groups.push((target, vec![value])),
            }
        }
        groups.sort_by_key(|&(t, _)| self.blocks[t].start);

        let inner = Ctx {
            continue_to: ctx.continue_to,
            break_to: merge,
        };
        let mut switch_cases = Vec::new();
        for (gi, (target, values)) in groups.iter().enumerate() {
            let mut body = Vec::new();
            if Some(*target) == merge {
                body.push(Stmt::Break);
            } else {
                let next_body = groups.get(gi + 1).map(|g| g.0);
                let local_stop = next_body.or(merge);
                let ft = self.build_seq(*target, local_stop, inner, &mut body);
                if ft && local_stop == merge {
                    body.push(Stmt::Break);
                }
            }
            switch_cases.push(SwitchCase {
                values: values.clone(),
                body,
            });
        }

        let default = if Some(default_target) == merge {
            None
        } else {
            let mut body = Vec::new();
            self.build_seq(default_target, merge, inner, &mut body);
            Some(body)
        };

        out.push(Stmt::Switch {
            disc: disc.expect("chain matched at least two comparisons"),
            cases: switch_cases,
            default,
        });

        Some(merge)
    }

    fn unstructured(&mut self, target_offset: u32, out: &mut Vec<Stmt>) {
        self.diags.push(Diagnostic::warning(
            DiagnosticCode::UnstructuredJump,
            format!(
                "jump to {:#x} does not fit any structured construct",
                target_offset
            ),
        ));
        out.push(Stmt::UnstructuredJump(label_name(target_offset)));
    }
}

fn compute_reachable(blocks: &[SimBlock], entry: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![entry];
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        for &s in &blocks[n].succ {
            if !seen.contains(&s) {
                stack.push(s);
            }
        }
    }
    seen
}

fn compute_dominators(
    blocks: &[SimBlock],
    entry: usize,
    reachable: &BTreeSet<usize>,
) -> Vec<BTreeSet<usize>> {
    let all: BTreeSet<usize> = reachable.clone();
    let mut dom: Vec<BTreeSet<usize>> = (0..blocks.len())
        .map(|b| {
            if b == entry {
                [b].into_iter().collect()
            } else {
                all.clone()
            }
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for &b in reachable.iter() {
            if b == entry {
                continue;
            }
            let preds: Vec<usize> = blocks[b]
                .pred
                .iter()
                .copied()
                .filter(|p| reachable.contains(p))
                .collect();
            let mut new: Option<BTreeSet<usize>> = None;
            for p in preds {
                new = Some(match new {
                    None => dom[p].clone(),
                    Some(acc) => acc.intersection(&dom[p]).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(b);
            if new != dom[b] {
                dom[b] = new;
                changed = true;
            }
        }
    }
    dom
}

fn compute_postdominators(blocks: &[SimBlock], reachable: &BTreeSet<usize>) -> Vec<BTreeSet<usize>> {
    let all: BTreeSet<usize> = reachable.clone();
    let exits: BTreeSet<usize> = reachable
        .iter()
        .copied()
        .filter(|&b| blocks[b].succ.iter().all(|s| !reachable.contains(s)) || blocks[b].succ.is_empty())
        .collect();

    let mut pdom: Vec<BTreeSet<usize>> = (0..blocks.len())
        .map(|b| {
            if exits.contains(&b) {
                [b].into_iter().collect()
            } else {
                all.clone()
            }
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for &b in reachable.iter() {
            if exits.contains(&b) {
                continue;
            }
            let succs: Vec<usize> = blocks[b]
                .succ
                .iter()
                .copied()
                .filter(|s| reachable.contains(s))
                .collect();
            let mut new: Option<BTreeSet<usize>> = None;
            for s in succs {
                new = Some(match new {
                    None => pdom[s].clone(),
                    Some(acc) => acc.intersection(&pdom[s]).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(b);
            if new != pdom[b] {
                pdom[b] = new;
                changed = true;
            }
        }
    }
    pdom
}

/// Immediate postdominator: the candidate every other candidate
/// postdominates.
fn compute_ipdom(pdom: &[BTreeSet<usize>], reachable: &BTreeSet<usize>) -> Vec<Option<usize>> {
    let mut ipdom = vec![None; pdom.len()];
    for &b in reachable {
        let candidates: Vec<usize> = pdom[b].iter().copied().filter(|&c| c != b).collect();
        ipdom[b] = candidates
            .iter()
            .copied()
            .find(|&c| candidates.iter().all(|&q| q == c || pdom[c].contains(&q)));
    }
    ipdom
}

fn compute_natural_loops(
    blocks: &[SimBlock],
    dom: &[BTreeSet<usize>],
    reachable: &BTreeSet<usize>,
) -> BTreeMap<usize, BTreeSet<usize>> {
    let mut loops: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for &x in reachable {
        let targets: Vec<usize> = blocks[x]
            .succ
            .iter()
            .copied()
            .filter(|t| reachable.contains(t))
            .collect();
        for y in targets {
            if !dom[x].contains(&y) {
                continue;
            }
            // Back edge x -> y; the natural loop is everything reaching x
            // without passing through y.
            let body = loops.entry(y).or_default();
            body.insert(y);
            body.insert(x);
            let mut stack = vec![x];
            let mut seen: BTreeSet<usize> = [y, x].into_iter().collect();
            while let Some(n) = stack.pop() {
                for &p in &blocks[n].pred {
                    if reachable.contains(&p) && seen.insert(p) {
                        body.insert(p);
                        stack.push(p);
                    }
                }
            }
        }
    }
    loops
}

/// Rewrites `init; while (cond) { ...; step }` into a `for` when the init
/// and step both target the loop variable.
fn rewrite_for(stmts: &mut Vec<Stmt>) {
    let mut i = 0;
    while i < stmts.len() {
        // Recurse first so nested loops rewrite too.
        match &mut stmts[i] {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                rewrite_for(then_body);
                if let Some(e) = else_body {
                    rewrite_for(e);
                }
            }
            Stmt::While { body, .. }
            | Stmt::DoWhile { body, .. }
            | Stmt::For { body, .. } => rewrite_for(body),
            Stmt::Switch { cases, default, .. } => {
                for c in cases.iter_mut() {
                    rewrite_for(&mut c.body);
                }
                if let Some(d) = default {
                    rewrite_for(d);
                }
            }
            _ => {}
        }

        if i > 0 && is_for_candidate(&stmts[i - 1], &stmts[i]) {
            let Stmt::While { cond, mut body } = stmts.remove(i) else {
                unreachable!()
            };
            let step = match body.pop() {
                Some(Stmt::Expr(e)) => Some(e),
                Some(other) => {
                    body.push(other);
                    None
                }
                None => None,
            };
            // `int v = e;` splits back into a declaration plus a `for`
            // init assignment; NSS for-inits are expressions.
            let decl_init = matches!(stmts[i - 1], Stmt::VarDecl { .. });
            let (init, insert_at) = if decl_init {
                let Stmt::VarDecl { name, init, .. } = &mut stmts[i - 1] else {
                    unreachable!()
                };
                let assign = init
                    .take()
                    .map(|e| Expr::Assign(Box::new(Expr::Ident(name.clone())), Box::new(e)));
                (assign, i)
            } else {
                let Stmt::Expr(e) = stmts.remove(i - 1) else {
                    unreachable!()
                };
                (Some(e), i - 1)
            };
            stmts.insert(
                insert_at,
                Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                },
            );
            i = insert_at + 1;
        } else {
            i += 1;
        }
    }
}

fn is_for_candidate(prev: &Stmt, cur: &Stmt) -> bool {
    let Stmt::While { cond, body } = cur else {
        return false;
    };
    let var = match prev {
        Stmt::Expr(Expr::Assign(lhs, _)) => match lhs.as_ref() {
            Expr::Ident(n) => n.clone(),
            _ => return false,
        },
        Stmt::VarDecl {
            name,
            init: Some(_),
            ..
        } => name.clone(),
        _ => return false,
    };
    if !cond.mentions_ident(&var) {
        return false;
    }
    // The canonical step is its own trailing block; a loop whose entire
    // body is the increment came from `while (c) i++;` and stays a while.
    if body.len() < 2 {
        return false;
    }
    match body.last() {
        Some(Stmt::Expr(Expr::Unary(op, target))) if op.is_postfix() => {
            matches!(target.as_ref(), Expr::Ident(n) if *n == var)
        }
        Some(Stmt::Expr(Expr::Assign(lhs, _))) => {
            matches!(lhs.as_ref(), Expr::Ident(n) if *n == var)
        }
        _ => false,
    }
}
