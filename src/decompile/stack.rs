//! Symbolic stack model for the simulator.
//!
//! Entries are whole values: a vector is one entry spanning three slots,
//! a struct spans the sum of its fields. Byte offsets coming from the
//! bytecode address slots (4 bytes each); the helpers here translate those
//! ranges into entries and surface underflow or misalignment as typed
//! errors rather than panicking.

use crate::error::DecompileError;
use crate::types::Type;

use super::ast::Expr;

pub const VECTOR_FIELDS: [&str; 3] = ["x", "y", "z"];

#[derive(Debug, Clone)]
pub enum StackEntry {
    Constant {
        ty: Type,
        expr: Expr,
    },
    /// Declared local; `id` is the offset of the RSADD that created it.
    Variable {
        ty: Type,
        id: u32,
        name: String,
    },
    Expression {
        ty: Type,
        expr: Expr,
        /// Offset of the instruction that produced the value.
        at: u32,
    },
    /// Flat struct value; field order is stack order.
    Struct {
        fields: Vec<StackEntry>,
    },
}

impl StackEntry {
    pub fn ty(&self) -> Type {
        match self {
            StackEntry::Constant { ty, .. }
            | StackEntry::Variable { ty, .. }
            | StackEntry::Expression { ty, .. } => ty.clone(),
            StackEntry::Struct { fields } => {
                Type::Struct(fields.iter().map(StackEntry::ty).collect())
            }
        }
    }

    pub fn slots(&self) -> usize {
        self.ty().slots().max(1)
    }

    /// The expression a read of this entry produces.
    pub fn expr(&self) -> Expr {
        match self {
            StackEntry::Constant { expr, .. } | StackEntry::Expression { expr, .. } => {
                expr.clone()
            }
            StackEntry::Variable { name, .. } => Expr::Ident(name.clone()),
            StackEntry::Struct { fields } => {
                // The only struct values the NCS family materializes whole
                // are vectors; render those as a vector literal.
                Expr::VectorCtor(fields.iter().map(StackEntry::expr).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymStack {
    pub entries: Vec<StackEntry>,
}

#[derive(Debug, Clone, Copy)]
pub enum WriteTarget {
    /// The range covers a whole entry.
    Whole(usize),
    /// A single slot inside a vector-typed entry (component index 0..3).
    VectorSlot(usize, usize),
}

impl SymStack {
    pub fn new() -> Self {
        SymStack::default()
    }

    pub fn depth_slots(&self) -> usize {
        self.entries.iter().map(StackEntry::slots).sum()
    }

    pub fn push(&mut self, e: StackEntry) {
        self.entries.push(e);
    }

    pub fn pop_entry(&mut self, at: u32) -> Result<StackEntry, DecompileError> {
        self.entries
            .pop()
            .ok_or(DecompileError::StackUnderflow { offset: at })
    }

    /// Pops a value of the wanted type, folding three loose float entries
    /// into a vector literal when a vector is consumed.
    pub fn pop_value(&mut self, want: &Type, at: u32) -> Result<Expr, DecompileError> {
        if want.slots() == 3 {
            let top = self.pop_entry(at)?;
            if top.slots() == 3 {
                return Ok(top.expr());
            }
            // Three consecutive float pushes; pop order is z, y, x.
            let z = top;
            let y = self.pop_entry(at)?;
            let x = self.pop_entry(at)?;
            for part in [&x, &y, &z] {
                if part.slots() != 1 {
                    return Err(DecompileError::TypeConflict {
                        offset: at,
                        expected: Type::Float,
                        found: part.ty(),
                    });
                }
            }
            return Ok(Expr::VectorCtor(vec![x.expr(), y.expr(), z.expr()]));
        }

        let e = self.pop_entry(at)?;
        let found = e.ty();
        if e.slots() != want.slots().max(1) {
            return Err(DecompileError::TypeConflict {
                offset: at,
                expected: want.clone(),
                found,
            });
        }
        Ok(e.expr())
    }

    /// Pops `slots` stack slots as whole entries, top-first. A range that
    /// splits an entry is malformed input.
    pub fn pop_slots(&mut self, slots: usize, at: u32) -> Result<Vec<StackEntry>, DecompileError> {
        let mut out = Vec::new();
        let mut taken = 0usize;
        while taken < slots {
            let e = self.pop_entry(at)?;
            taken += e.slots();
            out.push(e);
        }
        if taken != slots {
            return Err(DecompileError::TypeConflict {
                offset: at,
                expected: Type::Struct(Vec::new()),
                found: out.last().map(StackEntry::ty).unwrap_or(Type::Any),
            });
        }
        Ok(out)
    }

    /// Reads the byte range `[SP+offset, SP+offset+size)` without popping,
    /// producing copies in push order. A partial read of a vector becomes
    /// component accesses.
    pub fn read_range(
        &self,
        offset: i32,
        size: u16,
        at: u32,
    ) -> Result<Vec<StackEntry>, DecompileError> {
        let (want, start) = self.range_slots(offset, size, at)?;
        let end = start + want;

        let mut out = Vec::new();
        let mut pos = 0usize;
        for e in &self.entries {
            let w = e.slots();
            let e_start = pos;
            let e_end = pos + w;
            pos = e_end;
            if e_end <= start || e_start >= end {
                continue;
            }
            if e_start >= start && e_end <= end {
                out.push(read_copy(e));
            } else if e.ty() == Type::Vector {
                let from = start.max(e_start) - e_start;
                let to = end.min(e_end) - e_start;
                for comp in from..to {
                    out.push(StackEntry::Expression {
                        ty: Type::Float,
                        expr: Expr::Field(
                            Box::new(e.expr()),
                            VECTOR_FIELDS[comp].to_string(),
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
        Ok(out)
    }

    /// Locates the target of a copy-down into the byte range
    /// `[SP+offset, SP+offset+size)`.
    pub fn locate_write(
        &self,
        offset: i32,
        size: u16,
        at: u32,
    ) -> Result<WriteTarget, DecompileError> {
        let (want, start) = self.range_slots(offset, size, at)?;
        let mut pos = 0usize;
        for (idx, e) in self.entries.iter().enumerate() {
            let w = e.slots();
            if pos == start && w == want {
                return Ok(WriteTarget::Whole(idx));
            }
            if start >= pos && start < pos + w {
                if e.ty() == Type::Vector && want == 1 {
                    return Ok(WriteTarget::VectorSlot(idx, start - pos));
                }
                return Err(DecompileError::TypeConflict {
                    offset: at,
                    expected: Type::Vector,
                    found: e.ty(),
                });
            }
            pos += w;
        }
        Err(DecompileError::StackUnderflow { offset: at })
    }

    /// Validates a byte range and converts it to `(slot count, slot index
    /// from the bottom of the stack)`.
    fn range_slots(
        &self,
        offset: i32,
        size: u16,
        at: u32,
    ) -> Result<(usize, usize), DecompileError> {
        if offset >= 0 || offset % 4 != 0 || size % 4 != 0 || size == 0 {
            return Err(DecompileError::StackUnderflow { offset: at });
        }
        let want = size as usize / 4;
        let depth = (-offset / 4) as usize;
        let total = self.depth_slots();
        if depth > total || want > depth {
            return Err(DecompileError::StackUnderflow { offset: at });
        }
        Ok((want, total - depth))
    }
}

/// A read of an entry yields a value, not an alias: variables copy to
/// identifier expressions, everything else keeps its expression.
fn read_copy(e: &StackEntry) -> StackEntry {
    match e {
        StackEntry::Variable { ty, name, .. } => StackEntry::Expression {
            ty: ty.clone(),
            expr: Expr::Ident(name.clone()),
            at: 0,
        },
        other => other.clone(),
    }
}
