//! Flat disassembly listing with labels at subroutine entries and branch
//! targets, plus resolved action names when a table is available. Intended
//! for validation and reverse engineering, not for the decompiler itself.

use std::collections::BTreeSet;

use crate::actions::ActionTable;
use crate::error::DecompileError;
use crate::ncs::{op, Instruction, Operand};
use crate::reader;

pub fn disassemble(buf: &[u8], actions: Option<&ActionTable>) -> Result<String, DecompileError> {
    let insns = reader::read_program(buf)?;

    let mut jsr_targets: BTreeSet<u32> = BTreeSet::new();
    let mut jump_targets: BTreeSet<u32> = BTreeSet::new();
    for insn in &insns {
        if let Some(t) = insn.jump_target() {
            if t >= 0 {
                if insn.opcode == op::JSR {
                    jsr_targets.insert(t as u32);
                } else {
                    jump_targets.insert(t as u32);
                }
            }
        }
    }

    let mut out = String::new();
    for insn in &insns {
        if jsr_targets.contains(&insn.offset) {
            out.push_str(&format!("fn_{:x}:\n", insn.offset));
        } else if jump_targets.contains(&insn.offset) {
            out.push_str(&format!("loc_{:x}:\n", insn.offset));
        }
        let (text, comment) = format_insn(insn, actions);
        out.push_str(&format!("{:08x}  {}", insn.offset, text));
        if !comment.is_empty() {
            out.push_str("\t// ");
            out.push_str(&comment);
        }
        out.push('\n');
    }
    Ok(out)
}

fn format_insn(insn: &Instruction, actions: Option<&ActionTable>) -> (String, String) {
    let m = insn.mnemonic();
    let mut comment = String::new();
    let text = match &insn.operand {
        Operand::None => format!("{} {:#04x}", m, insn.type_byte),
        Operand::Int(v) => {
            if insn.is_jump() {
                let target = insn.jump_target().unwrap();
                comment = format!("-> {:#x}", target);
                format!("{} {}", m, v)
            } else {
                format!("{} {}", m, v)
            }
        }
        Operand::Float(v) => format!("{} {}", m, v),
        Operand::String(s) => format!("{} \"{}\"", m, s),
        Operand::Stack { offset, size } => format!("{} {}, {}", m, offset, size),
        Operand::Action { index, argc } => {
            if let Some(table) = actions {
                if let Ok(a) = table.get(*index) {
                    comment = a.dump();
                }
            }
            format!("{} {}, {}", m, index, argc)
        }
        Operand::Destruct {
            size,
            keep_offset,
            keep_size,
        } => format!("{} {}, {}, {}", m, size, keep_offset, keep_size),
        Operand::State { bp, sp } => format!("{} {}, {}", m, bp, sp),
        Operand::Size(n) => format!("{} {}", m, n),
    };
    (text, comment)
}
