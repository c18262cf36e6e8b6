// SPDX-License-Identifier: MIT
//
// Big-endian NCS byte-stream reader.
//
// The stream starts with the 8-byte magic "NCS V1.0", followed by the size
// header (opcode 0x42 plus a u32 total file length) and the instruction
// stream. All multi-byte operands are big-endian.

use byteorder::{BigEndian, ByteOrder};

use crate::error::DecompileError;
use crate::ncs::{op, pair_types, scalar_type, ty, Instruction, Operand};

pub const MAGIC: &[u8; 8] = b"NCS V1.0";

/// Offset of the first real instruction: magic + size header.
pub const HEADER_LEN: u32 = 13;

/// Decodes a whole NCS image into a flat, offset-ordered instruction list.
pub fn read_program(buf: &[u8]) -> Result<Vec<Instruction>, DecompileError> {
    if buf.len() < HEADER_LEN as usize || &buf[..8] != MAGIC {
        return Err(DecompileError::BadMagic);
    }
    if buf[8] != op::T {
        return Err(DecompileError::BadMagic);
    }
    let declared = BigEndian::read_u32(&buf[9..13]) as usize;
    if declared != buf.len() {
        return Err(DecompileError::TruncatedBytecode { offset: 8 });
    }

    let mut cur = Cursor {
        buf,
        pos: HEADER_LEN as usize,
    };
    let mut out = Vec::new();
    while !cur.at_end() {
        out.push(decode_one(&mut cur)?);
    }
    Ok(out)
}

fn decode_one(cur: &mut Cursor<'_>) -> Result<Instruction, DecompileError> {
    let offset = cur.pos as u32;
    let opcode = cur.read_u8()?;
    let type_byte = cur.read_u8()?;

    let unsupported = || DecompileError::UnsupportedType {
        opcode,
        type_byte,
        offset,
    };

    let operand = match opcode {
        op::CPDOWNSP | op::CPTOPSP | op::CPDOWNBP | op::CPTOPBP => {
            if type_byte != ty::STACK {
                return Err(unsupported());
            }
            let off = cur.read_i32()?;
            let size = cur.read_u16()?;
            Operand::Stack { offset: off, size }
        }
        op::RSADD => {
            if scalar_type(type_byte).is_none() {
                return Err(unsupported());
            }
            Operand::None
        }
        op::CONST => match type_byte {
            ty::INT => Operand::Int(cur.read_i32()?),
            ty::FLOAT => Operand::Float(cur.read_f32()?),
            ty::STRING => {
                let len = cur.read_u16()? as usize;
                let bytes = cur.take(len)?;
                Operand::String(String::from_utf8_lossy(bytes).into_owned())
            }
            ty::OBJECT => Operand::Int(cur.read_i32()?),
            _ => return Err(unsupported()),
        },
        op::ACTION => {
            if type_byte != ty::NONE {
                return Err(unsupported());
            }
            let index = cur.read_u16()?;
            let argc = cur.read_u8()?;
            Operand::Action { index, argc }
        }
        op::LOGAND
        | op::LOGOR
        | op::INCOR
        | op::EXCOR
        | op::BOOLAND
        | op::SHLEFT
        | op::SHRIGHT
        | op::USHRIGHT
        | op::MOD => {
            if type_byte != ty::INTINT {
                return Err(unsupported());
            }
            Operand::None
        }
        op::EQUAL | op::NEQUAL => {
            if type_byte == ty::STRUCTSTRUCT {
                Operand::Size(cur.read_u16()?)
            } else {
                match type_byte {
                    ty::INTINT
                    | ty::FLOATFLOAT
                    | ty::OBJECTOBJECT
                    | ty::STRINGSTRING
                    | ty::EFFECTEFFECT
                    | ty::EVENTEVENT
                    | ty::LOCATIONLOCATION
                    | ty::TALENTTALENT => Operand::None,
                    _ => return Err(unsupported()),
                }
            }
        }
        op::GEQ | op::GT | op::LT | op::LEQ => match type_byte {
            ty::INTINT | ty::FLOATFLOAT => Operand::None,
            _ => return Err(unsupported()),
        },
        op::ADD | op::SUB | op::MUL | op::DIV => {
            let ok = matches!(
                type_byte,
                ty::INTINT | ty::FLOATFLOAT | ty::INTFLOAT | ty::FLOATINT
            ) || (matches!(opcode, op::ADD | op::SUB)
                && type_byte == ty::VECTORVECTOR)
                || (opcode == op::ADD && type_byte == ty::STRINGSTRING)
                || (matches!(opcode, op::MUL | op::DIV)
                    && matches!(type_byte, ty::VECTORFLOAT | ty::FLOATVECTOR));
            if !ok {
                return Err(unsupported());
            }
            debug_assert!(pair_types(type_byte).is_some());
            Operand::None
        }
        op::NEG => match type_byte {
            ty::INT | ty::FLOAT => Operand::None,
            _ => return Err(unsupported()),
        },
        op::COMP | op::NOT => {
            if type_byte != ty::INT {
                return Err(unsupported());
            }
            Operand::None
        }
        op::MOVSP => Operand::Int(cur.read_i32()?),
        op::JMP | op::JSR | op::JZ | op::JNZ => Operand::Int(cur.read_i32()?),
        op::RETN | op::SAVEBP | op::RESTOREBP | op::NOP => Operand::None,
        op::DESTRUCT => {
            let size = cur.read_u16()?;
            let keep_offset = cur.read_i16()?;
            let keep_size = cur.read_u16()?;
            Operand::Destruct {
                size,
                keep_offset,
                keep_size,
            }
        }
        op::DECISP | op::INCISP | op::DECIBP | op::INCIBP => {
            if type_byte != ty::INT {
                return Err(unsupported());
            }
            Operand::Int(cur.read_i32()?)
        }
        op::STORESTATE => {
            let bp = cur.read_i32()?;
            let sp = cur.read_i32()?;
            Operand::State { bp, sp }
        }
        _ => return Err(DecompileError::UnknownOpcode { opcode, offset }),
    };

    Ok(Instruction {
        offset,
        size: cur.pos as u32 - offset,
        opcode,
        type_byte,
        operand,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecompileError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecompileError::TruncatedBytecode {
                offset: self.pos as u32,
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, DecompileError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecompileError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn read_i16(&mut self) -> Result<i16, DecompileError> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    fn read_i32(&mut self) -> Result<i32, DecompileError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn read_f32(&mut self) -> Result<f32, DecompileError> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(op::T);
        let total = (HEADER_LEN as usize + body.len()) as u32;
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let err = read_program(b"NOT NCS.........").unwrap_err();
        assert!(matches!(err, DecompileError::BadMagic));
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut buf = image(&[op::RETN, ty::NONE]);
        buf.push(0);
        let err = read_program(&buf).unwrap_err();
        assert!(matches!(err, DecompileError::TruncatedBytecode { .. }));
    }

    #[test]
    fn decodes_const_and_retn() {
        let mut body = vec![op::CONST, ty::INT];
        body.extend_from_slice(&42i32.to_be_bytes());
        body.extend_from_slice(&[op::RETN, ty::NONE]);
        let insns = read_program(&image(&body)).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].offset, HEADER_LEN);
        assert_eq!(insns[0].operand, Operand::Int(42));
        assert_eq!(insns[1].opcode, op::RETN);
        assert_eq!(insns[1].offset, HEADER_LEN + 6);
    }

    #[test]
    fn decodes_string_constant() {
        let mut body = vec![op::CONST, ty::STRING];
        body.extend_from_slice(&5u16.to_be_bytes());
        body.extend_from_slice(b"hello");
        body.extend_from_slice(&[op::RETN, ty::NONE]);
        let insns = read_program(&image(&body)).unwrap();
        assert_eq!(insns[0].operand, Operand::String("hello".into()));
        assert_eq!(insns[0].size, 9);
    }

    #[test]
    fn truncated_operand_is_reported() {
        let body = vec![op::CONST, ty::INT, 0, 0];
        let err = read_program(&image(&body)).unwrap_err();
        assert!(matches!(err, DecompileError::TruncatedBytecode { .. }));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let body = vec![0x7f, ty::NONE];
        let err = read_program(&image(&body)).unwrap_err();
        assert!(matches!(
            err,
            DecompileError::UnknownOpcode { opcode: 0x7f, .. }
        ));
    }

    #[test]
    fn jump_targets_are_relative_to_next_instruction() {
        // JSR +2 at the start of the stream: next instruction is at
        // HEADER_LEN + 6, so the target resolves two bytes past it.
        let mut body = vec![op::JSR, ty::NONE];
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(&[op::RETN, ty::NONE, op::RETN, ty::NONE]);
        let insns = read_program(&image(&body)).unwrap();
        assert_eq!(insns[0].jump_target(), Some((HEADER_LEN + 8) as i64));
    }
}
