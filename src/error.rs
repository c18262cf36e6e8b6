use std::fmt;

use thiserror::Error;

use crate::types::Type;

/// Fatal decompilation failures.
///
/// Format errors come from the reader, resolution errors from the linker and
/// simulator, `UnresolvedSignature` from strict-mode inference. Underflow and
/// type-conflict variants indicate malformed input or an implementation bug;
/// no stage uses them for expected conditions.
#[derive(Debug, Error)]
pub enum DecompileError {
    #[error("bad magic: expected \"NCS V1.0\"")]
    BadMagic,

    #[error("truncated bytecode at offset {offset:#x}")]
    TruncatedBytecode { offset: u32 },

    #[error("unknown opcode {opcode:#04x} at offset {offset:#x}")]
    UnknownOpcode { opcode: u8, offset: u32 },

    #[error("opcode {opcode:#04x} does not accept type byte {type_byte:#04x} at offset {offset:#x}")]
    UnsupportedType {
        opcode: u8,
        type_byte: u8,
        offset: u32,
    },

    #[error("jump at offset {offset:#x} targets {target:#x}, which is not an instruction boundary")]
    UnresolvedJump { offset: u32, target: i64 },

    #[error("action table has no entry for index {index}")]
    ActionTableMissing { index: u16 },

    #[error("unresolved signature for subroutine at {sub:#x}: {slot} stayed `any`")]
    UnresolvedSignature { sub: u32, slot: String },

    #[error("stack underflow at offset {offset:#x}")]
    StackUnderflow { offset: u32 },

    #[error("incoming edges disagree on stack depth at offset {offset:#x}")]
    StackDepthMismatch { offset: u32 },

    #[error("type conflict at offset {offset:#x}: expected {expected}, found {found}")]
    TypeConflict {
        offset: u32,
        expected: Type,
        found: Type,
    },

    #[error("decompilation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Note,
}

/// Non-fatal findings surfaced alongside the decompiled source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCode {
    AnyParameter,
    AnyReturn,
    UnstructuredJump,
    DeadCode,
}

impl DiagnosticCode {
    pub fn name(self) -> &'static str {
        match self {
            DiagnosticCode::AnyParameter => "any-parameter",
            DiagnosticCode::AnyReturn => "any-return",
            DiagnosticCode::UnstructuredJump => "unstructured-jump",
            DiagnosticCode::DeadCode => "dead-code",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            code,
            message: message.into(),
        }
    }

    pub fn note(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Note,
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Warning => "warning",
            Severity::Note => "note",
        };
        write!(f, "{}[{}]: {}", sev, self.code.name(), self.message)
    }
}
