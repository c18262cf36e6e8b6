//! End-to-end decompilation scenarios over hand-assembled NCS images.

use std::collections::HashMap;

use ncsdec::decompile::{decompile, CancelToken, Config};
use ncsdec::error::{DecompileError, DiagnosticCode};
use ncsdec::{disasm, ActionTable};

const NWSCRIPT: &str = r#"
// 0. Random
int Random(int nMaxInteger);

// 1. PrintString
void PrintString(string sString);

// 2. PrintFloat
void PrintFloat(float fFloat, int nWidth = 18, int nDecimals = 9);

// 3. FloatToString
string FloatToString(float fFloat, int nWidth = 18, int nDecimals = 9);

// 4. PrintInteger
void PrintInteger(int nInteger);

// 5. PrintObject
void PrintObject(object oObject);

// 6. AssignCommand
void AssignCommand(object oActionSubject, action aActionToAssign);

// 7. DelayCommand
void DelayCommand(float fSeconds, action aActionToDelay);

// 33. SetListenPattern
void SetListenPattern(object oObject, string sPattern, int nNumber = 0);

// 34. SetFacingPoint
void SetFacingPoint(vector vTarget);
"#;

fn actions() -> ActionTable {
    ActionTable::parse(NWSCRIPT)
}

// Opcode and type bytes, mirroring the NCS tables.
const OP_CPDOWNSP: u8 = 0x01;
const OP_RSADD: u8 = 0x02;
const OP_CPTOPSP: u8 = 0x03;
const OP_CONST: u8 = 0x04;
const OP_ACTION: u8 = 0x05;
const OP_EQUAL: u8 = 0x0b;
const OP_LT: u8 = 0x0f;
const OP_SUB: u8 = 0x15;
const OP_MOVSP: u8 = 0x1b;
const OP_JMP: u8 = 0x1d;
const OP_JSR: u8 = 0x1e;
const OP_JZ: u8 = 0x1f;
const OP_RETN: u8 = 0x20;
const OP_INCISP: u8 = 0x24;
const OP_JNZ: u8 = 0x25;
const OP_CPTOPBP: u8 = 0x27;
const OP_STORESTATE: u8 = 0x2c;
const OP_T: u8 = 0x42;

const TY_NONE: u8 = 0x00;
const TY_STACK: u8 = 0x01;
const TY_INT: u8 = 0x03;
const TY_FLOAT: u8 = 0x04;
const TY_STRING: u8 = 0x05;
const TY_OBJECT: u8 = 0x06;
const TY_II: u8 = 0x20;

const HEADER_LEN: u32 = 13;

/// Tiny NCS assembler with label fixups. Jump operands are relative to the
/// first byte of the next instruction.
#[derive(Default)]
struct Asm {
    body: Vec<u8>,
    labels: HashMap<&'static str, u32>,
    fixups: Vec<(usize, u32, &'static str)>,
}

impl Asm {
    fn new() -> Self {
        Asm::default()
    }

    fn off(&self) -> u32 {
        HEADER_LEN + self.body.len() as u32
    }

    fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.off());
        self
    }

    fn raw(&mut self, opcode: u8, type_byte: u8) -> &mut Self {
        self.body.push(opcode);
        self.body.push(type_byte);
        self
    }

    fn const_i(&mut self, v: i32) -> &mut Self {
        self.raw(OP_CONST, TY_INT);
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn const_f(&mut self, v: f32) -> &mut Self {
        self.raw(OP_CONST, TY_FLOAT);
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn const_s(&mut self, s: &str) -> &mut Self {
        self.raw(OP_CONST, TY_STRING);
        self.body.extend_from_slice(&(s.len() as u16).to_be_bytes());
        self.body.extend_from_slice(s.as_bytes());
        self
    }

    fn const_o(&mut self, v: i32) -> &mut Self {
        self.raw(OP_CONST, TY_OBJECT);
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn rsadd(&mut self, type_byte: u8) -> &mut Self {
        self.raw(OP_RSADD, type_byte)
    }

    fn stack_op(&mut self, opcode: u8, offset: i32, size: u16) -> &mut Self {
        self.raw(opcode, TY_STACK);
        self.body.extend_from_slice(&offset.to_be_bytes());
        self.body.extend_from_slice(&size.to_be_bytes());
        self
    }

    fn movsp(&mut self, n: i32) -> &mut Self {
        self.raw(OP_MOVSP, TY_NONE);
        self.body.extend_from_slice(&n.to_be_bytes());
        self
    }

    fn binop(&mut self, opcode: u8, type_byte: u8) -> &mut Self {
        self.raw(opcode, type_byte)
    }

    fn incisp(&mut self, offset: i32) -> &mut Self {
        self.raw(OP_INCISP, TY_INT);
        self.body.extend_from_slice(&offset.to_be_bytes());
        self
    }

    fn action(&mut self, index: u16, argc: u8) -> &mut Self {
        self.raw(OP_ACTION, TY_NONE);
        self.body.extend_from_slice(&index.to_be_bytes());
        self.body.push(argc);
        self
    }

    fn storestate(&mut self, bp: i32, sp: i32) -> &mut Self {
        self.raw(OP_STORESTATE, 0x10);
        self.body.extend_from_slice(&bp.to_be_bytes());
        self.body.extend_from_slice(&sp.to_be_bytes());
        self
    }

    fn jump(&mut self, opcode: u8, target: &'static str) -> &mut Self {
        self.raw(opcode, TY_NONE);
        let pos = self.body.len();
        self.body.extend_from_slice(&0i32.to_be_bytes());
        let next = self.off();
        self.fixups.push((pos, next, target));
        self
    }

    fn jump_rel(&mut self, opcode: u8, rel: i32) -> &mut Self {
        self.raw(opcode, TY_NONE);
        self.body.extend_from_slice(&rel.to_be_bytes());
        self
    }

    fn retn(&mut self) -> &mut Self {
        self.raw(OP_RETN, TY_NONE)
    }

    fn finish(mut self) -> Vec<u8> {
        for (pos, next, label) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(label)
                .unwrap_or_else(|| panic!("undefined label {label}"));
            let rel = target as i64 - next as i64;
            self.body[pos..pos + 4].copy_from_slice(&(rel as i32).to_be_bytes());
        }
        let mut out = Vec::with_capacity(HEADER_LEN as usize + self.body.len());
        out.extend_from_slice(b"NCS V1.0");
        out.push(OP_T);
        out.extend_from_slice(&((HEADER_LEN as usize + self.body.len()) as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

fn run(bytes: &[u8], cfg: &Config) -> ncsdec::Decompiled {
    decompile(bytes, &actions(), cfg, None).expect("decompile")
}

#[test]
fn s1_call_to_empty_subroutine() {
    let mut a = Asm::new();
    a.jump(OP_JSR, "fn_a").retn();
    a.label("fn_a").retn();
    let result = run(&a.finish(), &Config::default());

    // fn_a lands at 0x15: prototype, empty definition, call from main.
    assert!(result.source.contains("void fn_15();\n"));
    assert!(result.source.contains("void fn_15() {\n}\n"));
    assert!(result.source.contains("void main() {\n    fn_15();\n}\n"));
}

/// `fn_a(n)` and `fn_b(n)` call each other with an int base case each.
fn mutual_recursion_image() -> Vec<u8> {
    let mut a = Asm::new();
    // main: fn_a(5); (result discarded)
    a.const_i(5);
    a.jump(OP_JSR, "fn_a");
    a.movsp(-4);
    a.retn();

    a.label("fn_a");
    a.stack_op(OP_CPTOPBP, -4, 4);
    a.const_i(0);
    a.binop(OP_EQUAL, TY_II);
    a.jump(OP_JZ, "a_rec");
    a.const_i(1);
    a.retn();
    a.label("a_rec");
    a.stack_op(OP_CPTOPBP, -4, 4);
    a.const_i(1);
    a.binop(OP_SUB, TY_II);
    a.jump(OP_JSR, "fn_b");
    a.retn();

    a.label("fn_b");
    a.stack_op(OP_CPTOPBP, -4, 4);
    a.const_i(0);
    a.binop(OP_EQUAL, TY_II);
    a.jump(OP_JZ, "b_rec");
    a.const_i(0);
    a.retn();
    a.label("b_rec");
    a.stack_op(OP_CPTOPBP, -4, 4);
    a.const_i(1);
    a.binop(OP_SUB, TY_II);
    a.jump(OP_JSR, "fn_a");
    a.retn();

    a.finish()
}

#[test]
fn s2_mutual_recursion_converges_to_int_int() {
    let bytes = mutual_recursion_image();

    let lax = run(&bytes, &Config::default());
    let strict = decompile(
        &bytes,
        &actions(),
        &Config {
            strict_signatures: true,
            ..Config::default()
        },
        None,
    )
    .expect("strict mode must succeed once signatures converge");

    for result in [&lax, &strict] {
        // Both subroutines get the same int(int) signature.
        let sigs: Vec<&str> = result
            .source
            .lines()
            .filter(|l| l.starts_with("int fn_") && l.ends_with(");"))
            .collect();
        assert_eq!(sigs.len(), 2, "source:\n{}", result.source);
        for s in &sigs {
            assert!(s.contains("(int param0)"), "signature: {}", s);
        }
    }
    assert!(lax
        .diagnostics
        .iter()
        .all(|d| d.code != DiagnosticCode::AnyParameter && d.code != DiagnosticCode::AnyReturn));
}

#[test]
fn s3_counting_loop_emits_while() {
    let mut a = Asm::new();
    // int i = 0; while (i < 10) i++;
    a.rsadd(TY_INT);
    a.const_i(0);
    a.stack_op(OP_CPDOWNSP, -8, 4);
    a.movsp(-4);
    a.label("loop");
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.const_i(10);
    a.binop(OP_LT, TY_II);
    a.jump(OP_JZ, "exit");
    a.incisp(-4);
    a.jump(OP_JMP, "loop");
    a.label("exit");
    a.movsp(-4);
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(
        result.source.contains("while (var_d < 10) {\n        var_d++;\n    }"),
        "source:\n{}",
        result.source
    );
    assert!(!result.source.contains("for ("));
}

#[test]
fn for_loop_with_body_is_rewritten() {
    let mut a = Asm::new();
    // int i = 0; while (i < 5) { PrintInteger(i); i++; } == for loop
    a.rsadd(TY_INT);
    a.const_i(0);
    a.stack_op(OP_CPDOWNSP, -8, 4);
    a.movsp(-4);
    a.label("loop");
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.const_i(5);
    a.binop(OP_LT, TY_II);
    a.jump(OP_JZ, "exit");
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.action(4, 1); // PrintInteger(i)
    a.incisp(-4);
    a.jump(OP_JMP, "loop");
    a.label("exit");
    a.movsp(-4);
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(
        result
            .source
            .contains("for (var_d = 0; var_d < 5; var_d++) {"),
        "source:\n{}",
        result.source
    );
    assert!(result.source.contains("int var_d;"));
    assert!(result.source.contains("PrintInteger(var_d);"));
}

#[test]
fn do_while_loop() {
    let mut a = Asm::new();
    // int i = 0; do { i++; } while (i < 3);
    a.rsadd(TY_INT);
    a.const_i(0);
    a.stack_op(OP_CPDOWNSP, -8, 4);
    a.movsp(-4);
    a.label("body");
    a.incisp(-4);
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.const_i(3);
    a.binop(OP_LT, TY_II);
    a.jump(OP_JNZ, "body");
    a.movsp(-4);
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(
        result
            .source
            .contains("do {\n        var_d++;\n    } while (var_d < 3);"),
        "source:\n{}",
        result.source
    );
}

#[test]
fn s4_switch_with_three_cases() {
    let mut a = Asm::new();
    // int x = 2; switch (x) { case 1: ..., case 2: ..., default: ... }
    a.rsadd(TY_INT);
    a.const_i(2);
    a.stack_op(OP_CPDOWNSP, -8, 4);
    a.movsp(-4);
    a.stack_op(OP_CPTOPSP, -4, 4); // discriminant copy
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.const_i(1);
    a.binop(OP_EQUAL, TY_II);
    a.jump(OP_JNZ, "case1");
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.const_i(2);
    a.binop(OP_EQUAL, TY_II);
    a.jump(OP_JNZ, "case2");
    a.jump(OP_JMP, "default");
    a.label("case1");
    a.const_i(1);
    a.action(4, 1);
    a.jump(OP_JMP, "merge");
    a.label("case2");
    a.const_i(2);
    a.action(4, 1);
    a.jump(OP_JMP, "merge");
    a.label("default");
    a.const_i(0);
    a.action(4, 1);
    a.label("merge");
    a.movsp(-8);
    a.retn();

    let result = run(&a.finish(), &Config::default());
    let src = &result.source;
    assert!(src.contains("switch (var_d) {"), "source:\n{}", src);
    assert!(src.contains("case 1:"));
    assert!(src.contains("case 2:"));
    let default_pos = src.find("default:").expect("default case");
    assert!(src.rfind("case 2:").unwrap() < default_pos, "default last");
    assert!(src.contains("break;"));
}

#[test]
fn s5_action_call_keeps_all_arguments_in_order() {
    let mut a = Asm::new();
    // SetListenPattern(OBJECT_SELF, "hi", 3): last argument pushed first.
    a.const_i(3);
    a.const_s("hi");
    a.const_o(0);
    a.action(33, 3);
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(
        result
            .source
            .contains("SetListenPattern(OBJECT_SELF, \"hi\", 3);"),
        "source:\n{}",
        result.source
    );
}

#[test]
fn s6_jump_into_instruction_middle_is_fatal() {
    let mut a = Asm::new();
    a.jump_rel(OP_JMP, 1);
    a.retn();
    a.retn();
    let err = decompile(&a.finish(), &actions(), &Config::default(), None).unwrap_err();
    assert!(matches!(err, DecompileError::UnresolvedJump { .. }));
}

#[test]
fn vector_literal_folds_from_three_float_pushes() {
    let mut a = Asm::new();
    a.const_f(1.0);
    a.const_f(2.0);
    a.const_f(3.0);
    a.action(34, 1); // SetFacingPoint(vector)
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(
        result
            .source
            .contains("SetFacingPoint([1.0, 2.0, 3.0]);"),
        "source:\n{}",
        result.source
    );
}

#[test]
fn store_state_becomes_deferred_body() {
    let mut a = Asm::new();
    a.storestate(0, 0);
    a.jump(OP_JMP, "after");
    a.const_s("hi");
    a.action(1, 1); // PrintString
    a.retn();
    a.label("after");
    a.const_f(1.5);
    a.action(7, 2); // DelayCommand(float, action)
    a.retn();

    let result = run(&a.finish(), &Config::default());
    let src = &result.source;
    // Body offset: STORESTATE (10 bytes) + JMP (6 bytes) after the header.
    assert!(src.contains("void sta_1d();"), "source:\n{}", src);
    assert!(src.contains("void sta_1d() {\n    PrintString(\"hi\");\n}"));
    assert!(src.contains("DelayCommand(1.5, sta_1d());"));
}

#[test]
fn negative_zero_float_normalizes() {
    let mut a = Asm::new();
    a.const_f(-0.0);
    a.action(2, 1); // PrintFloat with one provided argument
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(result.source.contains("PrintFloat(0.0);"));
}

#[test]
fn unread_parameters_infer_arity_zero() {
    let mut a = Asm::new();
    a.jump(OP_JSR, "fn_a");
    a.retn();
    a.label("fn_a");
    a.const_i(7);
    a.movsp(-4);
    a.retn();

    let result = run(&a.finish(), &Config::default());
    assert!(result.source.contains("void fn_15() {"));
    assert!(!result.source.contains("param0"));
}

#[test]
fn tail_recursion_is_a_single_component_with_propagated_return() {
    let mut a = Asm::new();
    // main: fn_a(3);
    a.const_i(3);
    a.jump(OP_JSR, "fn_a");
    a.movsp(-4);
    a.retn();
    // fn_a(n): if (n == 0) return 0; return fn_a(n - 1);
    a.label("fn_a");
    a.stack_op(OP_CPTOPBP, -4, 4);
    a.const_i(0);
    a.binop(OP_EQUAL, TY_II);
    a.jump(OP_JZ, "rec");
    a.const_i(0);
    a.retn();
    a.label("rec");
    a.stack_op(OP_CPTOPBP, -4, 4);
    a.const_i(1);
    a.binop(OP_SUB, TY_II);
    a.jump(OP_JSR, "fn_a");
    a.retn();

    let strict = decompile(
        &a.finish(),
        &actions(),
        &Config {
            strict_signatures: true,
            ..Config::default()
        },
        None,
    )
    .expect("self-recursive signature must converge");
    assert!(
        strict.source.contains("int fn_21(int param0);"),
        "source:\n{}",
        strict.source
    );
}

#[test]
fn unresolved_return_type_is_fatal_only_in_strict_mode() {
    let mut a = Asm::new();
    a.jump(OP_JSR, "fn_a");
    a.retn();
    a.label("fn_a");
    a.jump(OP_JSR, "fn_b");
    a.retn();
    a.label("fn_b");
    a.jump(OP_JSR, "fn_a");
    a.retn();
    let bytes = a.finish();

    let lax = run(&bytes, &Config::default());
    assert!(lax
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::AnyReturn));

    let err = decompile(
        &bytes,
        &actions(),
        &Config {
            strict_signatures: true,
            ..Config::default()
        },
        None,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DecompileError::UnresolvedSignature { .. }
    ));
}

#[test]
fn decompilation_is_deterministic() {
    let bytes = mutual_recursion_image();
    let first = run(&bytes, &Config::default());
    let second = run(&bytes, &Config::default());
    assert_eq!(first.source, second.source);
}

#[test]
fn dead_subroutines_prune_unless_kept() {
    let mut a = Asm::new();
    a.retn();
    // fn_a is only the target of its own JSR; nothing reaches it from main.
    a.label("fn_a");
    a.jump(OP_JSR, "fn_a");
    a.retn();
    let bytes = a.finish();

    let pruned = run(&bytes, &Config::default());
    assert!(!pruned.source.contains("fn_"), "source:\n{}", pruned.source);
    assert!(pruned
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::DeadCode));

    let kept = run(
        &bytes,
        &Config {
            prune_dead: false,
            ..Config::default()
        },
    );
    assert!(kept.source.contains("fn_f("), "source:\n{}", kept.source);
}

#[test]
fn cancellation_short_circuits() {
    let token = CancelToken::new();
    token.cancel();
    let mut a = Asm::new();
    a.retn();
    let err = decompile(&a.finish(), &actions(), &Config::default(), Some(&token)).unwrap_err();
    assert!(matches!(err, DecompileError::Cancelled));
}

#[test]
fn stack_underflow_is_fatal() {
    let mut a = Asm::new();
    a.binop(0x14, TY_II); // ADD with nothing on the stack
    a.retn();
    let err = decompile(&a.finish(), &actions(), &Config::default(), None).unwrap_err();
    assert!(matches!(err, DecompileError::StackUnderflow { .. }));
}

#[test]
fn missing_action_is_fatal() {
    let mut a = Asm::new();
    a.const_i(1);
    a.action(999, 1);
    a.retn();
    let err = decompile(&a.finish(), &actions(), &Config::default(), None).unwrap_err();
    assert!(matches!(
        err,
        DecompileError::ActionTableMissing { index: 999 }
    ));
}

#[test]
fn disassembly_lists_labels_and_action_names() {
    let mut a = Asm::new();
    a.jump(OP_JSR, "fn_a");
    a.retn();
    a.label("fn_a");
    a.const_s("hi");
    a.action(1, 1);
    a.retn();

    let table = actions();
    let listing = disasm::disassemble(&a.finish(), Some(&table)).expect("disassemble");
    assert!(listing.contains("fn_15:"));
    assert!(listing.contains("JSR"));
    assert!(listing.contains("\"PrintString\""));
}

#[test]
fn roundtrip_normalization_accepts_emitted_source() {
    // The emitted text for the counting loop, hand-written the way a script
    // author would, must normalize to the same string as the decompiler
    // output.
    let mut a = Asm::new();
    a.rsadd(TY_INT);
    a.const_i(0);
    a.stack_op(OP_CPDOWNSP, -8, 4);
    a.movsp(-4);
    a.label("loop");
    a.stack_op(OP_CPTOPSP, -4, 4);
    a.const_i(10);
    a.binop(OP_LT, TY_II);
    a.jump(OP_JZ, "exit");
    a.incisp(-4);
    a.jump(OP_JMP, "loop");
    a.label("exit");
    a.movsp(-4);
    a.retn();
    let result = run(&a.finish(), &Config::default());

    let reference = "// counting loop\nvoid main() {\n    int var_d = 0;\n    while (var_d < 10) {\n        var_d++; // bump\n    }\n}\n";
    let diff = ncsdec::diff::unified_diff(
        &ncsdec::diff::normalize_nss(reference),
        &ncsdec::diff::normalize_nss(&result.source),
    );
    assert_eq!(diff, "", "normalized sources differ:\n{}", diff);
}
