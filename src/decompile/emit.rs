//! Tree-to-text serialization of the structured AST.
//!
//! Identifier synthesis is deterministic: every generated name is a
//! function of the entity's defining offset (lowercase hex, no padding).
//! Output uses four-space indentation, LF line endings, no trailing
//! whitespace, and a mandatory final newline.

use crate::types::Type;

use super::ast::{FunctionDef, Stmt};
use super::link::{Program, SubKind};
use super::proto::Prototypes;

pub fn var_name(offset: u32) -> String {
    format!("var_{:x}", offset)
}

pub fn param_name(index: usize) -> String {
    format!("param{}", index)
}

pub fn label_name(offset: u32) -> String {
    format!("loc_{:x}", offset)
}

/// Synthesized name of a subroutine. The program entry emits as `main`, or
/// `StartingConditional` when it returns int; store-state bodies get the
/// `sta_` scheme.
pub fn sub_name(program: &Program, protos: &Prototypes, entry: u32) -> String {
    if entry == program.entry {
        return if protos.get(entry).return_type == Type::Int {
            "StartingConditional".to_string()
        } else {
            "main".to_string()
        };
    }
    match program.sub(entry).map(|s| s.kind) {
        Some(SubKind::StateBody) => format!("sta_{:x}", entry),
        _ => format!("fn_{:x}", entry),
    }
}

/// Serializes the whole program: forward prototypes first, then function
/// definitions in entry-offset order with the entry point last.
pub fn emit_program(funcs: &[FunctionDef], entry: u32) -> String {
    let mut w = Writer::new();

    let helpers: Vec<&FunctionDef> = funcs.iter().filter(|f| f.entry != entry).collect();
    for f in &helpers {
        w.line(&format!("{};", signature(f)));
    }
    if !helpers.is_empty() {
        w.blank();
    }

    let mut ordered: Vec<&FunctionDef> = helpers;
    if let Some(main) = funcs.iter().find(|f| f.entry == entry) {
        ordered.push(main);
    }

    for (i, f) in ordered.iter().enumerate() {
        if i != 0 {
            w.blank();
        }
        w.line(&format!("{} {{", signature(f)));
        w.indent += 1;
        for s in &f.body {
            emit_stmt(&mut w, s);
        }
        w.indent -= 1;
        w.line("}");
    }

    w.out
}

fn signature(f: &FunctionDef) -> String {
    let params = f
        .params
        .iter()
        .map(|(t, n)| format!("{} {}", t.keyword(), n))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} {}({})", f.return_type.keyword(), f.name, params)
}

struct Writer {
    out: String,
    indent: usize,
}

impl Writer {
    fn new() -> Self {
        Writer {
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }
}

fn emit_stmt(w: &mut Writer, stmt: &Stmt) {
    match stmt {
        Stmt::VarDecl { ty, name, init } => match init {
            Some(e) => w.line(&format!("{} {} = {};", ty.keyword(), name, e)),
            None => w.line(&format!("{} {};", ty.keyword(), name)),
        },
        Stmt::Expr(e) => w.line(&format!("{};", e)),
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => emit_if(w, "", cond, then_body, else_body.as_deref()),
        Stmt::While { cond, body } => {
            w.line(&format!("while ({}) {{", cond));
            emit_body(w, body);
            w.line("}");
        }
        Stmt::DoWhile { body, cond } => {
            w.line("do {");
            emit_body(w, body);
            w.line(&format!("}} while ({});", cond));
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => {
            let init = init.as_ref().map(|e| e.to_string()).unwrap_or_default();
            let step = step.as_ref().map(|e| e.to_string()).unwrap_or_default();
            w.line(&format!("for ({}; {}; {}) {{", init, cond, step));
            emit_body(w, body);
            w.line("}");
        }
        Stmt::Switch {
            disc,
            cases,
            default,
        } => {
            w.line(&format!("switch ({}) {{", disc));
            w.indent += 1;
            for case in cases {
                for v in &case.values {
                    w.line(&format!("case {}:", v));
                }
                emit_body(w, &case.body);
            }
            if let Some(d) = default {
                w.line("default:");
                emit_body(w, d);
            }
            w.indent -= 1;
            w.line("}");
        }
        Stmt::Break => w.line("break;"),
        Stmt::Continue => w.line("continue;"),
        Stmt::Return(Some(e)) => w.line(&format!("return {};", e)),
        Stmt::Return(None) => w.line("return;"),
        Stmt::UnstructuredJump(label) => w.line(&format!("// goto {};", label)),
    }
}

fn emit_body(w: &mut Writer, body: &[Stmt]) {
    w.indent += 1;
    for s in body {
        emit_stmt(w, s);
    }
    w.indent -= 1;
}

/// `else` containing a single `if` collapses to `else if (...)`.
fn emit_if(
    w: &mut Writer,
    prefix: &str,
    cond: &super::ast::Expr,
    then_body: &[Stmt],
    else_body: Option<&[Stmt]>,
) {
    w.line(&format!("{}if ({}) {{", prefix, cond));
    emit_body(w, then_body);
    w.line("}");
    if let Some(eb) = else_body {
        if let [Stmt::If {
            cond: c2,
            then_body: t2,
            else_body: e2,
        }] = eb
        {
            emit_if(w, "else ", c2, t2, e2.as_deref());
        } else {
            w.line("else {");
            emit_body(w, eb);
            w.line("}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompile::ast::{BinOp, Expr};

    fn ident(s: &str) -> Expr {
        Expr::Ident(s.to_string())
    }

    #[test]
    fn emits_definitions_with_prototypes_and_entry_last() {
        let funcs = vec![
            FunctionDef {
                name: "main".into(),
                entry: 13,
                return_type: Type::Void,
                params: vec![],
                body: vec![Stmt::Expr(Expr::UserCall {
                    name: "fn_20".into(),
                    entry: 0x20,
                    args: vec![],
                })],
            },
            FunctionDef {
                name: "fn_20".into(),
                entry: 0x20,
                return_type: Type::Void,
                params: vec![],
                body: vec![],
            },
        ];
        let text = emit_program(&funcs, 13);
        assert_eq!(
            text,
            "void fn_20();\n\nvoid fn_20() {\n}\n\nvoid main() {\n    fn_20();\n}\n"
        );
    }

    #[test]
    fn else_if_collapses() {
        let inner = Stmt::If {
            cond: Expr::Binary(BinOp::Eq, Box::new(ident("x")), Box::new(Expr::IntLit(2))),
            then_body: vec![Stmt::Return(None)],
            else_body: None,
        };
        let outer = Stmt::If {
            cond: Expr::Binary(BinOp::Eq, Box::new(ident("x")), Box::new(Expr::IntLit(1))),
            then_body: vec![Stmt::Return(None)],
            else_body: Some(vec![inner]),
        };
        let f = FunctionDef {
            name: "main".into(),
            entry: 13,
            return_type: Type::Void,
            params: vec![],
            body: vec![outer],
        };
        let text = emit_program(&[f], 13);
        assert!(text.contains("else if (x == 2) {"));
        assert!(!text.contains("else {\n        if"));
    }

    #[test]
    fn output_has_no_trailing_whitespace_and_ends_with_newline() {
        let f = FunctionDef {
            name: "main".into(),
            entry: 13,
            return_type: Type::Void,
            params: vec![],
            body: vec![Stmt::VarDecl {
                ty: Type::Int,
                name: "var_14".into(),
                init: Some(Expr::IntLit(3)),
            }],
        };
        let text = emit_program(&[f], 13);
        assert!(text.ends_with('\n'));
        for line in text.lines() {
            assert_eq!(line, line.trim_end());
        }
    }
}
