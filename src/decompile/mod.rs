//! Decompilation pipeline: bytecode reading, structural linking, call-graph
//! and SCC analysis, fixed-point signature inference, symbolic stack
//! simulation, control-flow structuring, and NSS emission, composed behind
//! a single `decompile` entry point.

pub mod ast;
pub mod callgraph;
pub mod emit;
pub mod link;
pub mod proto;
pub mod scc;
pub mod sim;
pub mod stack;
pub mod structure;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::actions::ActionTable;
use crate::error::{DecompileError, Diagnostic, DiagnosticCode};
use crate::reader;

use ast::FunctionDef;
use emit::{param_name, sub_name};

/// Which game's action catalogue the script targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Game {
    K1,
    K2,
}

impl Game {
    /// Conventional file name of the companion nwscript source.
    pub fn nwscript_file(self) -> &'static str {
        match self {
            Game::K1 => "k1_nwscript.nss",
            Game::K2 => "tsl_nwscript.nss",
        }
    }
}

/// Pipeline configuration. There is no process-wide state; everything the
/// stages need travels through this value.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fail if any reachable subroutine keeps an `any` slot.
    pub strict_signatures: bool,
    pub game: Game,
    /// Cap on fixed-point passes within one SCC.
    pub max_iterations: usize,
    /// Drop subroutines unreachable from the entry point.
    pub prune_dead: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            strict_signatures: false,
            game: Game::K1,
            max_iterations: 16,
            prune_dead: true,
        }
    }
}

/// Cooperative cancellation handle, checked between stages and between
/// SCCs. Cancellation yields `DecompileError::Cancelled` with no partial
/// output.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Decompiled {
    pub source: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Decompiles an NCS image to NSS source. Pure in the functional sense:
/// identical inputs produce byte-identical output.
pub fn decompile(
    bytes: &[u8],
    actions: &ActionTable,
    cfg: &Config,
    cancel: Option<&CancelToken>,
) -> Result<Decompiled, DecompileError> {
    let check = |c: Option<&CancelToken>| -> Result<(), DecompileError> {
        match c {
            Some(c) if c.is_cancelled() => Err(DecompileError::Cancelled),
            _ => Ok(()),
        }
    };

    let mut diagnostics = Vec::new();

    info!("reading {} bytes of bytecode", bytes.len());
    let instructions = reader::read_program(bytes)?;
    debug!("decoded {} instructions", instructions.len());

    check(cancel)?;
    let program = link::link(instructions)?;
    let dead_count = program.dead.iter().filter(|d| **d).count();
    if dead_count > 0 {
        diagnostics.push(Diagnostic::note(
            DiagnosticCode::DeadCode,
            format!("{} unreachable instruction(s) after RETN", dead_count),
        ));
    }
    debug!(
        "linked {} subroutine(s), entry at {:#x}",
        program.subroutines.len(),
        program.entry
    );

    check(cancel)?;
    let graph = callgraph::build(&program);

    check(cancel)?;
    info!(
        "inferring signatures for {} subroutine(s)",
        program.subroutines.len()
    );
    let protos = proto::infer(&program, &graph, actions, cfg, cancel, &mut diagnostics)?;

    check(cancel)?;
    let reachable = graph.reachable_from(program.entry);
    let mut funcs: Vec<FunctionDef> = Vec::new();
    for sub in &program.subroutines {
        if cfg.prune_dead && !reachable.contains(&sub.entry) {
            diagnostics.push(Diagnostic::note(
                DiagnosticCode::DeadCode,
                format!("pruned unreachable subroutine at {:#x}", sub.entry),
            ));
            continue;
        }
        check(cancel)?;

        let sig = protos.get(sub.entry);
        let blocks = sim::simulate(&program, sub.entry, &protos, actions)?;
        let mut body = structure::structure(&blocks, &mut diagnostics);
        if sig.return_type == crate::types::Type::Void
            && matches!(body.last(), Some(ast::Stmt::Return(None)))
        {
            body.pop();
        }

        let params = sig
            .params
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), param_name(i)))
            .collect();
        funcs.push(FunctionDef {
            name: sub_name(&program, &protos, sub.entry),
            entry: sub.entry,
            return_type: sig.return_type.clone(),
            params,
            body,
        });
    }

    check(cancel)?;
    let source = emit::emit_program(&funcs, program.entry);
    info!(
        "emitted {} function(s), {} diagnostic(s)",
        funcs.len(),
        diagnostics.len()
    );

    Ok(Decompiled {
        source,
        diagnostics,
    })
}
