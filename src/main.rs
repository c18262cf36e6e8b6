// SPDX-License-Identifier: MIT
//
// ncsdec
//
// A decompiler for NWScript compiled bytecode (NCS) as used by the
// Aurora/Odyssey engines. Parses the instruction stream, rebuilds
// subroutine signatures and structured control flow, and emits NSS source.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use ncsdec::decompile::{decompile, Config, Game};
use ncsdec::{disasm, ActionTable};

#[derive(Parser)]
#[command(name = "ncsdec", version, about = "NWScript NCS bytecode parser and decompiler")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GameArg {
    K1,
    K2,
}

impl From<GameArg> for Game {
    fn from(g: GameArg) -> Game {
        match g {
            GameArg::K1 => Game::K1,
            GameArg::K2 => Game::K2,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Disassemble an NCS file into a flat listing with labels.
    Disasm {
        file: PathBuf,
        /// nwscript source used to resolve action names.
        #[arg(long)]
        nwscript: Option<PathBuf>,
    },

    /// Decompile an NCS file back to NSS source.
    Decompile {
        file: PathBuf,
        /// nwscript source holding the action table; defaults to the
        /// game's conventional file name in the current directory.
        #[arg(long)]
        nwscript: Option<PathBuf>,
        /// Action table to use.
        #[arg(long, value_enum, default_value = "k1")]
        game: GameArg,
        /// Fail if any reachable subroutine keeps an unresolved slot.
        #[arg(long)]
        strict_signatures: bool,
        /// Cap on signature fixed-point passes per call-graph component.
        #[arg(long, default_value_t = 16)]
        max_iterations: usize,
        /// Keep subroutines unreachable from the entry point.
        #[arg(long)]
        keep_dead: bool,
        /// Write output here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Dump the parsed action table in its debug form.
    Actions { nwscript: PathBuf },
}

fn load_actions(path: &PathBuf) -> Result<ActionTable> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    Ok(ActionTable::parse(&text))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Disasm { file, nwscript } => {
            let data = std::fs::read(&file).with_context(|| format!("read {:?}", file))?;
            let actions = nwscript.as_ref().map(load_actions).transpose()?;
            let listing = disasm::disassemble(&data, actions.as_ref())
                .context("disassemble NCS bytecode")?;
            print!("{}", listing);
        }

        Command::Decompile {
            file,
            nwscript,
            game,
            strict_signatures,
            max_iterations,
            keep_dead,
            output,
        } => {
            let game: Game = game.into();
            let data = std::fs::read(&file).with_context(|| format!("read {:?}", file))?;
            let table_path =
                nwscript.unwrap_or_else(|| PathBuf::from(game.nwscript_file()));
            let actions = load_actions(&table_path)?;

            let cfg = Config {
                strict_signatures,
                game,
                max_iterations,
                prune_dead: !keep_dead,
            };
            let result = decompile(&data, &actions, &cfg, None).context("decompile NCS")?;
            for d in &result.diagnostics {
                eprintln!("{}", d);
            }
            match output {
                Some(path) => std::fs::write(&path, &result.source)
                    .with_context(|| format!("write {:?}", path))?,
                None => print!("{}", result.source),
            }
        }

        Command::Actions { nwscript } => {
            let actions = load_actions(&nwscript)?;
            print!("{}", actions.dump());
        }
    }
    Ok(())
}
