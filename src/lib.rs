pub mod actions;
pub mod decompile;
pub mod diff;
pub mod disasm;
pub mod error;
pub mod ncs;
pub mod reader;
pub mod types;

pub use actions::ActionTable;
pub use decompile::{decompile, CancelToken, Config, Decompiled, Game};
pub use error::{DecompileError, Diagnostic};
pub use reader::read_program;
