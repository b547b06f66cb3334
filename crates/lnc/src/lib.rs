//! `lnc` compiles the event-driven language Ln to AMM, the textual
//! three-address assembly consumed by the graphcode toolchain.
//!
//! The pipeline is strictly sequential: parse each module with the PEG
//! combinator grammar, load the import graph topologically, populate
//! module/export scope pairs, check event handlers, lower handler bodies to
//! three-address statements while inference runs to a fixed point, and
//! serialize the resolved program as AMM text.
//!
//! The two entry points are [`compile_file`] and [`compile_string`]; both
//! have `_with` variants taking [`CompileOptions`].

mod amm;
mod error;
mod function;
mod grammar;
mod ir;
mod loader;
mod lower;
mod module;
mod opcode;
mod peg;
mod program;
mod scope;
mod types;

use std::path::Path;

use log::debug;

pub use crate::{
    error::{CompileError, CompileResult, ErrorKind, SourceLoc},
    loader::CompileOptions,
};
use crate::program::Program;

/// Compiles the program rooted at an entry file to AMM text.
pub fn compile_file(path: impl AsRef<Path>) -> CompileResult<String> {
    compile_file_with(path, &CompileOptions::default())
}

/// [`compile_file`] with explicit options.
pub fn compile_file_with(path: impl AsRef<Path>, options: &CompileOptions) -> CompileResult<String> {
    let mut prog = Program::new();
    loader::load_entry_file(&mut prog, path.as_ref(), options)?;
    finish(&mut prog)
}

/// Compiles an in-memory source as an anonymous entry module. Only
/// `@std/…` imports are available (there is no directory to resolve local
/// imports against).
pub fn compile_string(source: &str) -> CompileResult<String> {
    compile_string_with(source, &CompileOptions::default())
}

/// [`compile_string`] with explicit options.
pub fn compile_string_with(source: &str, options: &CompileOptions) -> CompileResult<String> {
    let mut prog = Program::new();
    loader::load_entry_string(&mut prog, source, options)?;
    finish(&mut prog)
}

fn finish(prog: &mut Program) -> CompileResult<String> {
    debug!("checking event handlers");
    function::check_event_handlers(prog)?;
    debug!("lowering handlers");
    lower::lower_program(prog)?;
    debug!("emitting AMM");
    amm::emit(prog)
}
