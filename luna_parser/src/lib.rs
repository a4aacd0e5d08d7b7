//! Parsing and chunk loading for the Luna language.
//!
//! [`load`] is the one entry point: it sniffs the first byte of the
//! stream to dispatch between the text compiler and the binary loader,
//! honoring the mode string (`b` accept binary, `t` accept text, `B`
//! accept binary from a fixed buffer).

pub mod parser;

use luna_bytecode::dump::LUNA_SIGNATURE;
use luna_bytecode::{undump, Closure};
use luna_common::{LunaError, LunaResult};
use luna_lexer::ByteReader;

pub use parser::Parser;

fn check_mode(mode: &str, what: &str) -> LunaResult<()> {
    let c = what.as_bytes()[0] as char;
    if !mode.contains(c) {
        return Err(LunaError::syntax(format!(
            "attempt to load a {} chunk (mode is '{}')",
            what, mode
        )));
    }
    Ok(())
}

/// Load a chunk from `reader`: compile source text, or undump a binary
/// chunk when the stream starts with the signature byte. `mode` defaults
/// to `"bt"`.
pub fn load(mut reader: ByteReader, chunk_name: &str, mode: Option<&str>) -> LunaResult<Closure> {
    let mode = mode.unwrap_or("bt");
    let first = reader.next_byte()?;
    if first == Some(LUNA_SIGNATURE[0]) {
        let fixed = mode.contains('B');
        if !fixed {
            check_mode(mode, "binary")?;
        }
        let mut input = vec![LUNA_SIGNATURE[0]];
        input.extend(reader.read_to_end()?);
        undump::undump(&input, chunk_name, fixed)
    } else {
        check_mode(mode, "text")?;
        log::debug!("load: compiling text chunk '{}'", chunk_name);
        parser::compile(reader, chunk_name, first)
    }
}

/// Convenience wrapper over [`load`] for in-memory sources.
pub fn load_bytes(source: &[u8], chunk_name: &str, mode: Option<&str>) -> LunaResult<Closure> {
    load(ByteReader::from_slice(source), chunk_name, mode)
}

/// Compile a source string (text only).
pub fn compile_str(source: &str, chunk_name: &str) -> LunaResult<Closure> {
    load_bytes(source.as_bytes(), chunk_name, Some("t"))
}
