//! Loading behavior: text/binary dispatch, mode strings, round trips,
//! and error reporting.

use luna_bytecode::dump::dump_to_vec;
use luna_bytecode::proto::PF_FIXED;
use luna_common::LunaError;
use luna_parser::{compile_str, load_bytes};
use pretty_assertions::assert_eq;

const SAMPLE: &str = "\
local function greet(name)
  return 'hello, ' .. name
end
return greet('world')
";

#[test]
fn dump_then_load_preserves_prototype() {
    let compiled = compile_str(SAMPLE, "@sample.luna").unwrap();
    let bytes = dump_to_vec(&compiled.proto, false);
    let loaded = load_bytes(&bytes, "@sample.luna", None).unwrap();
    assert_eq!(loaded.proto, compiled.proto);
}

#[test]
fn dump_of_loaded_chunk_is_byte_identical() {
    let compiled = compile_str(SAMPLE, "@sample.luna").unwrap();
    let bytes = dump_to_vec(&compiled.proto, false);
    let loaded = load_bytes(&bytes, "@sample.luna", None).unwrap();
    assert_eq!(dump_to_vec(&loaded.proto, false), bytes);
}

#[test]
fn text_mode_rejects_binary() {
    let compiled = compile_str("return 1", "=t").unwrap();
    let bytes = dump_to_vec(&compiled.proto, false);
    let err = load_bytes(&bytes, "=t", Some("t")).unwrap_err();
    assert!(err
        .message()
        .contains("attempt to load a binary chunk (mode is 't')"));
}

#[test]
fn binary_mode_rejects_text() {
    let err = load_bytes(b"return 1", "=t", Some("b")).unwrap_err();
    assert!(err
        .message()
        .contains("attempt to load a text chunk (mode is 'b')"));
}

#[test]
fn fixed_buffer_mode_marks_prototypes() {
    let compiled = compile_str("return 1", "=t").unwrap();
    let bytes = dump_to_vec(&compiled.proto, false);
    let loaded = load_bytes(&bytes, "=t", Some("B")).unwrap();
    assert!(loaded.proto.flag & PF_FIXED != 0);
}

#[test]
fn syntax_errors_carry_position_and_token() {
    let err = compile_str("local = 1", "=bad").unwrap_err();
    assert!(matches!(err, LunaError::Syntax { .. }));
    assert!(err.message().starts_with("bad:1:"), "got: {}", err.message());
    assert!(err.message().contains("<name> expected"));

    let err = compile_str("x = (1\n\n", "=bad").unwrap_err();
    assert!(err.message().contains("')' expected (to close '(' at line 1)"));
}

#[test]
fn semantic_errors() {
    let err = compile_str("local a <const> = 1\na = 2", "=t").unwrap_err();
    assert!(err.message().contains("attempt to assign to const variable 'a'"));

    let err = compile_str("break", "=t").unwrap_err();
    assert!(err.message().contains("break outside loop"));

    let err = compile_str("goto nowhere", "=t").unwrap_err();
    assert!(err.message().contains("no visible label 'nowhere'"));

    let err = compile_str("local a <close>, b <close> = f(), g()", "=t").unwrap_err();
    assert!(err.message().contains("multiple to-be-closed variables"));

    let err = compile_str("local a <wat> = 1", "=t").unwrap_err();
    assert!(err.message().contains("unknown attribute 'wat'"));

    let err = compile_str("::l:: ::l::", "=t").unwrap_err();
    assert!(err.message().contains("label 'l' already defined"));

    // a named global declaration makes unlisted names errors
    let err = compile_str("global y\nx = 1", "=t").unwrap_err();
    assert!(err.message().contains("variable 'x' not declared"));

    let err = compile_str("local f = function() return ... end", "=t").unwrap_err();
    assert!(err
        .message()
        .contains("cannot use '...' outside a vararg function"));
}

#[test]
fn goto_into_scope_is_rejected() {
    let err = compile_str(
        "goto skip\nlocal x = 1\n::skip::\nreturn x",
        "=t",
    )
    .unwrap_err();
    assert!(err.message().contains("jumps into the scope of 'x'"), "got: {}", err.message());
}

#[test]
fn global_collective_declaration_allows_declared_names() {
    // declared names keep working under 'global *'
    assert!(compile_str("global x\nglobal *\nx = 1", "=t").is_ok());
    // and the collective itself declares everything
    assert!(compile_str("global *\nanything = 1", "=t").is_ok());
    // a <const> collective makes every global read-only
    let err = compile_str("global <const> *\nx = 1", "=t").unwrap_err();
    assert!(err.message().contains("attempt to assign to const variable 'x'"));
}

#[test]
fn stripped_chunks_reload() {
    let compiled = compile_str(SAMPLE, "@sample.luna").unwrap();
    let bytes = dump_to_vec(&compiled.proto, true);
    let loaded = load_bytes(&bytes, "@sample.luna", None).unwrap();
    assert!(loaded.proto.source.is_none());
    assert_eq!(loaded.proto.code, compiled.proto.code);
    assert_eq!(loaded.proto.constants, compiled.proto.constants);
    assert_eq!(loaded.proto.protos.len(), compiled.proto.protos.len());
}
