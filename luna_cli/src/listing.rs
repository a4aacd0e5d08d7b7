//! Human-readable listings of compiled prototypes, in the spirit of
//! `luac -l`.

use std::fmt::Write as _;

use luna_bytecode::{OpMode, Proto, Value};

fn const_text(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::False => "false".to_string(),
        Value::True => "true".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{:?}", f),
        Value::Str(s) => format!("{:?}", s.display()),
    }
}

fn instr_text(p: &Proto, pc: usize) -> String {
    let i = p.code[pc];
    let Some(op) = i.opcode() else {
        return format!("<invalid {:#010x}>", i.0);
    };
    let args = match op.mode() {
        OpMode::IAbc => format!("{} {} {} {}", i.a(), i.b(), i.c(), i.k()),
        OpMode::IvAbc => format!("{} {} {} {}", i.a(), i.vb(), i.vc(), i.k()),
        OpMode::IABx => format!("{} {}", i.a(), i.bx()),
        OpMode::IAsBx => format!("{} {}", i.a(), i.sbx()),
        OpMode::IAx => format!("{}", i.ax_arg()),
        OpMode::IsJ => format!("{}", i.sj_arg()),
    };
    let line = p
        .line_at(pc)
        .map(|l| l.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("\t{}\t[{}]\t{}\t{}", pc + 1, line, op.name(), args)
}

/// Render one prototype (and optionally its children) as a listing.
pub fn list_proto(p: &Proto, recurse: bool) -> String {
    let mut out = String::new();
    let source = p
        .source
        .as_ref()
        .map(|s| s.display().into_owned())
        .unwrap_or_else(|| "?".to_string());
    let what = if p.line_defined == 0 { "main" } else { "function" };
    let vararg = if p.is_vararg() { "+" } else { "" };
    writeln!(
        out,
        "{} <{}:{},{}> ({} instructions)",
        what,
        source,
        p.line_defined,
        p.last_line_defined,
        p.code.len()
    )
    .unwrap();
    writeln!(
        out,
        "{}{} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
        p.num_params,
        vararg,
        p.max_stack_size,
        p.upvalues.len(),
        p.loc_vars.len(),
        p.constants.len(),
        p.protos.len()
    )
    .unwrap();
    for pc in 0..p.code.len() {
        writeln!(out, "{}", instr_text(p, pc)).unwrap();
    }
    if !p.constants.is_empty() {
        writeln!(out, "constants ({}):", p.constants.len()).unwrap();
        for (i, v) in p.constants.iter().enumerate() {
            writeln!(out, "\t{}\t{}", i, const_text(v)).unwrap();
        }
    }
    if !p.upvalues.is_empty() {
        writeln!(out, "upvalues ({}):", p.upvalues.len()).unwrap();
        for (i, uv) in p.upvalues.iter().enumerate() {
            let name = uv
                .name
                .as_ref()
                .map(|n| n.display().into_owned())
                .unwrap_or_else(|| "-".to_string());
            writeln!(out, "\t{}\t{}\t{}\t{}", i, name, uv.in_stack as u8, uv.index).unwrap();
        }
    }
    if recurse {
        for child in &p.protos {
            out.push('\n');
            out.push_str(&list_proto(child, true));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use luna_parser::compile_str;

    #[test]
    fn listing_shows_header_and_opcodes() {
        let closure = compile_str("local a = 1\nreturn a", "=listing").unwrap();
        let text = list_proto(&closure.proto, true);
        assert!(text.contains("main <listing:0,0>"));
        assert!(text.contains("VARARGPREP"));
        assert!(text.contains("LOADI"));
        assert!(text.contains("RETURN1"));
    }

    #[test]
    fn listing_recurses_into_children() {
        let closure = compile_str("local f = function() return 'x' end", "=l").unwrap();
        let text = list_proto(&closure.proto, true);
        assert!(text.contains("CLOSURE"));
        assert!(text.contains("function <l:"));
        assert!(text.contains("\"x\""));
    }
}
