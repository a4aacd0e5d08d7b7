//! End-to-end compilation tests: exact instruction streams for small
//! chunks, plus the invariants every compiled prototype must satisfy.

use luna_bytecode::instruction::int2sc;
use luna_bytecode::{OpCode, Proto, Value};
use luna_parser::compile_str;
use pretty_assertions::assert_eq;

fn compile(src: &str) -> Proto {
    compile_str(src, "=test").expect("compilation failed").proto
}

fn ops(p: &Proto) -> Vec<OpCode> {
    p.code.iter().map(|i| i.opcode().unwrap()).collect()
}

#[test]
fn empty_chunk() {
    let p = compile("");
    assert_eq!(ops(&p), vec![OpCode::VarargPrep, OpCode::Return0]);
    assert_eq!(p.code[0].a(), 0);
    assert_eq!(p.max_stack_size, 2);
    assert_eq!(p.num_params, 0);
    assert!(p.is_vararg());
}

#[test]
fn whitespace_and_comments_only() {
    let p = compile("-- a comment\n--[[ long\ncomment ]]  \n");
    assert_eq!(ops(&p), vec![OpCode::VarargPrep, OpCode::Return0]);
}

#[test]
fn bare_return() {
    // the body's own return doubles as the final one
    let p = compile("return");
    assert_eq!(ops(&p), vec![OpCode::VarargPrep, OpCode::Return0]);
    assert_eq!(p.max_stack_size, 2);
    assert_eq!(p.num_params, 0);
}

#[test]
fn constant_folded_return() {
    let p = compile("return 1 + 2");
    assert_eq!(
        ops(&p),
        vec![OpCode::VarargPrep, OpCode::LoadI, OpCode::Return1]
    );
    assert_eq!(p.code[1].a(), 0);
    assert_eq!(p.code[1].sbx(), 3);
    assert_eq!(p.code[2].a(), 0);
    assert!(p.constants.is_empty());
}

#[test]
fn small_integer_locals_use_loadi() {
    let p = compile("local a = 1\nlocal b = 2");
    assert_eq!(
        ops(&p),
        vec![
            OpCode::VarargPrep,
            OpCode::LoadI,
            OpCode::LoadI,
            OpCode::Return0
        ]
    );
    assert!(p.constants.is_empty());
}

#[test]
fn nil_declarations_coalesce() {
    let p = compile("local a, b, c");
    assert_eq!(
        ops(&p),
        vec![OpCode::VarargPrep, OpCode::LoadNil, OpCode::Return0]
    );
    assert_eq!(p.code[1].a(), 0);
    assert_eq!(p.code[1].b(), 2); // sets R0..R2

    // consecutive declarations merge into the previous LOADNIL
    let p = compile("local a, b, c\nlocal d");
    assert_eq!(
        ops(&p),
        vec![OpCode::VarargPrep, OpCode::LoadNil, OpCode::Return0]
    );
    assert_eq!(p.code[1].b(), 3);
}

#[test]
fn table_constructor() {
    let p = compile("local t = {10, 20, 30}");
    assert_eq!(
        ops(&p),
        vec![
            OpCode::VarargPrep,
            OpCode::NewTable,
            OpCode::ExtraArg,
            OpCode::LoadI,
            OpCode::LoadI,
            OpCode::LoadI,
            OpCode::SetList,
            OpCode::Return0
        ]
    );
    let newtable = p.code[1];
    assert_eq!(newtable.a(), 0);
    assert_eq!(newtable.vb(), 0); // no hash part
    assert_eq!(newtable.vc(), 3); // array size 3
    assert_eq!(newtable.k(), 0);
    assert_eq!(p.code[2].ax_arg(), 0);
    let setlist = p.code[6];
    assert_eq!(setlist.a(), 0);
    assert_eq!(setlist.vb(), 3);
    assert_eq!(setlist.vc(), 0);
    assert!(p.max_stack_size >= 4);
}

#[test]
fn closure_child_prototype() {
    let p = compile("local f = function(x) return x + 1 end");
    assert_eq!(
        ops(&p),
        vec![OpCode::VarargPrep, OpCode::Closure, OpCode::Return0]
    );
    assert_eq!(p.code[1].bx(), 0);
    assert_eq!(p.protos.len(), 1);

    let child = &p.protos[0];
    assert_eq!(child.num_params, 1);
    assert!(!child.is_vararg());
    assert_eq!(
        ops(child),
        vec![
            OpCode::AddI,
            OpCode::MmBinI,
            OpCode::Return1,
            OpCode::Return0
        ]
    );
    let addi = child.code[0];
    assert_eq!(addi.a(), 1);
    assert_eq!(addi.b(), 0);
    assert_eq!(addi.sc(), 1); // sC-encoded immediate
    let mmbini = child.code[1];
    assert_eq!(mmbini.a(), 0);
    assert_eq!(mmbini.sb(), 1);
    assert_eq!(mmbini.c(), 6); // TM_ADD
    assert_eq!(mmbini.k(), 0);
    assert_eq!(child.code[2].a(), 1);
}

#[test]
fn or_of_globals_stays_testset_only() {
    let p = compile("a = b or c");
    assert_eq!(
        ops(&p),
        vec![
            OpCode::VarargPrep,
            OpCode::GetTabUp, // b
            OpCode::Test,     // degraded TESTSET: value already in place
            OpCode::Jmp,
            OpCode::GetTabUp, // c
            OpCode::SetTabUp, // a
            OpCode::Return0
        ]
    );
    // no boolean materialization: every jump came from a TESTSET
    assert!(!ops(&p).contains(&OpCode::LFalseSkip));
    assert!(!ops(&p).contains(&OpCode::LoadTrue));
}

#[test]
fn comparison_result_materializes_booleans() {
    let p = compile("local x = b < c");
    let o = ops(&p);
    assert!(o.contains(&OpCode::Lt));
    assert!(o.contains(&OpCode::LFalseSkip));
    assert!(o.contains(&OpCode::LoadTrue));
}

#[test]
fn numeric_for_layout() {
    let p = compile("for i = 1, 10 do print(i) end");
    assert_eq!(
        ops(&p),
        vec![
            OpCode::VarargPrep,
            OpCode::LoadI, // init
            OpCode::LoadI, // limit
            OpCode::LoadI, // step (default 1)
            OpCode::ForPrep,
            OpCode::GetTabUp, // print
            OpCode::Move,     // i
            OpCode::Call,
            OpCode::ForLoop,
            OpCode::Return0
        ]
    );
    assert_eq!(p.code[4].a(), 0); // FORPREP at base 0
    assert_eq!(p.code[8].a(), 0); // FORLOOP at base 0
    // FORPREP jumps to the FORLOOP
    assert_eq!(p.code[4].bx(), 3);
    // FORLOOP jumps back to the body
    assert_eq!(p.code[8].bx(), 4);
    assert!(p.max_stack_size >= 5); // 4 loop registers + call frame
}

#[test]
fn generic_for_emits_tbc_iteration() {
    let p = compile("for k, v in pairs(t) do end");
    let o = ops(&p);
    assert!(o.contains(&OpCode::TForPrep));
    assert!(o.contains(&OpCode::TForCall));
    assert!(o.contains(&OpCode::TForLoop));
    let tforcall_at = o.iter().position(|&op| op == OpCode::TForCall).unwrap();
    assert_eq!(p.code[tforcall_at].c(), 2); // two declared variables
}

#[test]
fn while_loop_with_break() {
    let p = compile("while x do break end");
    let o = ops(&p);
    // break is a goto: a jump plus its dead CLOSE placeholder
    assert!(o.contains(&OpCode::Jmp));
    assert!(o.contains(&OpCode::Close));
    let close_at = o.iter().position(|&op| op == OpCode::Close).unwrap();
    assert_eq!(p.code[close_at].b(), 1); // dead placeholder form
}

#[test]
fn repeat_until_loops_back() {
    let p = compile("repeat f() until x");
    let o = ops(&p);
    assert!(o.contains(&OpCode::Call));
    assert!(o.contains(&OpCode::Test));
}

#[test]
fn if_elseif_else() {
    let p = compile("if a then x = 1 elseif b then x = 2 else x = 3 end");
    let o = ops(&p);
    assert_eq!(o.iter().filter(|&&op| op == OpCode::Test).count(), 2);
    assert_eq!(o.last(), Some(&OpCode::Return0));
}

#[test]
fn method_call_uses_self_opcode() {
    let p = compile("obj:method(1)");
    let o = ops(&p);
    assert!(o.contains(&OpCode::SelfOp));
    assert!(o.contains(&OpCode::Call));
}

#[test]
fn tail_call_in_return() {
    let p = compile("local function f() return f() end");
    let child = &p.protos[0];
    assert!(ops(child).contains(&OpCode::TailCall));
}

#[test]
fn to_be_closed_scope_disables_tail_call() {
    let p = compile("local function g(x) local y <close> = x return h() end");
    let child = &p.protos[0];
    let o = ops(child);
    assert!(o.contains(&OpCode::Tbc));
    assert!(!o.contains(&OpCode::TailCall));
    assert!(o.contains(&OpCode::Call));
}

#[test]
fn compile_time_const_uses_no_register() {
    let p = compile("local a <const> = 5\nlocal b = a + 1");
    // 'a' folds away: only one LOADI, value 6, into register 0
    assert_eq!(
        ops(&p),
        vec![OpCode::VarargPrep, OpCode::LoadI, OpCode::Return0]
    );
    assert_eq!(p.code[1].a(), 0);
    assert_eq!(p.code[1].sbx(), 6);
}

#[test]
fn upvalue_capture_chains_through_closures() {
    let p = compile(
        "local up = 1\n\
         local function outer()\n\
           local function inner() return up end\n\
           return inner\n\
         end",
    );
    let outer = &p.protos[0];
    let inner = &outer.protos[0];
    // 'up' is captured from the stack by outer, then relayed by inner
    assert_eq!(outer.upvalues.len(), 1);
    assert!(outer.upvalues[0].in_stack);
    assert_eq!(inner.upvalues.len(), 1);
    assert!(!inner.upvalues[0].in_stack);
    assert_eq!(
        inner.upvalues[0].name.as_ref().map(|n| n.display().into_owned()),
        Some("up".to_string())
    );
}

#[test]
fn captured_local_forces_close_annotation() {
    let p = compile(
        "do\n\
           local x = 1\n\
           f = function() return x end\n\
         end",
    );
    let o = ops(&p);
    assert!(o.contains(&OpCode::Close));
    // the final return carries the needs-close flag and vararg fixup
    let ret = p.code.last().unwrap();
    assert_eq!(ret.opcode(), Some(OpCode::Return0));
    assert_eq!(ret.k(), 1);
    assert_eq!(ret.c(), 1); // main is vararg with zero parameters
}

#[test]
fn goto_resolves_forward_and_backward() {
    let p = compile("::top:: do goto top end goto bottom ::bottom::");
    let o = ops(&p);
    assert!(o.iter().filter(|&&op| op == OpCode::Jmp).count() >= 2);
}

#[test]
fn shift_immediates() {
    let p = compile("local a = x\nlocal b = a << 2\nlocal c = a >> 2\nlocal d = 2 << a");
    let o = ops(&p);
    // a << 2 is SHRI with negated immediate; a >> 2 is SHRI; 2 << a is SHLI
    assert_eq!(o.iter().filter(|&&op| op == OpCode::ShrI).count(), 2);
    assert_eq!(o.iter().filter(|&&op| op == OpCode::ShlI).count(), 1);
    let first_shri = o.iter().position(|&op| op == OpCode::ShrI).unwrap();
    assert_eq!(p.code[first_shri].sc(), -2);
}

#[test]
fn subtraction_of_small_constant_uses_addi() {
    let p = compile("local a = x\nlocal b = a - 3");
    let o = ops(&p);
    let addi_at = o.iter().position(|&op| op == OpCode::AddI).unwrap();
    assert_eq!(p.code[addi_at].sc(), -3);
    // the paired metamethod keeps the original operand
    let mmbini = p.code[addi_at + 1];
    assert_eq!(mmbini.opcode(), Some(OpCode::MmBinI));
    assert_eq!(mmbini.b(), int2sc(3));
    assert_eq!(mmbini.c(), 7); // TM_SUB
}

#[test]
fn immediate_comparison_swaps_sides() {
    let p = compile("if 1 < x then y = 1 end");
    // 1 < x becomes x > 1 with an immediate operand
    assert!(ops(&p).contains(&OpCode::GtI));
}

#[test]
fn string_constants_are_pooled_once() {
    let p = compile("local a = 'dup'\nlocal b = 'dup'");
    let strs = p
        .constants
        .iter()
        .filter(|v| matches!(v, Value::Str(_)))
        .count();
    assert_eq!(strs, 1);
}

#[test]
fn int_and_float_constants_never_unify() {
    let p = compile("local a = 70000\nlocal b = 70000.0\nreturn a, b");
    let has_int = p.constants.iter().any(|v| *v == Value::Int(70000));
    let has_flt = p.constants.iter().any(|v| *v == Value::Float(70000.0));
    assert!(has_int && has_flt);
    assert_eq!(p.constants.len(), 2);
}

#[test]
fn concat_chain_merges() {
    let p = compile("local s = a .. b .. c");
    let o = ops(&p);
    // right-associative chain collapses into a single CONCAT over 3 slots
    assert_eq!(o.iter().filter(|&&op| op == OpCode::Concat).count(), 1);
    let concat_at = o.iter().position(|&op| op == OpCode::Concat).unwrap();
    assert_eq!(p.code[concat_at].b(), 3);
}

#[test]
fn vararg_expression_in_vararg_function() {
    let p = compile("local a, b = ...");
    assert!(ops(&p).contains(&OpCode::Vararg));
}

#[test]
fn global_declaration_assigns_through_env() {
    let p = compile("global x = 1");
    let o = ops(&p);
    assert!(o.contains(&OpCode::SetTabUp));
}

#[test]
fn multiple_assignment_conflict_saves_table() {
    // 'a' is both an assignment target and the table of another target
    let p = compile("local a, b = {}, {}\na[1], a = 1, b");
    let o = ops(&p);
    // the conflict forces a MOVE of 'a' to a safe register
    assert!(o.contains(&OpCode::Move));
    assert!(o.contains(&OpCode::SetI));
}

// ---------------------------------------------------------------
// Universal invariants, checked over several chunks
// ---------------------------------------------------------------

fn check_invariants(p: &Proto) {
    let len = p.code.len() as i32;
    for (pc, i) in p.code.iter().enumerate() {
        let op = i.opcode().expect("undecodable opcode");
        // every jump lands inside the function
        if op == OpCode::Jmp {
            let o = i.sj_arg();
            assert!(
                o == -1 || (0 <= pc as i32 + 1 + o && (pc as i32 + 1 + o) < len),
                "jump out of range at pc {}",
                pc
            );
        }
        // every MMBIN* follows an arithmetic/bitwise opcode
        if op.is_mm() {
            let prev = p.code[pc - 1].opcode().unwrap();
            assert!(
                (OpCode::AddI..=OpCode::Shr).contains(&prev),
                "MMBIN not preceded by arith at pc {}",
                pc
            );
        }
        // register writes stay under max_stack_size
        if op.sets_a() {
            assert!(
                i.a() < p.max_stack_size as u32,
                "write above max stack at pc {}",
                pc
            );
        }
    }
    for child in &p.protos {
        check_invariants(child);
    }
}

#[test]
fn invariants_hold_for_assorted_chunks() {
    for src in [
        "",
        "return",
        "return 1 + 2",
        "local t = {10, 20, 30, x = 1, [2] = 3}",
        "for i = 1, 10 do print(i) end",
        "for k, v in pairs(t) do print(k, v) end",
        "local function fib(n) if n < 2 then return n end return fib(n-1) + fib(n-2) end return fib(10)",
        "while x do if y then break end x = x - 1 end",
        "repeat local a = f() until a",
        "a = b or c",
        "local s = 'x' .. 1 .. 2.5",
        "global g <const> = 10; return g",
        "local mt = { __index = function(t, k) return k end }",
        "obj:method(1, 2, ...)",
        "do local x <close> = open() x:use() end",
    ] {
        let p = compile(src);
        check_invariants(&p);
    }
}

#[test]
fn decode_reencode_identity() {
    use luna_bytecode::Instruction;
    let p = compile("local function f(a, b) return a * b + #('x' .. a) end return f(2, 3)");
    fn walk(p: &Proto) {
        for &i in &p.code {
            let re = Instruction(i.0);
            assert_eq!(i, re);
        }
        for c in &p.protos {
            walk(c);
        }
    }
    walk(&p);
}
