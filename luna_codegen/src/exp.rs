//! Deferred expression descriptors.
//!
//! Most operations do not emit code immediately: the parser hands the
//! code generator an [`ExpDesc`] describing where a value is (or how to
//! produce it), and materialization is delayed until a register is
//! actually required. Every descriptor also carries two patch lists of
//! pending conditional jumps (`exit when true` / `exit when false`)
//! threaded through the instruction stream by the short-circuit
//! operators; the lists survive every transformation until `exp2reg`
//! or an explicit discard consumes them.

use luna_bytecode::instruction::NO_JUMP;
use luna_common::LuaStr;

/// Kinds of expressions and variables, with their payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpKind {
    /// The empty end of an expression list.
    Void,
    Nil,
    True,
    False,
    /// Constant in the pool; payload is its index.
    K(u32),
    /// Floating constant.
    KFlt(f64),
    /// Integer constant.
    KInt(i64),
    /// String constant, not yet in the pool.
    KStr(LuaStr),
    /// Value sits in a fixed register.
    NonReloc(u32),
    /// Local variable: register plus compiler index (relative to the
    /// function's first local).
    Local { reg: u32, vidx: u16 },
    /// Global name. The payload is the resolution sentinel: −1 while the
    /// preambular declaration is active, −2 when no collective
    /// declaration applies, or the absolute active-variable index of the
    /// innermost matching declaration.
    Global(i32),
    /// Upvalue; payload is its index in the function's upvalue list.
    Upval(u32),
    /// Compile-time `<const>` variable; absolute active-variable index.
    Const(u32),
    /// `t[k]` with table and key in registers.
    Indexed { table: u32, idx: u32, key_str: i32, read_only: bool },
    /// `up[k]` with a short-string constant key.
    IndexUp { table: u32, idx: u32, key_str: i32, read_only: bool },
    /// `t[i]` with a small integer literal key.
    IndexI { table: u32, idx: i32, key_str: i32, read_only: bool },
    /// `t[k]` with a short-string constant key.
    IndexStr { table: u32, idx: u32, key_str: i32, read_only: bool },
    /// Expression is a comparison; payload is the pc of its jump.
    Jmp(u32),
    /// Partially-emitted instruction whose destination register is still
    /// open; payload is its pc.
    Reloc(u32),
    /// Open function call; payload is the pc of the CALL.
    Call(u32),
    /// Vararg expression; payload is the pc of the VARARG.
    Vararg(u32),
}

/// An expression descriptor: a kind plus the two pending jump lists.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// Patch list of "exit when true".
    pub t: i32,
    /// Patch list of "exit when false".
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> ExpDesc {
        ExpDesc { kind, t: NO_JUMP, f: NO_JUMP }
    }

    pub fn void() -> ExpDesc {
        ExpDesc::new(ExpKind::Void)
    }

    pub fn string(s: LuaStr) -> ExpDesc {
        ExpDesc::new(ExpKind::KStr(s))
    }

    pub fn int(i: i64) -> ExpDesc {
        ExpDesc::new(ExpKind::KInt(i))
    }

    pub fn float(f: f64) -> ExpDesc {
        ExpDesc::new(ExpKind::KFlt(f))
    }

    /// Replace the kind, keeping the jump lists.
    pub fn set(&mut self, kind: ExpKind) {
        self.kind = kind;
    }

    /// Reinitialize completely (fresh jump lists).
    pub fn init(&mut self, kind: ExpKind) {
        self.kind = kind;
        self.t = NO_JUMP;
        self.f = NO_JUMP;
    }

    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// True for kinds that denote an assignable variable.
    pub fn is_var(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Local { .. }
                | ExpKind::Global(_)
                | ExpKind::Upval(_)
                | ExpKind::Const(_)
                | ExpKind::Indexed { .. }
                | ExpKind::IndexUp { .. }
                | ExpKind::IndexI { .. }
                | ExpKind::IndexStr { .. }
        )
    }

    pub fn is_indexed(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Indexed { .. }
                | ExpKind::IndexUp { .. }
                | ExpKind::IndexI { .. }
                | ExpKind::IndexStr { .. }
        )
    }

    /// Call or vararg: implicitly "multiple results".
    pub fn has_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }

    /// Numeric literal without pending jumps (a folding candidate).
    pub fn is_numeral(&self) -> bool {
        !self.has_jumps() && matches!(self.kind, ExpKind::KInt(_) | ExpKind::KFlt(_))
    }

    /// The pc payload of Jmp/Reloc/Call/Vararg descriptors.
    pub fn pc(&self) -> u32 {
        match self.kind {
            ExpKind::Jmp(pc)
            | ExpKind::Reloc(pc)
            | ExpKind::Call(pc)
            | ExpKind::Vararg(pc) => pc,
            ref k => unreachable!("descriptor has no pc: {:?}", k),
        }
    }

    /// The register of a NonReloc descriptor.
    pub fn reg(&self) -> u32 {
        match self.kind {
            ExpKind::NonReloc(r) => r,
            ExpKind::Local { reg, .. } => reg,
            ref k => unreachable!("descriptor has no register: {:?}", k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_lists_start_empty() {
        let e = ExpDesc::int(3);
        assert!(!e.has_jumps());
        assert_eq!(e.t, NO_JUMP);
        assert_eq!(e.f, NO_JUMP);
    }

    #[test]
    fn kind_predicates() {
        assert!(ExpDesc::new(ExpKind::Local { reg: 0, vidx: 0 }).is_var());
        assert!(ExpDesc::new(ExpKind::IndexI {
            table: 0,
            idx: 1,
            key_str: -1,
            read_only: false
        })
        .is_indexed());
        assert!(ExpDesc::new(ExpKind::Call(0)).has_multret());
        assert!(ExpDesc::int(1).is_numeral());
        assert!(!ExpDesc::string(LuaStr::from("x")).is_numeral());
    }
}
