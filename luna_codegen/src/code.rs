//! Instruction emission and the expression-descriptor algebra.
//!
//! Jump lists are not a separate data structure: a list of pending jumps
//! lives inline in the instruction stream, each jump's sJ offset linking
//! to the next element, with `NO_JUMP` (an offset to itself) marking the
//! end. Patching rewrites only offsets; it never reorders or retags
//! instructions.

use luna_bytecode::instruction::{
    int2sc, Instruction, MAXARG_AX, MAXARG_B, MAXARG_BX, MAXARG_C, MAXARG_VC, MAX_FSTACK,
    MAX_INDEX_RK, NO_JUMP, NO_REG, OFFSET_SC, OFFSET_SJ, MAXARG_SJ,
};
use luna_bytecode::proto::{ABS_LINE_INFO, AbsLineInfo, LIM_LINE_DIFF, MAX_INSTR_WITH_ABS};
use luna_bytecode::value::ceil_log2;
use luna_bytecode::{OpCode, Value};
use luna_common::{LunaResult, LuaStr};

use crate::exp::{ExpDesc, ExpKind};
use crate::fold;
use crate::func_state::{Compiler, ConstKey};
use crate::ops::{tm, BinOp, UnOp};

/// "Return all values" marker for call/return counts.
pub const MULTRET: i32 = -1;

impl Compiler {
    // ---------------------------------------------------------------
    // Line information
    // ---------------------------------------------------------------

    /// Record line info for the last emitted instruction. When the
    /// delta from the previous line does not fit in a byte, or after
    /// [`MAX_INSTR_WITH_ABS`] instructions, an absolute entry is pushed
    /// and the per-instruction byte carries the sentinel.
    fn save_line_info(&mut self, line: u32) {
        let fs = self.fs_mut();
        let mut linedif = line as i64 - fs.previousline as i64;
        let pc = fs.proto.code.len() - 1;
        let force_abs = if linedif.abs() >= LIM_LINE_DIFF as i64 {
            true
        } else {
            let iw = fs.iwthabs;
            fs.iwthabs += 1;
            iw >= MAX_INSTR_WITH_ABS
        };
        if force_abs {
            fs.proto.abs_line_info.push(AbsLineInfo { pc: pc as u32, line });
            linedif = ABS_LINE_INFO as i64;
            fs.iwthabs = 1;
        }
        fs.proto.line_info.push(linedif as i8);
        fs.previousline = line;
    }

    /// Remove line info of the last instruction, keeping the counters
    /// consistent so the replacing instruction is tagged correctly.
    fn remove_last_line_info(&mut self) {
        let fs = self.fs_mut();
        let delta = fs.proto.line_info.pop().expect("no line info to remove");
        if delta != ABS_LINE_INFO {
            fs.previousline = (fs.previousline as i64 - delta as i64) as u32;
            fs.iwthabs -= 1;
        } else {
            let abs = fs.proto.abs_line_info.pop().expect("missing absolute entry");
            debug_assert_eq!(abs.pc as usize, fs.proto.line_info.len());
            fs.iwthabs = MAX_INSTR_WITH_ABS + 1; // force next entry absolute
        }
    }

    /// Remove the last instruction, correcting line info accordingly.
    fn remove_last_instruction(&mut self) {
        self.remove_last_line_info();
        self.fs_mut().proto.code.pop();
    }

    /// Re-tag the last instruction with `line`.
    pub fn fix_line(&mut self, line: u32) {
        self.remove_last_line_info();
        self.save_line_info(line);
    }

    // ---------------------------------------------------------------
    // Emission primitives
    // ---------------------------------------------------------------

    /// Append instruction `i`, tagging it with the line of the last
    /// consumed token. Returns its pc.
    pub fn code(&mut self, i: Instruction) -> LunaResult<u32> {
        self.fs_mut().proto.code.push(i);
        let line = self.lastline;
        self.save_line_info(line);
        Ok(self.pc() - 1)
    }

    pub fn code_abck(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: u32) -> LunaResult<u32> {
        debug_assert!(a <= MAX_FSTACK && b <= MAXARG_B && c <= MAXARG_C && k <= 1);
        self.code(Instruction::abck(op, a, b, c, k))
    }

    pub fn code_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> LunaResult<u32> {
        self.code_abck(op, a, b, c, 0)
    }

    pub fn code_vabck(&mut self, op: OpCode, a: u32, vb: u32, vc: u32, k: u32) -> LunaResult<u32> {
        debug_assert!(vb <= luna_bytecode::instruction::MAXARG_VB && vc <= MAXARG_VC);
        self.code(Instruction::vabck(op, a, vb, vc, k))
    }

    pub fn code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> LunaResult<u32> {
        debug_assert!(bx <= MAXARG_BX);
        self.code(Instruction::abx(op, a, bx))
    }

    fn code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> LunaResult<u32> {
        self.code(Instruction::asbx(op, a, sbx))
    }

    fn code_sj(&mut self, op: OpCode, sj: i32, k: u32) -> LunaResult<u32> {
        self.code(Instruction::sj(op, sj, k))
    }

    fn code_extra_arg(&mut self, ax: u32) -> LunaResult<u32> {
        debug_assert!(ax <= MAXARG_AX);
        self.code(Instruction::ax(OpCode::ExtraArg, ax))
    }

    /// Load constant `k` into `reg`, with the extended form when the
    /// index does not fit in Bx.
    fn code_k(&mut self, reg: u32, k: usize) -> LunaResult<u32> {
        if k as u32 <= MAXARG_BX {
            self.code_abx(OpCode::LoadK, reg, k as u32)
        } else {
            let p = self.code_abx(OpCode::LoadKX, reg, 0)?;
            self.code_extra_arg(k as u32)?;
            Ok(p)
        }
    }

    /// The previous instruction, unless a jump target may sit between
    /// it and the current position (which forbids peephole rewrites).
    pub(crate) fn previous_instruction(&self) -> Option<Instruction> {
        let fs = self.fs();
        if fs.pc() > fs.lasttarget {
            Some(fs.proto.code[fs.proto.code.len() - 1])
        } else {
            None
        }
    }

    /// Emit LOADNIL for `n` registers from `from`, merging into a
    /// previous LOADNIL when the ranges connect.
    pub fn nil(&mut self, from: u32, n: u32) -> LunaResult<()> {
        let mut l = from + n - 1; // last register to set
        if let Some(prev) = self.previous_instruction() {
            if prev.opcode() == Some(OpCode::LoadNil) {
                let pfrom = prev.a();
                let pl = pfrom + prev.b();
                let mut from = from;
                if (pfrom <= from && from <= pl + 1) || (from <= pfrom && pfrom <= l + 1) {
                    if pfrom < from {
                        from = pfrom;
                    }
                    if pl > l {
                        l = pl;
                    }
                    let pc = self.pc() - 1;
                    let i = self.instr_mut(pc);
                    i.set_a(from);
                    i.set_b(l - from);
                    return Ok(());
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, n - 1, 0)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Jumps and patch lists
    // ---------------------------------------------------------------

    /// The destination of the jump at `pc`, for list traversal;
    /// `NO_JUMP` marks the end of the list.
    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.instr(pc as u32).sj_arg();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    /// Fix the jump at `pc` to jump to `dest`.
    fn fix_jump(&mut self, pc: i32, dest: i32) -> LunaResult<()> {
        debug_assert_ne!(dest, NO_JUMP);
        let offset = dest - (pc + 1);
        if !(-OFFSET_SJ <= offset && offset <= MAXARG_SJ as i32 - OFFSET_SJ) {
            return Err(self.code_error("control structure too long"));
        }
        debug_assert_eq!(self.instr(pc as u32).opcode(), Some(OpCode::Jmp));
        self.instr_mut(pc as u32).set_sj(offset);
        Ok(())
    }

    /// Concatenate jump list `l2` onto `l1`.
    pub fn concat_jumps(&mut self, l1: &mut i32, l2: i32) -> LunaResult<()> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
        } else {
            let mut list = *l1;
            loop {
                let next = self.get_jump(list);
                if next == NO_JUMP {
                    break;
                }
                list = next;
            }
            self.fix_jump(list, l2)?;
        }
        Ok(())
    }

    /// Emit a jump with an open destination; returns its pc as a
    /// one-element patch list.
    pub fn jump(&mut self) -> LunaResult<i32> {
        Ok(self.code_sj(OpCode::Jmp, NO_JUMP, 0)? as i32)
    }

    /// Emit a return instruction.
    pub fn ret(&mut self, first: u32, nret: i32) -> LunaResult<()> {
        let op = match nret {
            0 => OpCode::Return0,
            1 => OpCode::Return1,
            _ => OpCode::Return,
        };
        self.check_limit((nret + 1) as usize, MAXARG_B as usize, "returns")?;
        self.code_abc(op, first, (nret + 1) as u32, 0)?;
        Ok(())
    }

    /// A test or comparison opcode followed by its jump.
    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: u32) -> LunaResult<i32> {
        self.code_abck(op, a, b, c, k)?;
        self.jump()
    }

    /// Current pc, marked as a jump target so no peephole crosses it.
    pub fn get_label(&mut self) -> u32 {
        let fs = self.fs_mut();
        fs.lasttarget = fs.pc();
        fs.lasttarget
    }

    /// The instruction "controlling" the jump at `pc`: its condition,
    /// or the jump itself when unconditional.
    fn get_jump_control(&self, pc: i32) -> i32 {
        if pc >= 1
            && self
                .instr(pc as u32 - 1)
                .opcode()
                .is_some_and(|op| op.is_test())
        {
            pc - 1
        } else {
            pc
        }
    }

    /// Patch the destination register of a TESTSET. Returns false when
    /// the controlling instruction is not a TESTSET; degrades it to a
    /// plain TEST when no register wants the value.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let ctrl = self.get_jump_control(node);
        let i = self.instr(ctrl as u32);
        if i.opcode() != Some(OpCode::TestSet) {
            return false;
        }
        if reg != NO_REG && reg != i.b() {
            self.instr_mut(ctrl as u32).set_a(reg);
        } else {
            // no register to put the value, or it is already there
            *self.instr_mut(ctrl as u32) =
                Instruction::abck(OpCode::Test, i.b(), 0, 0, i.k());
        }
        true
    }

    /// Make sure no test in the list produces a value.
    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    /// Patch all jumps in `list`: tests producing values jump to
    /// `vtarget` with `reg` as destination, others to `dtarget`.
    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> LunaResult<()> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Patch every jump in `list` to `target` (a backward address).
    pub fn patch_list(&mut self, list: i32, target: u32) -> LunaResult<()> {
        debug_assert!(target <= self.pc());
        self.patch_list_aux(list, target as i32, NO_REG, target as i32)
    }

    /// Patch every jump in `list` to the current position.
    pub fn patch_to_here(&mut self, list: i32) -> LunaResult<()> {
        let here = self.get_label();
        self.patch_list(list, here)
    }

    // ---------------------------------------------------------------
    // Constant pool
    // ---------------------------------------------------------------

    /// Append `v` to the constant pool unconditionally.
    fn add_constant_raw(&mut self, v: Value) -> LunaResult<usize> {
        let fs = self.fs_mut();
        fs.proto.constants.push(v);
        let k = fs.proto.constants.len() - 1;
        self.check_limit(k, MAXARG_AX as usize, "constants")?;
        Ok(k)
    }

    /// Add `v` under dedup key `key`, reusing an existing slot when the
    /// cache has one.
    fn add_constant(&mut self, key: ConstKey, v: Value) -> LunaResult<usize> {
        if let Some(&k) = self.fs().kcache.get(&key) {
            return Ok(k);
        }
        let k = self.add_constant_raw(v)?;
        self.fs_mut().kcache.insert(key, k);
        Ok(k)
    }

    pub fn string_k(&mut self, s: LuaStr) -> LunaResult<usize> {
        self.add_constant(ConstKey::Str(s.clone()), Value::Str(s))
    }

    pub fn int_k(&mut self, n: i64) -> LunaResult<usize> {
        self.add_constant(ConstKey::Int(n), Value::Int(n))
    }

    /// Floats key on their exact bit pattern, so integer-valued floats
    /// never unify with integer constants and ±0.0 stay distinct.
    pub fn number_k(&mut self, r: f64) -> LunaResult<usize> {
        self.add_constant(ConstKey::Float(r.to_bits()), Value::Float(r))
    }

    fn bool_true_k(&mut self) -> LunaResult<usize> {
        self.add_constant(ConstKey::True, Value::True)
    }

    fn bool_false_k(&mut self) -> LunaResult<usize> {
        self.add_constant(ConstKey::False, Value::False)
    }

    fn nil_k(&mut self) -> LunaResult<usize> {
        self.add_constant(ConstKey::Nil, Value::Nil)
    }

    // ---------------------------------------------------------------
    // Loading numeric literals
    // ---------------------------------------------------------------

    fn fits_sbx(i: i64) -> bool {
        let offset = (MAXARG_BX >> 1) as i64;
        -offset <= i && i <= MAXARG_BX as i64 - offset
    }

    fn fits_sc(i: i64) -> bool {
        (i as u64).wrapping_add(OFFSET_SC as u64) <= MAXARG_C as u64
    }

    /// Load integer `i` into `reg`, preferring the immediate form.
    pub fn code_int(&mut self, reg: u32, i: i64) -> LunaResult<()> {
        if Self::fits_sbx(i) {
            self.code_asbx(OpCode::LoadI, reg, i as i32)?;
        } else {
            let k = self.int_k(i)?;
            self.code_k(reg, k)?;
        }
        Ok(())
    }

    /// Load float `f` into `reg`, using LOADF for integral values that
    /// fit the immediate field.
    fn code_float(&mut self, reg: u32, f: f64) -> LunaResult<()> {
        if let Some(fi) = fold::flt2int_exact(f) {
            if Self::fits_sbx(fi) {
                self.code_asbx(OpCode::LoadF, reg, fi as i32)?;
                return Ok(());
            }
        }
        let k = self.number_k(f)?;
        self.code_k(reg, k)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Multi-return adjustment
    // ---------------------------------------------------------------

    /// Fix an open call or vararg to produce `nresults` values
    /// (`MULTRET` for "all").
    pub fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> LunaResult<()> {
        self.check_limit((nresults + 1) as usize, MAXARG_C as usize, "multiple results")?;
        let pc = e.pc();
        match e.kind {
            ExpKind::Call(_) => {
                self.instr_mut(pc).set_c((nresults + 1) as u32);
            }
            ExpKind::Vararg(_) => {
                let freereg = self.fs().freereg;
                let i = self.instr_mut(pc);
                i.set_c((nresults + 1) as u32);
                i.set_a(freereg);
                self.reserve_regs(1)?;
            }
            ref k => unreachable!("not a multi-return expression: {:?}", k),
        }
        Ok(())
    }

    /// Fix an open call or vararg to produce exactly one result. A call
    /// becomes NonReloc (its result lands at the call's base register);
    /// a vararg becomes Reloc.
    pub fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                debug_assert_eq!(self.instr(pc).c(), 2);
                e.kind = ExpKind::NonReloc(self.instr(pc).a());
            }
            ExpKind::Vararg(pc) => {
                self.instr_mut(pc).set_c(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // Discharging descriptors
    // ---------------------------------------------------------------

    /// If `e` is a constant expression, produce its value.
    pub fn exp_to_const(&self, e: &ExpDesc) -> Option<Value> {
        if e.has_jumps() {
            return None;
        }
        match &e.kind {
            ExpKind::Nil => Some(Value::Nil),
            ExpKind::False => Some(Value::False),
            ExpKind::True => Some(Value::True),
            ExpKind::KInt(i) => Some(Value::Int(*i)),
            ExpKind::KFlt(f) => Some(Value::Float(*f)),
            ExpKind::KStr(s) => Some(Value::Str(s.clone())),
            ExpKind::Const(vidx) => Some(self.dyd.actvar[*vidx as usize].k.clone()),
            _ => None,
        }
    }

    /// Numeric-literal view for folding and operand classification.
    fn to_numeral(e: &ExpDesc) -> Option<Value> {
        if e.has_jumps() {
            return None;
        }
        match e.kind {
            ExpKind::KInt(i) => Some(Value::Int(i)),
            ExpKind::KFlt(f) => Some(Value::Float(f)),
            _ => None,
        }
    }

    fn const_to_exp(v: Value, e: &mut ExpDesc) {
        match v {
            Value::Int(i) => e.set(ExpKind::KInt(i)),
            Value::Float(f) => e.set(ExpKind::KFlt(f)),
            Value::False => e.set(ExpKind::False),
            Value::True => e.set(ExpKind::True),
            Value::Nil => e.set(ExpKind::Nil),
            Value::Str(s) => e.set(ExpKind::KStr(s)),
        }
    }

    /// Ensure `e` is not a variable nor a compile-time constant. The
    /// jump lists are untouched.
    pub fn discharge_vars(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        match e.kind.clone() {
            ExpKind::Const(vidx) => {
                let v = self.dyd.actvar[vidx as usize].k.clone();
                Self::const_to_exp(v, e);
            }
            ExpKind::Local { reg, .. } => {
                e.set(ExpKind::NonReloc(reg)); // already in a register
            }
            ExpKind::Upval(idx) => {
                let pc = self.code_abc(OpCode::GetUpval, 0, idx, 0)?;
                e.set(ExpKind::Reloc(pc));
            }
            ExpKind::IndexUp { table, idx, .. } => {
                let pc = self.code_abc(OpCode::GetTabUp, 0, table, idx)?;
                e.set(ExpKind::Reloc(pc));
            }
            ExpKind::IndexI { table, idx, .. } => {
                self.free_reg(table);
                let pc = self.code_abc(OpCode::GetI, 0, table, idx as u32)?;
                e.set(ExpKind::Reloc(pc));
            }
            ExpKind::IndexStr { table, idx, .. } => {
                self.free_reg(table);
                let pc = self.code_abc(OpCode::GetField, 0, table, idx)?;
                e.set(ExpKind::Reloc(pc));
            }
            ExpKind::Indexed { table, idx, .. } => {
                self.free_regs(table, idx);
                let pc = self.code_abc(OpCode::GetTable, 0, table, idx)?;
                e.set(ExpKind::Reloc(pc));
            }
            ExpKind::Call(_) | ExpKind::Vararg(_) => {
                self.set_one_ret(e);
            }
            _ => {} // there is one value available (somewhere)
        }
        Ok(())
    }

    /// Put the value of `e` into register `reg`, making it NonReloc.
    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> LunaResult<()> {
        self.discharge_vars(e)?;
        match e.kind.clone() {
            ExpKind::Nil => {
                self.nil(reg, 1)?;
            }
            ExpKind::False => {
                self.code_abc(OpCode::LoadFalse, reg, 0, 0)?;
            }
            ExpKind::True => {
                self.code_abc(OpCode::LoadTrue, reg, 0, 0)?;
            }
            ExpKind::KStr(s) => {
                let k = self.string_k(s)?;
                e.set(ExpKind::K(k as u32));
                self.code_k(reg, k)?;
            }
            ExpKind::K(k) => {
                self.code_k(reg, k as usize)?;
            }
            ExpKind::KFlt(f) => {
                self.code_float(reg, f)?;
            }
            ExpKind::KInt(i) => {
                self.code_int(reg, i)?;
            }
            ExpKind::Reloc(pc) => {
                self.instr_mut(pc).set_a(reg);
            }
            ExpKind::NonReloc(r) => {
                if reg != r {
                    self.code_abc(OpCode::Move, reg, r, 0)?;
                }
            }
            ExpKind::Jmp(_) => {
                return Ok(()); // nothing to do, and the kind is kept
            }
            ref k => unreachable!("cannot discharge: {:?}", k),
        }
        e.set(ExpKind::NonReloc(reg));
        Ok(())
    }

    /// Put the value of `e` into any register.
    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.fs().freereg - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    fn code_loadbool(&mut self, a: u32, op: OpCode) -> LunaResult<i32> {
        self.get_label(); // those instructions may be jump targets
        Ok(self.code_abc(op, a, 0, 0)? as i32)
    }

    /// Whether the list has a jump that does not come from a TESTSET
    /// (and therefore needs an explicit boolean load).
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let i = self.instr(self.get_jump_control(list) as u32);
            if i.opcode() != Some(OpCode::TestSet) {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    /// Place the final result of `e` (jump lists included) in `reg`.
    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> LunaResult<()> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jmp(pc) = e.kind {
            // the expression itself is a test: put it in the true list
            let mut t = e.t;
            self.concat_jumps(&mut t, pc as i32)?;
            e.t = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP; // position of an eventual LOAD false
            let mut p_t = NO_JUMP; // position of an eventual LOAD true
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jmp(_)) {
                    NO_JUMP
                } else {
                    self.jump()?
                };
                p_f = self.code_loadbool(reg, OpCode::LFalseSkip)?; // skips next inst.
                p_t = self.code_loadbool(reg, OpCode::LoadTrue)?;
                // jump around the booleans when 'e' is not a test
                self.patch_to_here(fj)?;
            }
            let fin = self.get_label() as i32; // position after the expression
            self.patch_list_aux(e.f, fin, reg, p_f)?;
            self.patch_list_aux(e.t, fin, reg, p_t)?;
        }
        e.f = NO_JUMP;
        e.t = NO_JUMP;
        e.set(ExpKind::NonReloc(reg));
        Ok(())
    }

    /// Place the final result of `e` in the next available register.
    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs().freereg - 1;
        self.exp_to_reg(e, reg)
    }

    /// Place the final result of `e` in some register, and return it.
    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> LunaResult<u32> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc(reg) = e.kind {
            if !e.has_jumps() {
                return Ok(reg); // already in a register
            }
            if reg >= self.nvar_stack() {
                // register is not a local: can hold the jump values
                self.exp_to_reg(e, reg)?;
                return Ok(reg);
            }
            // else the register is a local variable and cannot be
            // overwritten by the jump values; use a fresh register
        }
        self.exp_to_next_reg(e)?;
        Ok(e.reg())
    }

    /// Result in a register or an upvalue.
    pub fn exp_to_any_reg_up(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        }
        Ok(())
    }

    /// Result in a register or materialized as a constant.
    pub fn exp_to_val(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        if matches!(e.kind, ExpKind::Jmp(_)) || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e)?;
        }
        Ok(())
    }

    /// Try to make `e` a K expression with an index in the range of the
    /// field-sized operands.
    pub fn exp_to_k(&mut self, e: &mut ExpDesc) -> LunaResult<bool> {
        if !e.has_jumps() {
            let info = match &e.kind {
                ExpKind::True => Some(self.bool_true_k()?),
                ExpKind::False => Some(self.bool_false_k()?),
                ExpKind::Nil => Some(self.nil_k()?),
                ExpKind::KInt(i) => Some(self.int_k(*i)?),
                ExpKind::KFlt(f) => Some(self.number_k(*f)?),
                ExpKind::KStr(s) => Some(self.string_k(s.clone())?),
                ExpKind::K(idx) => Some(*idx as usize),
                _ => None,
            };
            if let Some(info) = info {
                if info as u32 <= MAX_INDEX_RK {
                    e.set(ExpKind::K(info as u32));
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Make `e` a valid R/K operand: returns true when it ended up as a
    /// constant-pool index.
    fn exp_to_rk(&mut self, e: &mut ExpDesc) -> LunaResult<bool> {
        if self.exp_to_k(e)? {
            Ok(true)
        } else {
            self.exp_to_any_reg(e)?;
            Ok(false)
        }
    }

    /// Operand value of a discharged R/K expression.
    fn rk_info(e: &ExpDesc) -> u32 {
        match e.kind {
            ExpKind::K(idx) => idx,
            ExpKind::NonReloc(reg) => reg,
            ref k => unreachable!("not an R/K operand: {:?}", k),
        }
    }

    fn code_abrk(&mut self, op: OpCode, a: u32, b: u32, ec: &mut ExpDesc) -> LunaResult<()> {
        let k = self.exp_to_rk(ec)? as u32;
        self.code_abck(op, a, b, Self::rk_info(ec), k)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Register bookkeeping
    // ---------------------------------------------------------------

    /// Free `reg` unless it holds a local variable.
    fn free_reg(&mut self, reg: u32) {
        if reg >= self.nvar_stack() {
            self.fs_mut().freereg -= 1;
            debug_assert_eq!(reg, self.fs().freereg);
        }
    }

    /// Free two registers in the proper (reverse allocation) order.
    fn free_regs(&mut self, r1: u32, r2: u32) {
        if r1 > r2 {
            self.free_reg(r1);
            self.free_reg(r2);
        } else {
            self.free_reg(r2);
            self.free_reg(r1);
        }
    }

    fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r);
        }
    }

    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = match e1.kind {
            ExpKind::NonReloc(r) => r as i64,
            _ => -1,
        };
        let r2 = match e2.kind {
            ExpKind::NonReloc(r) => r as i64,
            _ => -1,
        };
        if r1 > r2 {
            if r1 >= 0 {
                self.free_reg(r1 as u32);
            }
            if r2 >= 0 {
                self.free_reg(r2 as u32);
            }
        } else {
            if r2 >= 0 {
                self.free_reg(r2 as u32);
            }
            if r1 >= 0 {
                self.free_reg(r1 as u32);
            }
        }
    }

    // ---------------------------------------------------------------
    // Stores, SELF, and indexing
    // ---------------------------------------------------------------

    /// Store the result of `ex` into variable `var`.
    pub fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> LunaResult<()> {
        match var.kind {
            ExpKind::Local { reg, .. } => {
                self.free_exp(ex);
                return self.exp_to_reg(ex, reg); // compute 'ex' into proper place
            }
            ExpKind::Upval(idx) => {
                let e = self.exp_to_any_reg(ex)?;
                self.code_abc(OpCode::SetUpval, e, idx, 0)?;
            }
            ExpKind::IndexUp { table, idx, .. } => {
                self.code_abrk(OpCode::SetTabUp, table, idx, ex)?;
            }
            ExpKind::IndexI { table, idx, .. } => {
                self.code_abrk(OpCode::SetI, table, idx as u32, ex)?;
            }
            ExpKind::IndexStr { table, idx, .. } => {
                self.code_abrk(OpCode::SetField, table, idx, ex)?;
            }
            ExpKind::Indexed { table, idx, .. } => {
                self.code_abrk(OpCode::SetTable, table, idx, ex)?;
            }
            ref k => unreachable!("invalid variable kind to store: {:?}", k),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// Store the value at the top of the register file into `var`.
    pub fn store_var_top(&mut self, var: &ExpDesc) -> LunaResult<()> {
        let mut e = ExpDesc::new(ExpKind::NonReloc(self.fs().freereg - 1));
        self.store_var(var, &mut e) // also frees the top register
    }

    /// Convert expression `e` into `e.key(e, ...` for a method call.
    pub fn op_self(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> LunaResult<()> {
        self.exp_to_any_reg(e)?;
        let ereg = e.reg(); // register where 'e' (the receiver) was placed
        self.free_exp(e);
        let base = self.fs().freereg; // base register for the call
        e.set(ExpKind::NonReloc(base));
        self.reserve_regs(2)?; // method and 'self' produced by SELF
        let is_short = matches!(&key.kind, ExpKind::KStr(s) if s.is_short());
        if is_short && self.exp_to_k(key)? {
            self.code_abck(OpCode::SelfOp, base, ereg, Self::rk_info(key), 0)?;
        } else {
            // cannot use the SELF opcode: move + gettable
            self.exp_to_any_reg(key)?;
            self.code_abc(OpCode::Move, base + 1, ereg, 0)?;
            self.code_abc(OpCode::GetTable, base, ereg, key.reg())?;
        }
        self.free_exp(key);
        Ok(())
    }

    /// Whether `e` is a short literal string already in the pool with a
    /// field-sized index.
    fn is_k_str(&self, e: &ExpDesc) -> bool {
        match e.kind {
            ExpKind::K(idx) if !e.has_jumps() && idx <= MAXARG_B => {
                matches!(
                    self.fs().proto.constants.get(idx as usize),
                    Some(Value::Str(s)) if s.is_short()
                )
            }
            _ => false,
        }
    }

    /// Integer literal usable as an unsigned C operand.
    fn is_c_int(e: &ExpDesc) -> bool {
        matches!(e.kind, ExpKind::KInt(i) if !e.has_jumps() && (i as u64) <= MAXARG_C as u64)
    }

    /// Integer literal usable as a signed C operand.
    fn is_sc_int(e: &ExpDesc) -> bool {
        matches!(e.kind, ExpKind::KInt(i) if !e.has_jumps() && Self::fits_sc(i))
    }

    /// Number usable as a signed immediate operand; returns the encoded
    /// operand and whether the original was a float.
    fn is_sc_number(e: &ExpDesc) -> Option<(u32, bool)> {
        let (i, isfloat) = match e.kind {
            ExpKind::KInt(i) => (i, false),
            ExpKind::KFlt(f) => (fold::flt2int_exact(f)?, true),
            _ => return None,
        };
        if !e.has_jumps() && Self::fits_sc(i) {
            Some((int2sc(i as i32), isfloat))
        } else {
            None
        }
    }

    /// Create the expression `t[k]`. `t` must already be in a register
    /// or upvalue; upvalues can only be indexed by short-string
    /// constants.
    pub fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> LunaResult<()> {
        let mut key_str = -1;
        if let ExpKind::KStr(s) = k.kind.clone() {
            let idx = self.string_k(s)?;
            k.set(ExpKind::K(idx as u32));
            key_str = idx as i32;
        }
        debug_assert!(
            !t.has_jumps()
                && matches!(
                    t.kind,
                    ExpKind::Local { .. } | ExpKind::NonReloc(_) | ExpKind::Upval(_)
                )
        );
        if matches!(t.kind, ExpKind::Upval(_)) && !self.is_k_str(k) {
            // upvalue indexed by a non-short-string key: bring it down
            self.exp_to_any_reg(t)?;
        }
        if let ExpKind::Upval(up) = t.kind {
            debug_assert!(self.is_k_str(k));
            let idx = Self::rk_info(k);
            t.set(ExpKind::IndexUp { table: up, idx, key_str, read_only: false });
        } else {
            let treg = t.reg();
            if self.is_k_str(k) {
                let idx = Self::rk_info(k);
                t.set(ExpKind::IndexStr { table: treg, idx, key_str, read_only: false });
            } else if Self::is_c_int(k) {
                let idx = match k.kind {
                    ExpKind::KInt(i) => i as i32,
                    _ => unreachable!(),
                };
                t.set(ExpKind::IndexI { table: treg, idx, key_str, read_only: false });
            } else {
                let idx = self.exp_to_any_reg(k)?;
                t.set(ExpKind::Indexed { table: treg, idx, key_str, read_only: false });
            }
        }
        Ok(())
    }

    /// Mark an index expression as read-only (const global access).
    pub fn mark_read_only(e: &mut ExpDesc) {
        match &mut e.kind {
            ExpKind::Indexed { read_only, .. }
            | ExpKind::IndexUp { read_only, .. }
            | ExpKind::IndexI { read_only, .. }
            | ExpKind::IndexStr { read_only, .. } => *read_only = true,
            k => unreachable!("not an index expression: {:?}", k),
        }
    }

    // ---------------------------------------------------------------
    // Conditions and logical operators
    // ---------------------------------------------------------------

    /// Negate the comparison controlling the jump of `e`.
    fn negate_condition(&mut self, e: &ExpDesc) {
        let ctrl = self.get_jump_control(e.pc() as i32);
        let i = self.instr_mut(ctrl as u32);
        debug_assert!(i
            .opcode()
            .is_some_and(|op| op.is_test() && op != OpCode::TestSet && op != OpCode::Test));
        let k = i.k();
        i.set_k(k ^ 1);
    }

    /// Emit a jump taken when `e` has truth value `cond`. A `not`
    /// wrapper is absorbed by inverting the test.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> LunaResult<i32> {
        if let ExpKind::Reloc(pc) = e.kind {
            let ie = self.instr(pc);
            if ie.opcode() == Some(OpCode::Not) {
                self.remove_last_instruction(); // remove the NOT
                return self.cond_jump(OpCode::Test, ie.b(), 0, 0, !cond as u32);
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        self.cond_jump(OpCode::TestSet, NO_REG, e.reg(), 0, cond as u32)
    }

    /// Go through when `e` is true, jump otherwise.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jmp(jpc) => {
                self.negate_condition(e); // jump when it is false
                jpc as i32
            }
            ExpKind::K(_) | ExpKind::KFlt(_) | ExpKind::KInt(_) | ExpKind::KStr(_)
            | ExpKind::True => NO_JUMP, // always true; do nothing
            _ => self.jump_on_cond(e, false)?, // jump when false
        };
        let mut f = e.f;
        self.concat_jumps(&mut f, pc)?; // insert new jump in false list
        e.f = f;
        self.patch_to_here(e.t)?; // true jumps go through to here
        e.t = NO_JUMP;
        Ok(())
    }

    /// Go through when `e` is false, jump otherwise.
    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jmp(jpc) => jpc as i32, // already jumps if true
            ExpKind::Nil | ExpKind::False => NO_JUMP, // always false; do nothing
            _ => self.jump_on_cond(e, true)?, // jump if true
        };
        let mut t = e.t;
        self.concat_jumps(&mut t, pc)?; // insert new jump in true list
        e.t = t;
        self.patch_to_here(e.f)?; // false jumps go through to here
        e.f = NO_JUMP;
        Ok(())
    }

    /// Code `not e`, folding constants.
    fn code_not(&mut self, e: &mut ExpDesc) -> LunaResult<()> {
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.set(ExpKind::True),
            ExpKind::K(_) | ExpKind::KFlt(_) | ExpKind::KInt(_) | ExpKind::KStr(_)
            | ExpKind::True => e.set(ExpKind::False),
            ExpKind::Jmp(_) => self.negate_condition(e),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let pc = self.code_abc(OpCode::Not, 0, e.reg(), 0)?;
                e.set(ExpKind::Reloc(pc));
            }
            ref k => unreachable!("cannot negate: {:?}", k),
        }
        // interchange true and false lists
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f); // values are useless when negated
        self.remove_values(e.t);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Arithmetic and comparisons
    // ---------------------------------------------------------------

    fn const_fold(&mut self, op: fold::ArithOp, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
        let (Some(v1), Some(v2)) = (Self::to_numeral(e1), Self::to_numeral(e2)) else {
            return false;
        };
        match fold::const_fold(op, &v1, &v2) {
            Some(Value::Int(i)) => {
                e1.set(ExpKind::KInt(i));
                true
            }
            Some(Value::Float(f)) => {
                e1.set(ExpKind::KFlt(f));
                true
            }
            _ => false,
        }
    }

    /// Unary operations that produce values (everything but `not`).
    fn code_un_expval(&mut self, op: OpCode, e: &mut ExpDesc, line: u32) -> LunaResult<()> {
        let r = self.exp_to_any_reg(e)?; // opcodes operate only on registers
        self.free_exp(e);
        let pc = self.code_abc(op, 0, r, 0)?;
        e.set(ExpKind::Reloc(pc)); // all those operations are relocatable
        self.fix_line(line);
        Ok(())
    }

    /// Finish a value-producing binary operation: the primary opcode
    /// followed by its metamethod fallback.
    fn finish_bin_expval(
        &mut self,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        op: OpCode,
        v2: u32,
        flip: bool,
        line: u32,
        mmop: OpCode,
        event: u32,
    ) -> LunaResult<()> {
        let v1 = self.exp_to_any_reg(e1)?;
        let pc = self.code_abck(op, 0, v1, v2, 0)?;
        self.free_exps(e1, e2);
        e1.set(ExpKind::Reloc(pc));
        self.fix_line(line);
        self.code_abck(mmop, v1, v2, event, flip as u32)?; // metamethod fallback
        self.fix_line(line);
        Ok(())
    }

    /// Register-register binary operation.
    fn code_bin_expval(
        &mut self,
        opr: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunaResult<()> {
        let op = opr.to_op();
        let v2 = self.exp_to_any_reg(e2)?;
        let e2c = e2.clone();
        self.finish_bin_expval(e1, &e2c, op, v2, false, line, OpCode::MmBin, opr.tag_method())
    }

    /// Binary operation with an immediate second operand.
    fn code_bin_i(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        flip: bool,
        line: u32,
        event: u32,
    ) -> LunaResult<()> {
        let v2 = match e2.kind {
            ExpKind::KInt(i) => int2sc(i as i32),
            ref k => unreachable!("immediate operand must be an integer: {:?}", k),
        };
        self.finish_bin_expval(e1, e2, op, v2, flip, line, OpCode::MmBinI, event)
    }

    /// Binary operation with a K operand.
    fn code_bin_k(
        &mut self,
        opr: BinOp,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        flip: bool,
        line: u32,
    ) -> LunaResult<()> {
        let event = opr.tag_method();
        let v2 = Self::rk_info(e2); // K index
        let op = opr.to_opk();
        self.finish_bin_expval(e1, e2, op, v2, flip, line, OpCode::MmBinK, event)
    }

    /// Try to code an operation negating its second operand (SUB as
    /// ADDI, SHL as SHRI). The metamethod keeps the original operand.
    fn finish_bin_expneg(
        &mut self,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        op: OpCode,
        line: u32,
        event: u32,
    ) -> LunaResult<bool> {
        let ExpKind::KInt(i2) = e2.kind else {
            return Ok(false);
        };
        if e2.has_jumps() || !(Self::fits_sc(i2) && Self::fits_sc(-i2)) {
            return Ok(false);
        }
        let v2 = i2 as i32;
        self.finish_bin_expval(e1, e2, op, int2sc(-v2), false, line, OpCode::MmBinI, event)?;
        // correct the metamethod argument back to the original value
        let pc = self.pc() - 1;
        self.instr_mut(pc).set_b(int2sc(v2));
        Ok(true)
    }

    /// Binary operation with no usable constant operand.
    fn code_bin_no_k(
        &mut self,
        opr: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        flip: bool,
        line: u32,
    ) -> LunaResult<()> {
        if flip {
            std::mem::swap(e1, e2); // back to the original order
        }
        self.code_bin_expval(opr, e1, e2, line)
    }

    /// Arithmetic operators; a K-foldable second operand selects the
    /// `_K` opcode variants.
    fn code_arith(
        &mut self,
        opr: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        flip: bool,
        line: u32,
    ) -> LunaResult<()> {
        if Self::to_numeral(e2).is_some() && self.exp_to_k(e2)? {
            self.code_bin_k(opr, e1, e2, flip, line)
        } else {
            self.code_bin_no_k(opr, e1, e2, flip, line)
        }
    }

    /// Commutative operators: a numeric first operand is swapped to the
    /// right so it may be used as immediate or K operand.
    fn code_commutative(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunaResult<()> {
        let mut flip = false;
        if Self::to_numeral(e1).is_some() {
            std::mem::swap(e1, e2);
            flip = true;
        }
        if op == BinOp::Add && Self::is_sc_int(e2) {
            let e2c = e2.clone();
            self.code_bin_i(OpCode::AddI, e1, &e2c, flip, line, tm::ADD)
        } else {
            self.code_arith(op, e1, e2, flip, line)
        }
    }

    /// Bitwise operators are all commutative: try to put an integer
    /// constant as the K operand.
    fn code_bitwise(
        &mut self,
        opr: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunaResult<()> {
        let mut flip = false;
        if matches!(e1.kind, ExpKind::KInt(_)) {
            std::mem::swap(e1, e2); // constant operand goes to the right
            flip = true;
        }
        if matches!(e2.kind, ExpKind::KInt(_)) && self.exp_to_k(e2)? {
            self.code_bin_k(opr, e1, e2, flip, line)
        } else {
            self.code_bin_no_k(opr, e1, e2, flip, line)
        }
    }

    /// Order comparisons, with the immediate variants when one operand
    /// is a small constant (swapping sides flips LT/LE into GT/GE).
    fn code_order(&mut self, opr: BinOp, e1: &mut ExpDesc, e2: &mut ExpDesc) -> LunaResult<()> {
        let (r1, r2, isfloat, op);
        if let Some((im, f)) = Self::is_sc_number(e2) {
            r1 = self.exp_to_any_reg(e1)?;
            r2 = im;
            isfloat = f;
            op = opr.to_cmp_opi();
        } else if let Some((im, f)) = Self::is_sc_number(e1) {
            // (A < B) becomes (B > A)
            r1 = self.exp_to_any_reg(e2)?;
            r2 = im;
            isfloat = f;
            op = opr.to_cmp_op_gti();
        } else {
            r1 = self.exp_to_any_reg(e1)?;
            r2 = self.exp_to_any_reg(e2)?;
            isfloat = false;
            op = opr.to_cmp_op();
        }
        self.free_exps(e1, e2);
        let pc = self.cond_jump(op, r1, r2, isfloat as u32, 1)?;
        e1.set(ExpKind::Jmp(pc as u32));
        Ok(())
    }

    /// Equality comparisons. The first operand was already put in R/K
    /// form by `infix`.
    fn code_eq(&mut self, opr: BinOp, e1: &mut ExpDesc, e2: &mut ExpDesc) -> LunaResult<()> {
        if !matches!(e1.kind, ExpKind::NonReloc(_)) {
            debug_assert!(matches!(
                e1.kind,
                ExpKind::K(_) | ExpKind::KInt(_) | ExpKind::KFlt(_)
            ));
            std::mem::swap(e1, e2);
        }
        let r1 = self.exp_to_any_reg(e1)?; // 1st expression must be in a register
        let (op, r2, isfloat);
        if let Some((im, f)) = Self::is_sc_number(e2) {
            op = OpCode::EqI;
            r2 = im;
            isfloat = f;
        } else if self.exp_to_rk(e2)? {
            op = OpCode::EqK;
            r2 = Self::rk_info(e2);
            isfloat = false;
        } else {
            op = OpCode::Eq;
            r2 = self.exp_to_any_reg(e2)?;
            isfloat = false;
        }
        self.free_exps(e1, e2);
        let pc = self.cond_jump(op, r1, r2, isfloat as u32, (opr == BinOp::Eq) as u32)?;
        e1.set(ExpKind::Jmp(pc as u32));
        Ok(())
    }

    /// Merge a concatenation into a previous CONCAT when possible
    /// (concat is right-associative, so nested concats see the previous
    /// instruction).
    fn code_concat(&mut self, e1: &mut ExpDesc, e2: &ExpDesc, line: u32) -> LunaResult<()> {
        match self.previous_instruction() {
            Some(prev) if prev.opcode() == Some(OpCode::Concat) => {
                let n = prev.b(); // # of elements concatenated in 'e2'
                debug_assert_eq!(e1.reg() + 1, prev.a());
                self.free_exp(e2);
                let pc = self.pc() - 1;
                let e1reg = e1.reg();
                let i = self.instr_mut(pc);
                i.set_a(e1reg); // correct first element ('e1')
                i.set_b(n + 1); // one more element
            }
            _ => {
                self.code_abc(OpCode::Concat, e1.reg(), 2, 0)?;
                self.free_exp(e2);
                self.fix_line(line);
            }
        }
        Ok(())
    }

    /// Apply prefix operator `op` to `e`.
    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> LunaResult<()> {
        let fake = ExpDesc::int(0); // fake 2nd operand
        self.discharge_vars(e)?;
        match op {
            UnOp::Minus | UnOp::BNot => {
                if !self.const_fold(fold::ArithOp::from(op), e, &fake) {
                    self.code_un_expval(op.to_op(), e, line)?;
                }
            }
            UnOp::Len => self.code_un_expval(OpCode::Len, e, line)?,
            UnOp::Not => self.code_not(e)?,
        }
        Ok(())
    }

    /// Process the first operand of a binary operation before the
    /// second one is read.
    pub fn infix(&mut self, op: BinOp, v: &mut ExpDesc) -> LunaResult<()> {
        self.discharge_vars(v)?;
        match op {
            BinOp::And => self.go_if_true(v)?,
            BinOp::Or => self.go_if_false(v)?,
            BinOp::Concat => self.exp_to_next_reg(v)?, // operand must be on the stack
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod
            | BinOp::Pow | BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
                if Self::to_numeral(v).is_none() {
                    self.exp_to_any_reg(v)?;
                }
                // else keep the numeral, which may be folded or used as
                // an immediate operand
            }
            BinOp::Eq | BinOp::Ne => {
                if Self::to_numeral(v).is_none() {
                    self.exp_to_rk(v)?;
                }
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if Self::is_sc_number(v).is_none() {
                    self.exp_to_any_reg(v)?;
                }
            }
        }
        Ok(())
    }

    /// Finalize a binary operation after the second operand is read.
    pub fn posfix(
        &mut self,
        opr: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> LunaResult<()> {
        self.discharge_vars(e2)?;
        if opr.foldable() && self.const_fold(fold::ArithOp::from(opr), e1, e2) {
            return Ok(()); // done by folding
        }
        match opr {
            BinOp::And => {
                debug_assert_eq!(e1.t, NO_JUMP); // list closed by infix
                let mut f = e2.f;
                self.concat_jumps(&mut f, e1.f)?;
                e2.f = f;
                *e1 = e2.clone();
            }
            BinOp::Or => {
                debug_assert_eq!(e1.f, NO_JUMP); // list closed by infix
                let mut t = e2.t;
                self.concat_jumps(&mut t, e1.t)?;
                e2.t = t;
                *e1 = e2.clone();
            }
            BinOp::Concat => {
                self.exp_to_next_reg(e2)?;
                let e2c = e2.clone();
                self.code_concat(e1, &e2c, line)?;
            }
            BinOp::Add | BinOp::Mul => {
                self.code_commutative(opr, e1, e2, line)?;
            }
            BinOp::Sub => {
                if self.finish_bin_expneg(e1, e2, OpCode::AddI, line, tm::SUB)? {
                    // coded as (r1 + -I)
                } else {
                    self.code_arith(opr, e1, e2, false, line)?;
                }
            }
            BinOp::Div | BinOp::IDiv | BinOp::Mod | BinOp::Pow => {
                self.code_arith(opr, e1, e2, false, line)?;
            }
            BinOp::BAnd | BinOp::BOr | BinOp::BXor => {
                self.code_bitwise(opr, e1, e2, line)?;
            }
            BinOp::Shl => {
                if Self::is_sc_int(e1) {
                    std::mem::swap(e1, e2);
                    let e2c = e2.clone();
                    self.code_bin_i(OpCode::ShlI, e1, &e2c, true, line, tm::SHL)?; // I << r2
                } else if self.finish_bin_expneg(e1, e2, OpCode::ShrI, line, tm::SHL)? {
                    // coded as (r1 >> -I)
                } else {
                    self.code_bin_expval(opr, e1, e2, line)?;
                }
            }
            BinOp::Shr => {
                if Self::is_sc_int(e2) {
                    let e2c = e2.clone();
                    self.code_bin_i(OpCode::ShrI, e1, &e2c, false, line, tm::SHR)?; // r1 >> I
                } else {
                    self.code_bin_expval(opr, e1, e2, line)?;
                }
            }
            BinOp::Eq | BinOp::Ne => {
                self.code_eq(opr, e1, e2)?;
            }
            BinOp::Gt | BinOp::Ge => {
                // (a > b) is (b < a); (a >= b) is (b <= a)
                std::mem::swap(e1, e2);
                let flipped = if opr == BinOp::Gt { BinOp::Lt } else { BinOp::Le };
                self.code_order(flipped, e1, e2)?;
            }
            BinOp::Lt | BinOp::Le => {
                self.code_order(opr, e1, e2)?;
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Table constructors
    // ---------------------------------------------------------------

    /// Rewrite a NEWTABLE (and its EXTRAARG) with the final array and
    /// hash sizes.
    pub fn set_table_size(&mut self, pc: u32, ra: u32, asize: u32, hsize: u32) {
        let extra = asize / (MAXARG_VC + 1); // higher bits of array size
        let rc = asize % (MAXARG_VC + 1); // lower bits
        let k = (extra > 0) as u32;
        let hsize = if hsize != 0 { ceil_log2(hsize) + 1 } else { 0 };
        *self.instr_mut(pc) = Instruction::vabck(OpCode::NewTable, ra, hsize, rc, k);
        *self.instr_mut(pc + 1) = Instruction::ax(OpCode::ExtraArg, extra);
    }

    /// Emit a SETLIST. `base` is the register holding the table,
    /// `nelems` the total number of elements so far, `tostore` the
    /// number of pending values (`MULTRET` to take all up to top).
    pub fn set_list(&mut self, base: u32, nelems: i32, tostore: i32) -> LunaResult<()> {
        debug_assert_ne!(tostore, 0);
        let tostore = if tostore == MULTRET { 0 } else { tostore } as u32;
        if nelems as u32 <= MAXARG_VC {
            self.code_vabck(OpCode::SetList, base, tostore, nelems as u32, 0)?;
        } else {
            let extra = nelems as u32 / (MAXARG_VC + 1);
            let nelems = nelems as u32 % (MAXARG_VC + 1);
            self.code_vabck(OpCode::SetList, base, tostore, nelems, 1)?;
            self.code_extra_arg(extra)?;
        }
        self.fs_mut().freereg = base + 1; // free registers with list values
        Ok(())
    }

    /// Limit for pending constructor items before a SETLIST flush,
    /// based on how many registers remain.
    pub fn max_to_store(&self) -> i32 {
        let numfreeregs = (MAX_FSTACK - self.fs().freereg) as i32;
        if numfreeregs >= 160 {
            numfreeregs / 5
        } else if numfreeregs >= 80 {
            10
        } else {
            1
        }
    }

    // ---------------------------------------------------------------
    // Function finalization
    // ---------------------------------------------------------------

    /// The final target of a jump, collapsing chains of unconditional
    /// jumps (bounded, so pathological chains are merely left as
    /// multi-hops).
    fn final_target(&self, mut i: i32) -> i32 {
        for _ in 0..100 {
            let pc = self.instr(i as u32);
            if pc.opcode() != Some(OpCode::Jmp) {
                break;
            }
            i += pc.sj_arg() + 1;
        }
        i
    }

    /// Final pass over the function: annotate returns with close/vararg
    /// fixups and collapse jump chains.
    pub fn finish(&mut self) -> LunaResult<()> {
        let needclose = self.fs().needclose;
        let vararg = self.fs().proto.is_vararg();
        let nparams = self.fs().proto.num_params as u32;
        for i in 0..self.pc() {
            let instr = self.instr(i);
            match instr.opcode() {
                Some(OpCode::Return0) | Some(OpCode::Return1) | Some(OpCode::Return)
                | Some(OpCode::TailCall) => {
                    let pc = self.instr_mut(i);
                    if needclose {
                        pc.set_k(1); // signal that it needs to close
                    }
                    if vararg {
                        pc.set_c(nparams + 1); // signal that it is vararg
                    }
                }
                Some(OpCode::Jmp) => {
                    let target = self.final_target(i as i32);
                    self.fix_jump(i as i32, target)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fix a FORPREP/FORLOOP-family instruction at `pcpos` to jump to
    /// `dest` (`back` for backward jumps).
    pub fn fix_for_jump(&mut self, pcpos: u32, dest: u32, back: bool) -> LunaResult<()> {
        let mut offset = dest as i32 - (pcpos as i32 + 1);
        if back {
            offset = -offset;
        }
        if offset > MAXARG_BX as i32 {
            return Err(self.code_error("control structure too long"));
        }
        self.instr_mut(pcpos).set_bx(offset as u32);
        Ok(())
    }
}
