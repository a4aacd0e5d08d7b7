//! Per-function compile-time state and the compilation-wide dynamic
//! structures shared by all nested functions.

use hashbrown::HashMap;

use luna_bytecode::instruction::{Instruction, MAX_FSTACK};
use luna_bytecode::proto::{var_kind, LocVar, Proto, UpvalDesc};
use luna_bytecode::Value;
use luna_common::{limits, LunaError, LunaResult, LuaStr};

use crate::exp::{ExpDesc, ExpKind};

/// Description of an active (compile-time) variable.
#[derive(Debug, Clone)]
pub struct VarDesc {
    /// One of the [`var_kind`] constants.
    pub kind: u8,
    /// Register holding the variable, when it lives in one.
    pub ridx: u8,
    /// Index of the variable in the prototype's `loc_vars` array.
    pub pidx: i16,
    /// Variable name; `None` represents a collective `global *` entry.
    pub name: Option<LuaStr>,
    /// Value of a compile-time constant.
    pub k: Value,
}

impl VarDesc {
    pub fn new(name: Option<LuaStr>, kind: u8) -> VarDesc {
        VarDesc { kind, ridx: 0, pidx: -1, name, k: Value::Nil }
    }

    /// Whether the variable occupies a register.
    pub fn in_reg(&self) -> bool {
        self.kind <= var_kind::RDKTOCLOSE
    }

    /// Whether the entry is a global declaration.
    pub fn is_global(&self) -> bool {
        self.kind >= var_kind::GDKREG
    }
}

/// Description of a pending goto or an active label.
#[derive(Debug, Clone)]
pub struct LabelDesc {
    pub name: LuaStr,
    /// Position in the code.
    pub pc: u32,
    /// Line where it appeared.
    pub line: u32,
    /// Number of active variables at that position.
    pub nactvar: u16,
    /// True for a goto that escapes upvalues.
    pub close: bool,
}

/// Dynamic structures shared by the whole compilation; each function
/// state windows into them via `first_local`/`first_label`.
#[derive(Debug, Default)]
pub struct Dyndata {
    pub actvar: Vec<VarDesc>,
    /// Pending gotos.
    pub gt: Vec<LabelDesc>,
    /// Active labels.
    pub label: Vec<LabelDesc>,
}

/// Loop state of a block.
pub const BL_NOT_LOOP: u8 = 0;
pub const BL_LOOP: u8 = 1;
pub const BL_LOOP_WITH_BREAKS: u8 = 2;

/// Control of an open block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Index of the first label of this block in `Dyndata::label`.
    pub first_label: usize,
    /// Index of the first pending goto in `Dyndata::gt`.
    pub first_goto: usize,
    /// Number of active declarations at block entry.
    pub nactvar: u16,
    /// Some variable in the block is captured as an upvalue.
    pub upval: bool,
    /// BL_NOT_LOOP, BL_LOOP, or BL_LOOP_WITH_BREAKS.
    pub is_loop: u8,
    /// Inside the scope of a to-be-closed variable.
    pub inside_tbc: bool,
}

/// Key for the constant-deduplication cache. Integer and float keys are
/// distinct variants, so numerically equal constants of different
/// subtypes can never unify, and ±0.0 are distinct bit patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Nil,
    False,
    True,
    Int(i64),
    Float(u64),
    Str(LuaStr),
}

/// State needed to generate code for one function.
#[derive(Debug)]
pub struct FuncState {
    /// The prototype under construction.
    pub proto: Proto,
    /// Stack of open blocks, innermost last.
    pub blocks: Vec<Block>,
    /// Label of the last jump target, to forbid peephole rewrites across
    /// basic-block boundaries.
    pub lasttarget: u32,
    /// Last line saved in the line-info table.
    pub previousline: u32,
    /// Instructions issued since the last absolute line-info entry.
    pub iwthabs: u32,
    /// First free register.
    pub freereg: u32,
    /// Number of active variable declarations.
    pub nactvar: u16,
    /// Window base of this function in `Dyndata::actvar`.
    pub first_local: usize,
    /// Window base of this function in `Dyndata::label`.
    pub first_label: usize,
    /// The function closes upvalues when returning.
    pub needclose: bool,
    /// Constant-deduplication cache, discarded when the function is
    /// finalized.
    pub kcache: HashMap<ConstKey, usize>,
}

impl FuncState {
    pub fn new(proto: Proto, first_local: usize, first_label: usize) -> FuncState {
        let previousline = proto.line_defined;
        FuncState {
            proto,
            blocks: Vec::new(),
            lasttarget: 0,
            previousline,
            iwthabs: 0,
            freereg: 0,
            nactvar: 0,
            first_local,
            first_label,
            needclose: false,
            kcache: HashMap::new(),
        }
    }

    /// Program counter: number of instructions emitted so far.
    pub fn pc(&self) -> u32 {
        self.proto.code.len() as u32
    }

    pub fn block(&self) -> &Block {
        self.blocks.last().expect("no open block")
    }

    pub fn block_mut(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("no open block")
    }
}

/// The compiler driver state: the stack of nested function states plus
/// the dynamic parser structures. All code-generation primitives are
/// methods on this type, operating on the innermost function.
pub struct Compiler {
    pub fs_stack: Vec<FuncState>,
    pub dyd: Dyndata,
    /// Formatted chunk name for error prefixes.
    pub chunk: String,
    /// Line of the last consumed token; new instructions are tagged
    /// with it.
    pub lastline: u32,
}

impl Compiler {
    pub fn new(chunk_name: &str) -> Compiler {
        Compiler {
            fs_stack: Vec::new(),
            dyd: Dyndata::default(),
            chunk: limits::chunk_id(chunk_name),
            lastline: 1,
        }
    }

    pub fn fs(&self) -> &FuncState {
        self.fs_stack.last().expect("no active function")
    }

    pub fn fs_mut(&mut self) -> &mut FuncState {
        self.fs_stack.last_mut().expect("no active function")
    }

    /// Index of the innermost function state.
    pub fn level(&self) -> usize {
        self.fs_stack.len() - 1
    }

    pub fn pc(&self) -> u32 {
        self.fs().pc()
    }

    pub fn instr(&self, pc: u32) -> Instruction {
        self.fs().proto.code[pc as usize]
    }

    pub fn instr_mut(&mut self, pc: u32) -> &mut Instruction {
        &mut self.fs_mut().proto.code[pc as usize]
    }

    /// `"too many %s (limit is %d) in %s"` resource error.
    pub fn error_limit(&self, limit: usize, what: &str) -> LunaError {
        let line = self.fs().proto.line_defined;
        let wher = if line == 0 {
            "main function".to_string()
        } else {
            format!("function at line {}", line)
        };
        LunaError::limit(format!(
            "{}:{}: too many {} (limit is {}) in {}",
            self.chunk, self.lastline, what, limit, wher
        ))
    }

    pub fn check_limit(&self, v: usize, limit: usize, what: &str) -> LunaResult<()> {
        if v > limit {
            Err(self.error_limit(limit, what))
        } else {
            Ok(())
        }
    }

    /// Syntax-shaped error raised from inside the code generator.
    pub fn code_error(&self, msg: &str) -> LunaError {
        LunaError::syntax(format!("{}:{}: {}", self.chunk, self.lastline, msg))
    }

    /// Semantic error with the standard prefix.
    pub fn sem_error(&self, msg: &str) -> LunaError {
        LunaError::semantic(format!("{}:{}: {}", self.chunk, self.lastline, msg))
    }

    // ---------------------------------------------------------------
    // Variable bookkeeping
    // ---------------------------------------------------------------

    /// The variable description of compiler index `vidx` (relative to
    /// the innermost function).
    pub fn local_var(&self, vidx: u16) -> &VarDesc {
        &self.dyd.actvar[self.fs().first_local + vidx as usize]
    }

    pub fn local_var_mut(&mut self, vidx: u16) -> &mut VarDesc {
        let idx = self.fs().first_local + vidx as usize;
        &mut self.dyd.actvar[idx]
    }

    fn local_var_at(&self, level: usize, vidx: u16) -> &VarDesc {
        &self.dyd.actvar[self.fs_stack[level].first_local + vidx as usize]
    }

    /// Convert a compiler index level to its corresponding register:
    /// the register of the highest variable below that level that lives
    /// in one, plus one.
    pub fn reg_level(&self, nvar: u16) -> u32 {
        self.reg_level_at(self.level(), nvar)
    }

    pub fn reg_level_at(&self, level: usize, nvar: u16) -> u32 {
        let mut nvar = nvar;
        while nvar > 0 {
            nvar -= 1;
            let vd = self.local_var_at(level, nvar);
            if vd.in_reg() {
                return vd.ridx as u32 + 1;
            }
        }
        0
    }

    /// Number of variables in the register stack of the innermost
    /// function.
    pub fn nvar_stack(&self) -> u32 {
        self.reg_level(self.fs().nactvar)
    }

    /// Register a local variable in the prototype's debug table.
    pub fn register_local_var(&mut self, name: LuaStr) -> LunaResult<i16> {
        let pc = self.pc();
        let fs = self.fs_mut();
        fs.proto.loc_vars.push(LocVar { name: Some(name), start_pc: pc, end_pc: 0 });
        let idx = fs.proto.loc_vars.len() - 1;
        if idx > i16::MAX as usize {
            return Err(self.error_limit(i16::MAX as usize, "local variables"));
        }
        Ok(idx as i16)
    }

    /// Create a new active-variable entry; returns its compiler index.
    pub fn new_var_kind(&mut self, name: Option<LuaStr>, kind: u8) -> u16 {
        self.dyd.actvar.push(VarDesc::new(name, kind));
        (self.dyd.actvar.len() - 1 - self.fs().first_local) as u16
    }

    pub fn new_local_var(&mut self, name: LuaStr) -> u16 {
        self.new_var_kind(Some(name), var_kind::VDKREG)
    }

    /// Start the scope of the last `nvars` created variables.
    pub fn adjust_local_vars(&mut self, nvars: usize) -> LunaResult<()> {
        let mut reg_level = self.nvar_stack();
        for _ in 0..nvars {
            let vidx = self.fs().nactvar;
            self.fs_mut().nactvar += 1;
            let name = {
                let var = self.local_var(vidx);
                var.name.clone().expect("local variable has a name")
            };
            let pidx = self.register_local_var(name)?;
            let var = self.local_var_mut(vidx);
            var.ridx = reg_level as u8;
            var.pidx = pidx;
            reg_level += 1;
            self.check_limit(reg_level as usize, limits::MAX_VARS, "local variables")?;
        }
        Ok(())
    }

    /// Close the scope of all variables down to `tolevel`.
    pub fn remove_vars(&mut self, tolevel: u16) {
        let n = (self.fs().nactvar - tolevel) as usize;
        let pc = self.pc();
        while self.fs().nactvar > tolevel {
            self.fs_mut().nactvar -= 1;
            let vidx = self.fs().nactvar;
            if let Some(pidx) = self.local_debug_index(vidx) {
                self.fs_mut().proto.loc_vars[pidx].end_pc = pc;
            }
        }
        self.dyd.actvar.truncate(self.dyd.actvar.len() - n);
    }

    /// The debug-table index for variable `vidx`, when it has one
    /// (constants do not).
    fn local_debug_index(&self, vidx: u16) -> Option<usize> {
        let vd = self.local_var(vidx);
        if vd.in_reg() {
            Some(vd.pidx as usize)
        } else {
            None
        }
    }

    /// Debug-table entry of variable `vidx`, for patching `start_pc`.
    pub fn local_debug_info(&mut self, vidx: u16) -> Option<&mut LocVar> {
        let idx = self.local_debug_index(vidx)?;
        Some(&mut self.fs_mut().proto.loc_vars[idx])
    }

    /// Create an expression for local variable `vidx`.
    pub fn init_local_exp(&self, e: &mut ExpDesc, vidx: u16) {
        e.init(ExpKind::Local { reg: self.local_var(vidx).ridx as u32, vidx });
    }

    // ---------------------------------------------------------------
    // Upvalues and variable resolution
    // ---------------------------------------------------------------

    fn search_upvalue(&self, level: usize, name: &LuaStr) -> Option<u32> {
        self.fs_stack[level]
            .proto
            .upvalues
            .iter()
            .position(|uv| uv.name.as_ref() == Some(name))
            .map(|i| i as u32)
    }

    fn new_upvalue(&mut self, level: usize, name: &LuaStr, v: &ExpDesc) -> LunaResult<u32> {
        self.check_limit(
            self.fs_stack[level].proto.upvalues.len() + 1,
            limits::MAX_UPVAL,
            "upvalues",
        )?;
        let desc = match v.kind {
            ExpKind::Local { reg, vidx } => {
                let kind = self.local_var_at(level - 1, vidx).kind;
                UpvalDesc { name: Some(name.clone()), in_stack: true, index: reg as u8, kind }
            }
            ExpKind::Upval(idx) => {
                let up = &self.fs_stack[level - 1].proto.upvalues[idx as usize];
                UpvalDesc {
                    name: Some(name.clone()),
                    in_stack: false,
                    index: idx as u8,
                    kind: up.kind,
                }
            }
            ref k => unreachable!("not capturable: {:?}", k),
        };
        let ups = &mut self.fs_stack[level].proto.upvalues;
        ups.push(desc);
        Ok((ups.len() - 1) as u32)
    }

    /// Look for an active variable named `name` in the function at
    /// `level`. Initializes `var` and returns true when found. While
    /// searching, the Global sentinel in `var` tracks collective
    /// declarations exactly as described in the data model.
    fn search_var(&self, level: usize, name: &LuaStr, var: &mut ExpDesc) -> bool {
        let fs = &self.fs_stack[level];
        for vidx in (0..fs.nactvar).rev() {
            let vd = self.local_var_at(level, vidx);
            if vd.is_global() {
                match &vd.name {
                    None => {
                        // collective declaration: remember the innermost
                        if let ExpKind::Global(info) = var.kind {
                            if info < 0 {
                                var.kind =
                                    ExpKind::Global((fs.first_local + vidx as usize) as i32);
                            }
                        }
                    }
                    Some(n) => {
                        if n == name {
                            var.init(ExpKind::Global(
                                (fs.first_local + vidx as usize) as i32,
                            ));
                            return true;
                        } else if var.kind == ExpKind::Global(-1) {
                            // some global declaration invalidates the
                            // preambular one
                            var.kind = ExpKind::Global(-2);
                        }
                    }
                }
            } else if vd.name.as_ref() == Some(name) {
                if vd.kind == var_kind::RDKCTC {
                    var.init(ExpKind::Const((fs.first_local + vidx as usize) as u32));
                } else {
                    var.init(ExpKind::Local { reg: vd.ridx as u32, vidx });
                }
                return true;
            }
        }
        false
    }

    /// Mark the block where the variable at compiler index `vidx` was
    /// defined, so its scope exit emits a close.
    fn mark_upval(&mut self, level: usize, vidx: u16) {
        let fs = &mut self.fs_stack[level];
        for bl in fs.blocks.iter_mut().rev() {
            if bl.nactvar <= vidx {
                bl.upval = true;
                break;
            }
        }
        fs.needclose = true;
    }

    /// Mark that the current block has a to-be-closed variable.
    pub fn mark_to_be_closed(&mut self) {
        let fs = self.fs_mut();
        let bl = fs.blocks.last_mut().expect("no open block");
        bl.upval = true;
        bl.inside_tbc = true;
        fs.needclose = true;
    }

    /// Find the variable named `name` at `level`, walking outward. On a
    /// hit in an enclosing function, upvalue entries are chained through
    /// every intermediate function. Globals leave `var` in the Global
    /// kind with its sentinel.
    fn single_var_aux(
        &mut self,
        level: usize,
        name: &LuaStr,
        var: &mut ExpDesc,
        base: bool,
    ) -> LunaResult<()> {
        if self.search_var(level, name, var) {
            if let ExpKind::Local { vidx, .. } = var.kind {
                if !base {
                    self.mark_upval(level, vidx); // local used as upvalue
                }
            }
        } else {
            // not found at this level; try upvalues
            let mut idx = self.search_upvalue(level, name);
            if idx.is_none() {
                if level > 0 {
                    self.single_var_aux(level - 1, name, var, false)?;
                }
                match var.kind {
                    ExpKind::Local { .. } | ExpKind::Upval(_) => {
                        idx = Some(self.new_upvalue(level, name, var)?);
                    }
                    _ => return Ok(()), // global or constant
                }
            }
            var.init(ExpKind::Upval(idx.unwrap()));
        }
        Ok(())
    }

    /// Resolve `name` starting at the innermost function. The result is
    /// Local, Upval, Const, or Global-with-sentinel.
    pub fn resolve_var(&mut self, name: &LuaStr, var: &mut ExpDesc) -> LunaResult<()> {
        var.init(ExpKind::Global(-1));
        self.single_var_aux(self.level(), name, var, true)
    }

    // ---------------------------------------------------------------
    // Function nesting
    // ---------------------------------------------------------------

    /// Open a new function state nested in the current one.
    pub fn open_func(&mut self, source: Option<LuaStr>, line_defined: u32) {
        let mut proto = Proto::new();
        proto.source = source;
        proto.line_defined = line_defined;
        proto.max_stack_size = 2; // registers 0/1 are always valid
        let fs = FuncState::new(proto, self.dyd.actvar.len(), self.dyd.label.len());
        self.fs_stack.push(fs);
        self.enter_block(BL_NOT_LOOP);
    }

    /// Finalize the current function: final return, jump peephole,
    /// block close. Pops the state and returns the finished prototype.
    pub fn close_func(&mut self) -> LunaResult<Proto> {
        let nvars = self.nvar_stack();
        // skip the final return when the body already ends on an
        // identical one (no jump may target the skipped position)
        let redundant = self.previous_instruction().is_some_and(|i| {
            i.opcode() == Some(luna_bytecode::OpCode::Return0) && i.a() == nvars
        });
        if !redundant {
            self.ret(nvars, 0)?; // final return
        }
        self.leave_block()?;
        debug_assert!(self.fs().blocks.is_empty());
        self.finish()?;
        let fs = self.fs_stack.pop().expect("no active function");
        log::trace!(
            "close_func: {} instructions, {} constants, max stack {}",
            fs.proto.code.len(),
            fs.proto.constants.len(),
            fs.proto.max_stack_size
        );
        Ok(fs.proto)
    }

    /// Mark the current function as vararg, emitting the prologue
    /// adjustment.
    pub fn set_vararg(&mut self, nparams: u32) -> LunaResult<()> {
        use luna_bytecode::proto::PF_ISVARARG;
        self.fs_mut().proto.flag |= PF_ISVARARG;
        self.code_abc(luna_bytecode::OpCode::VarargPrep, nparams, 0, 0)?;
        Ok(())
    }

    /// Reserve the stack slot count for registers used by the function.
    pub fn check_stack(&mut self, n: u32) -> LunaResult<()> {
        let new_stack = self.fs().freereg + n;
        if new_stack > self.fs().proto.max_stack_size as u32 {
            self.check_limit(new_stack as usize, MAX_FSTACK as usize, "registers")?;
            self.fs_mut().proto.max_stack_size = new_stack as u8;
        }
        Ok(())
    }

    /// Reserve `n` registers.
    pub fn reserve_regs(&mut self, n: u32) -> LunaResult<()> {
        self.check_stack(n)?;
        self.fs_mut().freereg += n;
        Ok(())
    }
}
