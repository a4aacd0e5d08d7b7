//! Function prototypes: the output artifact of a compilation.

use serde::{Deserialize, Serialize};

use luna_common::LuaStr;

use crate::instruction::Instruction;
use crate::value::Value;

/// Prototype flag: the function accepts varargs.
pub const PF_ISVARARG: u8 = 1;
/// Prototype flag: the chunk was loaded from a fixed buffer.
pub const PF_FIXED: u8 = 2;

/// Sentinel in `line_info` meaning "consult the absolute table".
pub const ABS_LINE_INFO: i8 = -0x80;
/// Maximum run of instructions between absolute line-info anchors.
pub const MAX_INSTR_WITH_ABS: u32 = 128;
/// Line deltas at or above this magnitude force an absolute entry.
pub const LIM_LINE_DIFF: i32 = 0x80;

/// Kinds of variables, recorded in upvalue descriptors and the
/// compile-time variable table.
pub mod var_kind {
    /// Regular local.
    pub const VDKREG: u8 = 0;
    /// Local constant (`<const>`).
    pub const RDKCONST: u8 = 1;
    /// To-be-closed local (`<close>`).
    pub const RDKTOCLOSE: u8 = 2;
    /// Local compile-time constant.
    pub const RDKCTC: u8 = 3;
    /// Regular global declaration.
    pub const GDKREG: u8 = 4;
    /// Constant global declaration.
    pub const GDKCONST: u8 = 5;
}

/// Description of one upvalue of a prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpvalDesc {
    /// Upvalue name, for debug information.
    pub name: Option<LuaStr>,
    /// Whether it refers to a register of the enclosing function (true)
    /// or to one of its upvalues (false).
    pub in_stack: bool,
    /// Index of the upvalue in the enclosing function's registers or
    /// upvalue list.
    pub index: u8,
    /// Kind of the captured variable (see [`var_kind`]).
    pub kind: u8,
}

/// Debug information for a local variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocVar {
    pub name: Option<LuaStr>,
    /// First instruction where the variable is active.
    pub start_pc: u32,
    /// First instruction where the variable is dead.
    pub end_pc: u32,
}

/// Absolute line-info anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// The compiled representation of one function body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Proto {
    /// Number of fixed (named) parameters.
    pub num_params: u8,
    /// PF_ISVARARG | PF_FIXED.
    pub flag: u8,
    /// Number of registers the function needs.
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub upvalues: Vec<UpvalDesc>,
    /// Nested function prototypes, in order of definition.
    pub protos: Vec<Proto>,
    /// Debug: signed per-instruction line deltas ([`ABS_LINE_INFO`] marks
    /// an absolute entry).
    pub line_info: Vec<i8>,
    /// Debug: absolute line anchors.
    pub abs_line_info: Vec<AbsLineInfo>,
    /// Debug: local-variable lifetimes.
    pub loc_vars: Vec<LocVar>,
    /// Debug: source name of the chunk.
    pub source: Option<LuaStr>,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

impl Proto {
    pub fn new() -> Proto {
        Proto::default()
    }

    pub fn is_vararg(&self) -> bool {
        self.flag & PF_ISVARARG != 0
    }

    /// Resolve the source line of the instruction at `pc` from the debug
    /// tables, or `None` when the prototype was stripped.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        if self.line_info.is_empty() {
            return None;
        }
        // Nearest absolute anchor at or below pc, else the function head.
        let (mut base_pc, mut line) = match self
            .abs_line_info
            .iter()
            .rev()
            .find(|a| a.pc as usize <= pc)
        {
            Some(a) => (a.pc as i64, a.line as i64),
            None => (-1i64, self.line_defined as i64),
        };
        while base_pc < pc as i64 {
            base_pc += 1;
            let delta = self.line_info[base_pc as usize];
            debug_assert_ne!(delta, ABS_LINE_INFO);
            line += delta as i64;
        }
        Some(line as u32)
    }
}

/// A main closure: the root prototype together with its (single) `_ENV`
/// upvalue slot, as produced by a successful load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub proto: Proto,
}

impl Closure {
    pub fn new(proto: Proto) -> Closure {
        Closure { proto }
    }

    pub fn num_upvalues(&self) -> usize {
        self.proto.upvalues.len()
    }
}
