//! The Luna VM opcode set.
//!
//! Every opcode carries a mode byte recording its instruction format plus
//! the properties the code generator and the finish pass consult:
//! whether it writes register A, whether it must be followed by a jump
//! (test mode), whether it consumes or produces a variable number of
//! stack slots, and whether it is a metamethod call.

use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;

/// Basic instruction formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpMode {
    IAbc,
    IvAbc,
    IABx,
    IAsBx,
    IAx,
    IsJ,
}

/// Complete opcode set (83 opcodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    // Load/move operations
    Move = 0,   // R[A] := R[B]
    LoadI,      // R[A] := sBx
    LoadF,      // R[A] := (float)sBx
    LoadK,      // R[A] := K[Bx]
    LoadKX,     // R[A] := K[extra arg]
    LoadFalse,  // R[A] := false
    LFalseSkip, // R[A] := false; pc++
    LoadTrue,   // R[A] := true
    LoadNil,    // R[A], R[A+1], ..., R[A+B] := nil

    // Upvalue operations
    GetUpval, // R[A] := UpValue[B]
    SetUpval, // UpValue[B] := R[A]

    // Table get operations
    GetTabUp, // R[A] := UpValue[B][K[C]:shortstring]
    GetTable, // R[A] := R[B][R[C]]
    GetI,     // R[A] := R[B][C]
    GetField, // R[A] := R[B][K[C]:shortstring]

    // Table set operations
    SetTabUp, // UpValue[A][K[B]:shortstring] := RK(C)
    SetTable, // R[A][R[B]] := RK(C)
    SetI,     // R[A][B] := RK(C)
    SetField, // R[A][K[B]:shortstring] := RK(C)

    NewTable, // R[A] := {}  (vB = log2 hash size + 1, vC/extra = array size)

    SelfOp, // R[A+1] := R[B]; R[A] := R[B][K[C]:shortstring]

    AddI, // R[A] := R[B] + sC

    // Arithmetic with K operand
    AddK,  // R[A] := R[B] + K[C]:number
    SubK,  // R[A] := R[B] - K[C]:number
    MulK,  // R[A] := R[B] * K[C]:number
    ModK,  // R[A] := R[B] % K[C]:number
    PowK,  // R[A] := R[B] ^ K[C]:number
    DivK,  // R[A] := R[B] / K[C]:number
    IDivK, // R[A] := R[B] // K[C]:number

    // Bitwise with K operand
    BAndK, // R[A] := R[B] & K[C]:integer
    BOrK,  // R[A] := R[B] | K[C]:integer
    BXorK, // R[A] := R[B] ~ K[C]:integer

    // Immediate shifts
    ShlI, // R[A] := sC << R[B]
    ShrI, // R[A] := R[B] >> sC

    // Arithmetic, register-register
    Add,  // R[A] := R[B] + R[C]
    Sub,  // R[A] := R[B] - R[C]
    Mul,  // R[A] := R[B] * R[C]
    Mod,  // R[A] := R[B] % R[C]
    Pow,  // R[A] := R[B] ^ R[C]
    Div,  // R[A] := R[B] / R[C]
    IDiv, // R[A] := R[B] // R[C]

    // Bitwise, register-register
    BAnd, // R[A] := R[B] & R[C]
    BOr,  // R[A] := R[B] | R[C]
    BXor, // R[A] := R[B] ~ R[C]
    Shl,  // R[A] := R[B] << R[C]
    Shr,  // R[A] := R[B] >> R[C]

    // Metamethod fallbacks; each follows its arithmetic/bitwise opcode
    MmBin,  // call C metamethod over R[A] and R[B]
    MmBinI, // call C metamethod over R[A] and sB
    MmBinK, // call C metamethod over R[A] and K[B]

    // Unary operations
    Unm,  // R[A] := -R[B]
    BNot, // R[A] := ~R[B]
    Not,  // R[A] := not R[B]
    Len,  // R[A] := #R[B]

    Concat, // R[A] := R[A].. ... ..R[A + B - 1]

    Close, // close all upvalues >= R[A]
    Tbc,   // mark variable A "to be closed"
    Jmp,   // pc += sJ

    // Comparisons
    Eq, // if ((R[A] == R[B]) ~= k) then pc++
    Lt, // if ((R[A] <  R[B]) ~= k) then pc++
    Le, // if ((R[A] <= R[B]) ~= k) then pc++

    // Comparisons with constant/immediate
    EqK, // if ((R[A] == K[B]) ~= k) then pc++
    EqI, // if ((R[A] == sB) ~= k) then pc++
    LtI, // if ((R[A] < sB) ~= k) then pc++
    LeI, // if ((R[A] <= sB) ~= k) then pc++
    GtI, // if ((R[A] > sB) ~= k) then pc++
    GeI, // if ((R[A] >= sB) ~= k) then pc++

    Test,    // if (not R[A] == k) then pc++
    TestSet, // if (not R[B] == k) then pc++ else R[A] := R[B]

    Call,     // R[A], ... ,R[A+C-2] := R[A](R[A+1], ... ,R[A+B-1])
    TailCall, // return R[A](R[A+1], ... ,R[A+B-1])

    Return,  // return R[A], ... ,R[A+B-2]
    Return0, // return
    Return1, // return R[A]

    ForLoop, // update counters; if loop continues then pc -= Bx
    ForPrep, // check values and prepare counters; if not to run then pc += Bx+1

    TForPrep, // create upvalue for R[A+3]; pc += Bx
    TForCall, // R[A+4], ... ,R[A+3+C] := R[A](R[A+1], R[A+2])
    TForLoop, // if R[A+2] ~= nil then { R[A] := R[A+2]; pc -= Bx }

    SetList, // R[A][vC+i] := R[A+i], 1 <= i <= vB

    Closure, // R[A] := closure(KPROTO[Bx])

    Vararg,     // R[A], R[A+1], ..., R[A+C-2] = vararg
    VarargPrep, // adjust vararg parameters

    ExtraArg, // extra (larger) argument for previous opcode
}

pub const NUM_OPCODES: usize = OpCode::ExtraArg as usize + 1;

/// Property bits packed next to the format in the mode table.
const SETS_A: u8 = 1 << 3;
const TEST: u8 = 1 << 4;
const IN_TOP: u8 = 1 << 5;
const OUT_TOP: u8 = 1 << 6;
const MM: u8 = 1 << 7;

const fn opmode(mm: u8, ot: u8, it: u8, t: u8, a: u8, m: OpMode) -> u8 {
    (mm << 7) | (ot << 6) | (it << 5) | (t << 4) | (a << 3) | m as u8
}

#[rustfmt::skip]
static OPMODES: [u8; NUM_OPCODES] = [
    //     MM OT IT T  A  mode            opcode
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Move
    opmode(0, 0, 0, 0, 1, OpMode::IAsBx), // LoadI
    opmode(0, 0, 0, 0, 1, OpMode::IAsBx), // LoadF
    opmode(0, 0, 0, 0, 1, OpMode::IABx),  // LoadK
    opmode(0, 0, 0, 0, 1, OpMode::IABx),  // LoadKX
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // LoadFalse
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // LFalseSkip
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // LoadTrue
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // LoadNil
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // GetUpval
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // SetUpval
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // GetTabUp
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // GetTable
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // GetI
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // GetField
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // SetTabUp
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // SetTable
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // SetI
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // SetField
    opmode(0, 0, 0, 0, 1, OpMode::IvAbc), // NewTable
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // SelfOp
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // AddI
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // AddK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // SubK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // MulK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // ModK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // PowK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // DivK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // IDivK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BAndK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BOrK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BXorK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // ShlI
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // ShrI
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Add
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Sub
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Mul
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Mod
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Pow
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Div
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // IDiv
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BAnd
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BOr
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BXor
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Shl
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Shr
    opmode(1, 0, 0, 0, 0, OpMode::IAbc),  // MmBin
    opmode(1, 0, 0, 0, 0, OpMode::IAbc),  // MmBinI
    opmode(1, 0, 0, 0, 0, OpMode::IAbc),  // MmBinK
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Unm
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // BNot
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Not
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Len
    opmode(0, 0, 0, 0, 1, OpMode::IAbc),  // Concat
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // Close
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // Tbc
    opmode(0, 0, 0, 0, 0, OpMode::IsJ),   // Jmp
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // Eq
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // Lt
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // Le
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // EqK
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // EqI
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // LtI
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // LeI
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // GtI
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // GeI
    opmode(0, 0, 0, 1, 0, OpMode::IAbc),  // Test
    opmode(0, 0, 0, 1, 1, OpMode::IAbc),  // TestSet
    opmode(0, 1, 1, 0, 1, OpMode::IAbc),  // Call
    opmode(0, 1, 1, 0, 1, OpMode::IAbc),  // TailCall
    opmode(0, 0, 1, 0, 0, OpMode::IAbc),  // Return
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // Return0
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // Return1
    opmode(0, 0, 0, 0, 1, OpMode::IABx),  // ForLoop
    opmode(0, 0, 0, 0, 1, OpMode::IABx),  // ForPrep
    opmode(0, 0, 0, 0, 0, OpMode::IABx),  // TForPrep
    opmode(0, 0, 0, 0, 0, OpMode::IAbc),  // TForCall
    opmode(0, 0, 0, 0, 1, OpMode::IABx),  // TForLoop
    opmode(0, 0, 1, 0, 0, OpMode::IvAbc), // SetList
    opmode(0, 0, 0, 0, 1, OpMode::IABx),  // Closure
    opmode(0, 1, 0, 0, 1, OpMode::IAbc),  // Vararg
    opmode(0, 0, 1, 0, 1, OpMode::IAbc),  // VarargPrep
    opmode(0, 0, 0, 0, 0, OpMode::IAx),   // ExtraArg
];

static NAMES: [&str; NUM_OPCODES] = [
    "MOVE", "LOADI", "LOADF", "LOADK", "LOADKX", "LOADFALSE", "LFALSESKIP",
    "LOADTRUE", "LOADNIL", "GETUPVAL", "SETUPVAL", "GETTABUP", "GETTABLE",
    "GETI", "GETFIELD", "SETTABUP", "SETTABLE", "SETI", "SETFIELD",
    "NEWTABLE", "SELF", "ADDI", "ADDK", "SUBK", "MULK", "MODK", "POWK",
    "DIVK", "IDIVK", "BANDK", "BORK", "BXORK", "SHLI", "SHRI", "ADD", "SUB",
    "MUL", "MOD", "POW", "DIV", "IDIV", "BAND", "BOR", "BXOR", "SHL", "SHR",
    "MMBIN", "MMBINI", "MMBINK", "UNM", "BNOT", "NOT", "LEN", "CONCAT",
    "CLOSE", "TBC", "JMP", "EQ", "LT", "LE", "EQK", "EQI", "LTI", "LEI",
    "GTI", "GEI", "TEST", "TESTSET", "CALL", "TAILCALL", "RETURN", "RETURN0",
    "RETURN1", "FORLOOP", "FORPREP", "TFORPREP", "TFORCALL", "TFORLOOP",
    "SETLIST", "CLOSURE", "VARARG", "VARARGPREP", "EXTRAARG",
];

impl OpCode {
    /// Decode a raw opcode number; `None` for out-of-range values.
    pub fn from_u8(raw: u8) -> Option<OpCode> {
        if (raw as usize) < NUM_OPCODES {
            // Safety by construction: the enum is repr(u8), contiguous from 0.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(raw) })
        } else {
            None
        }
    }

    pub fn mode(self) -> OpMode {
        match OPMODES[self as usize] & 7 {
            0 => OpMode::IAbc,
            1 => OpMode::IvAbc,
            2 => OpMode::IABx,
            3 => OpMode::IAsBx,
            4 => OpMode::IAx,
            _ => OpMode::IsJ,
        }
    }

    /// Whether the instruction writes register A.
    pub fn sets_a(self) -> bool {
        OPMODES[self as usize] & SETS_A != 0
    }

    /// Test mode: the next instruction must be a jump.
    pub fn is_test(self) -> bool {
        OPMODES[self as usize] & TEST != 0
    }

    /// Uses the stack top set by the previous instruction (when B == 0).
    pub fn uses_top(self) -> bool {
        OPMODES[self as usize] & IN_TOP != 0
    }

    /// Sets the stack top for the next instruction (when C == 0).
    pub fn sets_top(self) -> bool {
        OPMODES[self as usize] & OUT_TOP != 0
    }

    /// Metamethod-call instruction.
    pub fn is_mm(self) -> bool {
        OPMODES[self as usize] & MM != 0
    }

    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }
}

/// Whether instruction `i` produces multiple values ("out top").
pub fn is_ot(i: Instruction) -> bool {
    match i.opcode() {
        Some(OpCode::TailCall) => true,
        Some(op) => op.sets_top() && i.c() == 0,
        None => false,
    }
}

/// Whether instruction `i` accepts multiple values ("in top").
pub fn is_it(i: Instruction) -> bool {
    match i.opcode() {
        Some(OpCode::SetList) => OpCode::SetList.uses_top() && i.vb() == 0,
        Some(op) => op.uses_top() && i.b() == 0,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_numbering_is_dense() {
        for raw in 0..NUM_OPCODES as u8 {
            let op = OpCode::from_u8(raw).unwrap();
            assert_eq!(op as u8, raw);
        }
        assert!(OpCode::from_u8(NUM_OPCODES as u8).is_none());
    }

    #[test]
    fn mode_table_spot_checks() {
        assert_eq!(OpCode::LoadI.mode(), OpMode::IAsBx);
        assert_eq!(OpCode::NewTable.mode(), OpMode::IvAbc);
        assert_eq!(OpCode::Jmp.mode(), OpMode::IsJ);
        assert_eq!(OpCode::ExtraArg.mode(), OpMode::IAx);
        assert!(OpCode::TestSet.is_test());
        assert!(OpCode::TestSet.sets_a());
        assert!(OpCode::Eq.is_test());
        assert!(!OpCode::Eq.sets_a());
        assert!(OpCode::Call.uses_top() && OpCode::Call.sets_top());
        assert!(OpCode::MmBinI.is_mm());
        assert!(!OpCode::SetTabUp.sets_a());
    }
}
