//! Packed 32-bit instruction words.
//!
//! All instructions carry the opcode in the low 7 bits. The remaining 25
//! bits are split per format:
//!
//! ```text
//! iABC    C(8)  | B(8)  |k| A(8) | Op(7)
//! ivABC   vC(10)| vB(6) |k| A(8) | Op(7)
//! iABx        Bx(17)      | A(8) | Op(7)
//! iAsBx      sBx(17)      | A(8) | Op(7)
//! iAx             Ax(25)         | Op(7)
//! isJ             sJ(25)         | Op(7)
//! ```
//!
//! Signed arguments are stored in excess-K form: the written value is the
//! represented value plus half the field's unsigned maximum.

use serde::{Deserialize, Serialize};

use crate::opcode::OpCode;

pub const SIZE_OP: u32 = 7;
pub const SIZE_A: u32 = 8;
pub const SIZE_B: u32 = 8;
pub const SIZE_C: u32 = 8;
pub const SIZE_VB: u32 = 6;
pub const SIZE_VC: u32 = 10;
pub const SIZE_BX: u32 = SIZE_C + SIZE_B + 1;
pub const SIZE_AX: u32 = SIZE_BX + SIZE_A;
pub const SIZE_SJ: u32 = SIZE_BX + SIZE_A;

pub const POS_OP: u32 = 0;
pub const POS_A: u32 = POS_OP + SIZE_OP;
pub const POS_K: u32 = POS_A + SIZE_A;
pub const POS_B: u32 = POS_K + 1;
pub const POS_VB: u32 = POS_K + 1;
pub const POS_C: u32 = POS_B + SIZE_B;
pub const POS_VC: u32 = POS_VB + SIZE_VB;
pub const POS_BX: u32 = POS_K;
pub const POS_AX: u32 = POS_A;
pub const POS_SJ: u32 = POS_A;

pub const MAXARG_A: u32 = (1 << SIZE_A) - 1;
pub const MAXARG_B: u32 = (1 << SIZE_B) - 1;
pub const MAXARG_C: u32 = (1 << SIZE_C) - 1;
pub const MAXARG_VB: u32 = (1 << SIZE_VB) - 1;
pub const MAXARG_VC: u32 = (1 << SIZE_VC) - 1;
pub const MAXARG_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAXARG_AX: u32 = (1 << SIZE_AX) - 1;
pub const MAXARG_SJ: u32 = (1 << SIZE_SJ) - 1;

pub const OFFSET_SBX: i32 = (MAXARG_BX >> 1) as i32;
pub const OFFSET_SJ: i32 = (MAXARG_SJ >> 1) as i32;
pub const OFFSET_SC: i32 = (MAXARG_C >> 1) as i32;

/// Maximum constant index usable as a direct K operand.
pub const MAX_INDEX_RK: u32 = MAXARG_B;

/// Maximum register-file size per function; the highest valid register is
/// one less.
pub const MAX_FSTACK: u32 = MAXARG_A;

/// Invalid register marker (one more than the last valid register).
pub const NO_REG: u32 = MAX_FSTACK;

/// Marks the end of a patch list: invalid as an absolute address, and as
/// a list link it would link an element to itself.
pub const NO_JUMP: i32 = -1;

pub const fn int2sc(i: i32) -> u32 {
    (i + OFFSET_SC) as u32
}

pub const fn sc2int(u: u32) -> i32 {
    u as i32 - OFFSET_SC
}

const fn mask1(n: u32, p: u32) -> u32 {
    (!(!0u32 << n)) << p
}

const fn mask0(n: u32, p: u32) -> u32 {
    !mask1(n, p)
}

/// One VM instruction as a packed 32-bit word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Instruction(pub u32);

impl Instruction {
    pub const fn abck(op: OpCode, a: u32, b: u32, c: u32, k: u32) -> Instruction {
        Instruction(
            ((op as u32) << POS_OP)
                | (a << POS_A)
                | (b << POS_B)
                | (c << POS_C)
                | (k << POS_K),
        )
    }

    pub const fn vabck(op: OpCode, a: u32, vb: u32, vc: u32, k: u32) -> Instruction {
        Instruction(
            ((op as u32) << POS_OP)
                | (a << POS_A)
                | (vb << POS_VB)
                | (vc << POS_VC)
                | (k << POS_K),
        )
    }

    pub const fn abx(op: OpCode, a: u32, bx: u32) -> Instruction {
        Instruction(((op as u32) << POS_OP) | (a << POS_A) | (bx << POS_BX))
    }

    pub const fn asbx(op: OpCode, a: u32, sbx: i32) -> Instruction {
        Instruction::abx(op, a, (sbx + OFFSET_SBX) as u32)
    }

    pub const fn ax(op: OpCode, ax: u32) -> Instruction {
        Instruction(((op as u32) << POS_OP) | (ax << POS_AX))
    }

    pub const fn sj(op: OpCode, sj: i32, k: u32) -> Instruction {
        Instruction(((op as u32) << POS_OP) | (((sj + OFFSET_SJ) as u32) << POS_SJ) | (k << POS_K))
    }

    const fn get(self, pos: u32, size: u32) -> u32 {
        (self.0 >> pos) & mask1(size, 0)
    }

    fn set(&mut self, v: u32, pos: u32, size: u32) {
        self.0 = (self.0 & mask0(size, pos)) | ((v << pos) & mask1(size, pos));
    }

    pub const fn raw_opcode(self) -> u32 {
        self.get(POS_OP, SIZE_OP)
    }

    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_u8(self.raw_opcode() as u8)
    }

    pub fn set_opcode(&mut self, op: OpCode) {
        self.set(op as u32, POS_OP, SIZE_OP);
    }

    pub const fn a(self) -> u32 {
        self.get(POS_A, SIZE_A)
    }

    pub const fn b(self) -> u32 {
        self.get(POS_B, SIZE_B)
    }

    pub const fn c(self) -> u32 {
        self.get(POS_C, SIZE_C)
    }

    pub const fn vb(self) -> u32 {
        self.get(POS_VB, SIZE_VB)
    }

    pub const fn vc(self) -> u32 {
        self.get(POS_VC, SIZE_VC)
    }

    pub const fn k(self) -> u32 {
        self.get(POS_K, 1)
    }

    pub const fn sb(self) -> i32 {
        sc2int(self.b())
    }

    pub const fn sc(self) -> i32 {
        sc2int(self.c())
    }

    pub const fn bx(self) -> u32 {
        self.get(POS_BX, SIZE_BX)
    }

    pub const fn sbx(self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    pub const fn ax_arg(self) -> u32 {
        self.get(POS_AX, SIZE_AX)
    }

    pub const fn sj_arg(self) -> i32 {
        self.get(POS_SJ, SIZE_SJ) as i32 - OFFSET_SJ
    }

    pub fn set_a(&mut self, v: u32) {
        self.set(v, POS_A, SIZE_A);
    }

    pub fn set_b(&mut self, v: u32) {
        self.set(v, POS_B, SIZE_B);
    }

    pub fn set_c(&mut self, v: u32) {
        self.set(v, POS_C, SIZE_C);
    }

    pub fn set_k(&mut self, v: u32) {
        self.set(v, POS_K, 1);
    }

    pub fn set_bx(&mut self, v: u32) {
        self.set(v, POS_BX, SIZE_BX);
    }

    pub fn set_sbx(&mut self, v: i32) {
        self.set_bx((v + OFFSET_SBX) as u32);
    }

    pub fn set_sj(&mut self, v: i32) {
        self.set((v + OFFSET_SJ) as u32, POS_SJ, SIZE_SJ);
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{} <{:#010x}>", op.name(), self.0),
            None => write!(f, "INVALID <{:#010x}>", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn field_layout() {
        let i = Instruction::abck(OpCode::GetField, 3, 200, 255, 1);
        assert_eq!(i.opcode(), Some(OpCode::GetField));
        assert_eq!(i.a(), 3);
        assert_eq!(i.b(), 200);
        assert_eq!(i.c(), 255);
        assert_eq!(i.k(), 1);
    }

    #[test]
    fn signed_fields_use_excess_k() {
        let i = Instruction::asbx(OpCode::LoadI, 0, -65535);
        assert_eq!(i.sbx(), -65535);
        assert_eq!(i.bx(), 0);
        let j = Instruction::sj(OpCode::Jmp, NO_JUMP, 0);
        assert_eq!(j.sj_arg(), NO_JUMP);
        let addi = Instruction::abck(OpCode::AddI, 1, 0, int2sc(1), 0);
        assert_eq!(addi.sc(), 1);
        assert_eq!(addi.c(), 128);
    }

    #[test]
    fn variant_fields_overlay_bc() {
        let i = Instruction::vabck(OpCode::NewTable, 0, 5, 1000, 1);
        assert_eq!(i.vb(), 5);
        assert_eq!(i.vc(), 1000);
        assert_eq!(i.k(), 1);
    }

    #[test]
    fn setters_rewrite_in_place() {
        let mut i = Instruction::sj(OpCode::Jmp, NO_JUMP, 0);
        i.set_sj(42);
        assert_eq!(i.sj_arg(), 42);
        assert_eq!(i.opcode(), Some(OpCode::Jmp));
        let mut t = Instruction::abck(OpCode::TestSet, NO_REG, 7, 0, 1);
        t.set_a(9);
        assert_eq!(t.a(), 9);
        assert_eq!(t.b(), 7);
        assert_eq!(t.k(), 1);
    }

    proptest! {
        /// Decoding and re-encoding an iABC word is byte-for-byte identity.
        #[test]
        fn abc_roundtrip(a in 0u32..=MAXARG_A, b in 0u32..=MAXARG_B,
                         c in 0u32..=MAXARG_C, k in 0u32..=1) {
            let i = Instruction::abck(OpCode::GetTabUp, a, b, c, k);
            let re = Instruction::abck(i.opcode().unwrap(), i.a(), i.b(), i.c(), i.k());
            prop_assert_eq!(i.0, re.0);
        }

        #[test]
        fn sbx_roundtrip(a in 0u32..=MAXARG_A,
                         sbx in -OFFSET_SBX..=(MAXARG_BX as i32 - OFFSET_SBX)) {
            let i = Instruction::asbx(OpCode::LoadI, a, sbx);
            prop_assert_eq!(i.sbx(), sbx);
            prop_assert_eq!(i.a(), a);
        }

        #[test]
        fn sj_roundtrip(sj in -OFFSET_SJ..=(MAXARG_SJ as i32 - OFFSET_SJ)) {
            let i = Instruction::sj(OpCode::Jmp, sj, 0);
            prop_assert_eq!(i.sj_arg(), sj);
        }

        #[test]
        fn vabc_roundtrip(a in 0u32..=MAXARG_A, vb in 0u32..=MAXARG_VB,
                          vc in 0u32..=MAXARG_VC, k in 0u32..=1) {
            let i = Instruction::vabck(OpCode::SetList, a, vb, vc, k);
            prop_assert_eq!(i.vb(), vb);
            prop_assert_eq!(i.vc(), vc);
            prop_assert_eq!(i.a(), a);
            prop_assert_eq!(i.k(), k);
        }
    }
}
