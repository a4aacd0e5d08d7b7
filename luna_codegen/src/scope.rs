//! Blocks, labels, and goto resolution.
//!
//! Forward gotos accumulate in a pending list; when a block finishes,
//! each one either resolves against a label of that block or is exported
//! to the enclosing block, recording whether the path escapes a variable
//! that may need closing. Every goto reserves a dead CLOSE placeholder
//! right after its jump; resolution swaps the pair when the jump really
//! must close upvalues.

use luna_bytecode::instruction::Instruction;
use luna_bytecode::OpCode;
use luna_common::{LunaError, LunaResult, LuaStr};

use crate::func_state::{Block, Compiler, LabelDesc, BL_LOOP, BL_LOOP_WITH_BREAKS, BL_NOT_LOOP};

/// The reserved label name `break` statements jump to.
pub fn break_label_name() -> LuaStr {
    LuaStr::from("break")
}

impl Compiler {
    pub fn enter_block(&mut self, is_loop: u8) {
        let inside_tbc = self
            .fs()
            .blocks
            .last()
            .map(|bl| bl.inside_tbc)
            .unwrap_or(false);
        let bl = Block {
            first_label: self.dyd.label.len(),
            first_goto: self.dyd.gt.len(),
            nactvar: self.fs().nactvar,
            upval: false,
            is_loop,
            inside_tbc,
        };
        debug_assert!(self.fs().freereg == self.nvar_stack());
        self.fs_mut().blocks.push(bl);
    }

    /// Close the current block: emit the close for captured locals, drop
    /// block variables, resolve or export its pending gotos.
    pub fn leave_block(&mut self) -> LunaResult<()> {
        let bl = self.fs().block().clone();
        let stklevel = self.reg_level(bl.nactvar); // level outside the block
        let has_previous = self.fs().blocks.len() > 1;
        if has_previous && bl.upval {
            self.code_abc(OpCode::Close, stklevel, 0, 0)?;
        }
        self.fs_mut().freereg = stklevel; // free registers
        if bl.is_loop == BL_LOOP_WITH_BREAKS {
            // create the implicit label that pending breaks jump to,
            // with the variable level outside the block
            let pc = self.get_label();
            self.dyd.label.push(LabelDesc {
                name: break_label_name(),
                pc,
                line: 0,
                nactvar: bl.nactvar,
                close: false,
            });
        }
        // solve gotos while the block's variables are still recorded,
        // so scope errors can name the variable being entered
        self.solve_gotos(&bl)?;
        self.remove_vars(bl.nactvar); // remove block locals
        debug_assert_eq!(self.fs().nactvar, bl.nactvar); // back to level on entry
        if !has_previous {
            // last block of the function: no goto may remain
            if bl.first_goto < self.dyd.gt.len() {
                let gt = self.dyd.gt[bl.first_goto].clone();
                return Err(self.undef_goto_error(&gt));
            }
        }
        self.fs_mut().blocks.pop();
        Ok(())
    }

    /// Whether some enclosing block is a loop; marks it as having
    /// pending breaks. Returns false outside any loop.
    pub fn mark_break_target(&mut self) -> bool {
        let fs = self.fs_mut();
        for bl in fs.blocks.iter_mut().rev() {
            if bl.is_loop != BL_NOT_LOOP {
                bl.is_loop = BL_LOOP_WITH_BREAKS;
                return true;
            }
        }
        false
    }

    /// Whether the innermost block is inside a to-be-closed scope
    /// (which disables tail calls).
    pub fn inside_tbc(&self) -> bool {
        self.fs().block().inside_tbc
    }

    fn jump_scope_error(&self, gt: &LabelDesc) -> LunaError {
        let vd = self.local_var(gt.nactvar);
        let varname = vd
            .name
            .as_ref()
            .map(|n| n.display().into_owned())
            .unwrap_or_else(|| "*".to_string());
        self.sem_error(&format!(
            "<goto {}> at line {} jumps into the scope of '{}'",
            gt.name.display(),
            gt.line,
            varname
        ))
    }

    fn undef_goto_error(&self, gt: &LabelDesc) -> LunaError {
        debug_assert!(gt.name != break_label_name()); // breaks are checked at creation
        self.sem_error(&format!(
            "no visible label '{}' for <goto> at line {}",
            gt.name.display(),
            gt.line
        ))
    }

    /// Close the pending goto at index `g` against `label` and remove it
    /// from the list. `block_upval` tells whether the finishing block
    /// has upvalues.
    fn close_goto(&mut self, g: usize, label: &LabelDesc, block_upval: bool) -> LunaResult<()> {
        let gt = self.dyd.gt[g].clone();
        debug_assert_eq!(gt.name, label.name);
        if gt.nactvar < label.nactvar {
            // goto jumps into the scope of some variable
            return Err(self.jump_scope_error(&gt));
        }
        let mut jump_pc = gt.pc;
        if gt.close || (label.nactvar < gt.nactvar && block_upval) {
            let stklevel = self.reg_level(label.nactvar);
            // move the jump over its placeholder and put a live CLOSE at
            // the original position
            let jmp = self.instr(gt.pc);
            *self.instr_mut(gt.pc + 1) = jmp;
            *self.instr_mut(gt.pc) = Instruction::abck(OpCode::Close, stklevel, 0, 0, 0);
            jump_pc += 1;
        }
        self.patch_list(jump_pc as i32, label.pc)?;
        self.dyd.gt.remove(g);
        Ok(())
    }

    /// Search the active labels from index `ilb` for one named `name`.
    fn find_label(&self, name: &LuaStr, ilb: usize) -> Option<LabelDesc> {
        self.dyd.label[ilb..]
            .iter()
            .find(|lb| &lb.name == name)
            .cloned()
    }

    /// Whether the current function already defines label `name`
    /// (for duplicate detection); returns its line.
    pub fn find_repeated_label(&self, name: &LuaStr) -> Option<u32> {
        self.find_label(name, self.fs().first_label).map(|lb| lb.line)
    }

    /// Register a new pending goto for `name`: an open jump plus its
    /// dead CLOSE placeholder.
    pub fn new_goto_entry(&mut self, name: LuaStr, line: u32) -> LunaResult<()> {
        let pc = self.jump()?;
        self.code_abc(OpCode::Close, 0, 1, 0)?; // placeholder, marked as dead
        let nactvar = self.fs().nactvar;
        self.dyd.gt.push(LabelDesc { name, pc: pc as u32, line, nactvar, close: false });
        Ok(())
    }

    /// Create a label named `name` at the current position. `last`
    /// tells whether the label is the final non-op statement of its
    /// block, in which case block locals are already conceptually dead.
    pub fn create_label(&mut self, name: LuaStr, line: u32, last: bool) -> LunaResult<()> {
        let pc = self.get_label();
        let mut nactvar = self.fs().nactvar;
        if last {
            nactvar = self.fs().block().nactvar;
        }
        self.dyd.label.push(LabelDesc { name, pc, line, nactvar, close: false });
        Ok(())
    }

    /// Resolve the pending gotos of a finishing block: close those that
    /// match a label of the block, export the rest to the enclosing
    /// block with their variable level corrected.
    fn solve_gotos(&mut self, bl: &Block) -> LunaResult<()> {
        let out_level = self.reg_level(bl.nactvar); // level outside the block
        let mut igt = bl.first_goto;
        while igt < self.dyd.gt.len() {
            let gt = self.dyd.gt[igt].clone();
            match self.find_label(&gt.name, bl.first_label) {
                Some(lb) => {
                    self.close_goto(igt, &lb, bl.upval)?; // removes the goto
                }
                None => {
                    // export the goto to the outer block
                    if bl.upval && self.reg_level(gt.nactvar) > out_level {
                        // jump escapes the scope of some variable
                        self.dyd.gt[igt].close = true;
                    }
                    self.dyd.gt[igt].nactvar = bl.nactvar;
                    igt += 1;
                }
            }
        }
        self.dyd.label.truncate(bl.first_label); // remove local labels
        Ok(())
    }

    /// Handle the `<close>` attribute: mark the block and emit TBC for
    /// the variable at compiler index `level`.
    pub fn check_to_close(&mut self, level: i32) -> LunaResult<()> {
        if level != -1 {
            self.mark_to_be_closed();
            let reg = self.reg_level(level as u16);
            self.code_abc(OpCode::Tbc, reg, 0, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_nest_and_unwind() {
        let mut c = Compiler::new("=t");
        c.open_func(None, 0);
        c.enter_block(BL_NOT_LOOP);
        assert!(!c.inside_tbc());
        c.mark_to_be_closed();
        assert!(c.inside_tbc());
        c.enter_block(BL_NOT_LOOP);
        // inherited from the enclosing block
        assert!(c.inside_tbc());
        c.leave_block().unwrap();
        c.leave_block().unwrap();
    }

    #[test]
    fn break_outside_loop_is_detected() {
        let mut c = Compiler::new("=t");
        c.open_func(None, 0);
        assert!(!c.mark_break_target());
        c.enter_block(BL_LOOP);
        assert!(c.mark_break_target());
        assert_eq!(c.fs().block().is_loop, BL_LOOP_WITH_BREAKS);
    }

    #[test]
    fn undefined_goto_is_fatal() {
        let mut c = Compiler::new("=t");
        c.lastline = 3;
        c.open_func(None, 0);
        c.new_goto_entry(LuaStr::from("out"), 3).unwrap();
        let err = c.close_func().unwrap_err();
        assert!(err.message().contains("no visible label 'out'"));
    }

    #[test]
    fn goto_resolves_to_label_in_same_block() {
        let mut c = Compiler::new("=t");
        c.open_func(None, 0);
        c.create_label(LuaStr::from("top"), 1, false).unwrap();
        c.new_goto_entry(LuaStr::from("top"), 2).unwrap();
        let proto = c.close_func().unwrap();
        // JMP back to pc 0, followed by the dead placeholder
        assert_eq!(proto.code[0].opcode(), Some(OpCode::Jmp));
        assert_eq!(proto.code[0].sj_arg(), -1);
        assert_eq!(proto.code[1].opcode(), Some(OpCode::Close));
    }
}
