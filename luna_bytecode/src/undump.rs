//! Binary chunk loader.
//!
//! Mirrors the writer's pre-order walk: each prototype is created,
//! attached to its parent, then its children are loaded recursively.
//! Every read is bounds-checked; any deviation from the declared header
//! or structure fails with a `bad binary format` error naming the chunk.

use luna_common::{LunaError, LunaResult, LuaStr};

use crate::dump::{
    tags, LUNAC_DATA, LUNAC_FORMAT, LUNAC_INST, LUNAC_INT, LUNAC_NUM, LUNAC_VERSION,
    LUNA_SIGNATURE,
};
use crate::instruction::Instruction;
use crate::proto::{AbsLineInfo, Closure, LocVar, Proto, UpvalDesc, PF_FIXED, PF_ISVARARG};

struct LoadState<'a> {
    input: &'a [u8],
    offset: usize,
    name: String,
    /// Strings already materialized, for back-references (1-based).
    saved: Vec<LuaStr>,
    fixed: bool,
}

impl<'a> LoadState<'a> {
    fn error(&self, why: &str) -> LunaError {
        LunaError::bad_binary(format!("{}: bad binary format ({})", self.name, why))
    }

    fn block(&mut self, n: usize) -> LunaResult<&'a [u8]> {
        if self.offset + n > self.input.len() {
            return Err(self.error("truncated chunk"));
        }
        let b = &self.input[self.offset..self.offset + n];
        self.offset += n;
        Ok(b)
    }

    fn align(&mut self, align: usize) -> LunaResult<()> {
        let padding = (align - self.offset % align) % align;
        if padding > 0 {
            self.block(padding)?;
        }
        Ok(())
    }

    fn byte(&mut self) -> LunaResult<u8> {
        Ok(self.block(1)?[0])
    }

    fn varint(&mut self, limit: u64) -> LunaResult<u64> {
        let mut x: u64 = 0;
        let limit = limit >> 7;
        loop {
            let b = self.byte()?;
            if x > limit {
                return Err(self.error("integer overflow"));
            }
            x = (x << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(x);
            }
        }
    }

    fn size(&mut self) -> LunaResult<usize> {
        Ok(self.varint(usize::MAX as u64)? as usize)
    }

    fn int(&mut self) -> LunaResult<u32> {
        Ok(self.varint(i32::MAX as u64)? as u32)
    }

    fn number(&mut self) -> LunaResult<f64> {
        let b = self.block(8)?;
        Ok(f64::from_ne_bytes(b.try_into().unwrap()))
    }

    fn integer(&mut self) -> LunaResult<i64> {
        let cx = self.varint(u64::MAX)?;
        // Undo the zig-zag coding.
        if cx & 1 != 0 {
            Ok(!(cx >> 1) as i64)
        } else {
            Ok((cx >> 1) as i64)
        }
    }

    fn string(&mut self) -> LunaResult<Option<LuaStr>> {
        let size = self.size()?;
        match size {
            0 => Ok(None),
            1 => {
                let idx = self.varint(u64::MAX)? as usize;
                if idx == 0 || idx > self.saved.len() {
                    return Err(self.error("invalid string index"));
                }
                Ok(Some(self.saved[idx - 1].clone()))
            }
            _ => {
                let size = size - 2;
                let content = self.block(size + 1)?; // includes trailing NUL
                let ts = LuaStr::detached(&content[..size]);
                self.saved.push(ts.clone());
                Ok(Some(ts))
            }
        }
    }

    fn code(&mut self, f: &mut Proto) -> LunaResult<()> {
        let n = self.int()? as usize;
        self.align(std::mem::size_of::<Instruction>())?;
        let raw = self.block(n * 4)?;
        f.code = raw
            .chunks_exact(4)
            .map(|c| Instruction(u32::from_ne_bytes(c.try_into().unwrap())))
            .collect();
        Ok(())
    }

    fn constants(&mut self, f: &mut Proto) -> LunaResult<()> {
        let n = self.int()? as usize;
        f.constants.reserve(n);
        for _ in 0..n {
            let t = self.byte()?;
            let v = match t {
                tags::NIL => crate::Value::Nil,
                tags::FALSE => crate::Value::False,
                tags::TRUE => crate::Value::True,
                tags::FLOAT => crate::Value::Float(self.number()?),
                tags::INT => crate::Value::Int(self.integer()?),
                tags::SHORT_STR | tags::LONG_STR => match self.string()? {
                    Some(s) => crate::Value::Str(s),
                    None => return Err(self.error("bad format for constant string")),
                },
                _ => return Err(self.error("invalid constant")),
            };
            f.constants.push(v);
        }
        Ok(())
    }

    fn upvalues(&mut self, f: &mut Proto) -> LunaResult<()> {
        let n = self.int()? as usize;
        f.upvalues.reserve(n);
        for _ in 0..n {
            let in_stack = self.byte()? != 0;
            let index = self.byte()?;
            let kind = self.byte()?;
            f.upvalues.push(UpvalDesc { name: None, in_stack, index, kind });
        }
        Ok(())
    }

    fn protos(&mut self, f: &mut Proto) -> LunaResult<()> {
        let n = self.int()? as usize;
        for _ in 0..n {
            let mut child = Proto::new();
            self.function(&mut child)?;
            f.protos.push(child);
        }
        Ok(())
    }

    fn debug(&mut self, f: &mut Proto) -> LunaResult<()> {
        let n = self.int()? as usize;
        let raw = self.block(n)?;
        f.line_info = raw.iter().map(|&b| b as i8).collect();
        let n = self.int()? as usize;
        if n > 0 {
            self.align(std::mem::size_of::<u32>())?;
            f.abs_line_info.reserve(n);
            for _ in 0..n {
                let pc = u32::from_ne_bytes(self.block(4)?.try_into().unwrap());
                let line = u32::from_ne_bytes(self.block(4)?.try_into().unwrap());
                f.abs_line_info.push(AbsLineInfo { pc, line });
            }
        }
        let n = self.int()? as usize;
        f.loc_vars.reserve(n);
        for _ in 0..n {
            let name = self.string()?;
            let start_pc = self.int()?;
            let end_pc = self.int()?;
            f.loc_vars.push(LocVar { name, start_pc, end_pc });
        }
        let n = self.int()? as usize;
        if n != 0 {
            // Debug info present: one name per upvalue.
            if n != f.upvalues.len() {
                return Err(self.error("corrupted chunk"));
            }
            for i in 0..n {
                f.upvalues[i].name = self.string()?;
            }
        }
        Ok(())
    }

    fn function(&mut self, f: &mut Proto) -> LunaResult<()> {
        f.line_defined = self.int()?;
        f.last_line_defined = self.int()?;
        f.num_params = self.byte()?;
        f.flag = self.byte()? & PF_ISVARARG; // only the meaningful flags
        if self.fixed {
            f.flag |= PF_FIXED;
        }
        f.max_stack_size = self.byte()?;
        self.code(f)?;
        self.constants(f)?;
        self.upvalues(f)?;
        self.protos(f)?;
        f.source = self.string()?;
        self.debug(f)
    }

    fn check_literal(&mut self, expected: &[u8], msg: &str) -> LunaResult<()> {
        let got = self.block(expected.len())?;
        if got != expected {
            return Err(self.error(msg));
        }
        Ok(())
    }

    fn check_num_size(&mut self, size: u8, tname: &str) -> LunaResult<()> {
        if self.byte()? != size {
            return Err(self.error(&format!("{} size mismatch", tname)));
        }
        Ok(())
    }

    fn check_header(&mut self) -> LunaResult<()> {
        // The caller has verified the first signature byte already.
        self.check_literal(&LUNA_SIGNATURE[1..], "not a binary chunk")?;
        if self.byte()? != LUNAC_VERSION {
            return Err(self.error("version mismatch"));
        }
        if self.byte()? != LUNAC_FORMAT {
            return Err(self.error("format mismatch"));
        }
        self.check_literal(LUNAC_DATA, "corrupted chunk")?;
        self.check_num_size(4, "int")?;
        let i = i32::from_ne_bytes(self.block(4)?.try_into().unwrap());
        if i != LUNAC_INT as i32 {
            return Err(self.error("int format mismatch"));
        }
        self.check_num_size(4, "instruction")?;
        let inst = u32::from_ne_bytes(self.block(4)?.try_into().unwrap());
        if inst != LUNAC_INST {
            return Err(self.error("instruction format mismatch"));
        }
        self.check_num_size(8, "integer")?;
        if self.integer_raw()? != LUNAC_INT {
            return Err(self.error("integer format mismatch"));
        }
        self.check_num_size(8, "number")?;
        if self.number()? != LUNAC_NUM {
            return Err(self.error("number format mismatch"));
        }
        Ok(())
    }

    fn integer_raw(&mut self) -> LunaResult<i64> {
        let b = self.block(8)?;
        Ok(i64::from_ne_bytes(b.try_into().unwrap()))
    }
}

/// Load a precompiled chunk. `input` must start with the signature byte
/// (which the caller has typically already inspected to choose the
/// binary path). `fixed` marks prototypes as backed by a fixed buffer.
pub fn undump(input: &[u8], chunk_name: &str, fixed: bool) -> LunaResult<Closure> {
    let name = match chunk_name.as_bytes().first() {
        Some(b'@') | Some(b'=') => chunk_name[1..].to_string(),
        Some(&b) if b == LUNA_SIGNATURE[0] => "binary string".to_string(),
        _ => chunk_name.to_string(),
    };
    log::debug!("undump: loading binary chunk '{}' ({} bytes)", name, input.len());
    let mut s = LoadState {
        input,
        offset: 1, // signature byte
        name,
        saved: Vec::new(),
        fixed,
    };
    if input.is_empty() || input[0] != LUNA_SIGNATURE[0] {
        return Err(s.error("not a binary chunk"));
    }
    s.check_header()?;
    let declared_upvals = s.byte()? as usize;
    let mut proto = Proto::new();
    s.function(&mut proto)?;
    if declared_upvals != proto.upvalues.len() {
        return Err(s.error("corrupted chunk"));
    }
    Ok(Closure::new(proto))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::dump_to_vec;
    use crate::opcode::OpCode;
    use crate::Value;
    use pretty_assertions::assert_eq;

    fn sample_proto() -> Proto {
        let mut child = Proto::new();
        child.num_params = 1;
        child.max_stack_size = 2;
        child.code = vec![
            Instruction::abck(OpCode::VarargPrep, 1, 0, 0, 0),
            Instruction::abck(OpCode::Return1, 1, 0, 0, 0),
        ];
        child.line_info = vec![0, 0];

        let mut p = Proto::new();
        p.flag = PF_ISVARARG;
        p.max_stack_size = 2;
        p.source = Some(LuaStr::from("=test"));
        p.code = vec![
            Instruction::abck(OpCode::VarargPrep, 0, 0, 0, 0),
            Instruction::abx(OpCode::Closure, 0, 0),
            Instruction::abck(OpCode::Return0, 0, 0, 0, 0),
        ];
        p.line_info = vec![0, 0, 0];
        p.constants = vec![
            Value::Int(-3),
            Value::Float(0.5),
            Value::Str(LuaStr::from("hello")),
            Value::Nil,
            Value::True,
            Value::Str(LuaStr::from("hello")),
        ];
        p.upvalues = vec![UpvalDesc {
            name: Some(LuaStr::from("_ENV")),
            in_stack: true,
            index: 0,
            kind: 0,
        }];
        p.loc_vars = vec![LocVar {
            name: Some(LuaStr::from("x")),
            start_pc: 1,
            end_pc: 3,
        }];
        p.protos.push(child);
        p
    }

    #[test]
    fn roundtrip_preserves_structure() {
        let p = sample_proto();
        let bytes = dump_to_vec(&p, false);
        let cl = undump(&bytes, "=test", false).unwrap();
        assert_eq!(cl.proto, p);
    }

    #[test]
    fn double_roundtrip_is_byte_identical() {
        let p = sample_proto();
        let bytes = dump_to_vec(&p, false);
        let cl = undump(&bytes, "=test", false).unwrap();
        let bytes2 = dump_to_vec(&cl.proto, false);
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn stripped_dump_loses_debug_tables() {
        let p = sample_proto();
        let bytes = dump_to_vec(&p, true);
        let cl = undump(&bytes, "=test", false).unwrap();
        assert!(cl.proto.source.is_none());
        assert!(cl.proto.loc_vars.is_empty());
        assert!(cl.proto.line_info.is_empty());
        assert_eq!(cl.proto.upvalues[0].name, None);
        assert_eq!(cl.proto.code, p.code);
        assert_eq!(cl.proto.constants, p.constants);
    }

    #[test]
    fn fixed_load_sets_flag() {
        let p = sample_proto();
        let bytes = dump_to_vec(&p, false);
        let cl = undump(&bytes, "=test", true).unwrap();
        assert!(cl.proto.flag & PF_FIXED != 0);
        assert!(cl.proto.protos[0].flag & PF_FIXED != 0);
    }

    #[test]
    fn truncation_is_an_error() {
        let p = sample_proto();
        let bytes = dump_to_vec(&p, false);
        for cut in [5, 12, 20, bytes.len() - 1] {
            let err = undump(&bytes[..cut], "=test", false).unwrap_err();
            assert!(matches!(err, LunaError::BadBinary { .. }));
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let p = sample_proto();
        let mut bytes = dump_to_vec(&p, false);
        bytes[4] = 0x54;
        let err = undump(&bytes, "=test", false).unwrap_err();
        assert!(err.message().contains("version mismatch"));
    }

    #[test]
    fn string_backrefs_resolve_to_same_handle() {
        let p = sample_proto();
        let bytes = dump_to_vec(&p, false);
        let cl = undump(&bytes, "=test", false).unwrap();
        assert_eq!(cl.proto.constants[2], cl.proto.constants[5]);
    }

    #[test]
    fn integer_zigzag_roundtrip() {
        for v in [0i64, -1, 1, -2, 2, i64::MAX, i64::MIN, 0x5678] {
            let mut p = Proto::new();
            p.constants = vec![Value::Int(v)];
            let bytes = dump_to_vec(&p, false);
            let cl = undump(&bytes, "=t", false).unwrap();
            assert_eq!(cl.proto.constants[0], Value::Int(v));
        }
    }
}
