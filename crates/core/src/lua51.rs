//! Lua 5.1 binary chunk reader and lifter.
//!
//! Turns the output of `string.dump`/`luac` into a [`Chunk`] tree. Lifting rewrites the
//! position-dependent corners of the Lua 5.1 encoding into explicit references:
//!
//! ```text
//! JMP/FORPREP/FORLOOP sBx      -> jump = pc + 1 + sBx            (slot B)
//! EQ/LT/LE/TEST/TESTSET/TFORLOOP -> jump = pc + 2 ("skip next")  (slot E)
//! LOADBOOL A B C (C != 0)      -> jump = pc + 2                  (slot E)
//! RK(x) >= 256                 -> k_b / k_c constant reference
//! LOADK/GETGLOBAL/SETGLOBAL Bx -> constant reference
//! SETLIST A B 0; <raw C>       -> SETLIST A B C
//! CLOSURE A Bx; MOVE/GETUPVAL  -> CLOSURE A Bx + child captures
//! ```
//!
//! Source names, line info, locals and upvalue names are parsed and dropped.

use crate::chunk::{Capture, Chunk};
use crate::constant::{Constant, ConstantValue};
use crate::instruction::{ChunkId, ConstId, InstrId, Instruction};
use crate::opcode::{OpCode, Operand};
use crate::result::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x51;
const MAXARG_SBX: i64 = 131071;
const BITRK: u32 = 256;

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    little_endian: bool,
    int_size: usize,
    size_t_size: usize,
    next_prototype: u32,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(Error::UnexpectedEof(self.offset))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn unsigned(&mut self, size: usize) -> Result<u64> {
        let raw = self.take(size)?;
        let mut value = 0u64;
        for n in 0..size {
            let byte = if self.little_endian { raw[size - 1 - n] } else { raw[n] };
            value = (value << 8) | byte as u64;
        }
        Ok(value)
    }

    fn int(&mut self) -> Result<i64> {
        let size = self.int_size;
        let raw = self.unsigned(size)?;
        let shift = 64 - 8 * size as u32;
        Ok(((raw << shift) as i64) >> shift)
    }

    fn count(&mut self) -> Result<usize> {
        let value = self.int()?;
        usize::try_from(value).map_err(|_| Error::InvalidHeader(format!("negative count {value}")))
    }

    fn number(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.unsigned(8)?))
    }

    fn string(&mut self) -> Result<Option<Vec<u8>>> {
        let size = self.size_t_size;
        let len = self.unsigned(size)? as usize;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(len)?;
        Ok(Some(raw[..len - 1].to_vec()))
    }

    fn header(&mut self) -> Result<()> {
        if self.take(4)? != SIGNATURE {
            return Err(Error::InvalidHeader("missing Lua signature".into()));
        }
        let version = self.byte()?;
        if version != VERSION {
            return Err(Error::InvalidHeader(format!("unsupported version 0x{version:02x}")));
        }
        let format = self.byte()?;
        if format != 0 {
            return Err(Error::InvalidHeader(format!("unsupported format {format}")));
        }
        self.little_endian = self.byte()? == 1;
        self.int_size = self.byte()? as usize;
        self.size_t_size = self.byte()? as usize;
        let instruction_size = self.byte()?;
        let number_size = self.byte()?;
        let integral = self.byte()?;

        if !matches!(self.int_size, 4 | 8) || !matches!(self.size_t_size, 4 | 8) {
            return Err(Error::InvalidHeader(format!(
                "unsupported int/size_t widths {}/{}",
                self.int_size, self.size_t_size
            )));
        }
        if instruction_size != 4 || number_size != 8 || integral != 0 {
            return Err(Error::InvalidHeader(
                "only 32-bit instructions and double numbers are supported".into(),
            ));
        }
        Ok(())
    }

    fn function(&mut self, parent_name: &str) -> Result<Chunk> {
        let prototype_id = self.next_prototype;
        self.next_prototype += 1;

        let name = self
            .string()?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_else(|| parent_name.to_string());
        let _line_defined = self.int()?;
        let _last_line_defined = self.int()?;

        let mut chunk = Chunk::new(prototype_id);
        chunk.name = name.clone();
        chunk.num_upvalues = self.byte()?;
        chunk.num_params = self.byte()?;
        chunk.is_vararg = self.byte()?;
        chunk.stack_size = self.byte()? as u32;

        let code_len = self.count()?;
        let mut words = Vec::with_capacity(code_len.min(self.bytes.len() / 4));
        for _ in 0..code_len {
            words.push(self.unsigned(4)? as u32);
        }

        let mut constants = Vec::new();
        for _ in 0..self.count()? {
            let value = match self.byte()? {
                0 => ConstantValue::Nil,
                1 => ConstantValue::Boolean(self.byte()? != 0),
                3 => ConstantValue::Number(self.number()?),
                4 => ConstantValue::String(self.string()?.unwrap_or_default()),
                tag => return Err(Error::InvalidConstantTag(tag)),
            };
            constants.push(chunk.constants.push(Constant::new(value)));
        }

        let mut children = Vec::new();
        for _ in 0..self.count()? {
            let child = self.function(&name)?;
            children.push(chunk.functions.push(child));
        }

        self.skip_debug()?;
        lift(&mut chunk, &words, &constants, &children)?;
        chunk.recompute();
        Ok(chunk)
    }

    fn skip_debug(&mut self) -> Result<()> {
        let lines = self.count()?;
        let len = lines
            .checked_mul(self.int_size)
            .ok_or(Error::UnexpectedEof(self.offset))?;
        self.take(len)?;
        for _ in 0..self.count()? {
            self.string()?;
            self.int()?;
            self.int()?;
        }
        for _ in 0..self.count()? {
            self.string()?;
        }
        Ok(())
    }
}

fn lookup<T: Copy>(pool: &[T], index: u32, kind: &'static str) -> Result<T> {
    pool.get(index as usize)
        .copied()
        .ok_or(Error::ReferenceOutOfRange {
            kind,
            index: index as i64,
            size: pool.len(),
        })
}

fn lift(chunk: &mut Chunk, words: &[u32], constants: &[ConstId], children: &[ChunkId]) -> Result<()> {
    let mut by_word: HashMap<usize, InstrId> = HashMap::new();
    let mut pending: Vec<(InstrId, i64)> = Vec::new();
    let mut pc = 0usize;

    while pc < words.len() {
        let word = words[pc];
        let raw_op = (word & 0x3f) as u8;
        let opcode = OpCode::from_lua51(raw_op).ok_or(Error::UnknownOpcode { opcode: raw_op, pc })?;
        let a = (word >> 6) & 0xff;
        let c = (word >> 14) & 0x1ff;
        let b = (word >> 23) & 0x1ff;
        let bx = word >> 14;
        let sbx = bx as i64 - MAXARG_SBX;

        let mut instruction = Instruction::new(opcode).with_a(a as i32);
        let mut consumed = 1;
        let mut jump_target = None;
        let [_, operand_b, operand_c] = opcode.operands();

        match operand_b {
            Operand::Constant => {
                instruction.constant = Some(lookup(constants, bx, "constant")?);
                instruction.b = bx as i32;
            }
            Operand::RegisterOrConstant if b >= BITRK => {
                instruction.k_b = Some(lookup(constants, b - BITRK, "constant")?);
                instruction.b = (b - BITRK) as i32;
            }
            Operand::Prototype => {
                let child = lookup(children, bx, "prototype")?;
                instruction.prototype = Some(child);
                instruction.b = bx as i32;

                let upvalues = chunk.functions[child].num_upvalues as usize;
                let mut captures = Vec::with_capacity(upvalues);
                for n in 0..upvalues {
                    let capture = *words.get(pc + 1 + n).ok_or(Error::UnexpectedEof(pc + 1 + n))?;
                    let capture_b = (capture >> 23) & 0x1ff;
                    captures.push(match OpCode::from_lua51((capture & 0x3f) as u8) {
                        Some(OpCode::Move) => Capture::Local(capture_b),
                        Some(OpCode::GetUpval) => Capture::Upvalue(capture_b),
                        _ => {
                            return Err(Error::InvalidBlockStructure(format!(
                                "closure at {pc} is followed by a non-capture instruction"
                            )));
                        }
                    });
                }
                chunk.functions[child].captures = captures;
                consumed += upvalues;
            }
            Operand::Jump => jump_target = Some(pc as i64 + 1 + sbx),
            _ => instruction.b = b as i32,
        }

        match operand_c {
            Operand::RegisterOrConstant if c >= BITRK => {
                instruction.k_c = Some(lookup(constants, c - BITRK, "constant")?);
                instruction.c = (c - BITRK) as i32;
            }
            Operand::Unused => {}
            _ => instruction.c = c as i32,
        }

        if opcode == OpCode::SetList && c == 0 {
            let raw = *words.get(pc + 1).ok_or(Error::UnexpectedEof(pc + 1))?;
            instruction.c = raw as i32;
            consumed += 1;
        }

        let skips = match opcode {
            OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Test
            | OpCode::TestSet
            | OpCode::TForLoop => true,
            OpCode::LoadBool => c != 0,
            _ => false,
        };
        if skips {
            jump_target = Some(pc as i64 + 2);
        }

        let id = chunk.instructions.push(instruction);
        by_word.insert(pc, id);
        if let Some(target) = jump_target {
            pending.push((id, target));
        }
        pc += consumed;
    }

    for (id, target) in pending {
        let target_id = usize::try_from(target)
            .ok()
            .and_then(|target| by_word.get(&target).copied())
            .ok_or(Error::ReferenceOutOfRange {
                kind: "jump",
                index: target,
                size: words.len(),
            })?;
        chunk.instructions[id].jump = Some(target_id);
    }
    Ok(())
}

/// Decodes a Lua 5.1 binary chunk into its IR tree.
pub fn decode(bytes: &[u8]) -> Result<Chunk> {
    let mut reader = Reader {
        bytes,
        offset: 0,
        little_endian: true,
        int_size: 4,
        size_t_size: 8,
        next_prototype: 0,
    };
    reader.header()?;
    let chunk = reader.function("?")?;
    debug!(
        "decoded {} prototypes, {} instructions",
        reader.next_prototype,
        chunk.total_instructions()
    );
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<u8> {
        vec![0x1b, b'L', b'u', b'a', 0x51, 0, 1, 4, 8, 4, 8, 0]
    }

    fn word(op: u32, a: u32, b: u32, c: u32) -> u32 {
        op | (a << 6) | (c << 14) | (b << 23)
    }

    fn sbx_word(op: u32, a: u32, sbx: i32) -> u32 {
        op | (a << 6) | (((sbx + MAXARG_SBX as i32) as u32) << 14)
    }

    fn function(code: &[u32], constants: &[f64]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&[0, 0, 2, 2]);
        out.extend_from_slice(&(code.len() as i32).to_le_bytes());
        for w in code {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.extend_from_slice(&(constants.len() as i32).to_le_bytes());
        for k in constants {
            out.push(3);
            out.extend_from_slice(&k.to_le_bytes());
        }
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out
    }

    #[test]
    fn lifts_rk_and_jumps() {
        // ADD 0 K0 K0; EQ 0 0 K0; JMP +1; RETURN 0 1; RETURN 0 1
        let code = [
            word(12, 0, 256, 256),
            word(23, 0, 0, 256),
            sbx_word(22, 0, 1),
            word(30, 0, 1, 0),
            word(30, 0, 1, 0),
        ];
        let mut bytes = header();
        bytes.extend(function(&code, &[1.5]));
        let mut chunk = decode(&bytes).unwrap();
        chunk.recompute();
        chunk.resolve_references().unwrap();

        let ids = chunk.instructions.ids().to_vec();
        let add = &chunk.instructions[ids[0]];
        assert!(add.k_b.is_some() && add.k_c.is_some());
        let eq = &chunk.instructions[ids[1]];
        assert_eq!(eq.jump, Some(ids[3]));
        assert_eq!(eq.e, 2);
        let jmp = &chunk.instructions[ids[2]];
        assert_eq!(jmp.jump, Some(ids[4]));
        assert_eq!(jmp.b, 2);
    }

    #[test]
    fn oversized_line_info_is_eof() {
        let mut bytes = header();
        bytes[7] = 8;
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 2, 2]);
        bytes.extend_from_slice(&1i64.to_le_bytes());
        bytes.extend_from_slice(&word(30, 0, 1, 0).to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&(i64::MAX / 2).to_le_bytes());
        assert!(matches!(decode(&bytes), Err(Error::UnexpectedEof(_))));
    }

    #[test]
    fn rejects_foreign_headers() {
        let mut bytes = header();
        bytes[4] = 0x52;
        assert!(matches!(decode(&bytes), Err(Error::InvalidHeader(_))));
    }
}
