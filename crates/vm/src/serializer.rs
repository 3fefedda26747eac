//! Binary encoding of the chunk tree read back by the interpreter's deserializer.
//!
//! Chunk record:
//!
//! ```text
//! captures   LEB count, then (kind byte, LEB index) per capture
//! sections   in BuildContext::chunk_steps order:
//!   params        byte
//!   constants     LEB count, then (tag byte, payload) per constant
//!   instructions  LEB count, then one record per instruction
//!   functions     LEB count, then one chunk record per child
//! ```
//!
//! Instruction record: descriptor byte (bits 0..2 flag storage A/B/C as constant indices,
//! bits 3..7 flag presence of A/B/C/E/F), LEB dispatch id, then zig-zag LEB operands for the
//! present fields in storage order.

use crate::context::{BuildContext, ChunkStep, ConstantTags};
use crate::{Error, Result};
use moonveil_core::instruction::ObfuscationType;
use moonveil_core::{Capture, Chunk, ConstantValue, Field, Instruction, OpCode};
use rand::{Rng, rngs::StdRng};

struct Writer<'a> {
    out: Vec<u8>,
    rng: &'a mut StdRng,
    tags: ConstantTags,
    steps: [ChunkStep; 4],
    handler_count: usize,
}

pub fn write_leb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn zigzag(value: i32) -> u64 {
    if value >= 0 {
        value as u64 * 2
    } else {
        (-(value as i64)) as u64 * 2 - 1
    }
}

fn slot(field: Field) -> usize {
    match field {
        Field::A => 0,
        Field::B => 1,
        Field::C => 2,
        Field::E => 3,
        Field::F => 4,
    }
}

impl Writer<'_> {
    fn chunk(&mut self, chunk: &Chunk) -> Result<()> {
        write_leb(&mut self.out, chunk.captures.len() as u64);
        for capture in &chunk.captures {
            let (kind, index) = match capture {
                Capture::Local(register) => (0u8, *register),
                Capture::Upvalue(index) => (1u8, *index),
            };
            self.out.push(kind);
            write_leb(&mut self.out, index as u64);
        }

        for step in self.steps {
            match step {
                ChunkStep::Params => self.out.push(chunk.num_params),
                ChunkStep::Constants => self.constants(chunk),
                ChunkStep::Instructions => self.instructions(chunk)?,
                ChunkStep::Functions => {
                    write_leb(&mut self.out, chunk.functions.len() as u64);
                    for (_, child) in chunk.functions.iter() {
                        self.chunk(child)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn constants(&mut self, chunk: &Chunk) {
        write_leb(&mut self.out, chunk.constants.len() as u64);
        for (_, constant) in chunk.constants.iter() {
            match &constant.value {
                ConstantValue::Nil => self.out.push(self.tags.nil),
                ConstantValue::Boolean(value) => {
                    self.out.push(self.tags.boolean);
                    self.out.push(*value as u8);
                }
                ConstantValue::Number(value) => {
                    self.out.push(self.tags.number);
                    self.out.extend_from_slice(&value.to_le_bytes());
                }
                ConstantValue::String(bytes) => {
                    self.out.push(self.tags.string);
                    write_leb(&mut self.out, bytes.len() as u64);
                    self.out.extend_from_slice(bytes);
                }
                ConstantValue::Crash => self.out.push(self.tags.crash),
            }
        }
    }

    fn instructions(&mut self, chunk: &Chunk) -> Result<()> {
        write_leb(&mut self.out, chunk.instructions.len() as u64);
        for (position, (_, instruction)) in chunk.instructions.iter().enumerate() {
            self.instruction(chunk, position, instruction)?;
        }
        Ok(())
    }

    fn handler(&self, chunk: &Chunk, position: usize, instruction: &Instruction) -> Result<u64> {
        instruction
            .custom
            .handler
            .map(|id| id as u64)
            .ok_or(Error::UnallocatedInstruction {
                chunk: chunk.prototype_id,
                position,
            })
    }

    fn instruction(&mut self, chunk: &Chunk, position: usize, instruction: &Instruction) -> Result<()> {
        let real = self.handler(chunk, position, instruction)?;
        let stored = match instruction.obfuscation {
            Some(ObfuscationType::Redirect | ObfuscationType::DynamicHandler)
                if self.handler_count > 1 =>
            {
                let shift = self.rng.random_range(1..self.handler_count) as u64;
                (real + shift) % self.handler_count as u64
            }
            _ => real,
        };

        let mut storage: [Option<(i64, bool)>; 5] = [None; 5];
        for field in instruction.present_fields() {
            let mut value = instruction.field(field) as i64;
            if instruction.jump_field() == Some(field) {
                value += position as i64;
            }
            if field == Field::A
                && matches!(instruction.opcode, OpCode::Redirect | OpCode::DynamicRedirect)
            {
                value = self.patched_handler(chunk, position, instruction)? as i64;
            }
            match instruction.obfuscation {
                Some(ObfuscationType::RegisterReload { field: relocated }) if relocated == field => {
                    value = self.rng.random_range(0..=255);
                }
                Some(ObfuscationType::VirtualTable { fields }) if fields.fields().contains(&field) => {
                    value = self.rng.random_range(0..=255);
                }
                _ => {}
            }
            if let Some(encoding) = instruction.custom.encoding {
                value = encoding.offset(field).encode(value as i32) as i64;
            }
            let target = match instruction.obfuscation {
                Some(ObfuscationType::Shuffle { permutation }) => permutation.storage(field),
                _ => field,
            };
            storage[slot(target)] = Some((value, instruction.constant_in(field).is_some()));
        }

        let mut descriptor = 0u8;
        for (index, entry) in storage.iter().enumerate() {
            if let Some((_, constant)) = entry {
                descriptor |= 1 << (3 + index);
                if *constant {
                    descriptor |= 1 << index;
                }
            }
        }
        self.out.push(descriptor);
        write_leb(&mut self.out, stored);
        for (value, _) in storage.iter().flatten() {
            write_leb(&mut self.out, zigzag(*value as i32));
        }
        Ok(())
    }

    /// Real handler id of the instruction a redirect writes.
    fn patched_handler(&self, chunk: &Chunk, position: usize, instruction: &Instruction) -> Result<u64> {
        let target = instruction.target.ok_or(Error::UnallocatedInstruction {
            chunk: chunk.prototype_id,
            position,
        })?;
        let patched = chunk
            .instructions
            .get(target)
            .ok_or(Error::UnallocatedInstruction {
                chunk: chunk.prototype_id,
                position,
            })?;
        self.handler(chunk, position, patched)
    }
}

/// Serializes the allocated, resolved chunk tree. The output is not yet masked.
pub fn serialize(ctx: &mut BuildContext) -> Result<Vec<u8>> {
    let BuildContext {
        root,
        rng,
        tags,
        chunk_steps,
        handlers,
        ..
    } = ctx;
    let mut writer = Writer {
        out: Vec::new(),
        rng,
        tags: *tags,
        steps: *chunk_steps,
        handler_count: handlers.len(),
    };
    writer.chunk(root)?;
    Ok(writer.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator;
    use moonveil_core::{Constant, Settings};
    use rand::SeedableRng;

    fn leb(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_leb(&mut out, value);
        out
    }

    #[test]
    fn leb_and_zigzag() {
        assert_eq!(leb(0), vec![0]);
        assert_eq!(leb(127), vec![0x7f]);
        assert_eq!(leb(128), vec![0x80, 0x01]);
        assert_eq!(leb(300), vec![0xac, 0x02]);
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-3), 5);
    }

    #[test]
    fn loadk_record_flags_constant_slot() {
        let mut chunk = Chunk::new(0);
        let k = chunk.constants.push(Constant::new(ConstantValue::Number(2.5)));
        let mut load = Instruction::new(OpCode::LoadK).with_a(3);
        load.constant = Some(k);
        chunk.instructions.push(load);
        chunk.recompute();
        chunk.resolve_references().unwrap();

        let mut ctx = BuildContext::new(chunk, Settings::default(), StdRng::seed_from_u64(2));
        ctx.chunk_steps = [
            ChunkStep::Instructions,
            ChunkStep::Params,
            ChunkStep::Constants,
            ChunkStep::Functions,
        ];
        allocator::allocate(&mut ctx).unwrap();
        let bytes = serialize(&mut ctx).unwrap();

        // no captures, one instruction (A|B present, B constant, id 0, A=3, B=0), params
        assert_eq!(&bytes[..7], &[0, 1, 0b0001_1010, 0, 6, 0, 0]);
        assert_eq!(bytes[7], 1);
        assert_eq!(bytes[8], ctx.tags.number);
        assert_eq!(&bytes[9..17], &2.5f64.to_le_bytes());
    }

    #[test]
    fn jumps_become_absolute() {
        let mut chunk = Chunk::new(0);
        let ret = chunk
            .instructions
            .alloc(Instruction::new(OpCode::Return).with_a(0).with_b(1));
        chunk.instructions.push(Instruction::new(OpCode::Move).with_a(0).with_b(0));
        chunk.instructions.push(Instruction::jmp(ret));
        let mut order = chunk.instructions.ids().to_vec();
        order.push(ret);
        chunk.instructions.set_order(order);
        chunk.recompute();
        chunk.resolve_references().unwrap();

        let mut ctx = BuildContext::new(chunk, Settings::default(), StdRng::seed_from_u64(4));
        ctx.chunk_steps = [
            ChunkStep::Instructions,
            ChunkStep::Params,
            ChunkStep::Constants,
            ChunkStep::Functions,
        ];
        allocator::allocate(&mut ctx).unwrap();
        let bytes = serialize(&mut ctx).unwrap();
        // skip captures(1) + count(1) + MOVE record (descriptor, id, A, B)
        let jmp = &bytes[6..];
        assert_eq!(jmp[0], 0b0001_0000);
        assert_eq!(jmp[2], zigzag(2) as u8);
    }
}
