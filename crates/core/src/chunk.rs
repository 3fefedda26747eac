//! Chunk: one compiled Lua prototype with its instruction, constant and child-function pools.
//!
//! Symbolic references on instructions are the source of truth; numeric operands are a cache.
//! After any structural edit callers run, in this order:
//!
//! 1. [`Chunk::recompute`] rebuilds instruction positions and pool indices;
//! 2. [`Chunk::resolve_references`] rewrites numeric operands from the references.
//!
//! Resolving with stale mappings fails loudly instead of writing corrupt operands.

use crate::constant::Constant;
use crate::instruction::{ChunkId, ConstId, InstrId, Instruction};
use crate::opcode::Field;
use crate::pool::Pool;
use crate::result::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// How a closure obtains one of its upvalues when it is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capture {
    /// Register of the enclosing frame.
    Local(u32),
    /// Upvalue of the enclosing closure.
    Upvalue(u32),
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub prototype_id: u32,
    pub num_params: u8,
    pub is_vararg: u8,
    pub num_upvalues: u8,
    pub stack_size: u32,
    pub instructions: Pool<Instruction>,
    pub constants: Pool<Constant>,
    pub functions: Pool<Chunk>,
    pub captures: Vec<Capture>,
    /// Last instruction of the woven anti-tamper prefix.
    pub anti_tamper: Option<InstrId>,
    /// Original global name -> per-build snapshot alias.
    pub environment_names: BTreeMap<String, String>,
}

impl Chunk {
    pub fn new(prototype_id: u32) -> Self {
        Self {
            name: String::new(),
            prototype_id,
            num_params: 0,
            is_vararg: 0,
            num_upvalues: 0,
            stack_size: 2,
            instructions: Pool::new("instruction"),
            constants: Pool::new("constant"),
            functions: Pool::new("function"),
            captures: Vec::new(),
            anti_tamper: None,
            environment_names: BTreeMap::new(),
        }
    }

    pub fn has_anti_tamper(&self) -> bool {
        self.anti_tamper.is_some()
    }

    /// Rebuilds the instruction map and every pool position of this chunk.
    pub fn recompute(&mut self) {
        self.instructions.recompute();
        self.constants.recompute();
        self.functions.recompute();
    }

    /// [`Chunk::recompute`] for this chunk and all nested chunks.
    pub fn recompute_all(&mut self) {
        self.recompute();
        for id in self.functions.ids().to_vec() {
            self.functions[id].recompute_all();
        }
    }

    /// Position of an instruction in the current layout.
    pub fn position(&self, id: InstrId) -> Result<usize> {
        self.instructions
            .position(id)?
            .ok_or(Error::DanglingReference {
                kind: "instruction",
                instruction: id.slot(),
            })
    }

    pub fn constant_index(&self, id: ConstId) -> Result<Option<usize>> {
        self.constants.position(id)
    }

    pub fn function_index(&self, id: ChunkId) -> Result<Option<usize>> {
        self.functions.position(id)
    }

    /// Recomputes every numeric operand from its symbolic reference.
    ///
    /// Jumps and patch targets become `target - self`; constant and prototype references
    /// become pool positions.
    pub fn resolve_references(&mut self) -> Result<()> {
        let order = self.instructions.ids().to_vec();
        for (position, id) in order.into_iter().enumerate() {
            let instruction = &self.instructions[id];
            let mut updates: Vec<(Field, i32)> = Vec::new();

            let pool_index = |index: Result<Option<usize>>, kind: &'static str| -> Result<i32> {
                index?
                    .map(|index| index as i32)
                    .ok_or(Error::DanglingReference {
                        kind,
                        instruction: position,
                    })
            };

            if let Some(constant) = instruction.constant {
                updates.push((Field::B, pool_index(self.constants.position(constant), "constant")?));
            }
            if let Some(constant) = instruction.k_b {
                updates.push((Field::B, pool_index(self.constants.position(constant), "constant")?));
            }
            if let Some(constant) = instruction.k_c {
                updates.push((Field::C, pool_index(self.constants.position(constant), "constant")?));
            }
            if let Some(function) = instruction.prototype {
                updates.push((Field::B, pool_index(self.functions.position(function), "prototype")?));
            }
            if let (Some(target), Some(field)) = (instruction.jump, instruction.jump_field()) {
                let target = pool_index(self.instructions.position(target), "jump")?;
                updates.push((field, target - position as i32));
            }
            if let Some(target) = instruction.target {
                let target = pool_index(self.instructions.position(target), "patch target")?;
                updates.push((Field::F, target - position as i32));
            }

            let instruction = &mut self.instructions[id];
            for (field, value) in updates {
                *instruction.field_mut(field) = value;
            }
        }
        Ok(())
    }

    /// [`Chunk::resolve_references`] for this chunk and all nested chunks.
    pub fn resolve_all(&mut self) -> Result<()> {
        self.resolve_references()?;
        for id in self.functions.ids().to_vec() {
            self.functions[id].resolve_all()?;
        }
        Ok(())
    }

    /// Points every jump that lands on `from` at `to` instead.
    pub fn redirect_jumps(&mut self, from: InstrId, to: InstrId) {
        for id in self.instructions.ids().to_vec() {
            let instruction = &mut self.instructions[id];
            if instruction.jump == Some(from) {
                instruction.jump = Some(to);
            }
        }
    }

    /// Inserts `instruction` directly before `anchor` in the layout.
    pub fn insert_before(&mut self, anchor: InstrId, instruction: Instruction) -> Result<InstrId> {
        let position = self
            .instructions
            .find(anchor)
            .ok_or(Error::DanglingReference {
                kind: "anchor",
                instruction: anchor.slot(),
            })?;
        Ok(self.instructions.insert(position, instruction))
    }

    /// Largest prototype id in this subtree.
    pub fn max_prototype_id(&self) -> u32 {
        self.functions
            .iter()
            .map(|(_, child)| child.max_prototype_id())
            .fold(self.prototype_id, u32::max)
    }

    /// Total instruction count of this subtree.
    pub fn total_instructions(&self) -> usize {
        self.instructions.len()
            + self
                .functions
                .iter()
                .map(|(_, child)| child.total_instructions())
                .sum::<usize>()
    }

    /// Human readable listing of this chunk and its children.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        self.write_listing(&mut out, 0);
        out
    }

    fn write_listing(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = writeln!(
            out,
            "{indent}function <{}> #{} params={} vararg={} upvalues={} stack={}",
            self.name,
            self.prototype_id,
            self.num_params,
            self.is_vararg,
            self.num_upvalues,
            self.stack_size
        );
        for (position, (_, instruction)) in self.instructions.iter().enumerate() {
            let mut line = format!(
                "{indent}  [{position:>4}] {:<12} {:>4} {:>4} {:>4}",
                instruction.opcode.mnemonic(),
                instruction.a,
                instruction.b,
                instruction.c
            );
            if instruction.jump_field() == Some(Field::E) {
                let _ = write!(line, "  E={}", instruction.e);
            }
            if instruction.target.is_some() {
                let _ = write!(line, "  F={}", instruction.f);
            }
            if let Some(constant) = instruction.constant.or(instruction.k_b).or(instruction.k_c)
                && let Some(value) = self.constants.get(constant)
            {
                let _ = write!(line, "  ; {}", value.value);
            }
            let _ = writeln!(out, "{line}");
        }
        for (index, (_, constant)) in self.constants.iter().enumerate() {
            let _ = writeln!(out, "{indent}  K{index} = {}", constant.value);
        }
        for (_, child) in self.functions.iter() {
            child.write_listing(out, depth + 1);
        }
    }
}
