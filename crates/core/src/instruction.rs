use crate::chunk::Chunk;
use crate::constant::Constant;
use crate::opcode::{Control, Field, OpCode, Operand};
use crate::pool::Id;
use serde::{Deserialize, Serialize};

pub type InstrId = Id<Instruction>;
pub type ConstId = Id<Constant>;
pub type ChunkId = Id<Chunk>;

/// Which operands a virtualized-table substitution relocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachedFields {
    A,
    B,
    AB,
}

impl CachedFields {
    pub fn fields(self) -> &'static [Field] {
        match self {
            CachedFields::A => &[Field::A],
            CachedFields::B => &[Field::B],
            CachedFields::AB => &[Field::A, Field::B],
        }
    }
}

/// Storage layout of the A/B/C operands for a cloned handler.
///
/// Each variant names the storage slot of semantic A, B and C in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permutation {
    Bac,
    Acb,
    Bca,
    Cab,
    Cba,
}

impl Permutation {
    pub const ALL: [Permutation; 5] = [
        Permutation::Bac,
        Permutation::Acb,
        Permutation::Bca,
        Permutation::Cab,
        Permutation::Cba,
    ];

    /// Storage slot holding the given semantic field.
    pub fn storage(self, field: Field) -> Field {
        let [a, b, c] = match self {
            Permutation::Bac => [Field::B, Field::A, Field::C],
            Permutation::Acb => [Field::A, Field::C, Field::B],
            Permutation::Bca => [Field::B, Field::C, Field::A],
            Permutation::Cab => [Field::C, Field::A, Field::B],
            Permutation::Cba => [Field::C, Field::B, Field::A],
        };
        match field {
            Field::A => a,
            Field::B => b,
            Field::C => c,
            other => other,
        }
    }
}

/// How the obfuscator disguised an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObfuscationType {
    /// Dispatch id is written at runtime by a preceding `Redirect`.
    Redirect,
    /// One operand is written at runtime by a preceding `Reload`.
    RegisterReload { field: Field },
    /// Operands stored with a per-instance offset.
    Polymorphic,
    /// Operands travel through the shared cache table.
    VirtualTable { fields: CachedFields },
    /// Dispatch id is written at runtime by a `DynamicRedirect` reached through a jump detour.
    DynamicHandler,
    /// Handler clone with permuted operand storage.
    Shuffle { permutation: Permutation },
}

/// Per-field offset of a polymorphic instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Offset {
    None,
    /// Stored as `value + k`; the handler subtracts `k`.
    Add(i32),
    /// Stored as `value - k`; the handler adds `k`.
    Sub(i32),
}

impl Offset {
    pub fn encode(self, value: i32) -> i32 {
        match self {
            Offset::None => value,
            Offset::Add(k) => value + k,
            Offset::Sub(k) => value - k,
        }
    }

    pub fn decode(self, stored: i32) -> i32 {
        match self {
            Offset::None => stored,
            Offset::Add(k) => stored - k,
            Offset::Sub(k) => stored + k,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolymorphicEncoding {
    pub a: Offset,
    pub b: Offset,
    pub c: Offset,
}

impl PolymorphicEncoding {
    pub fn offset(&self, field: Field) -> Offset {
        match field {
            Field::A => self.a,
            Field::B => self.b,
            Field::C => self.c,
            Field::E | Field::F => Offset::None,
        }
    }
}

/// Data attached by the virtual opcode allocator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    /// Index of the assigned handler in the build's handler table.
    pub handler: Option<usize>,
    pub encoding: Option<PolymorphicEncoding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    /// Branch channel; resolved from `jump` for skip-style conditionals.
    pub e: i32,
    /// Relative offset of the instruction this one patches at runtime.
    pub f: i32,
    /// Constant addressed through the `B` slot (`Bx` in Lua terms).
    pub constant: Option<ConstId>,
    pub k_b: Option<ConstId>,
    pub k_c: Option<ConstId>,
    pub prototype: Option<ChunkId>,
    pub jump: Option<InstrId>,
    /// Instruction patched through `F`.
    pub target: Option<InstrId>,
    /// Operand of `target` that a `Reload`/`PopCachedKey` writes.
    pub patch_field: Option<Field>,
    pub untouched: bool,
    pub obfuscation: Option<ObfuscationType>,
    pub obfuscated_by: Option<InstrId>,
    pub custom: CustomData,
}

impl Instruction {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            a: 0,
            b: 0,
            c: 0,
            e: 0,
            f: 0,
            constant: None,
            k_b: None,
            k_c: None,
            prototype: None,
            jump: None,
            target: None,
            patch_field: None,
            untouched: true,
            obfuscation: None,
            obfuscated_by: None,
            custom: CustomData::default(),
        }
    }

    pub fn with_a(mut self, a: i32) -> Self {
        self.a = a;
        self
    }

    pub fn with_b(mut self, b: i32) -> Self {
        self.b = b;
        self
    }

    pub fn with_c(mut self, c: i32) -> Self {
        self.c = c;
        self
    }

    pub fn jumping_to(mut self, target: InstrId) -> Self {
        self.jump = Some(target);
        self
    }

    pub fn patching(mut self, target: InstrId) -> Self {
        self.target = Some(target);
        self
    }

    /// Marks an instruction the obfuscator synthesized.
    pub fn synthetic(mut self) -> Self {
        self.untouched = false;
        self
    }

    /// Unconditional jump to `target`.
    pub fn jmp(target: InstrId) -> Self {
        Instruction::new(OpCode::Jmp).jumping_to(target).synthetic()
    }

    pub fn control(&self) -> Control {
        self.opcode.control(self.jump.is_some())
    }

    /// Slot that receives the resolved jump, if any.
    pub fn jump_field(&self) -> Option<Field> {
        self.jump.and(self.opcode.jump_field())
    }

    pub fn field(&self, field: Field) -> i32 {
        match field {
            Field::A => self.a,
            Field::B => self.b,
            Field::C => self.c,
            Field::E => self.e,
            Field::F => self.f,
        }
    }

    pub fn field_mut(&mut self, field: Field) -> &mut i32 {
        match field {
            Field::A => &mut self.a,
            Field::B => &mut self.b,
            Field::C => &mut self.c,
            Field::E => &mut self.e,
            Field::F => &mut self.f,
        }
    }

    /// Constant referenced through `field`, if that slot holds a constant.
    pub fn constant_in(&self, field: Field) -> Option<ConstId> {
        match (field, self.opcode.operand(field)) {
            (Field::B, Operand::Constant) => self.constant,
            (Field::B, Operand::RegisterOrConstant) => self.k_b,
            (Field::C, Operand::RegisterOrConstant) => self.k_c,
            _ => None,
        }
    }

    pub fn references_constants(&self) -> bool {
        self.constant.is_some() || self.k_b.is_some() || self.k_c.is_some()
    }

    /// Slots this instruction actually carries at runtime.
    pub fn present_fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| match field {
                Field::E => self.jump_field() == Some(Field::E),
                _ => self.opcode.operand(*field) != Operand::Unused,
            })
            .collect()
    }

    /// Register-valued slots, including RK slots that do not address a constant.
    pub fn register_fields(&self) -> Vec<Field> {
        Field::STORAGE
            .into_iter()
            .filter(|field| match self.opcode.operand(*field) {
                Operand::Register => true,
                Operand::RegisterOrConstant => self.constant_in(*field).is_none(),
                _ => false,
            })
            .collect()
    }
}
