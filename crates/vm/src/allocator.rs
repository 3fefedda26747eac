//! Virtual opcode allocation.
//!
//! Walks every instruction of the build, picks the handler it dispatches to and assigns dense,
//! shuffled dispatch ids:
//!
//! - plain instructions share one builtin handler per [`HandlerKey`];
//! - `Shuffle` instructions share one clone per key and permutation;
//! - `Polymorphic` instructions each get a bespoke handler undoing their own offsets.

use crate::context::BuildContext;
use crate::handlers::{self, HandlerKey};
use crate::template;
use crate::{Error, Result};
use moonveil_core::instruction::{ObfuscationType, Offset, Permutation, PolymorphicEncoding};
use moonveil_core::{Chunk, Field};
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualOpcode {
    pub key: HandlerKey,
    pub permutation: Option<Permutation>,
    pub encoding: Option<PolymorphicEncoding>,
    /// Lua body with `OP_*` placeholders still unbound.
    pub body: String,
}

#[derive(Default)]
struct HandlerTable {
    handlers: Vec<VirtualOpcode>,
    builtin: HashMap<HandlerKey, usize>,
    shuffled: HashMap<(HandlerKey, Permutation), usize>,
}

impl HandlerTable {
    fn builtin(&mut self, key: HandlerKey) -> Result<usize> {
        if let Some(&id) = self.builtin.get(&key) {
            return Ok(id);
        }
        let body = handlers::template(&key).ok_or(Error::MissingHandler(key.opcode))?;
        let id = self.push(key, None, None, body);
        self.builtin.insert(key, id);
        Ok(id)
    }

    fn shuffled(&mut self, key: HandlerKey, permutation: Permutation) -> Result<usize> {
        if let Some(&id) = self.shuffled.get(&(key, permutation)) {
            return Ok(id);
        }
        let body = handlers::template(&key).ok_or(Error::MissingHandler(key.opcode))?;
        let id = self.push(
            key,
            Some(permutation),
            None,
            template::permute(&body, permutation),
        );
        self.shuffled.insert((key, permutation), id);
        Ok(id)
    }

    fn polymorphic(&mut self, key: HandlerKey, encoding: PolymorphicEncoding) -> Result<usize> {
        let body = handlers::template(&key).ok_or(Error::MissingHandler(key.opcode))?;
        Ok(self.push(
            key,
            None,
            Some(encoding),
            template::polymorph(&body, &encoding),
        ))
    }

    fn push(
        &mut self,
        key: HandlerKey,
        permutation: Option<Permutation>,
        encoding: Option<PolymorphicEncoding>,
        body: String,
    ) -> usize {
        self.handlers.push(VirtualOpcode {
            key,
            permutation,
            encoding,
            body,
        });
        self.handlers.len() - 1
    }
}

/// Offset policy for one polymorphic operand.
pub fn choose_offset<R: Rng + ?Sized>(value: i32, rng: &mut R) -> Offset {
    if value > 40 {
        Offset::Sub(rng.random_range(1..=value - 5))
    } else if value <= 1 {
        Offset::None
    } else {
        Offset::Add(rng.random_range(1..=value.min(80)))
    }
}

fn assign(chunk: &mut Chunk, table: &mut HandlerTable, rng: &mut StdRng) -> Result<()> {
    for id in chunk.instructions.ids().to_vec() {
        let instruction = &mut chunk.instructions[id];
        let key = HandlerKey::of(instruction);
        let handler = match instruction.obfuscation {
            Some(ObfuscationType::Polymorphic) => {
                let present = instruction.present_fields();
                let mut offset = |field: Field| {
                    if present.contains(&field) {
                        choose_offset(instruction.field(field), rng)
                    } else {
                        Offset::None
                    }
                };
                let encoding = PolymorphicEncoding {
                    a: offset(Field::A),
                    b: offset(Field::B),
                    c: offset(Field::C),
                };
                instruction.custom.encoding = Some(encoding);
                table.polymorphic(key, encoding)?
            }
            Some(ObfuscationType::Shuffle { permutation }) => table.shuffled(key, permutation)?,
            _ => table.builtin(key)?,
        };
        instruction.custom.handler = Some(handler);
    }
    for id in chunk.functions.ids().to_vec() {
        assign(&mut chunk.functions[id], table, rng)?;
    }
    Ok(())
}

fn remap(chunk: &mut Chunk, ids: &[usize]) {
    for id in chunk.instructions.ids().to_vec() {
        let custom = &mut chunk.instructions[id].custom;
        custom.handler = custom.handler.map(|provisional| ids[provisional]);
    }
    for id in chunk.functions.ids().to_vec() {
        remap(&mut chunk.functions[id], ids);
    }
}

/// Assigns a handler to every instruction and stores the shuffled handler table in `ctx`.
pub fn allocate(ctx: &mut BuildContext) -> Result<()> {
    let mut table = HandlerTable::default();
    assign(&mut ctx.root, &mut table, &mut ctx.rng)?;

    let count = table.handlers.len();
    let mut ids: Vec<usize> = (0..count).collect();
    ids.shuffle(&mut ctx.rng);
    remap(&mut ctx.root, &ids);

    let mut slots: Vec<Option<VirtualOpcode>> = vec![None; count];
    for (provisional, handler) in table.handlers.into_iter().enumerate() {
        slots[ids[provisional]] = Some(handler);
    }
    ctx.handlers = slots.into_iter().flatten().collect();

    debug!(
        "allocated {} handlers ({} builtin, {} shuffled)",
        count,
        table.builtin.len(),
        table.shuffled.len()
    );
    Ok(())
}
