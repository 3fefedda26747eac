//! Per-build state shared by allocation, serialization and emission.

use crate::allocator::VirtualOpcode;
use moonveil_core::{Chunk, Field, Settings};
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use std::collections::BTreeMap;

/// Table keys the interpreter uses for instruction operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKeys {
    pub opcode: u32,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub e: u32,
    pub f: u32,
}

impl FieldKeys {
    pub fn key(&self, field: Field) -> u32 {
        match field {
            Field::A => self.a,
            Field::B => self.b,
            Field::C => self.c,
            Field::E => self.e,
            Field::F => self.f,
        }
    }
}

/// Table keys of a deserialized chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkKeys {
    pub instructions: u32,
    pub prototypes: u32,
    pub params: u32,
    pub captures: u32,
    pub state: u32,
}

/// Sections of a serialized chunk, in the order this build writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStep {
    Params,
    Constants,
    Instructions,
    Functions,
}

/// Tag byte preceding each serialized constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantTags {
    pub nil: u8,
    pub boolean: u8,
    pub number: u8,
    pub string: u8,
    pub crash: u8,
}

/// One obfuscation run. Never shared between builds.
pub struct BuildContext {
    pub root: Chunk,
    pub settings: Settings,
    pub rng: StdRng,
    pub xor_key: u8,
    pub tags: ConstantTags,
    pub fields: FieldKeys,
    pub chunk_keys: ChunkKeys,
    pub chunk_steps: [ChunkStep; 4],
    /// Handler table, indexed by dispatch id once allocated.
    pub handlers: Vec<VirtualOpcode>,
    /// Snapshot alias -> global name, collected from every chunk.
    pub snapshot: BTreeMap<String, String>,
}

impl BuildContext {
    pub fn new(root: Chunk, settings: Settings, mut rng: StdRng) -> Self {
        let xor_key = rng.random_range(1..=255u8);

        let tags = distinct(&mut rng, 5, 256);
        let tags = ConstantTags {
            nil: tags[0] as u8,
            boolean: tags[1] as u8,
            number: tags[2] as u8,
            string: tags[3] as u8,
            crash: tags[4] as u8,
        };

        let keys = distinct(&mut rng, 6, 96);
        let fields = FieldKeys {
            opcode: keys[0] + 1,
            a: keys[1] + 1,
            b: keys[2] + 1,
            c: keys[3] + 1,
            e: keys[4] + 1,
            f: keys[5] + 1,
        };

        let keys = distinct(&mut rng, 5, 96);
        let chunk_keys = ChunkKeys {
            instructions: keys[0] + 1,
            prototypes: keys[1] + 1,
            params: keys[2] + 1,
            captures: keys[3] + 1,
            state: keys[4] + 1,
        };

        let mut chunk_steps = [
            ChunkStep::Params,
            ChunkStep::Constants,
            ChunkStep::Instructions,
            ChunkStep::Functions,
        ];
        chunk_steps.shuffle(&mut rng);

        let mut snapshot = BTreeMap::new();
        collect_snapshot(&root, &mut snapshot);

        Self {
            root,
            settings,
            rng,
            xor_key,
            tags,
            fields,
            chunk_keys,
            chunk_steps,
            handlers: Vec::new(),
            snapshot,
        }
    }

    /// Placeholder -> key table used when binding interpreter text.
    pub fn placeholders(&self) -> BTreeMap<&'static str, u32> {
        BTreeMap::from([
            ("OP_ENUM", self.fields.opcode),
            ("OP_A", self.fields.a),
            ("OP_B", self.fields.b),
            ("OP_C", self.fields.c),
            ("OP_E", self.fields.e),
            ("OP_F", self.fields.f),
            ("K_INSTR", self.chunk_keys.instructions),
            ("K_PROTO", self.chunk_keys.prototypes),
            ("K_PARAMS", self.chunk_keys.params),
            ("K_CAPS", self.chunk_keys.captures),
            ("K_STATE", self.chunk_keys.state),
        ])
    }
}

fn distinct(rng: &mut StdRng, amount: usize, range: usize) -> Vec<u32> {
    rand::seq::index::sample(rng, range, amount)
        .into_iter()
        .map(|value| value as u32)
        .collect()
}

fn collect_snapshot(chunk: &Chunk, snapshot: &mut BTreeMap<String, String>) {
    for (global, alias) in &chunk.environment_names {
        snapshot.insert(alias.clone(), global.clone());
    }
    for (_, child) in chunk.functions.iter() {
        collect_snapshot(child, snapshot);
    }
}
