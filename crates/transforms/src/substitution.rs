//! Instruction substitution.
//!
//! Eligible instructions get a short self-modifying sequence spliced in front of them, or are
//! flagged for per-instance operand encoding. Every jump that landed on the original now lands
//! on the first spliced instruction, so the patch always runs before the patched instruction.

use crate::{Result, Transform, each_chunk};
use moonveil_core::instruction::{CachedFields, ObfuscationType};
use moonveil_core::{Chunk, Field, InstrId, Instruction, OpCode, Settings};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Redirect,
    RegisterReload,
    Polymorphic,
    VirtualTable,
    DynamicHandler,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Redirect,
        Strategy::RegisterReload,
        Strategy::Polymorphic,
        Strategy::VirtualTable,
        Strategy::DynamicHandler,
    ];
}

pub struct Substitution {
    settings: Settings,
}

impl Substitution {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

impl Transform for Substitution {
    fn name(&self) -> &'static str {
        "Substitution"
    }

    fn apply(&self, root: &mut Chunk, rng: &mut StdRng) -> Result<bool> {
        each_chunk(root, &mut |chunk| {
            let start = region_start(chunk, &self.settings);
            Ok(substitute_region(chunk, &self.settings, start, rng)? > 0)
        })
    }
}

/// First layout position open to substitution: right after the woven prefix, or 0 when
/// enhanced security lets substitution reach into the prefix.
pub fn region_start(chunk: &Chunk, settings: &Settings) -> usize {
    if settings.enhanced_security {
        return 0;
    }
    chunk
        .anti_tamper
        .and_then(|last| chunk.instructions.find(last))
        .map_or(0, |position| position + 1)
}

/// Whether the substitution engine may touch `instruction`.
pub fn eligible(instruction: &Instruction) -> bool {
    instruction.untouched
        && instruction.obfuscation.is_none()
        && instruction.opcode.substitutable()
        && !instruction.references_constants()
        && Field::STORAGE
            .into_iter()
            .all(|field| (0..=255).contains(&instruction.field(field)))
}

/// Substitutes eligible instructions from layout position `start` onward. Returns how many
/// instructions were substituted.
pub fn substitute_region<R: Rng + ?Sized>(
    chunk: &mut Chunk,
    settings: &Settings,
    start: usize,
    rng: &mut R,
) -> Result<usize> {
    let density = settings.substitution_density();
    let candidates: Vec<InstrId> = chunk
        .instructions
        .ids()
        .iter()
        .skip(start)
        .copied()
        .filter(|id| eligible(&chunk.instructions[*id]))
        .collect();

    let mut counts = [0usize; 5];
    for id in candidates {
        if !rng.random_bool(density) {
            continue;
        }
        let Some(strategy) = Strategy::ALL.choose(rng).copied() else {
            continue;
        };
        let applied = substitute(chunk, id, strategy, rng)?;
        if let Some(slot) = Strategy::ALL.iter().position(|s| *s == applied) {
            counts[slot] += 1;
        }
    }

    let total = counts.iter().sum();
    if total > 0 {
        debug!(
            "chunk #{}: substituted {} (redirect {}, reload {}, polymorphic {}, table {}, dynamic {})",
            chunk.prototype_id, total, counts[0], counts[1], counts[2], counts[3], counts[4]
        );
    }
    Ok(total)
}

/// Applies `strategy` to instruction `id`. Strategies that need an operand the instruction
/// does not carry fall back to [`Strategy::Polymorphic`]. Returns the strategy applied.
pub fn substitute<R: Rng + ?Sized>(
    chunk: &mut Chunk,
    id: InstrId,
    strategy: Strategy,
    rng: &mut R,
) -> Result<Strategy> {
    let operands: Vec<Field> = chunk.instructions[id]
        .present_fields()
        .into_iter()
        .filter(|field| matches!(field, Field::A | Field::B))
        .collect();

    let (obfuscation, by, applied) = match strategy {
        Strategy::Redirect => {
            let redirect = splice(chunk, id, vec![Instruction::new(OpCode::Redirect).patching(id)])?;
            (ObfuscationType::Redirect, redirect[0], strategy)
        }
        Strategy::RegisterReload if !operands.is_empty() => {
            let field = operands[rng.random_range(0..operands.len())];
            let mut reload = Instruction::new(OpCode::Reload)
                .with_a(chunk.instructions[id].field(field))
                .patching(id);
            reload.patch_field = Some(field);
            let reload = splice(chunk, id, vec![reload])?;
            (ObfuscationType::RegisterReload { field }, reload[0], strategy)
        }
        Strategy::VirtualTable if !operands.is_empty() => {
            let fields = match operands[..] {
                [field] if field == Field::A => CachedFields::A,
                [_] => CachedFields::B,
                _ => *[CachedFields::A, CachedFields::B, CachedFields::AB]
                    .choose(rng)
                    .unwrap_or(&CachedFields::AB),
            };
            let slots: Vec<i32> = rand::seq::index::sample(rng, 256, fields.fields().len())
                .into_iter()
                .map(|slot| slot as i32)
                .collect();

            let mut sequence = Vec::with_capacity(4);
            for (field, slot) in fields.fields().iter().zip(&slots) {
                sequence.push(
                    Instruction::new(OpCode::PushCachedKey)
                        .with_a(chunk.instructions[id].field(*field))
                        .with_b(*slot),
                );
            }
            for (field, slot) in fields.fields().iter().zip(&slots) {
                let mut pop = Instruction::new(OpCode::PopCachedKey).with_b(*slot).patching(id);
                pop.patch_field = Some(*field);
                sequence.push(pop);
            }
            let spliced = splice(chunk, id, sequence)?;
            (ObfuscationType::VirtualTable { fields }, spliced[0], strategy)
        }
        Strategy::DynamicHandler => {
            // The detour jumps to a redirect parked after the last instruction, which patches
            // the original and jumps back to it.
            let detour = splice(chunk, id, vec![Instruction::new(OpCode::Jmp)])?[0];
            let redirect = chunk.instructions.push(
                Instruction::new(OpCode::DynamicRedirect)
                    .patching(id)
                    .jumping_to(id)
                    .synthetic(),
            );
            chunk.instructions[detour].jump = Some(redirect);
            (ObfuscationType::DynamicHandler, redirect, strategy)
        }
        Strategy::Polymorphic | Strategy::RegisterReload | Strategy::VirtualTable => {
            (ObfuscationType::Polymorphic, id, Strategy::Polymorphic)
        }
    };

    let instruction = &mut chunk.instructions[id];
    instruction.obfuscation = Some(obfuscation);
    instruction.untouched = false;
    if by != id {
        instruction.obfuscated_by = Some(by);
    }
    Ok(applied)
}

/// Inserts `sequence` directly before `anchor` and sends every jump into `anchor` to the
/// first inserted instruction.
fn splice(chunk: &mut Chunk, anchor: InstrId, sequence: Vec<Instruction>) -> Result<Vec<InstrId>> {
    let mut ids = Vec::with_capacity(sequence.len());
    for instruction in sequence {
        ids.push(chunk.insert_before(anchor, instruction.synthetic())?);
    }
    if let Some(first) = ids.first() {
        chunk.redirect_jumps(anchor, *first);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonveil_core::LuaFrontend;
    use moonveil_core::frontend::Frontend;
    use moonveil_vm::{BuildContext, allocate, emit, serialize};
    use rand::SeedableRng;

    const PROGRAM: &str = r#"
        local a, b = 3, 4
        local c = a + b
        local d = c * a
        local t = {}
        t[1] = d
        local e = #t + d - b
        return e
    "#;

    fn load() -> Chunk {
        LuaFrontend.load(PROGRAM, "test").unwrap()
    }

    fn run(mut chunk: Chunk, seed: u64) -> f64 {
        chunk.recompute_all();
        chunk.resolve_all().unwrap();
        let mut ctx = BuildContext::new(chunk, Settings::default(), StdRng::seed_from_u64(seed));
        allocate(&mut ctx).unwrap();
        let bytes = serialize(&mut ctx).unwrap();
        let source = emit(&mut ctx, &bytes).unwrap();
        mlua::Lua::new().load(source.as_str()).eval().unwrap()
    }

    #[test]
    fn eligibility() {
        let add = Instruction::new(OpCode::Add).with_a(2).with_b(0).with_c(1);
        assert!(eligible(&add));
        assert!(!eligible(&add.clone().with_a(300)));
        assert!(!eligible(&add.clone().synthetic()));
        assert!(!eligible(&Instruction::new(OpCode::Return)));
        let mut constant = add;
        constant.k_c = Some(Chunk::new(0).constants.push(moonveil_core::Constant::new(
            moonveil_core::ConstantValue::Number(1.0),
        )));
        assert!(!eligible(&constant));
    }

    #[test]
    fn every_strategy_preserves_behaviour() {
        for strategy in Strategy::ALL {
            let mut chunk = load();
            let mut rng = StdRng::seed_from_u64(5);
            let targets: Vec<InstrId> = chunk
                .instructions
                .ids()
                .iter()
                .copied()
                .filter(|id| eligible(&chunk.instructions[*id]))
                .collect();
            assert!(targets.len() >= 3);
            for id in &targets {
                substitute(&mut chunk, *id, strategy, &mut rng).unwrap();
            }
            assert!(targets.iter().all(|id| !chunk.instructions[*id].untouched));
            assert_eq!(run(chunk, 1), 18.0, "{strategy:?}");
        }
    }

    #[test]
    fn spliced_sequences_precede_their_target() {
        let mut chunk = load();
        let id = chunk
            .instructions
            .ids()
            .iter()
            .copied()
            .find(|id| chunk.instructions[*id].opcode == OpCode::Add)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        substitute(&mut chunk, id, Strategy::VirtualTable, &mut rng).unwrap();
        let position = chunk.instructions.find(id).unwrap();
        let before = chunk.instructions[chunk.instructions.at(position - 1).unwrap()].opcode;
        assert_eq!(before, OpCode::PopCachedKey);
        assert!(chunk.instructions[id].obfuscated_by.is_some());
    }

    #[test]
    fn prefix_is_skipped_unless_enhanced() {
        let mut chunk = load();
        let third = chunk.instructions.at(2).unwrap();
        chunk.anti_tamper = Some(third);
        assert_eq!(region_start(&chunk, &Settings::default()), 3);
        let enhanced = Settings {
            enhanced_security: true,
            ..Settings::default()
        };
        assert_eq!(region_start(&chunk, &enhanced), 0);

        let before: Vec<Instruction> = chunk
            .instructions
            .ids()
            .iter()
            .take(3)
            .map(|id| chunk.instructions[*id].clone())
            .collect();
        for seed in 0..8 {
            let mut copy = chunk.clone();
            substitute_region(&mut copy, &Settings::default(), 3, &mut StdRng::seed_from_u64(seed)).unwrap();
            let after: Vec<Instruction> = copy
                .instructions
                .ids()
                .iter()
                .take(3)
                .map(|id| copy.instructions[*id].clone())
                .collect();
            assert_eq!(after, before);
        }
    }
}
