use crate::{Result, Transform, each_chunk};
use moonveil_core::instruction::{ObfuscationType, Permutation};
use moonveil_core::{Chunk, Instruction, OpCode, Settings};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tracing::debug;

/// Share of unconditional jumps dressed as for-loop preparations.
const JUMP_RATE: f64 = 0.5;
/// Share of instructions that get a handler clone with permuted operand storage.
const SHUFFLE_RATE: f64 = 0.25;

/// Varies the opcode surface: jumps become `FakeForPrep` with bounds that always take the
/// branch, and, with dynamic opcode structure on, instructions are marked for handler clones
/// with permuted operands.
pub struct OpcodeSubstitution {
    settings: Settings,
}

impl OpcodeSubstitution {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

impl Transform for OpcodeSubstitution {
    fn name(&self) -> &'static str {
        "OpcodeSubst"
    }

    fn apply(&self, root: &mut Chunk, rng: &mut StdRng) -> Result<bool> {
        each_chunk(root, &mut |chunk| {
            let (jumps, shuffled) = substitute_opcodes(chunk, self.settings.dynamic_opcode_structure, rng);
            Ok(jumps + shuffled > 0)
        })
    }
}

/// Returns the number of disguised jumps and of shuffle-marked instructions.
pub fn substitute_opcodes<R: Rng + ?Sized>(chunk: &mut Chunk, shuffle: bool, rng: &mut R) -> (usize, usize) {
    let mut jumps = 0;
    let mut shuffled = 0;
    for id in chunk.instructions.ids().to_vec() {
        let instruction = &mut chunk.instructions[id];
        if instruction.opcode == OpCode::Jmp
            && let Some(target) = instruction.jump
            && rng.random_bool(JUMP_RATE)
        {
            let limit = rng.random_range(0..=1000);
            let init = limit + rng.random_range(1..=1000);
            *instruction = Instruction::new(OpCode::FakeForPrep)
                .with_b(init)
                .with_c(limit)
                .jumping_to(target)
                .synthetic();
            jumps += 1;
            continue;
        }

        if shuffle
            && !instruction.opcode.is_pseudo()
            && instruction.obfuscation.is_none()
            && rng.random_bool(SHUFFLE_RATE)
            && let Some(permutation) = Permutation::ALL.choose(rng).copied()
        {
            instruction.obfuscation = Some(ObfuscationType::Shuffle { permutation });
            shuffled += 1;
        }
    }
    if jumps + shuffled > 0 {
        debug!(
            "chunk #{}: {} jumps disguised, {} instructions shuffle-marked",
            chunk.prototype_id, jumps, shuffled
        );
    }
    (jumps, shuffled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonveil_core::frontend::Frontend;
    use moonveil_core::{Control, LuaFrontend};
    use rand::SeedableRng;

    #[test]
    fn disguised_jumps_keep_their_target() {
        let mut chunk = LuaFrontend
            .load("local n = 0 for i = 1, 10 do if i % 2 == 0 then n = n + i end end return n", "t")
            .unwrap();
        let before: Vec<_> = chunk
            .instructions
            .iter()
            .filter(|(_, i)| i.opcode == OpCode::Jmp)
            .map(|(id, i)| (id, i.jump))
            .collect();
        assert!(!before.is_empty());

        let (jumps, _) = substitute_opcodes(&mut chunk, false, &mut StdRng::seed_from_u64(4));
        let mut disguised = 0;
        for (id, target) in before {
            let instruction = &chunk.instructions[id];
            assert_eq!(instruction.jump, target);
            assert_eq!(instruction.control(), Control::Jump);
            if instruction.opcode == OpCode::FakeForPrep {
                assert!(instruction.b > instruction.c);
                disguised += 1;
            }
        }
        assert_eq!(disguised, jumps);
    }

    #[test]
    fn shuffle_marking_needs_dynamic_structure() {
        let mut chunk = LuaFrontend.load("local a, b = 1, 2 return a + b, a - b, a * b", "t").unwrap();
        let (_, marked) = substitute_opcodes(&mut chunk, false, &mut StdRng::seed_from_u64(0));
        assert_eq!(marked, 0);
        let marked: usize = (0..16)
            .map(|seed| substitute_opcodes(&mut chunk.clone(), true, &mut StdRng::seed_from_u64(seed)).1)
            .sum();
        assert!(marked > 0);
    }
}
