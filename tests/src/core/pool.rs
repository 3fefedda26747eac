use moonveil_core::frontend::Frontend;
use moonveil_core::{Chunk, ConstantValue, InstrId, Instruction, LuaFrontend, OpCode};
use rand::SeedableRng;
use rand::rngs::StdRng;

const PROGRAM: &str = r#"
    local names = { "alpha", "beta", "gamma" }
    local total = 0
    for i = 1, #names do
        if names[i] ~= "beta" then
            total = total + string.len(names[i]) * 1.5
        end
    end
    local function twice(x) return x * 2 end
    return twice(total), 42, "done"
"#;

/// Constant values each instruction refers to, keyed by instruction id.
fn referenced_values(chunk: &Chunk) -> Vec<(InstrId, ConstantValue)> {
    chunk
        .instructions
        .iter()
        .filter_map(|(id, instruction)| {
            let constant = instruction.constant.or(instruction.k_b).or(instruction.k_c)?;
            Some((id, chunk.constants[constant].value.clone()))
        })
        .collect()
}

fn assert_resolved(chunk: &Chunk) {
    for (position, id) in chunk.instructions.ids().iter().enumerate() {
        let instruction = &chunk.instructions[*id];
        if let (Some(target), Some(field)) = (instruction.jump, instruction.jump_field()) {
            let landed = position as i32 + instruction.field(field);
            assert_eq!(chunk.instructions.at(landed as usize), Some(target), "jump at {position}");
        }
        if let Some(constant) = instruction.constant {
            let at = chunk.constants.at(instruction.b as usize).unwrap();
            assert_eq!(at, constant, "constant operand at {position}");
        }
    }
}

#[test]
fn shuffled_pools_resolve_to_the_same_values() {
    for seed in 0..8 {
        let mut chunk = LuaFrontend.load(PROGRAM, "pool").unwrap();
        let before = referenced_values(&chunk);
        let mut rng = StdRng::seed_from_u64(seed);

        chunk.constants.shuffle(&mut rng);
        chunk.functions.shuffle(&mut rng);
        chunk.recompute();
        chunk.resolve_references().unwrap();

        assert_resolved(&chunk);
        for (id, value) in before {
            let instruction = &chunk.instructions[id];
            let constant = instruction.constant.or(instruction.k_b).or(instruction.k_c).unwrap();
            assert!(chunk.constants[constant].value.same_as(&value));
        }
    }
}

#[test]
fn insertions_keep_jumps_on_their_targets() {
    let mut chunk = LuaFrontend.load(PROGRAM, "pool").unwrap();
    let targets: Vec<InstrId> = chunk
        .instructions
        .iter()
        .filter_map(|(_, instruction)| instruction.jump)
        .collect();
    assert!(!targets.is_empty());

    for target in &targets {
        chunk
            .insert_before(*target, Instruction::new(OpCode::Move).synthetic())
            .unwrap();
    }
    chunk.recompute();
    chunk.resolve_references().unwrap();

    assert_resolved(&chunk);
}

#[test]
fn stale_positions_are_reported() {
    let mut chunk = LuaFrontend.load(PROGRAM, "pool").unwrap();
    chunk.constants.shuffle(&mut StdRng::seed_from_u64(1));
    assert!(chunk.resolve_references().is_err());

    chunk.recompute();
    assert!(chunk.resolve_references().is_ok());
}
