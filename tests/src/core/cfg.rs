use moonveil_core::cfg::{self, BlockKind, EdgeKind};
use moonveil_core::frontend::Frontend;
use moonveil_core::{Chunk, Control, InstrId, LuaFrontend, OpCode};
use moonveil_tests::{eval, init_tracing, interpret};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;

const PROGRAM: &str = r#"
    local acc = {}
    local n = 0
    while n < 20 do
        n = n + 1
        if n % 2 == 0 and n % 3 ~= 0 then
            acc[#acc + 1] = n
        elseif n == 15 then
            acc[#acc + 1] = -1
        end
    end
    local s = ""
    for i, v in ipairs(acc) do
        s = s .. v .. (i < #acc and "," or "")
    end
    return s
"#;

/// Next instruction executed after `position`, skipping synthetic jumps.
fn logical_successor(chunk: &Chunk, position: usize) -> Option<InstrId> {
    let mut id = chunk.instructions.at(position + 1)?;
    for _ in 0..chunk.instructions.len() {
        let instruction = &chunk.instructions[id];
        if instruction.untouched || instruction.opcode != OpCode::Jmp {
            return Some(id);
        }
        id = instruction.jump?;
    }
    None
}

fn successors(chunk: &Chunk) -> HashMap<InstrId, InstrId> {
    chunk
        .instructions
        .ids()
        .iter()
        .enumerate()
        .filter(|(_, id)| chunk.instructions[**id].untouched)
        .filter(|(_, id)| {
            matches!(chunk.instructions[**id].control(), Control::Next | Control::Branch)
        })
        .filter_map(|(position, id)| Some((*id, logical_successor(chunk, position)?)))
        .collect()
}

#[test]
fn reconstruction_without_shuffle_is_identity() {
    let mut chunk = LuaFrontend.load(PROGRAM, "cfg").unwrap();
    let before = chunk.instructions.ids().to_vec();

    let graph = cfg::build_graph(&chunk).unwrap();
    cfg::reconstruct(&graph, &mut chunk).unwrap();

    assert_eq!(chunk.instructions.ids(), before.as_slice());
}

#[test]
fn blocks_partition_the_layout() {
    let chunk = LuaFrontend.load(PROGRAM, "cfg").unwrap();
    let graph = cfg::build_graph(&chunk).unwrap();

    let flattened: Vec<InstrId> = graph
        .order
        .iter()
        .flat_map(|node| graph.graph[*node].instructions.clone())
        .collect();
    assert_eq!(flattened.as_slice(), chunk.instructions.ids());
    assert!(graph.block_count() > 4);
    assert!(graph.graph.edge_weights().any(|edge| *edge == EdgeKind::Jump));
    assert!(graph.graph.node_weights().all(|block| block.kind == BlockKind::Body));
}

#[test]
fn shuffled_layout_keeps_the_execution_trace() {
    init_tracing();
    for seed in 0..10 {
        let mut chunk = LuaFrontend.load(PROGRAM, "cfg").unwrap();
        let expected = successors(&chunk);
        let jumps: Vec<(InstrId, Option<InstrId>)> = chunk
            .instructions
            .iter()
            .map(|(id, instruction)| (id, instruction.jump))
            .collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut graph = cfg::build_graph(&chunk).unwrap();
        cfg::shuffle(&mut graph, &mut chunk, &mut rng).unwrap();
        let bodies: Vec<_> = graph
            .order
            .iter()
            .copied()
            .filter(|node| graph.graph[*node].kind == BlockKind::Body)
            .collect();
        for node in bodies {
            cfg::shuffle_straight_line(&mut graph, &mut chunk, node, &mut rng).unwrap();
        }
        cfg::reconstruct(&graph, &mut chunk).unwrap();

        assert_eq!(successors(&chunk), expected, "seed {seed}");
        for (id, jump) in jumps {
            assert_eq!(chunk.instructions[id].jump, jump, "seed {seed}");
        }
    }
}

#[test]
fn shuffled_layout_computes_the_same_result() {
    let expected: String = eval(PROGRAM).unwrap();
    for seed in 0..4 {
        let mut chunk = LuaFrontend.load(PROGRAM, "cfg").unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut graph = cfg::build_graph(&chunk).unwrap();
        cfg::shuffle(&mut graph, &mut chunk, &mut rng).unwrap();
        cfg::reconstruct(&graph, &mut chunk).unwrap();

        let source = interpret(chunk, Default::default(), seed).unwrap();
        let actual: String = eval(&source).unwrap();
        assert_eq!(actual, expected, "seed {seed}");
    }
}
