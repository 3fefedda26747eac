use moonveil_core::frontend::Frontend;
use moonveil_core::{Capture, Chunk, ConstantValue, LuaFrontend, OpCode};
use std::collections::HashSet;

const PROGRAM: &str = r##"
    local counter = 0
    local function bump(step, ...)
        counter = counter + step
        local extra = select("#", ...)
        return function() return counter + extra end
    end
    local t = { 1, 2, 3, bump(2, "a", "b")() }
    return t[4], #t
"##;

fn prototype_ids(chunk: &Chunk, out: &mut Vec<u32>) {
    out.push(chunk.prototype_id);
    for (_, child) in chunk.functions.iter() {
        prototype_ids(child, out);
    }
}

#[test]
fn nested_prototypes_are_lifted() {
    let root = LuaFrontend.load(PROGRAM, "decoder").unwrap();
    assert_eq!(root.prototype_id, 0);
    assert_eq!(root.is_vararg & 2, 2);

    let mut ids = Vec::new();
    prototype_ids(&root, &mut ids);
    assert_eq!(ids.len(), 3);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(root.max_prototype_id(), 2);

    let (_, bump) = root.functions.iter().next().unwrap();
    assert_eq!(bump.num_params, 1);
    assert_ne!(bump.is_vararg, 0);
    assert_eq!(bump.captures, vec![Capture::Local(0)]);

    let (_, inner) = bump.functions.iter().next().unwrap();
    assert_eq!(inner.num_upvalues, 2);
    assert!(matches!(inner.captures[0], Capture::Upvalue(0)));
    assert!(matches!(inner.captures[1], Capture::Local(_)));
}

#[test]
fn capture_words_are_not_instructions() {
    let root = LuaFrontend.load(PROGRAM, "decoder").unwrap();
    let (_, bump) = root.functions.iter().next().unwrap();
    let closure = bump
        .instructions
        .ids()
        .iter()
        .position(|id| bump.instructions[*id].opcode == OpCode::Closure)
        .unwrap();
    let after = bump.instructions.at(closure + 1).unwrap();
    assert!(!matches!(bump.instructions[after].opcode, OpCode::Move | OpCode::GetUpval));
}

#[test]
fn constants_and_references_are_lifted() {
    let root = LuaFrontend.load(PROGRAM, "decoder").unwrap();
    let (_, bump) = root.functions.iter().next().unwrap();
    let names: Vec<&str> = bump
        .constants
        .iter()
        .filter_map(|(_, constant)| constant.value.as_str())
        .collect();
    assert!(names.contains(&"select"));
    assert!(names.contains(&"#"));

    for (_, instruction) in root.instructions.iter() {
        if instruction.opcode == OpCode::LoadK {
            let constant = instruction.constant.unwrap();
            assert!(matches!(
                root.constants[constant].value,
                ConstantValue::Number(_) | ConstantValue::String(_)
            ));
        }
        if instruction.opcode == OpCode::Closure {
            assert!(instruction.prototype.is_some());
        }
    }
}

#[test]
fn listing_names_every_prototype() {
    let root = LuaFrontend.load(PROGRAM, "decoder").unwrap();
    let listing = root.listing();
    assert!(listing.contains("CLOSURE"));
    assert!(listing.contains("RETURN"));
}

#[test]
fn compile_errors_surface() {
    assert!(LuaFrontend.load("local = 1", "broken").is_err());
}
