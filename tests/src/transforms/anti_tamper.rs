use moonveil_core::frontend::Frontend;
use moonveil_core::{Chunk, ConstantValue, LuaFrontend, OpCode, Settings};
use moonveil_tests::{eval, init_tracing, interpret};
use moonveil_transforms::Error;
use moonveil_transforms::anti_tamper::{Templates, weave};
use rand::SeedableRng;
use rand::rngs::StdRng;

const PROGRAM: &str = r#"
    local function memo(f)
        local cache = {}
        return function(n)
            if cache[n] == nil then cache[n] = f(n) end
            return cache[n]
        end
    end
    local fib
    fib = memo(function(n)
        if n < 2 then return n end
        return fib(n - 1) + fib(n - 2)
    end)
    return fib(30) .. "/" .. tostring(#{ pcall(error, "x") })
"#;

const ENTRY: &str = r#"
local State = __STATE
local Stack = State[1]
if type(Stack) ~= "table" then
	local Allocate = function()
		return __NEWSTACK
	end
	Stack = Allocate()
	State[1] = Stack
end
Stack[2] = __ENV
"#;

const NESTED: &str = r#"
local Stack = __STATE[1]
if not Stack then
	local Allocate = function()
		return __NEWSTACK
	end
	Stack = Allocate()
	__STATE[1] = Stack
	Stack[1] = __CRASH
end
Stack[2] = __ENV
"#;

fn count(chunk: &Chunk, woven: &mut usize) {
    if chunk.has_anti_tamper() {
        *woven += 1;
    }
    for (_, child) in chunk.functions.iter() {
        count(child, woven);
    }
}

#[test]
fn woven_programs_behave_identically() {
    init_tracing();
    let expected: String = eval(PROGRAM).unwrap();
    let templates = Templates::compile(&LuaFrontend).unwrap();
    for seed in 0..4 {
        let mut root = LuaFrontend.load(PROGRAM, "woven").unwrap();
        let woven = weave(&mut root, &templates, &mut StdRng::seed_from_u64(seed)).unwrap();
        assert_eq!(woven, 4);

        let source = interpret(root, Settings::default(), seed).unwrap();
        let actual: String = eval(&source).unwrap();
        assert_eq!(actual, expected, "seed {seed}");
    }
}

#[test]
fn every_original_prototype_carries_a_prefix() {
    let templates = Templates::compile(&LuaFrontend).unwrap();
    let mut root = LuaFrontend.load(PROGRAM, "woven").unwrap();
    weave(&mut root, &templates, &mut StdRng::seed_from_u64(1)).unwrap();

    let mut woven = 0;
    count(&root, &mut woven);
    assert_eq!(woven, 4);
    assert!(!root.environment_names.is_empty());
    for alias in root.environment_names.values() {
        assert!(alias.chars().all(|c| c.is_ascii_lowercase()));
    }
}

#[test]
fn custom_templates_are_accepted() {
    let templates = Templates::from_sources(&LuaFrontend, ENTRY, NESTED).unwrap();
    let mut root = LuaFrontend.load(PROGRAM, "custom").unwrap();
    assert_eq!(weave(&mut root, &templates, &mut StdRng::seed_from_u64(2)).unwrap(), 4);
    assert_eq!(
        root.environment_names.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["type"]
    );

    let has_crash = root
        .functions
        .iter()
        .any(|(_, child)| {
            child
                .constants
                .iter()
                .any(|(_, k)| k.tamper && k.value == ConstantValue::Crash)
        });
    assert!(has_crash);
    let helpers = root
        .functions
        .iter()
        .filter(|(_, child)| {
            child
                .instructions
                .iter()
                .any(|(_, instruction)| instruction.opcode == OpCode::NewStack)
        })
        .count();
    assert_eq!(helpers, 1);

    let expected: String = eval(PROGRAM).unwrap();
    let source = interpret(root, Settings::default(), 2).unwrap();
    assert_eq!(eval::<String>(&source).unwrap(), expected);
}

#[test]
fn unsupported_template_instructions_are_fatal() {
    let entry = "local S = __STATE\nlocal A = function() return __NEWSTACK end\nS[1] = A()\nreturn S";
    let templates = Templates::from_sources(&LuaFrontend, entry, NESTED).unwrap();
    let mut root = LuaFrontend.load(PROGRAM, "bad").unwrap();
    let err = weave(&mut root, &templates, &mut StdRng::seed_from_u64(3)).unwrap_err();
    assert!(
        matches!(err, Error::UnsupportedInstruction { ref site, .. } if site.pass == "AntiTamper"),
        "{err}"
    );
}
