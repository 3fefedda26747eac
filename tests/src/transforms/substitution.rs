use moonveil_core::frontend::Frontend;
use moonveil_core::{LuaFrontend, Settings};
use moonveil_tests::{eval, init_tracing, interpret};
use moonveil_transforms::Transform;
use moonveil_transforms::anti_tamper::AntiTamper;
use moonveil_transforms::control_flow::ControlFlow;
use moonveil_transforms::opcode_substitution::OpcodeSubstitution;
use moonveil_transforms::pass::{DefaultPass, Pass};
use moonveil_transforms::pool_shuffle::PoolShuffle;
use moonveil_transforms::substitution::{Substitution, eligible, region_start};
use rand::SeedableRng;
use rand::rngs::StdRng;

const PROGRAM: &str = r##"
    local function sum(...)
        local total = 0
        for i = 1, select("#", ...) do
            total = total + (select(i, ...))
        end
        return total
    end
    local t = setmetatable({}, { __index = function(_, k) return k * k end })
    local parts = {}
    for i = 1, 6 do
        local a, b = i, i + 1
        a, b = b, a
        parts[#parts + 1] = t[a] - b
    end
    local s = 0
    local k = 1
    repeat
        s = s + parts[k]
        k = k + 1
    until k > #parts
    return sum(s, 1, 2, 3) .. ":" .. table.concat(parts, ",")
"##;

fn transforms(settings: &Settings) -> Vec<Box<dyn Transform>> {
    vec![
        Box::new(AntiTamper::new().unwrap()),
        Box::new(PoolShuffle),
        Box::new(Substitution::new(settings)),
        Box::new(ControlFlow),
        Box::new(OpcodeSubstitution::new(settings)),
    ]
}

#[test]
fn full_transform_stack_preserves_behaviour() {
    init_tracing();
    let expected: String = eval(PROGRAM).unwrap();
    let mut configs = Vec::new();
    for enhanced_security in [false, true] {
        for dynamic_opcode_structure in [false, true] {
            configs.push(Settings {
                enhanced_security,
                dynamic_opcode_structure,
                ..Settings::default()
            });
        }
    }

    for settings in configs {
        for seed in 0..5 {
            let mut root = LuaFrontend.load(PROGRAM, "stack").unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let applied = DefaultPass
                .run(&mut root, &transforms(&settings), &mut rng)
                .unwrap();
            assert!(applied.contains(&"AntiTamper"));
            assert!(applied.contains(&"ControlFlow"));

            let source = interpret(root, settings.clone(), seed).unwrap();
            let actual: String = eval(&source).unwrap();
            assert_eq!(actual, expected, "seed {seed} settings {settings:?}");
        }
    }
}

#[test]
fn prefix_is_protected_unless_enhanced() {
    let mut root = LuaFrontend.load(PROGRAM, "prefix").unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    AntiTamper::new().unwrap().apply(&mut root, &mut rng).unwrap();

    let woven = region_start(&root, &Settings::default());
    assert!(woven > 0);
    let enhanced = Settings {
        enhanced_security: true,
        ..Settings::default()
    };
    assert_eq!(region_start(&root, &enhanced), 0);

    Substitution::new(&Settings::default())
        .apply(&mut root, &mut rng)
        .unwrap();
    let prefix = &root.instructions.ids()[..woven];
    for id in prefix {
        let instruction = &root.instructions[*id];
        assert!(instruction.obfuscation.is_none());
    }
}

#[test]
fn substituted_instructions_are_not_eligible_again() {
    let settings = Settings {
        enhanced_security: true,
        ..Settings::default()
    };
    let mut root = LuaFrontend.load(PROGRAM, "again").unwrap();
    let mut rng = StdRng::seed_from_u64(6);
    Substitution::new(&settings).apply(&mut root, &mut rng).unwrap();

    let marked: Vec<_> = root
        .instructions
        .iter()
        .filter(|(_, instruction)| instruction.obfuscation.is_some())
        .collect();
    assert!(!marked.is_empty());
    assert!(marked.iter().all(|(_, instruction)| !eligible(instruction)));
}
