use color_eyre::Result;
use moonveil_core::frontend::Frontend;
use moonveil_core::seed::Seed;
use moonveil_core::{LuaFrontend, Settings};
use moonveil_tests::{eval, init_tracing};
use moonveil_transforms::obfuscator::{ObfuscationConfig, ObfuscationResult, obfuscate};
use moonveil_vm::handlers::HandlerKey;
use moonveil_vm::{BuildContext, allocate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashSet;

const SEED_A: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
const SEED_B: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

const PROGRAM: &str = r#"
    local Account = {}
    Account.__index = Account

    function Account.new(owner, balance)
        return setmetatable({ owner = owner, balance = balance or 0, log = {} }, Account)
    end

    function Account:deposit(amount)
        if amount <= 0 then error("invalid amount") end
        self.balance = self.balance + amount
        self.log[#self.log + 1] = "+" .. amount
    end

    function Account:withdraw(amount)
        if amount > self.balance then
            return false, "insufficient funds"
        end
        self.balance = self.balance - amount
        self.log[#self.log + 1] = "-" .. amount
        return true
    end

    local acct = Account.new("ada", 100)
    acct:deposit(50)
    local ok, why = acct:withdraw(500)
    acct:withdraw(30)
    local failed = not pcall(acct.deposit, acct, -1)
    return string.format("%s %d %s %s %s", acct.owner, acct.balance, tostring(ok), why,
        table.concat(acct.log, "")) .. (failed and " guarded" or "")
"#;

fn config(seed: &str) -> ObfuscationConfig {
    ObfuscationConfig::with_seed(Seed::from_hex(seed).unwrap())
}

fn run(config: &ObfuscationConfig, source: &str) -> Result<(ObfuscationResult, String)> {
    let result = obfuscate(source, config)?;
    let value: String = eval(&result.output)?;
    Ok((result, value))
}

#[test]
fn arithmetic_survives_obfuscation() -> Result<()> {
    init_tracing();
    let result = obfuscate("return 1 + 2", &config(SEED_A))?;
    let value: f64 = eval(&result.output)?;
    assert_eq!(value, 3.0);
    Ok(())
}

#[test]
fn program_behaviour_is_preserved() -> Result<()> {
    init_tracing();
    let expected: String = eval(PROGRAM)?;
    assert_eq!(expected, "ada 120 false insufficient funds +50-30 guarded");

    for seed in [SEED_A, SEED_B] {
        let (result, actual) = run(&config(seed), PROGRAM)?;
        assert_eq!(actual, expected);
        assert_eq!(result.seed, seed);
        assert!(result.total_instructions > result.original_instructions);
        assert!(result.handler_count > 0);
        assert!(result.transforms_applied.iter().any(|name| name == "AntiTamper"));
    }
    Ok(())
}

#[test]
fn every_setting_combination_runs() -> Result<()> {
    let expected: String = eval(PROGRAM)?;
    for mask in 0..8u8 {
        let mut config = config(SEED_B);
        config.settings = Settings {
            enhanced_security: mask & 1 != 0,
            dynamic_opcode_structure: mask & 2 != 0,
            extra_compression: mask & 4 != 0,
            watermark: String::new(),
        };
        let (_, actual) = run(&config, PROGRAM)?;
        assert_eq!(actual, expected, "settings {:?}", config.settings);
    }
    Ok(())
}

#[test]
fn same_seed_reproduces_the_build() -> Result<()> {
    let a = obfuscate(PROGRAM, &config(SEED_A))?;
    let b = obfuscate(PROGRAM, &config(SEED_A))?;
    let c = obfuscate(PROGRAM, &config(SEED_B))?;
    assert_eq!(a.output, b.output);
    assert_ne!(a.output, c.output);
    Ok(())
}

#[test]
fn seeds_change_length_and_behaviour_is_kept() -> Result<()> {
    let expected: String = eval(PROGRAM)?;
    let mut lengths = HashSet::new();
    let mut outputs = HashSet::new();
    for nibble in 1..=6u8 {
        let seed = format!("0x{}", format!("{nibble:x}").repeat(64));
        let (result, actual) = run(&config(&seed), PROGRAM)?;
        assert_eq!(actual, expected, "seed {seed}");
        lengths.insert(result.output.len());
        outputs.insert(result.output);
    }
    assert_eq!(outputs.len(), 6);
    assert!(lengths.len() > 1, "every seed produced {lengths:?}");
    Ok(())
}

fn dispatch_order(seed: u64) -> Result<Vec<HandlerKey>> {
    let mut root = LuaFrontend.load(PROGRAM, "e2e")?;
    root.recompute_all();
    root.resolve_all()?;
    let mut ctx = BuildContext::new(root, Settings::default(), StdRng::seed_from_u64(seed));
    allocate(&mut ctx)?;
    Ok(ctx.handlers.iter().map(|handler| handler.key).collect())
}

#[test]
fn seeds_change_dispatch_ids() -> Result<()> {
    let orders = (1..=4).map(dispatch_order).collect::<Result<Vec<_>>>()?;
    let mut reference = orders[0].clone();
    reference.sort();
    assert!(reference.len() > 8);

    for order in &orders[1..] {
        let mut keys = order.clone();
        keys.sort();
        assert_eq!(keys, reference);
        assert_ne!(order, &orders[0]);
    }
    Ok(())
}

#[test]
fn watermark_leads_the_output() -> Result<()> {
    let mut config = config(SEED_A);
    config.settings.watermark = "built for\nacme".into();
    let (result, _) = run(&config, "return 'ok'")?;
    assert!(result.output.starts_with("-- built for acme\n"));
    Ok(())
}

#[test]
fn report_serializes() -> Result<()> {
    let result = obfuscate("local x = 4 return x * x", &config(SEED_B))?;
    let json = serde_json::to_value(&result)?;
    assert_eq!(json["seed"], SEED_B);
    assert!(json["prototypes"].as_u64().unwrap_or(0) >= 1);
    assert_eq!(json["obfuscated_size"].as_u64(), Some(result.output.len() as u64));
    Ok(())
}

#[test]
fn invalid_source_is_an_error() {
    assert!(obfuscate("local function (", &config(SEED_A)).is_err());
}
