use crate::Result;
use crate::Transform;
use crate::anti_tamper::AntiTamper;
use crate::control_flow::ControlFlow;
use crate::opcode_substitution::OpcodeSubstitution;
use crate::pass::{DefaultPass, Pass};
use crate::pool_shuffle::PoolShuffle;
use crate::substitution::Substitution;
use moonveil_core::frontend::Frontend;
use moonveil_core::seed::Seed;
use moonveil_core::{LuaFrontend, Settings};
use moonveil_vm::{BuildContext, allocate, emit, serialize};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for the obfuscation pipeline
#[derive(Debug, Clone)]
pub struct ObfuscationConfig {
    /// Cryptographic seed for deterministic obfuscation
    pub seed: Seed,
    pub settings: Settings,
    /// Rates of the source-level passes run over the generated interpreter
    pub source: moonveil_syntax::Options,
}

impl ObfuscationConfig {
    /// Create config with a specific seed
    pub fn with_seed(seed: Seed) -> Self {
        Self {
            seed,
            settings: Settings::default(),
            source: moonveil_syntax::Options::default(),
        }
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self::with_seed(Seed::generate())
    }
}

/// Result of the obfuscation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationResult {
    /// The obfuscated Lua script
    pub output: String,
    /// Seed of this build, hex with 0x prefix
    pub seed: String,
    /// Input size in bytes
    pub original_size: usize,
    /// Output size in bytes
    pub obfuscated_size: usize,
    /// Serialized chunk tree size in bytes, before masking and encoding
    pub payload_size: usize,
    /// Number of virtual opcode handlers in the interpreter
    pub handler_count: usize,
    /// Number of prototypes in the final chunk tree
    pub prototypes: usize,
    /// Instructions across all prototypes of the input
    pub original_instructions: usize,
    /// Instructions across all prototypes after every transform
    pub total_instructions: usize,
    /// Names of transforms that changed the chunk tree
    pub transforms_applied: Vec<String>,
}

/// Main obfuscation pipeline
pub fn obfuscate(source: &str, config: &ObfuscationConfig) -> Result<ObfuscationResult> {
    debug!("Starting obfuscation pipeline:");
    debug!("  Seed hash: {}", config.seed.hash_hex());
    debug!("  Settings: {:?}", config.settings);

    let mut rng = config.seed.create_deterministic_rng();

    // Step 1: compile and lift
    let mut root = LuaFrontend.load(source, "main")?;
    let original_instructions = root.total_instructions();
    debug!("  Input: {} bytes, {} instructions", source.len(), original_instructions);

    // Steps 2-6: bytecode transforms
    let passes: Vec<Box<dyn Transform>> = vec![
        Box::new(AntiTamper::new()?),
        Box::new(PoolShuffle),
        Box::new(Substitution::new(&config.settings)),
        Box::new(ControlFlow),
        Box::new(OpcodeSubstitution::new(&config.settings)),
    ];
    let applied = DefaultPass.run(&mut root, &passes, &mut rng)?;

    // Step 7: operands from references
    root.recompute_all();
    root.resolve_all()?;
    let total_instructions = root.total_instructions();
    let prototypes = count_prototypes(&root);

    // Step 8: virtual machine
    let mut ctx = BuildContext::new(root, config.settings.clone(), rng);
    allocate(&mut ctx)?;
    let bytes = serialize(&mut ctx)?;
    let interpreter = emit(&mut ctx, &bytes)?;
    debug!(
        "  Interpreter: {} handlers, {} payload bytes, {} characters",
        ctx.handlers.len(),
        bytes.len(),
        interpreter.len()
    );

    // Step 9: source layer and watermark
    let body = moonveil_syntax::obfuscate_source(&interpreter, &mut ctx.rng, &config.source)?;
    let output = watermark(&config.settings.watermark, body);

    Ok(ObfuscationResult {
        seed: config.seed.to_hex(),
        original_size: source.len(),
        obfuscated_size: output.len(),
        payload_size: bytes.len(),
        handler_count: ctx.handlers.len(),
        prototypes,
        original_instructions,
        total_instructions,
        transforms_applied: applied.into_iter().map(str::to_string).collect(),
        output,
    })
}

/// Prefixes `body` with the watermark as a single comment line.
fn watermark(mark: &str, body: String) -> String {
    let line: String = mark
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let line = line.trim();
    if line.is_empty() {
        body
    } else {
        format!("-- {line}\n{body}")
    }
}

fn count_prototypes(chunk: &moonveil_core::Chunk) -> usize {
    1 + chunk
        .functions
        .iter()
        .map(|(_, child)| count_prototypes(child))
        .sum::<usize>()
}

/// Prints a short summary of an obfuscation run
pub fn print_obfuscation_analysis(result: &ObfuscationResult) {
    println!("Transform Analysis:");
    println!(
        "Applying {} transforms: {:?}",
        result.transforms_applied.len(),
        result.transforms_applied
    );
    println!(
        "Instructions: {} → {} across {} prototypes",
        result.original_instructions, result.total_instructions, result.prototypes
    );
    println!("Handlers: {}", result.handler_count);
    println!("Payload: {} bytes", result.payload_size);
    println!(
        "Size change: {} → {} bytes ({:+.1}%)",
        result.original_size,
        result.obfuscated_size,
        100.0 * (result.obfuscated_size as f64 - result.original_size as f64)
            / result.original_size.max(1) as f64
    );
    println!();
}
