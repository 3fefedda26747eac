//! Module for the `obfuscate` subcommand, which runs a Lua script through the full moonveil
//! pipeline.

use super::CliError;
use clap::Args;
use moonveil_core::read_source;
use moonveil_core::seed::Seed;
use moonveil_transforms::obfuscator::{ObfuscationConfig, obfuscate, print_obfuscation_analysis};
use std::error::Error;
use std::fs;

/// Arguments for the `obfuscate` subcommand.
#[derive(Args)]
pub struct ObfuscateArgs {
    /// Lua source file.
    pub input: String,
    /// Cryptographic seed for deterministic obfuscation (64 hex chars, optional 0x prefix)
    #[arg(long)]
    seed: Option<String>,
    /// Denser substitution, reaching into the anti-tamper prefix.
    #[arg(long)]
    enhanced_security: bool,
    /// Disable handler clones with permuted operands.
    #[arg(long)]
    no_dynamic_opcodes: bool,
    /// Hex payload instead of LZW + base-36.
    #[arg(long)]
    no_compression: bool,
    /// Comment line placed at the top of the output.
    #[arg(long, default_value = "")]
    watermark: String,
    /// Output file for the obfuscated script (default: stdout)
    #[arg(short, long)]
    output: Option<String>,
    /// Path to emit the build report as JSON (optional).
    #[arg(long)]
    emit: Option<String>,
}

/// Executes the `obfuscate` subcommand using the unified obfuscation pipeline.
impl super::Command for ObfuscateArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let ObfuscateArgs {
            input,
            seed,
            enhanced_security,
            no_dynamic_opcodes,
            no_compression,
            watermark,
            output,
            emit,
        } = self;

        // Step 1: Read input
        let source = read_source(&input).map_err(CliError::Core)?;

        // Step 2: Configure obfuscation
        let mut config = match seed {
            Some(seed_hex) => ObfuscationConfig::with_seed(Seed::from_hex(&seed_hex).map_err(CliError::Seed)?),
            None => ObfuscationConfig::default(),
        };
        config.settings.enhanced_security = enhanced_security;
        config.settings.dynamic_opcode_structure = !no_dynamic_opcodes;
        config.settings.extra_compression = !no_compression;
        config.settings.watermark = watermark;

        // Step 3: Run obfuscation pipeline
        let result = obfuscate(&source, &config).map_err(CliError::Transform)?;

        // Step 4: Write outputs
        if let Some(path) = emit.as_ref() {
            let mut report = result.clone();
            report.output = String::new();
            fs::write(path, serde_json::to_string_pretty(&report).map_err(CliError::Serialize)?)
                .map_err(CliError::File)?;
            println!("Wrote build report to {path}");
        }

        match output {
            Some(path) => {
                print_obfuscation_analysis(&result);
                fs::write(&path, &result.output).map_err(CliError::File)?;
                println!("Wrote obfuscated script to {path}");
            }
            // stdout carries only the script
            None => println!("{}", result.output),
        }
        Ok(())
    }
}
