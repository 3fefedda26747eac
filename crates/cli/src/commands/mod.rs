use clap::Subcommand;
use std::error::Error;

pub mod cfg;
pub mod decode;
pub mod obfuscate;

use thiserror::Error;

/// Errors that can occur while running a subcommand.
#[derive(Debug, Error)]
pub enum CliError {
    /// The seed could not be parsed.
    #[error("invalid seed: {0}")]
    Seed(#[source] moonveil_core::Error),
    /// File read/write error.
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    /// Pipeline failure.
    #[error("obfuscation failed: {0}")]
    Transform(#[from] moonveil_transforms::Error),
    /// Front end or IR failure.
    #[error(transparent)]
    Core(#[from] moonveil_core::Error),
    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// CLI subcommands for Moonveil.
#[derive(Subcommand)]
pub enum Cmd {
    /// Obfuscate a Lua script.
    Obfuscate(obfuscate::ObfuscateArgs),
    /// Compile a script and print the lifted bytecode of every prototype.
    Decode(decode::DecodeArgs),
    /// Write the root chunk's CFG as Graphviz to stdout or a file.
    Cfg(cfg::CfgArgs),
}

/// Trait for executing CLI subcommands.
pub trait Command {
    /// Executes the subcommand.
    fn execute(self) -> Result<(), Box<dyn Error>>;
}

impl Command for Cmd {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        match self {
            Cmd::Obfuscate(args) => args.execute(),
            Cmd::Decode(args) => args.execute(),
            Cmd::Cfg(args) => args.execute(),
        }
    }
}
