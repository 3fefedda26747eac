mod commands;

use clap::Parser;
use commands::{Cmd, Command};

/// Moonveil CLI
///
/// Moonveil is a Lua 5.1 obfuscator that compiles a script, hardens its bytecode and wraps it
/// in a generated, per-build virtual machine. It can also print the lifted bytecode and the
/// control flow graph of a script.
#[derive(Parser)]
#[command(name = "moonveil")]
#[command(about = "Moonveil: Lua 5.1 obfuscator")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

/// Runs the Moonveil CLI with the provided arguments.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli.command.execute()
}
