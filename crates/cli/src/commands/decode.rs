//! Module for the `decode` subcommand, which compiles a script with the embedded Lua front end
//! and prints the lifted instruction listing.

use super::CliError;
use moonveil_core::LuaFrontend;
use moonveil_core::frontend::Frontend;
use moonveil_core::read_source;
use clap::Args;
use std::error::Error;

/// Arguments for the `decode` subcommand.
#[derive(Args)]
pub struct DecodeArgs {
    /// Lua source file.
    pub input: String,
}

impl super::Command for DecodeArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let source = read_source(&self.input).map_err(CliError::Core)?;
        let chunk = LuaFrontend.load(&source, &self.input).map_err(CliError::Core)?;
        print!("{}", chunk.listing());
        Ok(())
    }
}
