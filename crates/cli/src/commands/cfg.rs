//! Module for the `cfg` subcommand, which builds the control flow graph of the root chunk and
//! renders it as a Graphviz .dot file.

use super::CliError;
use clap::Args;
use moonveil_core::cfg::{Cfg, EdgeKind, build_graph};
use moonveil_core::frontend::Frontend;
use moonveil_core::{Chunk, LuaFrontend, read_source};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use std::error::Error;
use std::fmt::Write as _;
use std::fs;

/// Arguments for the `cfg` subcommand.
#[derive(Args)]
pub struct CfgArgs {
    /// Lua source file.
    pub input: String,
    /// Output file for Graphviz .dot (default: stdout)
    #[arg(short, long)]
    output: Option<String>,
}

impl super::Command for CfgArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let source = read_source(&self.input).map_err(CliError::Core)?;
        let chunk = LuaFrontend.load(&source, &self.input).map_err(CliError::Core)?;
        let cfg = build_graph(&chunk).map_err(CliError::Core)?;

        let dot = generate_dot(&cfg, &chunk);
        if let Some(out_path) = self.output {
            fs::write(out_path, &dot).map_err(CliError::File)?;
        } else {
            println!("{dot}");
        }
        Ok(())
    }
}

/// Generates a Graphviz .dot representation of the CFG, one node per block labelled with its
/// instructions.
fn generate_dot(cfg: &Cfg, chunk: &Chunk) -> String {
    let mut dot = String::from("digraph CFG {\n  node [shape=box, fontname=monospace];\n");

    for node in &cfg.order {
        let Some(block) = cfg.block(*node) else {
            continue;
        };
        let mut label = String::new();
        for id in &block.instructions {
            if let Some(instruction) = chunk.instructions.get(*id) {
                let _ = write!(
                    label,
                    "{} {} {} {}\\l",
                    instruction.opcode.mnemonic(),
                    instruction.a,
                    instruction.b,
                    instruction.c
                );
            }
        }
        let _ = writeln!(dot, "  n{} [label=\"{}\"];", node.index(), label);
    }

    for edge in cfg.graph.edge_references() {
        let style = match edge.weight() {
            EdgeKind::Fallthrough => "solid",
            EdgeKind::Jump => "dashed",
        };
        let _ = writeln!(
            dot,
            "  n{} -> n{} [style={}];",
            edge.source().index(),
            edge.target().index(),
            style
        );
    }

    dot.push_str("}\n");
    dot
}
