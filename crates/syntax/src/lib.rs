//! Lua 5.1 source toolkit and the source-level obfuscation layer.
//!
//! The generated interpreter is run through [`obfuscate_source`] before it is returned:
//! lex, parse, [`rewrite`], [`flatten`], [`numbers`], print. Blocks opened with a
//! `--@protect` comment are passed through untouched by every stage.

pub mod ast;
pub mod flatten;
pub mod lexer;
pub mod names;
pub mod numbers;
pub mod parser;
pub mod printer;
pub mod rewrite;

pub use lexer::{LexError, lex};
pub use names::Names;
pub use parser::{ParseError, Parser};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Core(#[from] moonveil_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rates and thresholds of the source passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Minimum number of top-level statements before a function body is flattened.
    pub flatten_threshold: usize,
    pub rewrite_rate: f64,
    pub loop_rate: f64,
    pub wrap_rate: f64,
    pub pad_rate: f64,
    pub number_rate: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flatten_threshold: 4,
            rewrite_rate: 0.5,
            loop_rate: 0.5,
            wrap_rate: 0.15,
            pad_rate: 0.5,
            number_rate: 0.25,
        }
    }
}

pub fn parse(source: &str) -> Result<ast::Block> {
    Ok(Parser::new(lex(source)?).parse_chunk()?)
}

/// Runs every source pass over `source` and prints the result.
pub fn obfuscate_source<R: Rng + ?Sized>(source: &str, rng: &mut R, options: &Options) -> Result<String> {
    let tokens = lex(source)?;
    let mut names = Names::from_tokens(&tokens);
    let mut block = Parser::new(tokens).parse_chunk()?;

    rewrite::rewrite(&mut block, rng, &mut names, options);
    let flattened = flatten::flatten(&mut block, rng, &mut names, options)?;
    let numbers = numbers::obscure(&mut block, rng, &mut names, options)?;
    debug!("source layer: {flattened} bodies flattened, {numbers} literals obscured");

    Ok(printer::print(&block))
}
