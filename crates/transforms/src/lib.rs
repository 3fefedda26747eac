pub mod anti_tamper;
pub mod control_flow;
pub mod obfuscator;
pub mod opcode_substitution;
pub mod pass;
pub mod pool_shuffle;
pub mod substitution;

use moonveil_core::Chunk;
use rand::rngs::StdRng;
use std::fmt;
use thiserror::Error;

/// Where in a build a fatal transform error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSite {
    /// Prototype id of the chunk being transformed.
    pub chunk: u32,
    pub pass: &'static str,
    /// Layout position of the offending instruction, when there is one.
    pub instruction: Option<usize>,
}

impl BuildSite {
    pub fn new(chunk: &Chunk, pass: &'static str) -> Self {
        Self {
            chunk: chunk.prototype_id,
            pass,
            instruction: None,
        }
    }

    pub fn at(mut self, instruction: usize) -> Self {
        self.instruction = Some(instruction);
        self
    }
}

impl fmt::Display for BuildSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in chunk #{}", self.pass, self.chunk)?;
        if let Some(instruction) = self.instruction {
            write!(f, " at instruction {instruction}")?;
        }
        Ok(())
    }
}

/// Transform error type encompassing all transform module errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A compiled template uses a construct that cannot be relocated into another chunk.
    #[error("template contract violated ({site}): {reason}")]
    TemplateContractViolation { site: BuildSite, reason: String },

    /// A pass met an instruction it has no handling for.
    #[error("unsupported instruction {opcode} ({site})")]
    UnsupportedInstruction { site: BuildSite, opcode: String },

    /// A pass expected a structural pattern that is missing or ambiguous.
    #[error("structural assumption failed ({site}): {reason}")]
    StructuralAssumption { site: BuildSite, reason: String },

    #[error(transparent)]
    Core(#[from] moonveil_core::Error),

    #[error(transparent)]
    Vm(#[from] moonveil_vm::Error),

    #[error(transparent)]
    Syntax(#[from] moonveil_syntax::Error),
}

/// Transform result type
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for bytecode obfuscation transforms.
pub trait Transform: Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform to the chunk tree rooted at `root`, returning whether changes were made.
    fn apply(&self, root: &mut Chunk, rng: &mut StdRng) -> Result<bool>;
}

/// Visits `chunk` and every nested chunk, parents first.
pub(crate) fn each_chunk(
    chunk: &mut Chunk,
    visit: &mut dyn FnMut(&mut Chunk) -> Result<bool>,
) -> Result<bool> {
    let mut changed = visit(chunk)?;
    for id in chunk.functions.ids().to_vec() {
        changed |= each_chunk(&mut chunk.functions[id], visit)?;
    }
    Ok(changed)
}
