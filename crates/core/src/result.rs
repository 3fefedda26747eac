//! Core results and error types

use thiserror::Error;

/// Core error type encompassing all core module errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The bytecode blob ended before a complete value could be read.
    #[error("unexpected end of bytecode at offset {0}")]
    UnexpectedEof(usize),

    /// The bytecode header does not describe a Lua 5.1 chunk this decoder understands.
    #[error("invalid bytecode header: {0}")]
    InvalidHeader(String),

    /// A raw instruction word carries an opcode outside the Lua 5.1 set.
    #[error("unknown opcode {opcode} at word {pc}")]
    UnknownOpcode {
        /// The raw 6-bit opcode.
        opcode: u8,
        /// Word index inside the function's code vector.
        pc: usize,
    },

    /// A constant tag in the constant table is not one Lua 5.1 emits.
    #[error("invalid constant tag {0}")]
    InvalidConstantTag(u8),

    /// A decoded reference points outside its pool.
    #[error("reference out of range: {kind} index {index} (pool size {size})")]
    ReferenceOutOfRange {
        /// What kind of pool was indexed.
        kind: &'static str,
        /// The offending index.
        index: i64,
        /// Size of the pool at decode time.
        size: usize,
    },

    /// Positions were queried while the pool had unrecomputed structural edits.
    #[error("stale mappings: {0} pool edited without recompute")]
    StaleMappings(&'static str),

    /// An instruction refers to an id that is no longer part of its chunk.
    #[error("dangling {kind} reference from instruction {instruction}")]
    DanglingReference {
        /// Which reference slot dangled.
        kind: &'static str,
        /// Position of the referencing instruction.
        instruction: usize,
    },

    /// Block structure is malformed or inconsistent.
    #[error("invalid block structure: {0}")]
    InvalidBlockStructure(String),

    /// A dispatch tree was requested for an empty or ambiguous key set.
    #[error("invalid dispatch keys: {0}")]
    InvalidDispatchKeys(String),

    /// The Lua front end rejected the source text.
    #[error("front end compile failed: {0}")]
    Frontend(String),

    /// Invalid hexadecimal in seed.
    #[error("invalid hexadecimal in seed")]
    InvalidSeedHex,

    /// Invalid seed length.
    #[error("invalid seed length: expected 64 hex chars, got {0}")]
    InvalidSeedLength(usize),

    /// Failed to read file at the specified path.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// The path to the file that could not be read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Core result type
pub type Result<T> = std::result::Result<T, Error>;
