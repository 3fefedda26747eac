//! Virtual machine back end: turns a finished chunk tree into a self-contained Lua script.
//!
//! [`allocator::allocate`] picks a handler for every instruction, [`serializer::serialize`]
//! encodes the tree, and [`emitter::emit`] wraps the encoded payload in the generated
//! interpreter.

pub mod allocator;
pub mod context;
pub mod emitter;
pub mod handlers;
pub mod payload;
pub mod serializer;
pub mod template;
pub mod uglify;

pub use allocator::{VirtualOpcode, allocate};
pub use context::BuildContext;
pub use emitter::emit;
pub use serializer::serialize;

use moonveil_core::OpCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] moonveil_core::Error),

    #[error("no handler template registered for {0}")]
    MissingHandler(OpCode),

    #[error("instruction {position} of chunk #{chunk} has no allocated handler")]
    UnallocatedInstruction { chunk: u32, position: usize },

    #[error("handler table is empty; allocate before emitting")]
    NoHandlers,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, Error>;
