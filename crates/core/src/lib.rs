pub mod cfg;
pub mod chunk;
pub mod constant;
pub mod dispatch;
pub mod frontend;
pub mod instruction;
pub mod lua51;
pub mod opcode;
pub mod pool;
pub mod result;
pub mod seed;
pub mod settings;

pub use chunk::{Capture, Chunk};
pub use constant::{Constant, ConstantValue};
pub use instruction::{ChunkId, ConstId, InstrId, Instruction};
pub use opcode::{Control, Field, OpCode, Operand};
pub use result::{Error, Result};
pub use settings::Settings;

#[cfg(feature = "mlua")]
pub use frontend::LuaFrontend;

/// Reads a Lua source file into memory.
pub fn read_source(path: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::FileRead {
        path: path.to_string(),
        source,
    })
}
