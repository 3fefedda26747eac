//! Source-to-bytecode front ends.

use crate::chunk::Chunk;
use crate::lua51;
use crate::result::Result;

/// Compiles Lua source text into a Lua 5.1 binary chunk.
pub trait Frontend {
    fn compile(&self, source: &str, chunk_name: &str) -> Result<Vec<u8>>;

    /// Compiles and lifts in one step.
    fn load(&self, source: &str, chunk_name: &str) -> Result<Chunk> {
        lua51::decode(&self.compile(source, chunk_name)?)
    }
}

/// Front end backed by an embedded Lua 5.1 state.
#[cfg(feature = "mlua")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaFrontend;

#[cfg(feature = "mlua")]
impl Frontend for LuaFrontend {
    fn compile(&self, source: &str, chunk_name: &str) -> Result<Vec<u8>> {
        use crate::result::Error;

        let lua = mlua::Lua::new();
        let function = lua
            .load(source)
            .set_name(format!("={chunk_name}"))
            .into_function()
            .map_err(|e| Error::Frontend(e.to_string()))?;
        Ok(function.dump(true))
    }
}
