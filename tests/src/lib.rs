//! Shared helpers for the integration tests.

use color_eyre::eyre::eyre;
use moonveil_core::{Chunk, Settings};
use moonveil_vm::{BuildContext, allocate, emit, serialize};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Evaluates a Lua chunk in a fresh state.
pub fn eval<T: mlua::FromLuaMulti>(source: &str) -> color_eyre::Result<T> {
    let lua = mlua::Lua::new();
    lua.load(source).eval::<T>().map_err(|e| eyre!("lua error: {e}"))
}

/// Builds the interpreter for an already transformed chunk tree.
pub fn interpret(mut root: Chunk, settings: Settings, seed: u64) -> color_eyre::Result<String> {
    root.recompute_all();
    root.resolve_all()?;
    let mut ctx = BuildContext::new(root, settings, StdRng::seed_from_u64(seed));
    allocate(&mut ctx)?;
    let bytes = serialize(&mut ctx)?;
    Ok(emit(&mut ctx, &bytes)?)
}
