use crate::Result;
use crate::Transform;
use moonveil_core::Chunk;
use rand::rngs::StdRng;
use tracing::info;

/// Trait for running a sequence of obfuscation transforms on a chunk tree.
pub trait Pass {
    /// Returns the names of the transforms that changed the tree.
    fn run(&self, root: &mut Chunk, passes: &[Box<dyn Transform>], rng: &mut StdRng) -> Result<Vec<&'static str>>;
}

/// Default implementation of the Pass trait.
///
/// Each transform works on a copy of the tree; the copy replaces the original only when the
/// transform succeeds and reports a change.
pub struct DefaultPass;

impl Pass for DefaultPass {
    fn run(&self, root: &mut Chunk, passes: &[Box<dyn Transform>], rng: &mut StdRng) -> Result<Vec<&'static str>> {
        let mut applied = Vec::with_capacity(passes.len());
        for pass in passes {
            let before = root.total_instructions();
            let mut snapshot = root.clone();

            let mutated = pass.apply(&mut snapshot, rng)?;
            if !mutated {
                continue;
            }

            let after = snapshot.total_instructions();
            info!("{:>14} +{} instructions", pass.name(), after.saturating_sub(before));
            *root = snapshot;
            applied.push(pass.name());
        }
        Ok(applied)
    }
}
