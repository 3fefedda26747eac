use crate::{Result, Transform, each_chunk};
use moonveil_core::{Chunk, ConstId};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

/// Shuffles the constant and child-function pools of every chunk.
///
/// Constants injected for anti-tamper keep their pool positions; every other constant is
/// permuted among the remaining positions.
pub struct PoolShuffle;

impl Transform for PoolShuffle {
    fn name(&self) -> &'static str {
        "PoolShuffle"
    }

    fn apply(&self, root: &mut Chunk, rng: &mut StdRng) -> Result<bool> {
        each_chunk(root, &mut |chunk| Ok(shuffle_pools(chunk, rng)))
    }
}

pub fn shuffle_pools<R: Rng + ?Sized>(chunk: &mut Chunk, rng: &mut R) -> bool {
    let order = chunk.constants.ids().to_vec();
    let mut free: Vec<ConstId> = order
        .iter()
        .copied()
        .filter(|id| !chunk.constants[*id].tamper)
        .collect();
    free.shuffle(rng);
    let mut free = free.into_iter();
    let shuffled: Vec<ConstId> = order
        .iter()
        .map(|id| {
            if chunk.constants[*id].tamper {
                *id
            } else {
                free.next().unwrap_or(*id)
            }
        })
        .collect();
    let constants = shuffled != order;
    if constants {
        chunk.constants.set_order(shuffled);
    }

    let functions = chunk.functions.len() > 1;
    if functions {
        chunk.functions.shuffle(rng);
    }
    if constants || functions {
        debug!(
            "chunk #{}: shuffled {} constants, {} functions",
            chunk.prototype_id,
            chunk.constants.len(),
            chunk.functions.len()
        );
    }
    constants || functions
}
