use crate::Result;
use crate::{Transform, each_chunk};
use moonveil_core::Chunk;
use moonveil_core::cfg::{self, BlockKind};
use rand::Rng;
use rand::rngs::StdRng;
use tracing::debug;

/// Share of straight-line blocks whose instructions are permuted.
const LINE_RATE: f64 = 0.5;

/// Scrambles the physical layout of every chunk: block order first, then the instruction
/// order inside some straight-line blocks.
pub struct ControlFlow;

impl Transform for ControlFlow {
    fn name(&self) -> &'static str {
        "ControlFlow"
    }

    fn apply(&self, root: &mut Chunk, rng: &mut StdRng) -> Result<bool> {
        each_chunk(root, &mut |chunk| shuffle_chunk(chunk, rng))
    }
}

/// Returns `false` for chunks with a single block, which are left as they are.
pub fn shuffle_chunk<R: Rng + ?Sized>(chunk: &mut Chunk, rng: &mut R) -> Result<bool> {
    let mut graph = cfg::build_graph(chunk)?;
    if graph.block_count() <= 1 {
        debug!("chunk #{}: not enough blocks to shuffle", chunk.prototype_id);
        return Ok(false);
    }

    cfg::shuffle(&mut graph, chunk, rng)?;

    let bodies: Vec<_> = graph
        .order
        .iter()
        .copied()
        .filter(|node| graph.graph[*node].kind == BlockKind::Body)
        .collect();
    let mut lines = 0;
    for node in bodies {
        if rng.random_bool(LINE_RATE) && cfg::shuffle_straight_line(&mut graph, chunk, node, rng)? {
            lines += 1;
        }
    }

    cfg::reconstruct(&graph, chunk)?;
    debug!(
        "chunk #{}: {} blocks reordered, {} straight-line blocks permuted",
        chunk.prototype_id,
        graph.order.len(),
        lines
    );
    Ok(true)
}
