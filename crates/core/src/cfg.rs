//! Control flow graph view over a chunk's instruction list.
//!
//! The graph is a temporary lens: [`build_graph`] partitions the layout into basic blocks,
//! [`shuffle`] and [`shuffle_straight_line`] scramble the physical order, and [`reconstruct`]
//! writes a flat layout back into the chunk. Blocks hold instruction ids only, so every jump in
//! the chunk stays symbolic the whole time and the usual recompute/resolve pair fixes operands
//! afterwards.
//!
//! Layout guarantees:
//! - the root block (holding instruction 0) stays first;
//! - a block that may fall through is physically followed by its `next` block, which after
//!   [`shuffle`] is always a synthetic jump block forwarding to the original successor.

use crate::chunk::Chunk;
use crate::instruction::{InstrId, Instruction};
use crate::opcode::Control;
use crate::result::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;
use rand::{Rng, seq::SliceRandom};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Straight-line slice of the original layout.
    Body,
    /// Synthetic single-jump block inserted by [`shuffle`].
    Jump,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub instructions: Vec<InstrId>,
    /// Block that must physically follow this one.
    pub next: Option<NodeIndex>,
}

impl Block {
    pub fn head(&self) -> Option<InstrId> {
        self.instructions.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    Jump,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub graph: StableDiGraph<Block, EdgeKind>,
    pub root: NodeIndex,
    /// Physical block order.
    pub order: Vec<NodeIndex>,
}

impl Cfg {
    pub fn block(&self, node: NodeIndex) -> Option<&Block> {
        self.graph.node_weight(node)
    }

    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether `node` only leaves through fallthrough or not at all.
    pub fn is_straight_line(&self, node: NodeIndex) -> bool {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .all(|edge| *edge.weight() == EdgeKind::Fallthrough)
    }
}

/// Partitions the chunk's layout into basic blocks.
///
/// Leaders are instruction 0, every jump target and every instruction following a control
/// transfer.
pub fn build_graph(chunk: &Chunk) -> Result<Cfg> {
    let layout = chunk.instructions.ids().to_vec();
    if layout.is_empty() {
        return Err(Error::InvalidBlockStructure("chunk has no instructions".into()));
    }
    let index: HashMap<InstrId, usize> = layout.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut leaders = HashSet::from([0usize]);
    for (position, id) in layout.iter().enumerate() {
        let instruction = &chunk.instructions[*id];
        if let Some(target) = instruction.jump {
            let target = *index.get(&target).ok_or_else(|| {
                Error::InvalidBlockStructure(format!("jump at {position} leaves the chunk"))
            })?;
            leaders.insert(target);
        }
        if instruction.control() != Control::Next && position + 1 < layout.len() {
            leaders.insert(position + 1);
        }
    }
    let mut starts: Vec<usize> = leaders.into_iter().collect();
    starts.sort_unstable();

    let mut graph = StableDiGraph::new();
    let mut heads = HashMap::new();
    let mut order = Vec::with_capacity(starts.len());
    for (n, start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(layout.len());
        let node = graph.add_node(Block {
            kind: BlockKind::Body,
            instructions: layout[*start..end].to_vec(),
            next: None,
        });
        heads.insert(layout[*start], node);
        order.push(node);
    }

    for (n, node) in order.iter().enumerate() {
        let last = *graph[*node]
            .instructions
            .last()
            .ok_or_else(|| Error::InvalidBlockStructure("empty block".into()))?;
        let instruction = &chunk.instructions[last];
        let control = instruction.control();

        if matches!(control, Control::Next | Control::Branch) {
            let follower = *order.get(n + 1).ok_or_else(|| {
                Error::InvalidBlockStructure("last block falls off the chunk".into())
            })?;
            graph[*node].next = Some(follower);
            graph.add_edge(*node, follower, EdgeKind::Fallthrough);
        }
        if matches!(control, Control::Jump | Control::Branch) {
            let target = instruction
                .jump
                .and_then(|target| heads.get(&target).copied())
                .ok_or_else(|| Error::InvalidBlockStructure("jump target is not a block head".into()))?;
            graph.add_edge(*node, target, EdgeKind::Jump);
        }
    }

    debug!("built CFG with {} blocks for chunk #{}", order.len(), chunk.prototype_id);
    Ok(Cfg {
        graph,
        root: order[0],
        order,
    })
}

/// Randomly reorders every block except the root and forwards each fallthrough through a
/// fresh jump block.
pub fn shuffle<R: Rng + ?Sized>(cfg: &mut Cfg, chunk: &mut Chunk, rng: &mut R) -> Result<()> {
    let mut rest: Vec<NodeIndex> = cfg.order.iter().copied().filter(|n| *n != cfg.root).collect();
    rest.shuffle(rng);

    let mut order = Vec::with_capacity(cfg.order.len() * 2);
    for node in std::iter::once(cfg.root).chain(rest) {
        order.push(node);
        let Some(successor) = cfg.graph[node].next else {
            continue;
        };
        let head = cfg.graph[successor]
            .head()
            .ok_or_else(|| Error::InvalidBlockStructure("empty successor".into()))?;
        let jmp = chunk.instructions.alloc(Instruction::jmp(head));
        let jump_block = cfg.graph.add_node(Block {
            kind: BlockKind::Jump,
            instructions: vec![jmp],
            next: None,
        });

        if let Some(edge) = cfg.graph.find_edge(node, successor)
            && cfg.graph[edge] == EdgeKind::Fallthrough
        {
            cfg.graph.remove_edge(edge);
        }
        cfg.graph.add_edge(node, jump_block, EdgeKind::Fallthrough);
        cfg.graph.add_edge(jump_block, successor, EdgeKind::Jump);
        cfg.graph[node].next = Some(jump_block);
        order.push(jump_block);
    }

    debug!("shuffled {} blocks ({} after jump insertion)", cfg.order.len(), order.len());
    cfg.order = order;
    Ok(())
}

/// Permutes the instructions of a straight-line block, chaining them with explicit jumps so
/// execution order survives the new physical order.
///
/// Returns `false` when the block is not eligible (has jump edges, fewer than two
/// instructions, or a non-terminal tail without a successor).
pub fn shuffle_straight_line<R: Rng + ?Sized>(
    cfg: &mut Cfg,
    chunk: &mut Chunk,
    node: NodeIndex,
    rng: &mut R,
) -> Result<bool> {
    if !cfg.is_straight_line(node) {
        return Ok(false);
    }
    let block = &cfg.graph[node];
    if block.kind != BlockKind::Body || block.instructions.len() < 2 {
        return Ok(false);
    }
    let instructions = block.instructions.clone();
    let tail = instructions[instructions.len() - 1];
    let exit = match chunk.instructions[tail].control() {
        Control::Stop => None,
        Control::Next => match block.next.and_then(|next| cfg.graph[next].head()) {
            Some(head) => Some(head),
            None => return Ok(false),
        },
        Control::Jump | Control::Branch => return Ok(false),
    };

    let mut units: Vec<Vec<InstrId>> = Vec::with_capacity(instructions.len());
    for (n, id) in instructions.iter().enumerate() {
        let successor = instructions.get(n + 1).copied().or(exit);
        let mut unit = vec![*id];
        if let Some(successor) = successor {
            unit.push(chunk.instructions.alloc(Instruction::jmp(successor)));
        }
        units.push(unit);
    }
    units.shuffle(rng);

    let mut layout = Vec::with_capacity(instructions.len() * 2 + 1);
    if units[0][0] != instructions[0] {
        layout.push(chunk.instructions.alloc(Instruction::jmp(instructions[0])));
    }
    layout.extend(units.into_iter().flatten());
    cfg.graph[node].instructions = layout;
    Ok(true)
}

/// Flattens the graph back into the chunk's instruction layout.
///
/// The chunk's mappings are dirty afterwards.
pub fn reconstruct(cfg: &Cfg, chunk: &mut Chunk) -> Result<()> {
    for (n, node) in cfg.order.iter().enumerate() {
        if let Some(next) = cfg.graph[*node].next
            && cfg.order.get(n + 1) != Some(&next)
        {
            return Err(Error::InvalidBlockStructure(format!(
                "block {} is not followed by its fallthrough successor",
                node.index()
            )));
        }
    }
    let layout: Vec<InstrId> = cfg
        .order
        .iter()
        .flat_map(|node| cfg.graph[*node].instructions.iter().copied())
        .collect();
    chunk.instructions.set_order(layout);
    Ok(())
}
