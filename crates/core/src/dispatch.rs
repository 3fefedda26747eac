//! Randomized binary-search dispatch trees.
//!
//! Maps integer keys to bodies through a balanced tree of comparisons. The same builder backs
//! the interpreter's opcode switch, statement flattening and numeric literal chains, so all of
//! them share one set of guarantees: every key reaches exactly its own leaf, and a fixed RNG
//! state reproduces the tree exactly.
//!
//! Shapes:
//!
//! ```text
//! 1 entry    body
//! 2 entries  if <one of 8 equivalent guards> then body else body end
//! n entries  sort, split at the midpoint, guard with `<=`/`>=` on the split key, recurse
//! ```

use crate::result::{Error, Result};
use rand::Rng;
use std::collections::HashSet;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "~=",
        }
    }

    fn holds(self, left: i64, right: i64) -> bool {
        match self {
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Eq => left == right,
            Comparison::Ne => left != right,
        }
    }
}

/// `subject <op> key`, or `key <op> subject` when `key_first` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub op: Comparison,
    pub key: i64,
    pub key_first: bool,
}

impl Guard {
    fn new(op: Comparison, key: i64, key_first: bool) -> Self {
        Self { op, key, key_first }
    }

    pub fn test(&self, subject: i64) -> bool {
        if self.key_first {
            self.op.holds(self.key, subject)
        } else {
            self.op.holds(subject, self.key)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchNode<T> {
    Leaf {
        key: i64,
        body: T,
    },
    Branch {
        guard: Guard,
        then: Box<DispatchNode<T>>,
        otherwise: Box<DispatchNode<T>>,
    },
}

/// Builds a dispatch tree over `entries`.
///
/// Fails on an empty entry list or duplicate keys.
pub fn build<T, R: Rng + ?Sized>(mut entries: Vec<(i64, T)>, rng: &mut R) -> Result<DispatchNode<T>> {
    if entries.is_empty() {
        return Err(Error::InvalidDispatchKeys("no entries".into()));
    }
    let mut seen = HashSet::new();
    for (key, _) in &entries {
        if !seen.insert(*key) {
            return Err(Error::InvalidDispatchKeys(format!("duplicate key {key}")));
        }
    }
    entries.sort_by_key(|(key, _)| *key);
    Ok(split(entries, rng))
}

fn split<T, R: Rng + ?Sized>(mut entries: Vec<(i64, T)>, rng: &mut R) -> DispatchNode<T> {
    match entries.len() {
        1 => {
            let (key, body) = entries.remove(0);
            DispatchNode::Leaf { key, body }
        }
        2 => {
            let (k2, e2) = entries.remove(1);
            let (k1, e1) = entries.remove(0);
            let low = DispatchNode::Leaf { key: k1, body: e1 };
            let high = DispatchNode::Leaf { key: k2, body: e2 };
            let (guard, low_first) = match rng.random_range(0..8) {
                0 => (Guard::new(Comparison::Gt, k1, false), false),
                1 => (Guard::new(Comparison::Le, k1, false), true),
                2 => (Guard::new(Comparison::Lt, k1, true), false),
                3 => (Guard::new(Comparison::Ge, k1, true), true),
                4 => (Guard::new(Comparison::Eq, k1, false), true),
                5 => (Guard::new(Comparison::Eq, k2, true), false),
                6 => (Guard::new(Comparison::Ne, k1, false), false),
                _ => (Guard::new(Comparison::Ne, k2, true), true),
            };
            branch(guard, low, high, low_first)
        }
        len => {
            let right = entries.split_off(len / 2);
            let left = entries;
            let left_last = left[left.len() - 1].0;
            let right_first = right[0].0;
            let key_first = rng.random_bool(0.5);
            let test_left = rng.random_bool(0.5);

            let low = split(left, rng);
            let high = split(right, rng);
            if test_left {
                let op = if key_first { Comparison::Ge } else { Comparison::Le };
                branch(Guard::new(op, left_last, key_first), low, high, true)
            } else {
                let op = if key_first { Comparison::Le } else { Comparison::Ge };
                branch(Guard::new(op, right_first, key_first), low, high, false)
            }
        }
    }
}

fn branch<T>(guard: Guard, low: DispatchNode<T>, high: DispatchNode<T>, low_first: bool) -> DispatchNode<T> {
    let (then, otherwise) = if low_first { (low, high) } else { (high, low) };
    DispatchNode::Branch {
        guard,
        then: Box::new(then),
        otherwise: Box::new(otherwise),
    }
}

impl<T> DispatchNode<T> {
    /// Body selected for `subject`, or `None` when the walk ends on another key's leaf.
    pub fn eval(&self, subject: i64) -> Option<&T> {
        let mut node = self;
        loop {
            match node {
                DispatchNode::Leaf { key, body } => {
                    return (*key == subject).then_some(body);
                }
                DispatchNode::Branch {
                    guard,
                    then,
                    otherwise,
                } => {
                    node = if guard.test(subject) { then } else { otherwise };
                }
            }
        }
    }

    /// Every leaf in tree order.
    pub fn leaves(&self) -> Vec<(i64, &T)> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<(i64, &'a T)>) {
        match self {
            DispatchNode::Leaf { key, body } => out.push((*key, body)),
            DispatchNode::Branch {
                then, otherwise, ..
            } => {
                then.collect_leaves(out);
                otherwise.collect_leaves(out);
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            DispatchNode::Leaf { .. } => 0,
            DispatchNode::Branch {
                then, otherwise, ..
            } => 1 + then.depth().max(otherwise.depth()),
        }
    }

    /// Renders the tree as Lua source, with `leaf` producing each body.
    pub fn render(&self, subject: &str, leaf: &mut impl FnMut(i64, &T) -> String) -> String {
        let mut out = String::new();
        self.render_into(subject, leaf, &mut out);
        out
    }

    fn render_into(&self, subject: &str, leaf: &mut impl FnMut(i64, &T) -> String, out: &mut String) {
        match self {
            DispatchNode::Leaf { key, body } => out.push_str(&leaf(*key, body)),
            DispatchNode::Branch {
                guard,
                then,
                otherwise,
            } => {
                let condition = if guard.key_first {
                    format!("{} {} {}", guard.key, guard.op.symbol(), subject)
                } else {
                    format!("{} {} {}", subject, guard.op.symbol(), guard.key)
                };
                let _ = writeln!(out, "if {condition} then");
                then.render_into(subject, leaf, out);
                out.push_str("\nelse\n");
                otherwise.render_into(subject, leaf, out);
                out.push_str("\nend");
            }
        }
    }
}
