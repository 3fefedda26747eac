//! Index-addressed arena with an explicit order and a lazily rebuilt position cache.
//!
//! Instructions, constants and child functions all live in a [`Pool`]. Storage slots are
//! stable: an [`Id`] handed out once keeps addressing the same element for the lifetime of the
//! pool, no matter how the element is moved in the order. The order is the semantic one
//! (instruction layout, constant pool index, prototype index) and its positions are cached.
//!
//! Any structural edit marks the cache dirty. Asking for a position while dirty is an error,
//! never a stale answer: callers must [`Pool::recompute`] first.

use crate::result::{Error, Result};
use rand::{Rng, seq::SliceRandom};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed handle into a [`Pool`].
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u32,
            _marker: PhantomData,
        }
    }

    /// Raw storage slot, stable across reorders.
    pub fn slot(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

#[derive(Debug, Clone)]
pub struct Pool<T> {
    items: Vec<Option<T>>,
    order: Vec<Id<T>>,
    positions: Vec<Option<usize>>,
    dirty: bool,
    label: &'static str,
}

impl<T> Pool<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            items: Vec::new(),
            order: Vec::new(),
            positions: Vec::new(),
            dirty: false,
            label,
        }
    }

    /// Appends an element at the end of the order.
    pub fn push(&mut self, item: T) -> Id<T> {
        let id = self.alloc(item);
        self.order.push(id);
        self.dirty = true;
        id
    }

    /// Inserts an element at `position` in the order.
    pub fn insert(&mut self, position: usize, item: T) -> Id<T> {
        let id = self.alloc(item);
        let position = position.min(self.order.len());
        self.order.insert(position, id);
        self.dirty = true;
        id
    }

    /// Stores an element without placing it in the order.
    ///
    /// Detached elements are used while a caller assembles a new order wholesale (see
    /// [`Pool::set_order`]).
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len());
        self.items.push(Some(item));
        self.positions.push(None);
        id
    }

    /// Removes an element from storage and order.
    pub fn remove(&mut self, id: Id<T>) -> Option<T> {
        let item = self.items.get_mut(id.slot())?.take()?;
        self.order.retain(|other| *other != id);
        self.dirty = true;
        Some(item)
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.slot()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Ids in semantic order.
    pub fn ids(&self) -> &[Id<T>] {
        &self.order
    }

    /// Elements in semantic order.
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.get(*id).map(|item| (*id, item)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        self.get(id).is_some()
    }

    /// Replaces the order wholesale. Every id must be live; ids left out are dropped.
    pub fn set_order(&mut self, order: Vec<Id<T>>) {
        let keep: std::collections::HashSet<Id<T>> = order.iter().copied().collect();
        for slot in 0..self.items.len() {
            let id = Id::new(slot);
            if !keep.contains(&id) {
                self.items[slot] = None;
            }
        }
        self.order = order;
        self.dirty = true;
    }

    /// Randomly permutes the order.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.order.shuffle(rng);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuilds the position cache in one pass over the order.
    pub fn recompute(&mut self) {
        for position in self.positions.iter_mut() {
            *position = None;
        }
        for (position, id) in self.order.iter().enumerate() {
            self.positions[id.slot()] = Some(position);
        }
        self.dirty = false;
    }

    /// Cached position of `id`.
    ///
    /// Fails with [`Error::StaleMappings`] when the pool was edited since the last recompute,
    /// and returns `Ok(None)` for ids that are not in the order.
    pub fn position(&self, id: Id<T>) -> Result<Option<usize>> {
        if self.dirty {
            return Err(Error::StaleMappings(self.label));
        }
        Ok(self.positions.get(id.slot()).copied().flatten())
    }

    /// Linear lookup that ignores the cache. Use only while deliberately mid-edit.
    pub fn find(&self, id: Id<T>) -> Option<usize> {
        self.order.iter().position(|other| *other == id)
    }

    pub fn at(&self, position: usize) -> Option<Id<T>> {
        self.order.get(position).copied()
    }
}

impl<T> std::ops::Index<Id<T>> for Pool<T> {
    type Output = T;

    fn index(&self, id: Id<T>) -> &T {
        match self.get(id) {
            Some(item) => item,
            None => panic!("{} pool has no live element {id:?}", self.label),
        }
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Pool<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        let label = self.label;
        match self.get_mut(id) {
            Some(item) => item,
            None => panic!("{label} pool has no live element {id:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn positions_require_recompute() {
        let mut pool = Pool::new("test");
        let a = pool.push('a');
        assert!(matches!(pool.position(a), Err(Error::StaleMappings("test"))));
        pool.recompute();
        assert_eq!(pool.position(a).unwrap(), Some(0));
    }

    #[test]
    fn ids_survive_reordering() {
        let mut pool = Pool::new("test");
        let ids: Vec<_> = (0..16).map(|n| pool.push(n)).collect();
        pool.shuffle(&mut StdRng::seed_from_u64(7));
        pool.recompute();
        for (n, id) in ids.iter().enumerate() {
            let position = pool.position(*id).unwrap().unwrap();
            assert_eq!(pool[pool.at(position).unwrap()], n);
        }
    }

    #[test]
    fn removed_ids_have_no_position() {
        let mut pool = Pool::new("test");
        let a = pool.push(1);
        let b = pool.push(2);
        pool.remove(a);
        pool.recompute();
        assert_eq!(pool.position(a).unwrap(), None);
        assert_eq!(pool.position(b).unwrap(), Some(0));
        assert!(!pool.contains(a));
    }
}
