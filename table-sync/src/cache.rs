use std::collections::BTreeSet;
use std::mem;

use crate::row::Row;
use crate::state::LoadState;

/// Ids touched by cache mutations since the last flush, split by kind.
///
/// Kinds are kept consistent across a batch: a row inserted and then removed
/// before the flush is never reported, and a row removed and then inserted
/// again is reported as updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChanges<Id: Ord> {
    pub inserted: BTreeSet<Id>,
    pub updated: BTreeSet<Id>,
    pub removed: BTreeSet<Id>,
}

impl<Id: Ord + Clone> RowChanges<Id> {
    pub fn new() -> Self {
        Self { inserted: BTreeSet::new(), updated: BTreeSet::new(), removed: BTreeSet::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every affected id, ascending.
    pub fn affected(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .inserted
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn record_insert(&mut self, id: Id) {
        if self.removed.remove(&id) {
            self.updated.insert(id);
        } else {
            self.inserted.insert(id);
        }
    }

    fn record_update(&mut self, id: Id) {
        if !self.inserted.contains(&id) {
            self.updated.insert(id);
        }
    }

    fn record_remove(&mut self, id: Id) {
        if !self.inserted.remove(&id) {
            self.updated.remove(&id);
            self.removed.insert(id);
        }
    }
}

impl<Id: Ord + Clone> Default for RowChanges<Id> {
    fn default() -> Self {
        Self::new()
    }
}

/// Rows of one table scope, strictly ordered by id, each with exactly one
/// [`LoadState`].
pub struct RowCache<R: Row> {
    rows: Vec<R>,
    states: Vec<LoadState>,
    changes: RowChanges<R::Id>,
}

impl<R: Row> RowCache<R> {
    pub fn new() -> Self {
        Self { rows: Vec::new(), states: Vec::new(), changes: RowChanges::new() }
    }

    fn search(&self, id: &R::Id) -> Result<usize, usize> {
        self.rows.binary_search_by(|r| r.id().cmp(id))
    }

    pub fn get(&self, id: &R::Id) -> Option<(&R, LoadState)> {
        self.search(id).ok().map(|pos| (&self.rows[pos], self.states[pos]))
    }

    pub fn state(&self, id: &R::Id) -> Option<LoadState> {
        self.search(id).ok().map(|pos| self.states[pos])
    }

    pub fn contains(&self, id: &R::Id) -> bool {
        self.search(id).is_ok()
    }

    /// Index of the row in id order.
    pub fn position(&self, id: &R::Id) -> Option<usize> {
        self.search(id).ok()
    }

    /// Insert at the sorted position, or overwrite the row with the same id.
    /// Returns the previous row and state when overwriting.
    pub fn insert_or_update(&mut self, row: R, state: LoadState) -> Option<(R, LoadState)> {
        let id = row.id();
        match self.search(&id) {
            Ok(pos) => {
                let old_row = mem::replace(&mut self.rows[pos], row);
                let old_state = mem::replace(&mut self.states[pos], state);
                self.changes.record_update(id);
                Some((old_row, old_state))
            }
            Err(pos) => {
                self.rows.insert(pos, row);
                self.states.insert(pos, state);
                self.changes.record_insert(id);
                None
            }
        }
    }

    pub fn remove(&mut self, id: &R::Id) -> Option<(R, LoadState)> {
        let pos = self.search(id).ok()?;
        let row = self.rows.remove(pos);
        let state = self.states.remove(pos);
        self.changes.record_remove(id.clone());
        Some((row, state))
    }

    /// Change only the state tag. Returns the previous state.
    pub fn set_state(&mut self, id: &R::Id, state: LoadState) -> Option<LoadState> {
        let pos = self.search(id).ok()?;
        let old = mem::replace(&mut self.states[pos], state);
        if old != state {
            self.changes.record_update(id.clone());
        }
        Some(old)
    }

    /// Drop every row, reporting each as removed.
    pub fn clear(&mut self) {
        for row in self.rows.drain(..) {
            self.changes.record_remove(row.id());
        }
        self.states.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&R, LoadState)> {
        self.rows.iter().zip(self.states.iter().copied())
    }

    pub fn ids(&self) -> Vec<R::Id> {
        self.rows.iter().map(Row::id).collect()
    }

    pub fn last_id(&self) -> Option<R::Id> {
        self.rows.last().map(Row::id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Take the changes accumulated since the previous call.
    pub fn take_changes(&mut self) -> RowChanges<R::Id> {
        mem::take(&mut self.changes)
    }
}

impl<R: Row> Default for RowCache<R> {
    fn default() -> Self {
        Self::new()
    }
}
