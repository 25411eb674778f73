use crate::row::Row;
use crate::state::LoadState;

/// What [`BackupLedger::for_each_mut`] should do with the entry just visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Pre-edit snapshots of rows, ordered by id.
///
/// The first snapshot for an id wins: saving again while one exists does
/// nothing, so a chain of edits always reverts to the value before the first.
/// A `DraftAdd` snapshot stands for "no prior row".
pub struct BackupLedger<R: Row> {
    rows: Vec<R>,
    states: Vec<LoadState>,
}

impl<R: Row> BackupLedger<R> {
    pub fn new() -> Self {
        Self { rows: Vec::new(), states: Vec::new() }
    }

    fn search(&self, id: &R::Id) -> Result<usize, usize> {
        self.rows.binary_search_by(|r| r.id().cmp(id))
    }

    /// Returns whether a snapshot was recorded.
    pub fn save(&mut self, row: &R, state: LoadState) -> bool {
        match self.search(&row.id()) {
            Ok(_) => false,
            Err(pos) => {
                self.rows.insert(pos, row.clone());
                self.states.insert(pos, state);
                true
            }
        }
    }

    pub fn get(&self, id: &R::Id) -> Option<(&R, LoadState)> {
        self.search(id).ok().map(|pos| (&self.rows[pos], self.states[pos]))
    }

    pub fn contains(&self, id: &R::Id) -> bool {
        self.search(id).is_ok()
    }

    pub fn remove(&mut self, id: &R::Id) -> Option<(R, LoadState)> {
        let pos = self.search(id).ok()?;
        Some((self.rows.remove(pos), self.states.remove(pos)))
    }

    /// Visit every snapshot in id order; the callback decides whether the
    /// entry stays.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&R, LoadState) -> Visit,
    {
        let mut i = 0;
        while i < self.rows.len() {
            match f(&self.rows[i], self.states[i]) {
                Visit::Keep => i += 1,
                Visit::Remove => {
                    self.rows.remove(i);
                    self.states.remove(i);
                }
            }
        }
    }

    pub fn ids(&self) -> Vec<R::Id> {
        self.rows.iter().map(Row::id).collect()
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.states.clear();
    }
}

impl<R: Row> Default for BackupLedger<R> {
    fn default() -> Self {
        Self::new()
    }
}
