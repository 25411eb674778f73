use std::rc::Rc;

use serde_json::Value;

use crate::cache::{RowCache, RowChanges};
use crate::row::Row;
use crate::state::LoadState;

/// Observer of one table's row cache.
///
/// Projections are told which ids changed, never the values; they read values
/// back through the cache they are handed. They must not mutate the table.
pub trait Projection<R: Row> {
    fn rows_changed(&mut self, cache: &RowCache<R>, changes: &RowChanges<R::Id>);

    /// The remote copy of `id` changed. The table refreshes the row itself.
    fn row_stale(&mut self, _cache: &RowCache<R>, _id: &R::Id) {}
}

/// A computed column layered on a displayed row, typically derived from
/// another table.
pub trait VirtualField<R: Row> {
    fn role(&self) -> &str;

    /// The row this field belongs to was inserted or changed.
    fn row_changed(&mut self, row: &R, state: LoadState);

    /// Recompute from the field's own dependencies. Returns whether the value
    /// changed.
    fn refresh(&mut self) -> bool;

    fn get(&self, row: &R, state: LoadState) -> (Value, LoadState);
}

pub type VirtualFieldFactory<R> = Rc<dyn Fn() -> Vec<Box<dyn VirtualField<R>>>>;

type RowFilter<R> = Box<dyn Fn(&R, LoadState) -> bool>;

/// Structural change to a list projection, with inclusive position ranges.
/// Positions of each event are relative to the list after every earlier event
/// was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    Inserted { first: usize, last: usize },
    Removed { first: usize, last: usize },
    Changed { first: usize, last: usize },
}

/// Ordered list of row ids mirroring a table, optionally restricted to rows
/// passing a filter.
pub struct ListModel<R: Row> {
    ids: Vec<R::Id>,
    filter: Option<RowFilter<R>>,
    factory: Option<VirtualFieldFactory<R>>,
    fields: Vec<Vec<Box<dyn VirtualField<R>>>>,
    events: Vec<ModelEvent>,
}

impl<R: Row> ListModel<R> {
    pub fn new() -> Self {
        Self { ids: Vec::new(), filter: None, factory: None, fields: Vec::new(), events: Vec::new() }
    }

    pub fn filtered(filter: impl Fn(&R, LoadState) -> bool + 'static) -> Self {
        let mut model = Self::new();
        model.filter = Some(Box::new(filter));
        model
    }

    pub fn with_virtual_fields(mut self, factory: VirtualFieldFactory<R>) -> Self {
        self.factory = Some(factory);
        self
    }

    fn accepts(&self, row: &R, state: LoadState) -> bool {
        self.filter.as_ref().map_or(true, |f| f(row, state))
    }

    fn new_fields(&self, row: &R, state: LoadState) -> Vec<Box<dyn VirtualField<R>>> {
        let mut fields = self.factory.as_ref().map(|f| f()).unwrap_or_default();
        for field in &mut fields {
            field.row_changed(row, state);
        }
        fields
    }

    /// Fill the list from the cache's current contents. Returns the ids of
    /// displayed rows found stale.
    pub fn populate(&mut self, cache: &RowCache<R>) -> Vec<R::Id> {
        let mut stale = Vec::new();
        let start = self.ids.len();
        for (row, state) in cache.iter() {
            if !self.accepts(row, state) {
                continue;
            }
            if state == LoadState::Stale {
                stale.push(row.id());
            }
            let fields = self.new_fields(row, state);
            self.ids.push(row.id());
            self.fields.push(fields);
        }
        if self.ids.len() > start {
            self.events.push(ModelEvent::Inserted { first: start, last: self.ids.len() - 1 });
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[R::Id] {
        &self.ids
    }

    pub fn id_at(&self, position: usize) -> Option<&R::Id> {
        self.ids.get(position)
    }

    pub fn position(&self, id: &R::Id) -> Option<usize> {
        self.ids.binary_search(id).ok()
    }

    /// Row and state displayed at `position`, read from `cache`.
    pub fn row_at<'c>(&self, cache: &'c RowCache<R>, position: usize) -> Option<(&'c R, LoadState)> {
        self.ids.get(position).and_then(|id| cache.get(id))
    }

    pub fn virtual_value(
        &self,
        cache: &RowCache<R>,
        position: usize,
        role: &str,
    ) -> Option<(Value, LoadState)> {
        let (row, state) = self.row_at(cache, position)?;
        let field = self.fields.get(position)?.iter().find(|f| f.role() == role)?;
        Some(field.get(row, state))
    }

    /// Let every virtual field recompute; rows whose fields changed are
    /// reported as changed.
    pub fn refresh_virtual_fields(&mut self) {
        let mut changed = Vec::new();
        for (position, fields) in self.fields.iter_mut().enumerate() {
            let mut any = false;
            for field in fields.iter_mut() {
                any |= field.refresh();
            }
            if any {
                changed.push(position);
            }
        }
        for position in changed {
            self.record(ModelEvent::Changed { first: position, last: position });
        }
    }

    pub fn take_events(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.events)
    }

    fn record(&mut self, event: ModelEvent) {
        use ModelEvent::*;
        if let Some(previous) = self.events.last_mut() {
            match (previous, event) {
                (Inserted { last, .. }, Inserted { first, last: new_last }) if first == *last + 1 => {
                    *last = new_last;
                    return;
                }
                // successive removals at one position collapse into a range
                (Removed { first, last }, Removed { first: at, .. }) if at == *first => {
                    *last += 1;
                    return;
                }
                (Changed { first: from, last }, Changed { first, last: new_last })
                    if first >= *from && new_last <= *last =>
                {
                    return;
                }
                (Changed { last, .. }, Changed { first, last: new_last }) if first == *last + 1 => {
                    *last = new_last;
                    return;
                }
                _ => {}
            }
        }
        self.events.push(event);
    }
}

impl<R: Row> Default for ListModel<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Row> Projection<R> for ListModel<R> {
    /// Merge the sorted affected ids against the sorted shadow list in one
    /// pass.
    fn rows_changed(&mut self, cache: &RowCache<R>, changes: &RowChanges<R::Id>) {
        let affected = changes.affected();
        if affected.is_empty() {
            return;
        }

        let old_ids = std::mem::take(&mut self.ids);
        let old_fields = std::mem::take(&mut self.fields);
        let mut ids = Vec::with_capacity(old_ids.len() + affected.len());
        let mut fields = Vec::with_capacity(ids.capacity());
        let mut old = old_ids.into_iter().zip(old_fields).peekable();

        for id in affected {
            while let Some((shown, _)) = old.peek() {
                if *shown >= id {
                    break;
                }
                if let Some((shown, f)) = old.next() {
                    ids.push(shown);
                    fields.push(f);
                }
            }

            let displayed = matches!(old.peek(), Some((shown, _)) if *shown == id);
            let wanted = cache.get(&id).filter(|(row, state)| self.accepts(row, *state));
            let at = ids.len();

            match (displayed, wanted) {
                (true, Some((row, state))) => {
                    if let Some((shown, mut f)) = old.next() {
                        for field in &mut f {
                            field.row_changed(row, state);
                        }
                        ids.push(shown);
                        fields.push(f);
                    }
                    self.record(ModelEvent::Changed { first: at, last: at });
                }
                (true, None) => {
                    old.next();
                    self.record(ModelEvent::Removed { first: at, last: at });
                }
                (false, Some((row, state))) => {
                    fields.push(self.new_fields(row, state));
                    ids.push(id);
                    self.record(ModelEvent::Inserted { first: at, last: at });
                }
                (false, None) => {}
            }
        }

        for (shown, f) in old {
            ids.push(shown);
            fields.push(f);
        }
        self.ids = ids;
        self.fields = fields;
    }

    fn row_stale(&mut self, _cache: &RowCache<R>, id: &R::Id) {
        if let Some(at) = self.position(id) {
            self.record(ModelEvent::Changed { first: at, last: at });
        }
    }
}
