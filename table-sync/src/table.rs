use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{self, GetTableRows};
use crate::backup::{BackupLedger, Visit};
use crate::cache::RowCache;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::journal::{EntryKind, JournalEntry};
use crate::merge::{resolve_incoming, resolve_removal, MergeDecision, MergeReport, RemovalDecision};
use crate::name;
use crate::projection::{ListModel, Projection};
use crate::row::{self, FieldMap, Row, RowId};
use crate::state::LoadState;

/// How long a single-row refresh counts as in flight.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(7);

/// Notification about the fate of a local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum EditEvent<R: Row> {
    PendingEditSettled { before: R, after: R },
    DraftInvalidated { id: R::Id },
    PendingAddSettled { draft_id: R::Id, submitted: FieldMap, row: R },
    PendingDeleteSettled { row: R },
    PendingEditsChanged(bool),
}

/// What a queued query was for, carried back with its reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    /// A page of rows. `remaining` is `None` for an unbounded load.
    Rows { remaining: Option<usize> },
    /// Refresh of the row with this key.
    Single(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub fetch: Fetch,
    pub request: GetTableRows,
}

#[derive(Debug, Clone)]
struct LocalAdd<Id> {
    draft_id: Id,
    fields: FieldMap,
}

/// Local mirror of one remote table scope with optimistic edits.
///
/// The table performs no I/O. Queries it wants sent accumulate in an outbox
/// drained by [`Table::take_queries`]; replies come back through
/// [`Table::apply_response`]. Edit notifications accumulate likewise and are
/// drained by [`Table::take_events`].
pub struct Table<R: Row> {
    scope: u64,
    scope_name: String,
    label: String,
    config: SyncConfig,
    cache: RowCache<R>,
    backups: BackupLedger<R>,
    local_adds: Vec<LocalAdd<R::Id>>,
    pending_edits: bool,
    loading: BTreeMap<R::Id, Instant>,
    queries: Vec<TableQuery>,
    events: Vec<EditEvent<R>>,
    projections: Vec<Weak<RefCell<dyn Projection<R>>>>,
}

impl<R: Row> Table<R> {
    /// A table whose scope is a number, sent to the node in decimal.
    pub fn new(scope: u64, config: &SyncConfig) -> Self {
        Self::with_scope(scope, scope.to_string(), config)
    }

    /// A table whose scope is an account name such as `global`.
    pub fn named(scope: &str, config: &SyncConfig) -> Self {
        Self::with_scope(name::string_to_u64(scope), scope.to_string(), config)
    }

    fn with_scope(scope: u64, scope_name: String, config: &SyncConfig) -> Self {
        Self {
            scope,
            label: format!("{}[{}]", R::TABLE, scope_name),
            scope_name,
            config: config.clone(),
            cache: RowCache::new(),
            backups: BackupLedger::new(),
            local_adds: Vec::new(),
            pending_edits: false,
            loading: BTreeMap::new(),
            queries: Vec::new(),
            events: Vec::new(),
            projections: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn cache(&self) -> &RowCache<R> {
        &self.cache
    }

    pub fn backups(&self) -> &BackupLedger<R> {
        &self.backups
    }

    pub fn get(&self, id: &R::Id) -> Option<(&R, LoadState)> {
        self.cache.get(id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn has_pending_edits(&self) -> bool {
        self.pending_edits
    }

    pub fn take_queries(&mut self) -> Vec<TableQuery> {
        std::mem::take(&mut self.queries)
    }

    pub fn take_events(&mut self) -> Vec<EditEvent<R>> {
        std::mem::take(&mut self.events)
    }

    // --- projections ---

    /// A list projection over every row.
    pub fn all_rows(&mut self) -> Rc<RefCell<ListModel<R>>> {
        self.project(ListModel::new())
    }

    /// Populate `model` from the cache and keep it updated. The first live
    /// projection triggers a full refresh; otherwise stale rows it shows are
    /// refreshed.
    pub fn project(&mut self, mut model: ListModel<R>) -> Rc<RefCell<ListModel<R>>> {
        let first = self.live_projections().is_empty();
        let stale = model.populate(&self.cache);
        let model = Rc::new(RefCell::new(model));
        let handle: Rc<RefCell<dyn Projection<R>>> = model.clone();
        self.subscribe(&handle);
        if first {
            self.full_refresh();
        } else {
            for id in stale {
                self.refresh_row(&id);
            }
        }
        model
    }

    /// Register an observer. The table keeps only a weak handle.
    pub fn subscribe(&mut self, projection: &Rc<RefCell<dyn Projection<R>>>) {
        self.projections.push(Rc::downgrade(projection));
    }

    fn live_projections(&mut self) -> Vec<Rc<RefCell<dyn Projection<R>>>> {
        self.projections.retain(|p| p.strong_count() > 0);
        self.projections.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify(&mut self) {
        let changes = self.cache.take_changes();
        if changes.is_empty() {
            return;
        }
        for projection in self.live_projections() {
            projection.borrow_mut().rows_changed(&self.cache, &changes);
        }
    }

    // --- reads ---

    pub fn find_row_if(&self, pred: impl Fn(&R) -> bool) -> Option<&R> {
        self.cache.iter().map(|(row, _)| row).find(|&row| pred(row))
    }

    pub fn local_rows(&self) -> impl Iterator<Item = (&R, LoadState)> + '_ {
        self.cache.iter()
    }

    /// Flat field map of a row plus its `loadState`.
    pub fn get_row_fields(&self, id: &R::Id) -> Option<FieldMap> {
        let (row, state) = self.cache.get(id)?;
        let mut fields = row::to_fields(row);
        fields.insert("loadState".to_string(), serde_json::to_value(state).unwrap_or_default());
        Some(fields)
    }

    /// Read a row, refreshing it when missing or stale. A missing row reads
    /// as `Loading`.
    pub fn fetch_row(&mut self, id: &R::Id) -> (Option<R>, LoadState) {
        match self.cache.get(id).map(|(row, state)| (row.clone(), state)) {
            Some((row, state)) => {
                if state == LoadState::Stale {
                    self.refresh_row(id);
                }
                (Some(row), state)
            }
            None => {
                self.refresh_row(id);
                (None, LoadState::Loading)
            }
        }
    }

    // --- refresh ---

    fn request(&self, limit: u32) -> GetTableRows {
        GetTableRows::new(&self.config.contract, R::TABLE, &self.scope_name, limit)
    }

    pub fn full_refresh(&mut self) {
        debug!("{}: full refresh", self.label);
        let request = self.request(self.config.page_limit);
        self.queries.push(TableQuery { fetch: Fetch::Rows { remaining: None }, request });
    }

    /// Ask for one row, unless a request for it went out less than
    /// [`REFRESH_TIMEOUT`] ago.
    pub fn refresh_row(&mut self, id: &R::Id) {
        let now = Instant::now();
        if let Some(since) = self.loading.get(id) {
            if now.duration_since(*since) < REFRESH_TIMEOUT {
                debug!("{}: row {} already loading", self.label, id);
                return;
            }
        }
        self.loading.insert(id.clone(), now);
        let key = id.lower_bound();
        let request = self.request(1).from(key.clone());
        self.queries.push(TableQuery { fetch: Fetch::Single(key), request });
    }

    /// Mirror a different scope and reload.
    ///
    /// Draft and pending adds move along with the table and settle against
    /// the new scope's rows as they load. Every other row belongs to the old
    /// scope and is dropped; a local edit on such a row is invalidated.
    pub fn update_scope(&mut self, scope: u64) {
        if scope == self.scope {
            return;
        }
        info!("{}: changing scope to {}", self.label, scope);
        self.scope = scope;
        self.scope_name = scope.to_string();
        self.label = format!("{}[{}]", R::TABLE, self.scope_name);

        let stale: Vec<R::Id> = self.cache.iter().filter(|(_, s)| !s.is_add()).map(|(r, _)| r.id()).collect();
        for id in &stale {
            self.cache.remove(id);
        }
        let mut invalidated = Vec::new();
        self.backups.for_each_mut(|backup, state| {
            if state.is_add() {
                return Visit::Keep;
            }
            invalidated.push(backup.id());
            Visit::Remove
        });
        for id in invalidated {
            warn!("{}: discarding edit of row {} left behind in the old scope", self.label, id);
            self.events.push(EditEvent::DraftInvalidated { id });
        }
        if self.pending_edits && self.backups.is_empty() {
            self.pending_edits = false;
            self.events.push(EditEvent::PendingEditsChanged(false));
        }
        self.loading.clear();
        self.queries.clear();
        self.notify();
        self.full_refresh();
    }

    /// Fold a rows reply into the table and queue its continuation.
    pub fn apply_response(&mut self, query: &TableQuery, reply: &Value) -> Result<MergeReport> {
        if query.request.scope != self.scope_name {
            debug!("{}: dropping reply for scope {}", self.label, query.request.scope);
            return Ok(MergeReport::default());
        }

        let single = match &query.fetch {
            Fetch::Single(key) => serde_json::from_value::<R::Id>(key.clone()).ok(),
            Fetch::Rows { .. } => None,
        };
        if let Some(id) = &single {
            self.loading.remove(id);
        }

        let page = api::parse_rows(reply).ok_or_else(|| {
            warn!("{}: response to request for rows not sensible: {}", self.label, reply);
            Error::Malformed(format!("{} rows reply", self.label))
        })?;
        let mut rows = Vec::with_capacity(page.rows.len());
        for raw in &page.rows {
            let decoded = row::decode::<R>(raw).map_err(|e| {
                warn!("{}: {}", self.label, e);
                e
            })?;
            if !decoded.unknown.is_empty() {
                debug!("{}: unused fields {:?} in row", self.label, decoded.unknown);
            }
            rows.push(decoded.row);
        }

        if let Some(next) = page.next_key {
            let remaining = match query.fetch {
                Fetch::Rows { remaining } => remaining,
                Fetch::Single(_) => Some(1),
            };
            match remaining {
                None => {
                    let request = self.request(self.config.page_limit).from(next);
                    self.queries.push(TableQuery { fetch: Fetch::Rows { remaining: None }, request });
                }
                Some(wanted) if rows.len() < wanted => {
                    let left = wanted - rows.len();
                    let request = self.request(left as u32).from(next);
                    self.queries.push(TableQuery { fetch: Fetch::Rows { remaining: Some(left) }, request });
                }
                Some(_) => {}
            }
        }

        rows.sort_by(|a, b| a.id().cmp(&b.id()));
        let found = single.as_ref().map(|id| rows.iter().any(|r| &r.id() == id));
        let report = self.merge_batch(rows);
        if let (Some(id), Some(false)) = (&single, found) {
            if self.cache.state(id) == Some(LoadState::Loading) {
                debug!("{}: row {} no longer exists", self.label, id);
                self.cache.remove(id);
            }
        }
        self.notify();
        Ok(report)
    }

    // --- reconciliation ---

    /// Reconcile authoritative rows with the cache and any local edits.
    pub fn merge_rows(&mut self, rows: Vec<R>) -> MergeReport {
        let report = self.merge_batch(rows);
        self.notify();
        report
    }

    fn merge_batch(&mut self, rows: Vec<R>) -> MergeReport {
        let mut report = MergeReport::default();
        for row in rows {
            self.merge_row(row, &mut report);
        }
        if report.total_changes() > 0 {
            info!(
                "{}: {} rows inserted, {} updated, {} edits settled, {} invalidated",
                self.label, report.inserted, report.updated, report.settled, report.invalidated
            );
        }
        report
    }

    fn merge_row(&mut self, row: R, report: &mut MergeReport) {
        let id = row.id();
        if id.is_draft_range() {
            warn!("{}: remote row {} lies in the draft id range", self.label, id);
        }
        self.loading.remove(&id);

        let cached = self.cache.get(&id).map(|(r, s)| (r.clone(), s));
        let decision = resolve_incoming(cached.as_ref().map(|(_, s)| *s));
        match (decision, cached) {
            (MergeDecision::Insert, _) => {
                self.cache.insert_or_update(row.clone(), LoadState::Loaded);
                report.inserted += 1;
                if self.check_pending_insertion(&row) {
                    report.settled += 1;
                }
            }
            (MergeDecision::Fill, cached) => {
                let was_pending_add = matches!(cached, Some((_, LoadState::PendingAdd)));
                self.cache.insert_or_update(row.clone(), LoadState::Loaded);
                report.updated += 1;
                if self.check_pending_insertion(&row) {
                    report.settled += 1;
                }
                if was_pending_add && self.backups.contains(&id) {
                    warn!("{}: pending add {} confirmed without matching its submitted fields", self.label, id);
                    let submitted = self.take_local_add(&id).unwrap_or_default();
                    self.events.push(EditEvent::PendingAddSettled { draft_id: id.clone(), submitted, row });
                    self.drop_backup(&id);
                    report.settled += 1;
                }
            }
            (MergeDecision::Overwrite, _) => {
                self.cache.insert_or_update(row, LoadState::Loaded);
                report.updated += 1;
            }
            (MergeDecision::Invalidate, Some((_, state))) => {
                warn!("{}: remote changed row {} while it was {}, discarding local edit", self.label, id, state);
                if state.is_add() {
                    self.take_local_add(&id);
                }
                self.cache.insert_or_update(row, LoadState::Loaded);
                self.events.push(EditEvent::DraftInvalidated { id: id.clone() });
                self.drop_backup(&id);
                report.updated += 1;
                report.invalidated += 1;
            }
            (MergeDecision::Settle, Some((before, _))) => {
                if before != row {
                    warn!(
                        "{}: pending edit of row {} settled with mismatch: submitted {:?}, remote {:?}",
                        self.label, id, before, row
                    );
                }
                self.cache.insert_or_update(row.clone(), LoadState::Loaded);
                self.events.push(EditEvent::PendingEditSettled { before, after: row });
                self.drop_backup(&id);
                report.updated += 1;
                report.settled += 1;
            }
            (MergeDecision::Invalidate | MergeDecision::Settle, None) => {}
        }
    }

    /// Match a freshly loaded row against the submitted adds. Returns whether
    /// an add settled.
    fn check_pending_insertion(&mut self, row: &R) -> bool {
        if !self.pending_edits || self.local_adds.is_empty() {
            return false;
        }
        let matches: Vec<usize> = self
            .local_adds
            .iter()
            .enumerate()
            .filter(|(_, add)| row::matches_fields(row, &add.fields))
            .map(|(i, _)| i)
            .collect();
        let Some(&first) = matches.first() else {
            return false;
        };
        if matches.len() > 1 {
            warn!("{}: row {} matches {} pending adds, settling the first", self.label, row.id(), matches.len());
        }

        let add = self.local_adds.remove(first);
        if add.draft_id != row.id() {
            self.cache.remove(&add.draft_id);
            self.loading.remove(&add.draft_id);
        }
        info!("{}: pending add {} confirmed as row {}", self.label, add.draft_id, row.id());
        self.events.push(EditEvent::PendingAddSettled {
            draft_id: add.draft_id.clone(),
            submitted: add.fields,
            row: row.clone(),
        });
        self.drop_backup(&add.draft_id);
        true
    }

    fn take_local_add(&mut self, id: &R::Id) -> Option<FieldMap> {
        let pos = self.local_adds.iter().position(|add| &add.draft_id == id)?;
        Some(self.local_adds.remove(pos).fields)
    }

    fn drop_backup(&mut self, id: &R::Id) {
        if self.backups.remove(id).is_some() && self.pending_edits && self.backups.is_empty() {
            self.pending_edits = false;
            info!("{}: all pending edits settled", self.label);
            self.events.push(EditEvent::PendingEditsChanged(false));
        }
    }

    // --- journal ---

    /// Apply the journal entries addressed to this table and scope.
    pub fn process_journal(&mut self, entries: &[JournalEntry]) {
        let scope = self.scope;
        for entry in entries.iter().filter(|e| e.touches(R::TABLE, scope)) {
            let id = R::Id::from_journal_key(entry.key);
            match entry.kind {
                EntryKind::Delete => {
                    info!("{}: deleting row {} as per journal", self.label, id);
                    self.remove_row(&id);
                }
                EntryKind::Modify => {
                    info!("{}: marking row {} stale as per journal", self.label, id);
                    self.mark_stale(&id);
                }
                EntryKind::Add => {
                    info!("{}: loading new row {} as per journal", self.label, id);
                    self.get_new(&id);
                }
            }
        }
    }

    /// The remote deleted a row.
    pub fn remove_row(&mut self, id: &R::Id) {
        self.loading.remove(id);
        let Some((row, state)) = self.cache.remove(id) else {
            debug!("{}: deleted row {} was not cached", self.label, id);
            return;
        };
        match resolve_removal(state) {
            RemovalDecision::Plain => {}
            RemovalDecision::SettleDelete => {
                info!("{}: pending delete of row {} confirmed", self.label, id);
                self.events.push(EditEvent::PendingDeleteSettled { row });
                self.drop_backup(id);
            }
            RemovalDecision::Invalidate => {
                warn!("{}: remote deleted row {} while it was {}", self.label, id, state);
                if state.is_add() {
                    self.take_local_add(id);
                }
                self.events.push(EditEvent::DraftInvalidated { id: id.clone() });
                self.drop_backup(id);
            }
        }
        self.notify();
    }

    /// The remote modified a row; its cached value is outdated.
    pub fn mark_stale(&mut self, id: &R::Id) {
        let Some(state) = self.cache.state(id) else {
            debug!("{}: modified row {} is not cached", self.label, id);
            return;
        };
        if state.is_pending() {
            self.refresh_row(id);
            return;
        }
        if state.is_draft() {
            warn!("{}: remote modified row {} while it was {}, discarding draft", self.label, id, state);
            if state.is_add() {
                self.take_local_add(id);
            }
            match self.backups.remove(id) {
                Some((backup, prior)) if !prior.is_add() => {
                    self.cache.insert_or_update(backup, prior);
                }
                _ => {
                    let mut placeholder = R::default();
                    placeholder.set_id(id.clone());
                    self.cache.insert_or_update(placeholder, LoadState::Loading);
                }
            }
            self.events.push(EditEvent::DraftInvalidated { id: id.clone() });
        }
        if self.cache.state(id) != Some(LoadState::Loading) {
            self.cache.set_state(id, LoadState::Stale);
        }
        self.notify();
        for projection in self.live_projections() {
            projection.borrow_mut().row_stale(&self.cache, id);
        }
        self.refresh_row(id);
    }

    /// The remote added a row.
    pub fn get_new(&mut self, id: &R::Id) {
        match self.cache.state(id) {
            Some(LoadState::PendingAdd) => {}
            Some(state) => warn!("{}: journal added row {} already cached as {}", self.label, id, state),
            None => {
                let mut placeholder = R::default();
                placeholder.set_id(id.clone());
                self.cache.insert_or_update(placeholder, LoadState::Loading);
                self.notify();
            }
        }
        self.refresh_row(id);
    }

    // --- local edits ---

    fn check_no_pending(&self) -> Result<()> {
        if self.pending_edits {
            return Err(Error::EditsPending { table: self.label.clone() });
        }
        Ok(())
    }

    pub fn draft_add(&mut self) -> AddBuilder<'_, R> {
        AddBuilder { table: self, fields: FieldMap::new() }
    }

    pub fn draft_edit(&mut self, id: R::Id) -> EditBuilder<'_, R> {
        EditBuilder { table: self, id, changes: FieldMap::new() }
    }

    /// Insert a locally drafted row. Numeric ids are assigned from the draft
    /// range; string ids must be supplied and must not exist yet.
    pub fn draft_add_fields(&mut self, fields: FieldMap) -> Result<R::Id> {
        self.check_no_pending()?;
        let decoded = row::apply_fields(&R::default(), &fields).map_err(|e| {
            warn!("{}: {}", self.label, e);
            e
        })?;
        if !decoded.unknown.is_empty() {
            warn!("{}: ignoring unknown fields {:?} in draft add", self.label, decoded.unknown);
        }
        let mut new_row = decoded.row;
        let unset = R::default().id();

        let id = if R::Id::ASSIGNS_DRAFT_IDS {
            if new_row.id() != unset {
                warn!("{}: draft add specifies its own id {}", self.label, new_row.id());
                return Err(Error::DraftIdSpecified { table: self.label.clone(), id: new_row.id().to_string() });
            }
            let last = self.cache.last_id();
            let Some(draft_id) = R::Id::next_draft_id(last.as_ref()) else {
                warn!("{}: no draft id left after {:?}", self.label, last);
                return Err(Error::DraftIdsExhausted { table: self.label.clone() });
            };
            new_row.set_id(draft_id.clone());
            draft_id
        } else {
            let id = new_row.id();
            if id == unset {
                warn!("{}: draft add does not name its id", self.label);
                return Err(Error::Decode { table: self.label.clone(), reason: "draft add needs an id".into() });
            }
            if self.cache.contains(&id) {
                warn!("{}: draft add collides with row {}", self.label, id);
                return Err(Error::IdCollision { table: self.label.clone(), id: id.to_string() });
            }
            id
        };

        let generated = generated_id_fields::<R>();
        let submitted: FieldMap = fields
            .into_iter()
            .filter(|(k, _)| !decoded.unknown.contains(k) && !generated.contains(k))
            .collect();
        info!("{}: drafted new row {}", self.label, id);
        self.cache.insert_or_update(new_row.clone(), LoadState::DraftAdd);
        self.backups.save(&new_row, LoadState::DraftAdd);
        self.local_adds.push(LocalAdd { draft_id: id.clone(), fields: submitted });
        self.notify();
        Ok(id)
    }

    pub fn draft_edit_fields(&mut self, id: &R::Id, changes: FieldMap) -> Result<()> {
        self.check_no_pending()?;
        let Some((current, state)) = self.cache.get(id).map(|(r, s)| (r.clone(), s)) else {
            warn!("{}: cannot edit row {}: not found", self.label, id);
            return Err(Error::RowNotFound { table: self.label.clone(), id: id.to_string() });
        };
        if state == LoadState::DraftDelete {
            warn!("{}: cannot edit row {}: it is draft deleted", self.label, id);
            return Err(Error::DraftDeleted { table: self.label.clone(), id: id.to_string() });
        }
        let decoded = row::apply_fields(&current, &changes).map_err(|e| {
            warn!("{}: {}", self.label, e);
            e
        })?;
        if decoded.row.id() != *id {
            warn!("{}: edit would change the id of row {}", self.label, id);
            return Err(Error::IdChanged { table: self.label.clone(), id: id.to_string() });
        }
        if !decoded.unknown.is_empty() {
            warn!("{}: ignoring unknown fields {:?} in edit of row {}", self.label, decoded.unknown, id);
        }

        if state == LoadState::DraftAdd {
            let generated = generated_id_fields::<R>();
            if let Some(add) = self.local_adds.iter_mut().find(|add| &add.draft_id == id) {
                for (key, value) in changes {
                    if !decoded.unknown.contains(&key) && !generated.contains(&key) {
                        add.fields.insert(key, value);
                    }
                }
            }
            self.cache.insert_or_update(decoded.row, LoadState::DraftAdd);
        } else {
            self.backups.save(&current, state);
            self.cache.insert_or_update(decoded.row, LoadState::DraftEdit);
        }
        self.notify();
        Ok(())
    }

    pub fn draft_delete(&mut self, id: &R::Id) -> Result<()> {
        self.check_no_pending()?;
        let Some((current, state)) = self.cache.get(id).map(|(r, s)| (r.clone(), s)) else {
            warn!("{}: cannot delete row {}: not found", self.label, id);
            return Err(Error::RowNotFound { table: self.label.clone(), id: id.to_string() });
        };
        match state {
            LoadState::DraftDelete => return Ok(()),
            LoadState::DraftAdd => {
                self.cache.remove(id);
                self.backups.remove(id);
                self.take_local_add(id);
            }
            _ => {
                self.backups.save(&current, state);
                self.cache.set_state(id, LoadState::DraftDelete);
            }
        }
        self.notify();
        Ok(())
    }

    /// Submit every draft: each moves to its pending state.
    pub fn mark_edits_pending(&mut self) -> Result<()> {
        self.check_no_pending()?;
        let cache = &mut self.cache;
        let label = &self.label;
        let mut promoted = 0;
        self.backups.for_each_mut(|row, _| {
            let id = row.id();
            match cache.state(&id).and_then(LoadState::promoted) {
                Some(next) => {
                    cache.set_state(&id, next);
                    promoted += 1;
                }
                None => warn!("{}: backed up row {} is not a draft", label, id),
            }
            Visit::Keep
        });
        if promoted > 0 {
            self.pending_edits = true;
            info!("{}: {} edits pending", self.label, promoted);
            self.events.push(EditEvent::PendingEditsChanged(true));
        }
        self.notify();
        Ok(())
    }

    /// Revert every edit like [`Table::reset_edits`], reporting each one as
    /// invalidated.
    pub fn discard_edits(&mut self) {
        for id in self.backups.ids() {
            warn!("{}: discarding edit of row {}", self.label, id);
            self.events.push(EditEvent::DraftInvalidated { id });
        }
        self.reset_edits();
    }

    /// Revert every draft and pending edit.
    pub fn reset_edits(&mut self) {
        let cache = &mut self.cache;
        self.backups.for_each_mut(|backup, state| {
            if state.is_add() {
                cache.remove(&backup.id());
            } else {
                cache.insert_or_update(backup.clone(), state);
            }
            Visit::Remove
        });
        self.local_adds.clear();
        if self.pending_edits {
            self.pending_edits = false;
            self.events.push(EditEvent::PendingEditsChanged(false));
        }
        info!("{}: edits reset", self.label);
        self.notify();
    }
}

/// Fields that carry a generated draft id; empty when ids are caller supplied.
fn generated_id_fields<R: Row>() -> Vec<String> {
    let Some(draft_id) = R::Id::next_draft_id(None).filter(|_| R::Id::ASSIGNS_DRAFT_IDS) else {
        return Vec::new();
    };
    let blank = row::to_fields(&R::default());
    let mut marked = R::default();
    marked.set_id(draft_id);
    row::to_fields(&marked)
        .into_iter()
        .filter(|(k, v)| blank.get(k) != Some(v))
        .map(|(k, _)| k)
        .collect()
}

impl<R: Row> fmt::Display for Table<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl<R: Row> fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("label", &self.label)
            .field("rows", &self.cache.len())
            .field("backups", &self.backups.len())
            .field("pending_edits", &self.pending_edits)
            .finish()
    }
}

pub struct EditBuilder<'a, R: Row> {
    table: &'a mut Table<R>,
    id: R::Id,
    changes: FieldMap,
}

impl<'a, R: Row> EditBuilder<'a, R> {
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.changes.insert(field.to_string(), value.into());
        self
    }

    pub fn commit(self) -> Result<()> {
        self.table.draft_edit_fields(&self.id, self.changes)
    }
}

pub struct AddBuilder<'a, R: Row> {
    table: &'a mut Table<R>,
    fields: FieldMap,
}

impl<'a, R: Row> AddBuilder<'a, R> {
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn commit(self) -> Result<R::Id> {
        self.table.draft_add_fields(self.fields)
    }
}

/// A table with its row type erased, as the sync driver sees it.
pub trait TableHandle {
    fn label(&self) -> &str;
    fn table_name(&self) -> &'static str;
    fn scope(&self) -> u64;
    fn full_refresh(&mut self);
    fn process_journal(&mut self, entries: &[JournalEntry]);
    fn take_queries(&mut self) -> Vec<TableQuery>;
    fn apply_response(&mut self, query: &TableQuery, reply: &Value) -> Result<()>;
    fn has_pending_edits(&self) -> bool;
}

impl<R: Row> TableHandle for Table<R> {
    fn label(&self) -> &str {
        Table::label(self)
    }

    fn table_name(&self) -> &'static str {
        R::TABLE
    }

    fn scope(&self) -> u64 {
        self.scope
    }

    fn full_refresh(&mut self) {
        Table::full_refresh(self)
    }

    fn process_journal(&mut self, entries: &[JournalEntry]) {
        Table::process_journal(self, entries)
    }

    fn take_queries(&mut self) -> Vec<TableQuery> {
        Table::take_queries(self)
    }

    fn apply_response(&mut self, query: &TableQuery, reply: &Value) -> Result<()> {
        Table::apply_response(self, query, reply).map(|_| ())
    }

    fn has_pending_edits(&self) -> bool {
        self.pending_edits
    }
}
