//! The voting application's tables.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use table_sync::{
    EditEvent, ListModel, LoadState, Row, SyncConfig, Table, TableRegistry, VirtualField, VirtualFieldFactory,
};
use tracing::{info, warn};

/// Scope of the polling groups table.
pub const GROUPS_SCOPE: &str = "global";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollingGroup {
    pub id: u64,
    pub name: String,
    pub tags: Vec<String>,
}

impl Row for PollingGroup {
    type Id = u64;
    const TABLE: &'static str = "groups";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// Member of one polling group; the member table is scoped by group id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub account: String,
    pub weight: u32,
    pub tags: Vec<String>,
}

impl Row for GroupMember {
    type Id = String;
    const TABLE: &'static str = "members";

    fn id(&self) -> String {
        self.account.clone()
    }

    fn set_id(&mut self, id: String) {
        self.account = id;
    }
}

/// Number of members of the group a row shows.
///
/// The member list is resolved on the first [`VirtualField::refresh`] after
/// the group row is known, not when the row appears, so that a settled group
/// finds its rescoped member table instead of creating an empty one.
pub struct GroupSizeField {
    catalog: Weak<Catalog>,
    group: Option<u64>,
    members: Option<Rc<RefCell<ListModel<GroupMember>>>>,
    count: Option<usize>,
}

impl GroupSizeField {
    pub const ROLE: &'static str = "memberCount";

    pub fn new(catalog: Weak<Catalog>) -> Self {
        Self { catalog, group: None, members: None, count: None }
    }
}

impl VirtualField<PollingGroup> for GroupSizeField {
    fn role(&self) -> &str {
        Self::ROLE
    }

    fn row_changed(&mut self, row: &PollingGroup, state: LoadState) {
        if state == LoadState::Loading {
            self.group = None;
        } else if self.group != Some(row.id) {
            self.group = Some(row.id);
        } else {
            return;
        }
        self.members = None;
        self.count = None;
    }

    fn refresh(&mut self) -> bool {
        if self.members.is_none() {
            if let (Some(group), Some(catalog)) = (self.group, self.catalog.upgrade()) {
                self.members = Some(catalog.member_rows(group));
            }
        }
        let count = self.members.as_ref().map(|m| m.borrow().len());
        if count == self.count {
            return false;
        }
        self.count = count;
        true
    }

    fn get(&self, _row: &PollingGroup, _state: LoadState) -> (Value, LoadState) {
        match self.count {
            Some(count) => (Value::from(count), LoadState::Loaded),
            None => (Value::Null, LoadState::Loading),
        }
    }
}

/// Owns the application's tables and registers each with the sync driver.
pub struct Catalog {
    this: Weak<Catalog>,
    config: SyncConfig,
    registry: TableRegistry,
    groups: Rc<RefCell<Table<PollingGroup>>>,
    members: RefCell<BTreeMap<u64, Rc<RefCell<Table<GroupMember>>>>>,
    member_lists: RefCell<BTreeMap<u64, Rc<RefCell<ListModel<GroupMember>>>>>,
}

impl Catalog {
    pub fn new(config: &SyncConfig, registry: TableRegistry) -> Rc<Self> {
        let groups = Rc::new(RefCell::new(Table::named(GROUPS_SCOPE, config)));
        registry.register(&groups);
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            config: config.clone(),
            registry,
            groups,
            members: RefCell::new(BTreeMap::new()),
            member_lists: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn groups(&self) -> Rc<RefCell<Table<PollingGroup>>> {
        self.groups.clone()
    }

    /// Every polling group, each with a [`GroupSizeField`].
    pub fn group_rows(&self) -> Rc<RefCell<ListModel<PollingGroup>>> {
        let catalog = self.this.clone();
        let factory: VirtualFieldFactory<PollingGroup> = Rc::new(move || {
            vec![Box::new(GroupSizeField::new(catalog.clone())) as Box<dyn VirtualField<PollingGroup>>]
        });
        self.groups.borrow_mut().project(ListModel::new().with_virtual_fields(factory))
    }

    /// The member table of `group`, created and registered on first use.
    pub fn members(&self, group: u64) -> Rc<RefCell<Table<GroupMember>>> {
        let mut members = self.members.borrow_mut();
        if let Some(table) = members.get(&group) {
            return table.clone();
        }
        let table = Rc::new(RefCell::new(Table::new(group, &self.config)));
        self.registry.register(&table);
        info!("Catalog: opened {}", table.borrow().label());
        members.insert(group, table.clone());
        table
    }

    /// A shared list of the members of `group`.
    pub fn member_rows(&self, group: u64) -> Rc<RefCell<ListModel<GroupMember>>> {
        if let Some(list) = self.member_lists.borrow().get(&group) {
            return list.clone();
        }
        let list = self.members(group).borrow_mut().all_rows();
        self.member_lists.borrow_mut().insert(group, list.clone());
        list
    }

    pub fn member_tables(&self) -> Vec<u64> {
        self.members.borrow().keys().copied().collect()
    }

    /// Drain the groups table's edit events, moving the member table of each
    /// settled group from its draft id to its real id.
    pub fn process_events(&self) -> Vec<EditEvent<PollingGroup>> {
        let events = self.groups.borrow_mut().take_events();
        for event in &events {
            if let EditEvent::PendingAddSettled { draft_id, row, .. } = event {
                self.rescope_members(*draft_id, row.id);
            }
        }
        events
    }

    fn rescope_members(&self, draft_id: u64, id: u64) {
        if draft_id == id {
            return;
        }
        let mut members = self.members.borrow_mut();
        let mut lists = self.member_lists.borrow_mut();
        let Some(table) = members.remove(&draft_id) else {
            return;
        };
        let list = lists.remove(&draft_id);
        if members.contains_key(&id) {
            warn!(
                "Catalog: members of group {} already open, orphaning members drafted under {}",
                id, draft_id
            );
            table.borrow_mut().discard_edits();
            return;
        }
        table.borrow_mut().update_scope(id);
        members.insert(id, table);
        if let Some(list) = list {
            lists.insert(id, list);
        }
    }
}

#[cfg(test)]
mod tests {
    use table_sync::BASE_DRAFT_ID;
    use tracing_test::traced_test;

    use super::*;

    fn group(id: u64, name: &str) -> PollingGroup {
        PollingGroup { id, name: name.to_string(), tags: Vec::new() }
    }

    fn member(account: &str, weight: u32) -> GroupMember {
        GroupMember { account: account.to_string(), weight, tags: Vec::new() }
    }

    fn catalog() -> (Rc<Catalog>, TableRegistry) {
        let registry = TableRegistry::new();
        (Catalog::new(&SyncConfig::default(), registry.clone()), registry)
    }

    /// Draft a group, submit it and let the node confirm it under `real_id`.
    fn settle_new_group(catalog: &Catalog, real_id: u64) -> u64 {
        let groups = catalog.groups();
        let draft_id = groups.borrow_mut().draft_add().set("name", "Book club").commit().unwrap();
        groups.borrow_mut().mark_edits_pending().unwrap();
        groups.borrow_mut().merge_rows(vec![group(real_id, "Book club")]);
        draft_id
    }

    #[test]
    fn test_member_tables_open_on_demand() {
        let (catalog, registry) = catalog();
        assert_eq!(registry.len(), 1);
        let first = catalog.members(4);
        assert!(Rc::ptr_eq(&first, &catalog.members(4)));
        assert_eq!(first.borrow().label(), "members[4]");
        assert_eq!(catalog.groups().borrow().label(), "groups[global]");
        assert_eq!(registry.len(), 2);
        assert_eq!(catalog.member_tables(), vec![4]);
    }

    #[test]
    fn test_settled_group_takes_its_members_along() {
        let (catalog, _registry) = catalog();
        let draft_members = catalog.members(BASE_DRAFT_ID);
        draft_members.borrow_mut().draft_add().set("account", "erin").set("weight", 2).commit().unwrap();
        draft_members.borrow_mut().mark_edits_pending().unwrap();
        let draft_id = settle_new_group(&catalog, 12);
        assert_eq!(draft_id, BASE_DRAFT_ID);

        let events = catalog.process_events();
        assert!(events.iter().any(|e| matches!(e, EditEvent::PendingAddSettled { row, .. } if row.id == 12)));
        assert_eq!(catalog.member_tables(), vec![12]);
        assert!(Rc::ptr_eq(&draft_members, &catalog.members(12)));
        assert_eq!(draft_members.borrow().scope(), 12);
        // the submitted member moves along and settles once the node lists it
        assert!(draft_members.borrow().has_pending_edits());
        draft_members.borrow_mut().merge_rows(vec![member("erin", 2)]);
        assert!(!draft_members.borrow().has_pending_edits());
        assert_eq!(draft_members.borrow().get(&"erin".to_string()), Some((&member("erin", 2), LoadState::Loaded)));
    }

    #[traced_test]
    #[test]
    fn test_settling_onto_open_members_orphans_the_draft() {
        let (catalog, registry) = catalog();
        let existing = catalog.members(12);
        let draft = catalog.members(BASE_DRAFT_ID);
        draft.borrow_mut().draft_add().set("account", "erin").set("weight", 2).commit().unwrap();
        settle_new_group(&catalog, 12);
        catalog.process_events();

        assert!(Rc::ptr_eq(&existing, &catalog.members(12)));
        assert_eq!(catalog.member_tables(), vec![12]);
        assert!(logs_contain("orphaning members drafted under"));
        assert_eq!(draft.borrow_mut().take_events(), vec![EditEvent::DraftInvalidated { id: "erin".to_string() }]);
        assert!(draft.borrow().is_empty());
        drop(draft);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_group_size_field() {
        let (catalog, _registry) = catalog();
        let list = catalog.group_rows();
        catalog.groups().borrow_mut().merge_rows(vec![group(1, "Chess"), group(2, "Go")]);
        catalog.members(1).borrow_mut().merge_rows(vec![member("alice", 1), member("bob", 2)]);

        let size = |position| {
            let groups = catalog.groups();
            let groups = groups.borrow();
            list.borrow().virtual_value(groups.cache(), position, GroupSizeField::ROLE)
        };
        assert_eq!(size(0), Some((Value::Null, LoadState::Loading)));

        list.borrow_mut().take_events();
        list.borrow_mut().refresh_virtual_fields();
        assert_eq!(size(0), Some((Value::from(2), LoadState::Loaded)));
        assert_eq!(size(1), Some((Value::from(0), LoadState::Loaded)));
        assert_eq!(list.borrow_mut().take_events().len(), 1);

        catalog.members(2).borrow_mut().merge_rows(vec![member("carol", 5)]);
        list.borrow_mut().refresh_virtual_fields();
        assert_eq!(size(1), Some((Value::from(1), LoadState::Loaded)));
        list.borrow_mut().refresh_virtual_fields();
        assert!(list.borrow_mut().take_events().iter().all(|e| *e != table_sync::ModelEvent::Changed { first: 0, last: 0 }));
    }

    #[test]
    fn test_placeholder_groups_stay_loading() {
        let (catalog, _registry) = catalog();
        let list = catalog.group_rows();
        catalog.groups().borrow_mut().get_new(&9);
        list.borrow_mut().refresh_virtual_fields();
        let groups = catalog.groups();
        let groups = groups.borrow();
        assert_eq!(
            list.borrow().virtual_value(groups.cache(), 0, GroupSizeField::ROLE),
            Some((Value::Null, LoadState::Loading))
        );
        assert!(catalog.member_tables().is_empty());
    }
}
