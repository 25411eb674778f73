#![allow(dead_code)]

use chrono::Utc;
use ledger_mirror::{PollingGroup, GROUPS_SCOPE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use table_sync::{name, EntryKind, JournalEntry, SyncConfig, Table};

pub fn generate_group(idx: u64) -> PollingGroup {
    let topics = ["chess", "garden", "budget", "books", "music"];
    PollingGroup {
        id: idx,
        name: format!("{} group {}", topics[idx as usize % 5], idx),
        tags: vec![topics[idx as usize % 5].to_string(), format!("cohort-{}", idx % 7)],
    }
}

pub fn generate_groups(count: u64) -> Vec<PollingGroup> {
    (1..=count).map(generate_group).collect()
}

pub fn create_table(rows: u64) -> Table<PollingGroup> {
    let mut table = Table::named(GROUPS_SCOPE, &SyncConfig::default());
    table.merge_rows(generate_groups(rows));
    table
}

/// Every row renamed, as a node would return them after a bulk update.
pub fn renamed_groups(count: u64) -> Vec<PollingGroup> {
    (1..=count)
        .map(|idx| PollingGroup { name: format!("renamed {}", idx), ..generate_group(idx) })
        .collect()
}

/// A table with every `stride`-th row carrying a local edit.
pub fn create_edited_table(rows: u64, stride: u64) -> Table<PollingGroup> {
    let mut table = create_table(rows);
    for idx in (1..=rows).step_by(stride as usize) {
        table.draft_edit(idx).set("name", format!("draft {}", idx)).commit().unwrap();
    }
    table
}

pub fn journal_batch(count: u64, rows: u64, seed: u64) -> Vec<JournalEntry> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scope = name::string_to_u64(GROUPS_SCOPE);
    (1..=count)
        .map(|id| JournalEntry {
            id,
            timestamp: Utc::now(),
            table: "groups".to_string(),
            scope,
            key: rng.gen_range(1..=rows),
            kind: if rng.gen_bool(0.9) { EntryKind::Modify } else { EntryKind::Delete },
        })
        .collect()
}
