use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::api::{self, GetTableRows};
use crate::config::SyncConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Add,
    Modify,
    Delete,
}

impl<'de> Deserialize<'de> for EntryKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match api::u64_or_string(deserializer)? {
            0 => Ok(EntryKind::Add),
            1 => Ok(EntryKind::Modify),
            2 => Ok(EntryKind::Delete),
            other => Err(serde::de::Error::custom(format!("unknown journal modification {other}"))),
        }
    }
}

/// One remote mutation notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JournalEntry {
    #[serde(deserialize_with = "api::u64_or_string")]
    pub id: u64,
    #[serde(deserialize_with = "api::ledger_time")]
    pub timestamp: DateTime<Utc>,
    pub table: String,
    #[serde(deserialize_with = "api::u64_or_string")]
    pub scope: u64,
    #[serde(deserialize_with = "api::u64_or_string")]
    pub key: u64,
    #[serde(rename = "modification")]
    pub kind: EntryKind,
}

impl JournalEntry {
    pub fn touches(&self, table: &str, scope: u64) -> bool {
        self.table == table && self.scope == scope
    }
}

/// What the caller must do with a freshly fetched batch.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalAction {
    /// Nothing new.
    None,
    /// The batch continues the last seen entry; apply it entry by entry.
    Apply(Vec<JournalEntry>),
    /// Continuity was lost; every materialized table needs a full refresh.
    RefreshAll,
}

/// Remembers the newest journal entry seen on the current connection.
#[derive(Debug, Default)]
pub struct JournalTracker {
    last_seen: Option<u64>,
}

impl JournalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    pub fn reset(&mut self) {
        self.last_seen = None;
    }

    /// The next journal request: the newest entry alone until one has been
    /// seen, then everything after it.
    pub fn next_request(&self, config: &SyncConfig) -> GetTableRows {
        let request = |limit| GetTableRows::new(&config.contract, &config.journal_table, &config.journal_scope, limit);
        match self.last_seen {
            None => request(1).reversed(),
            Some(last) => request(config.page_limit).from(Value::from(last + 1)),
        }
    }

    /// Parse a journal reply and decide how it applies.
    pub fn ingest(&mut self, reply: &Value) -> Result<JournalAction> {
        let page = api::parse_rows(reply)
            .ok_or_else(|| Error::Malformed(format!("journal reply {}", reply)))?;
        let mut entries = page
            .rows
            .into_iter()
            .map(serde_json::from_value::<JournalEntry>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Malformed(format!("journal entry: {e}")))?;
        entries.sort_by_key(|e| e.id);
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(JournalAction::None);
        };

        let continuous = self.last_seen.map_or(false, |seen| first.id == seen + 1);
        self.last_seen = Some(last.id);
        Ok(if continuous { JournalAction::Apply(entries) } else { JournalAction::RefreshAll })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::name;

    fn entry(id: u64, key: u64, kind: u64) -> Value {
        json!({
            "id": id,
            "timestamp": "2021-01-02T03:04:05.000",
            "table": "groups",
            "scope": name::string_to_u64("global").to_string(),
            "key": key,
            "modification": kind
        })
    }

    #[test]
    fn test_entry_decodes_string_integers() {
        let parsed: JournalEntry = serde_json::from_value(entry(3, 9, 2)).unwrap();
        assert_eq!(parsed.kind, EntryKind::Delete);
        assert_eq!(parsed.scope, name::string_to_u64("global"));
        assert!(parsed.touches("groups", name::string_to_u64("global")));
        assert_eq!(parsed.timestamp.to_rfc3339(), "2021-01-02T03:04:05+00:00");

        assert!(serde_json::from_value::<JournalEntry>(entry(3, 9, 7)).is_err());
    }

    #[test]
    fn test_bootstrap_then_incremental_requests() {
        let config = SyncConfig::default();
        let mut tracker = JournalTracker::new();
        let first = tracker.next_request(&config);
        assert!(first.reverse);
        assert_eq!(first.limit, 1);
        assert_eq!(first.lower_bound, None);
        assert_eq!(first.scope, "global");

        let action = tracker.ingest(&json!({"rows": [entry(10, 1, 0)], "more": false})).unwrap();
        assert_eq!(action, JournalAction::RefreshAll);
        assert_eq!(tracker.last_seen(), Some(10));

        let next = tracker.next_request(&config);
        assert!(!next.reverse);
        assert_eq!(next.lower_bound, Some(json!(11)));
        assert_eq!(next.limit, config.page_limit);
    }

    #[test]
    fn test_continuous_batch_is_applied_in_order() {
        let mut tracker = JournalTracker::new();
        tracker.ingest(&json!({"rows": [entry(10, 1, 0)]})).unwrap();
        let action = tracker
            .ingest(&json!({"rows": [entry(12, 2, 1), entry(11, 1, 1)], "more": false}))
            .unwrap();
        match action {
            JournalAction::Apply(entries) => {
                assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![11, 12])
            }
            other => panic!("expected apply, got {other:?}"),
        }
        assert_eq!(tracker.last_seen(), Some(12));
    }

    #[test]
    fn test_gap_requests_full_refresh() {
        let mut tracker = JournalTracker::new();
        tracker.ingest(&json!({"rows": [entry(10, 1, 0)]})).unwrap();
        let action = tracker.ingest(&json!({"rows": [entry(15, 1, 1), entry(16, 1, 1)]})).unwrap();
        assert_eq!(action, JournalAction::RefreshAll);
        assert_eq!(tracker.last_seen(), Some(16));
    }

    #[test]
    fn test_empty_and_malformed_replies() {
        let mut tracker = JournalTracker::new();
        tracker.ingest(&json!({"rows": [entry(10, 1, 0)]})).unwrap();
        assert_eq!(tracker.ingest(&json!({"rows": []})).unwrap(), JournalAction::None);
        assert!(matches!(tracker.ingest(&json!({"nope": 1})), Err(Error::Malformed(_))));
        assert!(matches!(tracker.ingest(&json!({"rows": [{"id": 11}]})), Err(Error::Malformed(_))));
        assert_eq!(tracker.last_seen(), Some(10));
    }
}
