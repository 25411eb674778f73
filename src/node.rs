//! An in-memory ledger node.
//!
//! Answers the calls a [`SyncDriver`](table_sync::SyncDriver) makes and can be
//! mutated between sync cycles. Every row mutation appends a journal entry, so
//! the node behaves like a contract that journals its own writes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use table_sync::{name, Endpoint, NetworkFailure, RemoteApi, Row, RowId};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Key {
    Num(u64),
    Name(String),
}

impl Key {
    fn parse(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_u64().map(Key::Num),
            Value::String(s) => Some(s.parse().map(Key::Num).unwrap_or_else(|_| Key::Name(s.clone()))),
            _ => None,
        }
    }

    fn journal_key(&self) -> u64 {
        match self {
            Key::Num(n) => *n,
            Key::Name(s) => name::string_to_u64(s),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Key::Num(n) => Value::String(n.to_string()),
            Key::Name(s) => Value::String(s.clone()),
        }
    }
}

fn scope_number(scope: &str) -> u64 {
    scope.parse().unwrap_or_else(|_| name::string_to_u64(scope))
}

type TableKey = (String, String);

struct NodeState {
    chain_id: String,
    head_block: u64,
    head_lag: chrono::Duration,
    tables: BTreeMap<TableKey, BTreeMap<Key, Value>>,
    journal: Vec<Value>,
    next_entry: u64,
    outage: Option<NetworkFailure>,
}

pub struct SimulatedNode {
    journal_table: String,
    latency: Duration,
    state: RefCell<NodeState>,
}

impl SimulatedNode {
    pub fn new(chain_id: &str) -> Self {
        Self {
            journal_table: "journal".to_string(),
            latency: Duration::ZERO,
            state: RefCell::new(NodeState {
                chain_id: chain_id.to_string(),
                head_block: 1,
                head_lag: chrono::Duration::zero(),
                tables: BTreeMap::new(),
                journal: Vec::new(),
                next_entry: 1,
                outage: None,
            }),
        }
    }

    /// Delay every answer by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_journal_table(mut self, table: &str) -> Self {
        self.journal_table = table.to_string();
        self
    }

    /// Insert or replace a row, journaling an add or a modification.
    pub fn upsert<R: Row>(&self, scope: &str, row: &R) {
        let Some(key) = serde_json::to_value(row.id()).ok().as_ref().and_then(Key::parse) else {
            return;
        };
        let Ok(value) = serde_json::to_value(row) else {
            return;
        };
        let mut state = self.state.borrow_mut();
        let rows = state.tables.entry((R::TABLE.to_string(), scope.to_string())).or_default();
        let kind = if rows.insert(key.clone(), value).is_some() { 1 } else { 0 };
        state.journal_write(R::TABLE, scope, &key, kind);
    }

    pub fn delete<R: Row>(&self, scope: &str, id: &R::Id) -> bool {
        let Some(key) = serde_json::to_value(id).ok().as_ref().and_then(Key::parse) else {
            return false;
        };
        let mut state = self.state.borrow_mut();
        let removed = state
            .tables
            .get_mut(&(R::TABLE.to_string(), scope.to_string()))
            .and_then(|rows| rows.remove(&key))
            .is_some();
        if removed {
            state.journal_write(R::TABLE, scope, &key, 2);
        }
        removed
    }

    /// Next free numeric id of a table, as the contract would assign it.
    pub fn next_id<R: Row<Id = u64>>(&self, scope: &str) -> u64 {
        let state = self.state.borrow();
        state
            .tables
            .get(&(R::TABLE.to_string(), scope.to_string()))
            .and_then(|rows| rows.keys().rev().find_map(|k| match k {
                Key::Num(n) => Some(*n),
                Key::Name(_) => None,
            }))
            .map_or(1, |last| last + 1)
    }

    pub fn row<R: Row>(&self, scope: &str, id: &R::Id) -> Option<R> {
        let key = Key::parse(&id.lower_bound())?;
        let state = self.state.borrow();
        let raw = state.tables.get(&(R::TABLE.to_string(), scope.to_string()))?.get(&key)?;
        serde_json::from_value(raw.clone()).ok()
    }

    pub fn row_count(&self, table: &str, scope: &str) -> usize {
        self.state.borrow().tables.get(&(table.to_string(), scope.to_string())).map_or(0, BTreeMap::len)
    }

    /// Skip `count` journal ids, as if entries had been pruned before anyone
    /// read them.
    pub fn lose_journal_entries(&self, count: u64) {
        self.state.borrow_mut().next_entry += count;
    }

    pub fn last_journal_entry(&self) -> Option<u64> {
        self.state.borrow().next_entry.checked_sub(1).filter(|&id| id > 0)
    }

    /// Fail every call with `failure` until cleared with `None`.
    pub fn set_outage(&self, failure: Option<NetworkFailure>) {
        self.state.borrow_mut().outage = failure;
    }

    /// Report a head block this far in the past.
    pub fn set_head_lag(&self, lag: Duration) {
        self.state.borrow_mut().head_lag = chrono::Duration::from_std(lag).unwrap_or_else(|_| chrono::Duration::zero());
    }

    fn answer(&self, endpoint: Endpoint, payload: &Value) -> Result<Value, NetworkFailure> {
        let mut state = self.state.borrow_mut();
        if let Some(failure) = &state.outage {
            return Err(failure.clone());
        }
        match endpoint {
            Endpoint::GetInfo => {
                state.head_block += 1;
                Ok(state.info())
            }
            Endpoint::GetBlock => {
                let number = payload["block_num_or_id"].as_u64().ok_or(NetworkFailure::Http(400))?;
                if number == 0 || number > state.head_block {
                    return Err(NetworkFailure::Http(500));
                }
                Ok(json!({
                    "block_num": number,
                    "id": block_id(number),
                    "previous": block_id(number - 1),
                    "transactions": []
                }))
            }
            Endpoint::GetTableRows => {
                let table = payload["table"].as_str().ok_or(NetworkFailure::Http(400))?;
                let scope = payload["scope"].as_str().ok_or(NetworkFailure::Http(400))?;
                let limit = payload["limit"].as_u64().unwrap_or(10) as usize;
                let reverse = payload["reverse"].as_bool().unwrap_or(false);
                let lower = payload.get("lower_bound").and_then(Key::parse);
                if table == self.journal_table {
                    Ok(state.journal_page(lower, limit, reverse))
                } else {
                    Ok(state.rows_page(table, scope, lower, limit))
                }
            }
        }
    }
}

fn block_id(number: u64) -> String {
    format!("{:08x}{:056x}", number, number.wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

fn ledger_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

impl NodeState {
    fn journal_write(&mut self, table: &str, scope: &str, key: &Key, kind: u8) {
        let id = self.next_entry;
        self.next_entry += 1;
        self.journal.push(json!({
            "id": id,
            "timestamp": ledger_time(Utc::now()),
            "table": table,
            "scope": scope_number(scope).to_string(),
            "key": key.journal_key().to_string(),
            "modification": kind
        }));
    }

    fn info(&self) -> Value {
        let head_time = Utc::now() - self.head_lag;
        json!({
            "server_version": "simulated",
            "chain_id": self.chain_id,
            "head_block_num": self.head_block,
            "last_irreversible_block_num": self.head_block.saturating_sub(2),
            "head_block_id": block_id(self.head_block),
            "head_block_time": ledger_time(head_time),
        })
    }

    fn journal_page(&self, lower: Option<Key>, limit: usize, reverse: bool) -> Value {
        let from = match lower {
            Some(Key::Num(n)) => n,
            _ => 0,
        };
        let mut entries: Vec<&Value> =
            self.journal.iter().filter(|e| e["id"].as_u64().map_or(false, |id| id >= from)).collect();
        if reverse {
            entries.reverse();
        }
        let more = entries.len() > limit;
        let next_key = entries.get(limit).map(|e| e["id"].to_string()).unwrap_or_default();
        entries.truncate(limit);
        json!({ "rows": entries, "more": more, "next_key": next_key })
    }

    fn rows_page(&self, table: &str, scope: &str, lower: Option<Key>, limit: usize) -> Value {
        let Some(rows) = self.tables.get(&(table.to_string(), scope.to_string())) else {
            return json!({ "rows": [], "more": false, "next_key": "" });
        };
        let mut matching = rows.iter().filter(|(key, _)| lower.as_ref().map_or(true, |lower| *key >= lower));
        let page: Vec<&Value> = matching.by_ref().take(limit).map(|(_, row)| row).collect();
        match matching.next() {
            Some((next, _)) => json!({ "rows": page, "more": true, "next_key": next.to_value() }),
            None => json!({ "rows": page, "more": false, "next_key": "" }),
        }
    }
}

#[async_trait(?Send)]
impl RemoteApi for SimulatedNode {
    async fn call(&self, node: &Url, endpoint: Endpoint, payload: Value) -> Result<Value, NetworkFailure> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        debug!("SimulatedNode: {}{} {}", node, endpoint.path().trim_start_matches('/'), payload);
        self.answer(endpoint, &payload)
    }
}
