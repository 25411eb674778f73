//! The synchronization loop.
//!
//! A [`SyncDriver`] talks to one node through a [`RemoteApi`]. On every timer
//! tick it asks for the chain head and the journal, dispatches journal entries
//! to the registered tables, and sends whatever row queries the tables have
//! queued. All calls run concurrently inside one task; their completions are
//! handled one at a time on that same task.

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{pin_mut, select, FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ChainInfo, Endpoint, NetworkFailure, RemoteApi};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::journal::{JournalAction, JournalTracker};
use crate::table::{TableHandle, TableQuery};

/// Connection status. Values above `Connected` mean a node is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum SyncStatus {
    Idle = 0,
    WaitingForConnection,
    RecoveringConnection,
    Connected = 7,
    Synchronized,
    SynchronizedStale,
}

impl SyncStatus {
    pub fn is_connected(self) -> bool {
        self > SyncStatus::Connected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    NodeError(i32),
    ResponseNonsense,
    ChainIdChanged(String),
    HeadBlockChanged { number: u64, id: String, time: Option<DateTime<Utc>> },
    IrreversibleBlockChanged(u64),
    LatencyChanged(Duration),
    Block { number: u64, payload: Value },
}

/// What the driver last learned about the chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainState {
    pub chain_id: String,
    pub head_block_id: String,
    pub head_block_num: u64,
    pub head_block_time: Option<DateTime<Utc>>,
    pub irreversible_block_num: u64,
    pub latency: Option<Duration>,
}

type TableRef = Rc<RefCell<dyn TableHandle>>;

/// Tables the driver keeps synchronized. Cloning shares the registry, so
/// tables can be registered while the driver is running.
#[derive(Clone, Default)]
pub struct TableRegistry {
    tables: Rc<RefCell<Vec<Weak<RefCell<dyn TableHandle>>>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only a weak handle is kept; dropping the table unregisters it.
    pub fn register<T: TableHandle + 'static>(&self, table: &Rc<RefCell<T>>) {
        let handle: TableRef = table.clone();
        self.tables.borrow_mut().push(Rc::downgrade(&handle));
    }

    pub fn live(&self) -> Vec<TableRef> {
        let mut tables = self.tables.borrow_mut();
        tables.retain(|t| t.strong_count() > 0);
        tables.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Call {
    Info { started: Instant },
    Journal,
    Rows { table: Weak<RefCell<dyn TableHandle>>, query: TableQuery },
    Block(u64),
}

struct Completion {
    generation: u64,
    call: Call,
    payload: Value,
    result: std::result::Result<Value, NetworkFailure>,
}

enum Wake {
    Tick,
    Done(Completion),
}

type Retry = (Weak<RefCell<dyn TableHandle>>, TableQuery);

pub struct SyncDriver<A: RemoteApi + 'static> {
    api: Rc<A>,
    config: SyncConfig,
    node: Option<Url>,
    /// Bumped on every node switch; completions from older nodes are dropped.
    generation: u64,
    active: bool,
    ever_connected: bool,
    registry: TableRegistry,
    journal: JournalTracker,
    journal_in_flight: bool,
    chain: ChainState,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    in_flight: FuturesUnordered<LocalBoxFuture<'static, Completion>>,
    retry: Vec<Retry>,
    ticker: Option<Interval>,
}

impl<A: RemoteApi + 'static> SyncDriver<A> {
    pub fn new(api: A, config: SyncConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            api: Rc::new(api),
            config,
            node: None,
            generation: 0,
            active: false,
            ever_connected: false,
            registry: TableRegistry::new(),
            journal: JournalTracker::new(),
            journal_in_flight: false,
            chain: ChainState::default(),
            status,
            events,
            in_flight: FuturesUnordered::new(),
            retry: Vec::new(),
            ticker: None,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> TableRegistry {
        self.registry.clone()
    }

    pub fn register<T: TableHandle + 'static>(&self, table: &Rc<RefCell<T>>) {
        self.registry.register(table);
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    pub fn node(&self) -> Option<&Url> {
        self.node.as_ref()
    }

    pub fn journal_last_seen(&self) -> Option<u64> {
        self.journal.last_seen()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Point the driver at a node and start synchronizing. Setting the
    /// current node again does nothing; an unparsable URL changes nothing.
    /// Replies still due from the previous node are ignored when they arrive,
    /// except that their row queries are sent again to the new node.
    pub fn set_node(&mut self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl { url: url.to_string(), reason: e.to_string() })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl { url: url.to_string(), reason: "expected http or https".into() });
        }
        if self.node.as_ref() == Some(&parsed) {
            return Ok(());
        }
        info!("SyncDriver: using node {}", parsed);
        self.node = Some(parsed);
        self.generation += 1;
        self.journal.reset();
        self.journal_in_flight = false;
        self.ever_connected = false;
        self.chain = ChainState::default();
        self.connect_now();
        Ok(())
    }

    /// Restart the sync cycle; the first tick fires immediately.
    pub fn connect_now(&mut self) {
        if self.node.is_none() {
            return;
        }
        self.active = true;
        self.ticker = None;
        if !self.status().is_connected() {
            self.set_status(SyncStatus::WaitingForConnection);
        }
    }

    /// Stop the timer and return to `Idle`. Calls already sent still complete.
    pub fn disconnect(&mut self) {
        info!("SyncDriver: disconnecting");
        self.active = false;
        self.ticker = None;
        self.set_status(SyncStatus::Idle);
    }

    /// Ask for the chain head and the journal, and resend row queries that
    /// failed since the last cycle.
    pub fn sync_now(&mut self) {
        if !self.active {
            return;
        }
        self.issue(Endpoint::GetInfo, json!({}), Call::Info { started: Instant::now() });
        if !self.journal_in_flight {
            let request = self.journal.next_request(&self.config);
            self.journal_in_flight = true;
            self.issue(Endpoint::GetTableRows, request.to_payload(), Call::Journal);
        }
        let retry = std::mem::take(&mut self.retry);
        if !retry.is_empty() {
            debug!("SyncDriver: resending {} row queries", retry.len());
        }
        for (table, query) in retry {
            if table.strong_count() > 0 {
                let payload = query.request.to_payload();
                self.issue(Endpoint::GetTableRows, payload, Call::Rows { table, query });
            }
        }
    }

    pub fn request_block(&mut self, number: u64) -> Result<()> {
        if !self.active {
            return Err(Error::NotConnected);
        }
        self.issue(Endpoint::GetBlock, json!({ "block_num_or_id": number }), Call::Block(number));
        Ok(())
    }

    /// Wait for the next timer tick or call completion and handle it. Returns
    /// `false` when there is nothing left to wait for.
    pub async fn step(&mut self) -> bool {
        self.flush_queries();
        if self.active && self.ticker.is_none() {
            let mut ticker = tokio::time::interval(self.config.sync_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
        }

        let wake = match self.ticker.as_mut() {
            Some(ticker) if self.in_flight.is_empty() => {
                ticker.tick().await;
                Wake::Tick
            }
            Some(ticker) => {
                let tick = ticker.tick().fuse();
                pin_mut!(tick);
                select! {
                    _ = tick => Wake::Tick,
                    done = self.in_flight.select_next_some() => Wake::Done(done),
                }
            }
            None => match self.in_flight.next().await {
                Some(done) => Wake::Done(done),
                None => return false,
            },
        };

        match wake {
            Wake::Tick => self.sync_now(),
            Wake::Done(done) => self.complete(done),
        }
        self.flush_queries();
        true
    }

    /// Handle completions until no call is outstanding. Does not wait for the
    /// timer.
    pub async fn run_until_idle(&mut self) {
        self.flush_queries();
        while let Some(done) = self.in_flight.next().await {
            self.complete(done);
            self.flush_queries();
        }
    }

    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let shutdown = shutdown.fuse();
        pin_mut!(shutdown);
        loop {
            let step = self.step().fuse();
            pin_mut!(step);
            select! {
                _ = shutdown => break,
                more = step => {
                    if !more {
                        shutdown.as_mut().await;
                        break;
                    }
                }
            }
        }
        debug!("SyncDriver: stopped");
    }

    fn issue(&mut self, endpoint: Endpoint, payload: Value, call: Call) {
        let Some(node) = self.node.clone() else {
            return;
        };
        let api = self.api.clone();
        let generation = self.generation;
        self.in_flight.push(
            async move {
                let result = api.call(&node, endpoint, payload.clone()).await;
                Completion { generation, call, payload, result }
            }
            .boxed_local(),
        );
    }

    /// Send the row queries the tables have queued. Nothing is sent while no
    /// node is in use; the queries wait in the tables.
    fn flush_queries(&mut self) {
        if !self.active {
            return;
        }
        for table in self.registry.live() {
            let queries = table.borrow_mut().take_queries();
            for query in queries {
                let payload = query.request.to_payload();
                self.issue(Endpoint::GetTableRows, payload, Call::Rows { table: Rc::downgrade(&table), query });
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        let Completion { generation, call, payload, result } = done;
        if generation != self.generation {
            debug!("SyncDriver: dropping reply from a previous node to {}", payload);
            if let Call::Rows { table, query } = call {
                self.retry.push((table, query));
            }
            return;
        }
        match call {
            Call::Info { started } => {
                if self.active {
                    self.on_info(started, &payload, result);
                }
            }
            Call::Journal => {
                self.journal_in_flight = false;
                if self.active {
                    self.on_journal(&payload, result);
                }
            }
            Call::Rows { table, query } => {
                let Some(table) = table.upgrade() else {
                    return;
                };
                match result {
                    Ok(reply) => {
                        let applied = table.borrow_mut().apply_response(&query, &reply);
                        if applied.is_err() {
                            self.response_nonsense();
                        }
                    }
                    Err(failure) => {
                        self.network_error(&failure, &payload);
                        self.retry.push((Rc::downgrade(&table), query));
                    }
                }
            }
            Call::Block(number) => match result {
                Ok(block) => self.emit(SyncEvent::Block { number, payload: block }),
                Err(failure) => self.network_error(&failure, &payload),
            },
        }
    }

    fn on_info(&mut self, started: Instant, payload: &Value, result: std::result::Result<Value, NetworkFailure>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(failure) => return self.network_error(&failure, payload),
        };
        let info: ChainInfo = match serde_json::from_value(reply) {
            Ok(info) => info,
            Err(e) => {
                warn!("SyncDriver: response to get_info not sensible: {}", e);
                return self.response_nonsense();
            }
        };

        let latency = started.elapsed();
        if self.chain.latency != Some(latency) {
            self.chain.latency = Some(latency);
            self.emit(SyncEvent::LatencyChanged(latency));
        }
        if self.chain.chain_id != info.chain_id {
            self.chain.chain_id = info.chain_id.clone();
            self.emit(SyncEvent::ChainIdChanged(info.chain_id.clone()));
        }
        if self.chain.head_block_id != info.head_block_id {
            self.chain.head_block_id = info.head_block_id.clone();
            self.chain.head_block_num = info.head_block_num;
            self.chain.head_block_time = info.head_block_time;
            self.emit(SyncEvent::HeadBlockChanged {
                number: info.head_block_num,
                id: info.head_block_id.clone(),
                time: info.head_block_time,
            });
        }
        if self.chain.irreversible_block_num != info.last_irreversible_block_num {
            self.chain.irreversible_block_num = info.last_irreversible_block_num;
            self.emit(SyncEvent::IrreversibleBlockChanged(info.last_irreversible_block_num));
        }

        if !self.ever_connected {
            info!("SyncDriver: connected to chain {} with RTT {:?}", info.chain_id, latency);
            self.ever_connected = true;
        }
        let fresh = info.head_block_time.map_or(false, |time| {
            Utc::now().signed_duration_since(time).num_milliseconds() <= self.config.stale_after().as_millis() as i64
        });
        self.set_status(if fresh { SyncStatus::Synchronized } else { SyncStatus::SynchronizedStale });
    }

    fn on_journal(&mut self, payload: &Value, result: std::result::Result<Value, NetworkFailure>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(failure) => return self.network_error(&failure, payload),
        };
        match self.journal.ingest(&reply) {
            Err(e) => {
                warn!("SyncDriver: {}", e);
                self.response_nonsense();
            }
            Ok(JournalAction::None) => {}
            Ok(JournalAction::Apply(entries)) => {
                for table in self.registry.live() {
                    table.borrow_mut().process_journal(&entries);
                }
                if let Some(last) = self.journal.last_seen() {
                    info!("SyncDriver: synchronized journal through entry {}", last);
                }
            }
            Ok(JournalAction::RefreshAll) => {
                info!("SyncDriver: journal continuity lost, refreshing all tables");
                for table in self.registry.live() {
                    table.borrow_mut().full_refresh();
                }
            }
        }
    }

    fn network_error(&mut self, failure: &NetworkFailure, payload: &Value) {
        warn!("SyncDriver: network error {} ({}) for request {}", failure, failure.code(), payload);
        self.emit(SyncEvent::NodeError(failure.code()));
        self.downgrade();
    }

    fn response_nonsense(&mut self) {
        self.emit(SyncEvent::ResponseNonsense);
        self.downgrade();
    }

    fn downgrade(&mut self) {
        if !self.active {
            return;
        }
        self.set_status(if self.ever_connected {
            SyncStatus::RecoveringConnection
        } else {
            SyncStatus::WaitingForConnection
        });
    }

    fn set_status(&mut self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!("SyncDriver: status {:?}", status);
        }
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::row::testing::{item, Item};
    use crate::state::LoadState;
    use crate::table::Table;

    const NODE: &str = "http://node.test:8888";

    /// Scripted node: a single `items` table in scope 0 plus a journal.
    #[derive(Default)]
    struct FakeNode {
        rows: RefCell<Vec<Item>>,
        journal: RefCell<Vec<Value>>,
        head_age_secs: Cell<i64>,
        failure: RefCell<Option<NetworkFailure>>,
        nonsense_info: Cell<bool>,
        /// Host that answers a second late, from a journal far ahead.
        slow_host: RefCell<Option<String>>,
        calls: RefCell<Vec<(Endpoint, Value)>>,
    }

    fn journal_row(id: u64, key: u64, kind: u64) -> Value {
        json!({
            "id": id,
            "timestamp": "2024-05-06T07:08:09.500",
            "table": "items",
            "scope": 0,
            "key": key,
            "modification": kind
        })
    }

    impl FakeNode {
        fn push_entry(&self, id: u64, key: u64, kind: u64) {
            self.journal.borrow_mut().push(journal_row(id, key, kind));
        }

        fn row_calls(&self) -> Vec<Value> {
            self.calls
                .borrow()
                .iter()
                .filter(|(e, p)| *e == Endpoint::GetTableRows && p["table"] == "items")
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn count(&self, endpoint: Endpoint) -> usize {
            self.calls.borrow().iter().filter(|(e, _)| *e == endpoint).count()
        }

        fn answer(&self, endpoint: Endpoint, payload: &Value) -> std::result::Result<Value, NetworkFailure> {
            if let Some(failure) = self.failure.borrow().clone() {
                return Err(failure);
            }
            match endpoint {
                Endpoint::GetInfo if self.nonsense_info.get() => Ok(json!({"what": "?"})),
                Endpoint::GetInfo => {
                    let time = Utc::now() - chrono::Duration::seconds(self.head_age_secs.get());
                    Ok(json!({
                        "chain_id": "cafe",
                        "head_block_id": format!("{:016x}", time.timestamp()),
                        "head_block_num": time.timestamp().to_string(),
                        "last_irreversible_block_num": 5,
                        "head_block_time": time.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                    }))
                }
                Endpoint::GetBlock => Ok(json!({"block_num": payload["block_num_or_id"]})),
                Endpoint::GetTableRows if payload["table"] == "journal" => {
                    let journal = self.journal.borrow();
                    let rows: Vec<Value> = if payload["reverse"] == json!(true) {
                        journal.last().cloned().into_iter().collect()
                    } else {
                        let from = payload["lower_bound"].as_u64().unwrap_or(0);
                        journal.iter().filter(|e| e["id"].as_u64().unwrap_or(0) >= from).cloned().collect()
                    };
                    Ok(json!({"rows": rows, "more": false}))
                }
                Endpoint::GetTableRows => {
                    let from = match &payload["lower_bound"] {
                        Value::String(s) => s.parse().unwrap_or(0),
                        other => other.as_u64().unwrap_or(0),
                    };
                    let limit = payload["limit"].as_u64().unwrap_or(100) as usize;
                    let rows = self.rows.borrow();
                    let matching: Vec<&Item> = rows.iter().filter(|r| r.id >= from).collect();
                    let page: Vec<Value> = matching.iter().take(limit).map(|r| json!(r)).collect();
                    let more = matching.len() > limit;
                    let next_key = matching.get(limit).map(|r| r.id.to_string()).unwrap_or_default();
                    Ok(json!({"rows": page, "more": more, "next_key": next_key}))
                }
            }
        }
    }

    #[async_trait(?Send)]
    impl RemoteApi for FakeNode {
        async fn call(&self, node: &Url, endpoint: Endpoint, payload: Value) -> std::result::Result<Value, NetworkFailure> {
            self.calls.borrow_mut().push((endpoint, payload.clone()));
            let slow = self.slow_host.borrow().as_deref().is_some_and(|host| node.host_str() == Some(host));
            if slow {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if endpoint == Endpoint::GetTableRows && payload["table"] == "journal" {
                    return Ok(json!({"rows": [journal_row(500, 1, 1)], "more": false}));
                }
            }
            self.answer(endpoint, &payload)
        }
    }

    fn driver_with_table(rows: Vec<Item>) -> (SyncDriver<FakeNode>, Rc<RefCell<Table<Item>>>) {
        let node = FakeNode::default();
        *node.rows.borrow_mut() = rows;
        node.push_entry(10, 1, 0);
        let config = SyncConfig { page_limit: 2, ..SyncConfig::default() };
        let driver = SyncDriver::new(node, config.clone());
        let table = Rc::new(RefCell::new(Table::<Item>::new(0, &config)));
        driver.register(&table);
        (driver, table)
    }

    async fn sync(driver: &mut SyncDriver<FakeNode>) {
        driver.sync_now();
        driver.run_until_idle().await;
    }

    #[test]
    fn test_status_ordering() {
        assert!(!SyncStatus::RecoveringConnection.is_connected());
        assert!(SyncStatus::Synchronized.is_connected());
        assert!(SyncStatus::SynchronizedStale.is_connected());
        assert_eq!(SyncStatus::Synchronized as u8, 8);
    }

    #[tokio::test]
    async fn test_rejects_bad_urls() {
        let (mut driver, _table) = driver_with_table(vec![]);
        assert!(matches!(driver.set_node("not a url"), Err(Error::InvalidUrl { .. })));
        assert!(matches!(driver.set_node("ftp://node.test"), Err(Error::InvalidUrl { .. })));
        assert_eq!(driver.status(), SyncStatus::Idle);
        assert!(driver.node().is_none());
        assert!(matches!(driver.request_block(1), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_bootstrap_loads_every_page() {
        let (mut driver, table) = driver_with_table(vec![item(1, "a", 1), item(2, "b", 2), item(3, "c", 3)]);
        let status = driver.watch_status();
        driver.set_node(NODE).unwrap();
        assert_eq!(*status.borrow(), SyncStatus::WaitingForConnection);

        sync(&mut driver).await;
        assert_eq!(driver.status(), SyncStatus::Synchronized);
        assert_eq!(driver.journal_last_seen(), Some(10));
        assert_eq!(driver.chain().chain_id, "cafe");
        assert_eq!(driver.chain().irreversible_block_num, 5);
        assert_eq!(table.borrow().cache().ids(), vec![1, 2, 3]);
        // page limit 2: one continuation
        assert_eq!(driver.api().row_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_journal_entries_refresh_rows() {
        let (mut driver, table) = driver_with_table(vec![item(1, "a", 1)]);
        driver.set_node(NODE).unwrap();
        sync(&mut driver).await;
        let before = driver.api().row_calls().len();

        driver.api().rows.borrow_mut()[0].name = "changed".into();
        driver.api().rows.borrow_mut().push(item(2, "new", 2));
        driver.api().push_entry(11, 1, 1);
        driver.api().push_entry(12, 1, 1);
        driver.api().push_entry(13, 2, 0);
        sync(&mut driver).await;

        let calls = driver.api().row_calls();
        let mut singles: Vec<u64> = calls[before..]
            .iter()
            .filter(|p| p["limit"] == 1)
            .filter_map(|p| p["lower_bound"].as_u64())
            .collect();
        singles.sort();
        // two modifications of row 1 share one refresh
        assert_eq!(singles, vec![1, 2]);
        assert_eq!(table.borrow().get(&1), Some((&item(1, "changed", 1), LoadState::Loaded)));
        assert_eq!(table.borrow().get(&2), Some((&item(2, "new", 2), LoadState::Loaded)));
        assert_eq!(driver.journal_last_seen(), Some(13));
    }

    #[tokio::test]
    async fn test_journal_gap_refreshes_everything() {
        let (mut driver, table) = driver_with_table(vec![item(1, "a", 1)]);
        driver.set_node(NODE).unwrap();
        sync(&mut driver).await;
        let before = driver.api().row_calls().len();

        driver.api().journal.borrow_mut().clear();
        driver.api().push_entry(15, 1, 2);
        driver.api().push_entry(16, 1, 2);
        sync(&mut driver).await;

        let calls = driver.api().row_calls();
        assert_eq!(calls.len(), before + 1);
        assert!(calls[before].get("lower_bound").is_none());
        // the delete was not applied entry by entry
        assert_eq!(table.borrow().len(), 1);
        assert_eq!(driver.journal_last_seen(), Some(16));
    }

    #[tokio::test]
    async fn test_failures_downgrade_status() {
        let (mut driver, _table) = driver_with_table(vec![]);
        let mut events = driver.subscribe();
        *driver.api().failure.borrow_mut() = Some(NetworkFailure::ConnectionRefused);
        driver.set_node(NODE).unwrap();
        sync(&mut driver).await;
        assert_eq!(driver.status(), SyncStatus::WaitingForConnection);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::NodeError(-2));

        *driver.api().failure.borrow_mut() = None;
        sync(&mut driver).await;
        assert_eq!(driver.status(), SyncStatus::Synchronized);

        *driver.api().failure.borrow_mut() = Some(NetworkFailure::Http(502));
        sync(&mut driver).await;
        assert_eq!(driver.status(), SyncStatus::RecoveringConnection);
    }

    #[tokio::test]
    async fn test_stale_head_and_nonsense() {
        let (mut driver, _table) = driver_with_table(vec![]);
        driver.api().head_age_secs.set(60);
        driver.set_node(NODE).unwrap();
        sync(&mut driver).await;
        assert_eq!(driver.status(), SyncStatus::SynchronizedStale);

        let mut events = driver.subscribe();
        driver.api().nonsense_info.set(true);
        sync(&mut driver).await;
        assert_eq!(driver.status(), SyncStatus::RecoveringConnection);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SyncEvent::ResponseNonsense));
    }

    #[tokio::test]
    async fn test_queries_wait_for_a_node() {
        let (mut driver, table) = driver_with_table(vec![item(4, "d", 4)]);
        table.borrow_mut().full_refresh();
        driver.run_until_idle().await;
        assert_eq!(driver.api().count(Endpoint::GetTableRows), 0);

        driver.set_node(NODE).unwrap();
        driver.run_until_idle().await;
        assert_eq!(table.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_block_requests_and_disconnect() {
        let (mut driver, _table) = driver_with_table(vec![]);
        let mut events = driver.subscribe();
        driver.set_node(NODE).unwrap();
        driver.request_block(42).unwrap();
        driver.run_until_idle().await;
        assert_eq!(events.try_recv().unwrap(), SyncEvent::Block { number: 42, payload: json!({"block_num": 42}) });

        driver.disconnect();
        assert_eq!(driver.status(), SyncStatus::Idle);
        driver.sync_now();
        assert_eq!(driver.in_flight(), 0);
        driver.connect_now();
        assert_eq!(driver.status(), SyncStatus::WaitingForConnection);
        driver.set_node(NODE).unwrap();
        assert_eq!(driver.journal_last_seen(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_replies_from_the_previous_node_are_ignored() {
        let (mut driver, table) = driver_with_table(vec![item(1, "a", 1)]);
        *driver.api().slow_host.borrow_mut() = Some("old.test".into());
        driver.set_node("http://old.test:8888").unwrap();
        driver.sync_now();
        assert_eq!(driver.in_flight(), 2);

        driver.set_node(NODE).unwrap();
        sync(&mut driver).await;
        assert_eq!(driver.in_flight(), 0);
        assert_eq!(driver.journal_last_seen(), Some(10));
        assert_eq!(driver.status(), SyncStatus::Synchronized);
        assert_eq!(table.borrow().get(&1), Some((&item(1, "a", 1), LoadState::Loaded)));

        // the next journal request continues from the new node's position
        sync(&mut driver).await;
        let journal_calls: Vec<Value> = driver
            .api()
            .calls
            .borrow()
            .iter()
            .filter(|(e, p)| *e == Endpoint::GetTableRows && p["table"] == "journal")
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(journal_calls.len(), 3);
        assert_eq!(journal_calls[2]["lower_bound"], json!(11));
    }

    #[tokio::test]
    async fn test_failed_row_queries_are_sent_again() {
        let (mut driver, table) = driver_with_table(vec![item(1, "a", 1), item(2, "b", 2)]);
        driver.set_node(NODE).unwrap();
        sync(&mut driver).await;
        assert_eq!(table.borrow().cache().ids(), vec![1, 2]);

        *driver.api().failure.borrow_mut() = Some(NetworkFailure::ConnectionRefused);
        table.borrow_mut().full_refresh();
        driver.run_until_idle().await;
        assert_eq!(driver.status(), SyncStatus::RecoveringConnection);
        assert_eq!(driver.in_flight(), 0);

        *driver.api().failure.borrow_mut() = None;
        driver.api().rows.borrow_mut().push(item(3, "c", 3));
        sync(&mut driver).await;
        assert_eq!(table.borrow().cache().ids(), vec![1, 2, 3]);
        assert_eq!(driver.status(), SyncStatus::Synchronized);
    }

    #[tokio::test]
    async fn test_dropped_tables_are_forgotten() {
        let (driver, table) = driver_with_table(vec![]);
        let registry = driver.registry();
        assert_eq!(registry.len(), 1);
        drop(table);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drives_sync_cycles() {
        let (mut driver, table) = driver_with_table(vec![item(1, "a", 1)]);
        driver.set_node(NODE).unwrap();
        driver.run(tokio::time::sleep(Duration::from_secs(6))).await;
        assert_eq!(driver.api().count(Endpoint::GetInfo), 3);
        assert_eq!(driver.status(), SyncStatus::Synchronized);
        assert_eq!(table.borrow().len(), 1);
    }
}
