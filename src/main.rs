//! Ledger mirror demo
//!
//! Mirrors the polling groups of a simulated ledger and walks through:
//! - initial load and member counts
//! - a locally drafted group confirmed by the node under a real id
//! - a node outage and recovery
//! - lost journal entries forcing a full refresh
//!
//! Usage: `ledger-mirror-demo [config.json]`. Log level follows `RUST_LOG`.

use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;
use std::time::Duration;

use ledger_mirror::{Catalog, GroupMember, GroupSizeField, PollingGroup, SimulatedNode, GROUPS_SCOPE};
use table_sync::{EditEvent, ListModel, NetworkFailure, SyncConfig, SyncDriver, SyncEvent};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

const NODE_URL: &str = "http://127.0.0.1:8888";

fn seed(node: &SimulatedNode) {
    let groups = [("Chess club", vec!["games"]), ("Garden", vec!["outdoor", "weekly"]), ("Budget committee", vec![])];
    for (i, (name, tags)) in groups.into_iter().enumerate() {
        let id = i as u64 + 1;
        node.upsert(
            GROUPS_SCOPE,
            &PollingGroup { id, name: name.to_string(), tags: tags.into_iter().map(String::from).collect() },
        );
        for (j, account) in ["alice", "bob", "carol", "dave"].iter().take(i + 2).enumerate() {
            node.upsert(&id.to_string(), &GroupMember { account: account.to_string(), weight: j as u32 + 1, tags: vec![] });
        }
    }
}

async fn run_for(driver: &mut SyncDriver<SimulatedNode>, catalog: &Catalog, period: Duration) {
    driver.run(tokio::time::sleep(period)).await;
    for event in catalog.process_events() {
        match event {
            EditEvent::PendingAddSettled { draft_id, row, .. } => {
                info!("group {} confirmed as {} ({})", draft_id, row.id, row.name)
            }
            other => info!("groups: {:?}", other),
        }
    }
}

fn print_groups(catalog: &Catalog, list: &Rc<RefCell<ListModel<PollingGroup>>>) {
    list.borrow_mut().refresh_virtual_fields();
    let groups = catalog.groups();
    let groups = groups.borrow();
    let list = list.borrow();
    println!("{:>20} {:<20} {:>8} {:<10}", "id", "name", "members", "state");
    for position in 0..list.len() {
        let Some((group, state)) = list.row_at(groups.cache(), position) else {
            continue;
        };
        let members = match list.virtual_value(groups.cache(), position, GroupSizeField::ROLE) {
            Some((count, _)) if !count.is_null() => count.to_string(),
            _ => "?".to_string(),
        };
        println!("{:>20} {:<20} {:>8} {:<10}", group.id, group.name, members, state.to_string());
    }
    println!();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig { sync_interval_ms: 200, ..SyncConfig::default() },
    };
    let cycle = config.sync_interval() * 3;

    let node = SimulatedNode::new("5e1f").with_latency(Duration::from_millis(20));
    seed(&node);

    let mut driver = SyncDriver::new(node, config.clone());
    let mut events = driver.subscribe();
    let catalog = Catalog::new(&config, driver.registry());
    let list = catalog.group_rows();

    driver.set_node(NODE_URL)?;
    run_for(&mut driver, &catalog, cycle).await;
    // member lists open on the first field refresh
    list.borrow_mut().refresh_virtual_fields();
    run_for(&mut driver, &catalog, cycle).await;
    println!("== initial load ({:?})", driver.status());
    print_groups(&catalog, &list);

    // draft a group with one member, then let the node accept both
    let groups = catalog.groups();
    let draft_id = groups.borrow_mut().draft_add().set("name", "Book club").set("tags", vec!["reading"]).commit()?;
    catalog.members(draft_id).borrow_mut().draft_add().set("account", "erin").set("weight", 2).commit()?;
    groups.borrow_mut().mark_edits_pending()?;
    catalog.members(draft_id).borrow_mut().mark_edits_pending()?;
    println!("== drafted group {}", draft_id);
    print_groups(&catalog, &list);

    let real_id = driver.api().next_id::<PollingGroup>(GROUPS_SCOPE);
    driver.api().upsert(GROUPS_SCOPE, &PollingGroup { id: real_id, name: "Book club".into(), tags: vec!["reading".into()] });
    driver.api().upsert(&real_id.to_string(), &GroupMember { account: "erin".into(), weight: 2, tags: vec![] });
    run_for(&mut driver, &catalog, cycle).await;
    run_for(&mut driver, &catalog, cycle).await;
    println!("== after confirmation");
    print_groups(&catalog, &list);

    driver.api().set_outage(Some(NetworkFailure::ConnectionRefused));
    run_for(&mut driver, &catalog, cycle).await;
    println!("== during outage: {:?}", driver.status());
    driver.api().set_outage(None);
    driver.api().lose_journal_entries(4);
    driver.api().upsert(GROUPS_SCOPE, &PollingGroup { id: real_id + 1, name: "Choir".into(), tags: vec![] });
    driver.api().upsert(GROUPS_SCOPE, &PollingGroup { id: 1, name: "Chess & Go club".into(), tags: vec![] });
    run_for(&mut driver, &catalog, cycle).await;
    println!("== after recovery: {:?}, journal at {:?}", driver.status(), driver.journal_last_seen());
    print_groups(&catalog, &list);

    let head = driver.chain().head_block_num;
    driver.request_block(head)?;
    run_for(&mut driver, &catalog, cycle).await;
    driver.disconnect();

    let mut errors = 0;
    loop {
        match events.try_recv() {
            Ok(SyncEvent::NodeError(_) | SyncEvent::ResponseNonsense) => errors += 1,
            Ok(SyncEvent::Block { number, payload }) => println!("block {}: {}", number, payload["id"]),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    println!("{} node errors during the run", errors);
    Ok(())
}
