//! Ledger mirror: the polling-group tables of a voting contract, kept in sync
//! with a ledger node through `table_sync`.
//!
//! # Example
//! ```rust
//! use ledger_mirror::{Catalog, PollingGroup, SimulatedNode};
//! use table_sync::{SyncConfig, SyncDriver};
//!
//! let node = SimulatedNode::new("cafe");
//! node.upsert("global", &PollingGroup { id: 1, name: "Chess".into(), tags: vec![] });
//!
//! let config = SyncConfig::default();
//! let driver = SyncDriver::new(node, config.clone());
//! let catalog = Catalog::new(&config, driver.registry());
//! let groups = catalog.group_rows();
//! assert!(groups.borrow().is_empty());
//! ```

pub mod node;
pub mod tables;

pub use node::SimulatedNode;
pub use tables::{Catalog, GroupMember, GroupSizeField, PollingGroup, GROUPS_SCOPE};
