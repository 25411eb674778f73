//! Local mirrors of remote ledger tables.
//!
//! A [`Table`] caches the rows of one remote table scope, layers local drafts
//! over them and reconciles both with authoritative replies. A [`SyncDriver`]
//! keeps a set of tables current by polling a node's journal.

pub mod api;
mod backup;
mod cache;
mod config;
mod driver;
mod error;
mod journal;
mod merge;
pub mod name;
mod projection;
pub mod row;
mod state;
mod table;

pub use api::{ChainInfo, Endpoint, GetTableRows, NetworkFailure, RemoteApi};
pub use backup::{BackupLedger, Visit};
pub use cache::{RowCache, RowChanges};
pub use config::SyncConfig;
pub use driver::{ChainState, SyncDriver, SyncEvent, SyncStatus, TableRegistry};
pub use error::{Error, Result};
pub use journal::{EntryKind, JournalAction, JournalEntry, JournalTracker};
pub use merge::MergeReport;
pub use projection::{ListModel, ModelEvent, Projection, VirtualField, VirtualFieldFactory};
pub use row::{FieldMap, Row, RowId, BASE_DRAFT_ID};
pub use state::LoadState;
pub use table::{AddBuilder, EditBuilder, EditEvent, Fetch, Table, TableHandle, TableQuery, REFRESH_TIMEOUT};
