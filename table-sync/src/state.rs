use std::fmt;

use serde::{Deserialize, Serialize};

/// Load or edit status of one cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    /// Believed to match the remote record.
    Loaded,
    /// Placeholder carrying only the id; the value has not arrived yet.
    Loading,
    /// Loaded, but the remote record is known to have changed.
    Stale,
    DraftEdit,
    DraftAdd,
    DraftDelete,
    PendingEdit,
    PendingAdd,
    PendingDelete,
}

impl LoadState {
    pub fn is_draft(self) -> bool {
        matches!(self, LoadState::DraftEdit | LoadState::DraftAdd | LoadState::DraftDelete)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, LoadState::PendingEdit | LoadState::PendingAdd | LoadState::PendingDelete)
    }

    /// Any local edit, drafted or submitted.
    pub fn is_edited(self) -> bool {
        self.is_draft() || self.is_pending()
    }

    pub fn is_add(self) -> bool {
        matches!(self, LoadState::DraftAdd | LoadState::PendingAdd)
    }

    /// The state a draft moves to once submitted.
    pub fn promoted(self) -> Option<LoadState> {
        match self {
            LoadState::DraftEdit => Some(LoadState::PendingEdit),
            LoadState::DraftAdd => Some(LoadState::PendingAdd),
            LoadState::DraftDelete => Some(LoadState::PendingDelete),
            _ => None,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
