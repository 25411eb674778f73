use crate::state::LoadState;

/// Counts of what one batch of authoritative rows did to a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub settled: usize,
    pub invalidated: usize,
}

impl MergeReport {
    pub fn total_changes(&self) -> usize {
        self.inserted + self.updated
    }
}

/// How an authoritative row is folded over the cached row with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeDecision {
    /// No cached row: insert it.
    Insert,
    /// A placeholder or pending add: fill it, then look for a matching
    /// locally added record.
    Fill,
    /// Plain refresh of a loaded or stale row.
    Overwrite,
    /// The remote changed a row carrying a local draft, or resurrected a row
    /// with a submitted delete. The local edit is discarded.
    Invalidate,
    /// The remote answered a submitted edit.
    Settle,
}

pub(crate) fn resolve_incoming(cached: Option<LoadState>) -> MergeDecision {
    match cached {
        None => MergeDecision::Insert,
        Some(LoadState::Loading | LoadState::PendingAdd) => MergeDecision::Fill,
        Some(LoadState::Loaded | LoadState::Stale) => MergeDecision::Overwrite,
        Some(
            LoadState::DraftAdd
            | LoadState::DraftEdit
            | LoadState::DraftDelete
            | LoadState::PendingDelete,
        ) => MergeDecision::Invalidate,
        Some(LoadState::PendingEdit) => MergeDecision::Settle,
    }
}

/// How a removal confirmed by the remote affects the removed row's local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemovalDecision {
    Plain,
    SettleDelete,
    Invalidate,
}

pub(crate) fn resolve_removal(state: LoadState) -> RemovalDecision {
    match state {
        LoadState::PendingDelete => RemovalDecision::SettleDelete,
        s if s.is_edited() => RemovalDecision::Invalidate,
        _ => RemovalDecision::Plain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_precedence() {
        assert_eq!(resolve_incoming(None), MergeDecision::Insert);
        assert_eq!(resolve_incoming(Some(LoadState::Loading)), MergeDecision::Fill);
        assert_eq!(resolve_incoming(Some(LoadState::PendingAdd)), MergeDecision::Fill);
        assert_eq!(resolve_incoming(Some(LoadState::Stale)), MergeDecision::Overwrite);
        assert_eq!(resolve_incoming(Some(LoadState::DraftEdit)), MergeDecision::Invalidate);
        assert_eq!(resolve_incoming(Some(LoadState::DraftAdd)), MergeDecision::Invalidate);
        assert_eq!(resolve_incoming(Some(LoadState::PendingDelete)), MergeDecision::Invalidate);
        assert_eq!(resolve_incoming(Some(LoadState::PendingEdit)), MergeDecision::Settle);
    }

    #[test]
    fn test_removal_precedence() {
        assert_eq!(resolve_removal(LoadState::Loaded), RemovalDecision::Plain);
        assert_eq!(resolve_removal(LoadState::Loading), RemovalDecision::Plain);
        assert_eq!(resolve_removal(LoadState::PendingDelete), RemovalDecision::SettleDelete);
        assert_eq!(resolve_removal(LoadState::PendingEdit), RemovalDecision::Invalidate);
        assert_eq!(resolve_removal(LoadState::DraftAdd), RemovalDecision::Invalidate);
    }
}
