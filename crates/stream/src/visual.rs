use crate::config::StreamConfig;
use realmstream_common::CellId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisualState {
    ShowingFullCell,
    ShowingPlaceholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    state: VisualState,
    dirty: bool,
}

/// State a cell should show given its bucket and what it shows now.
///
/// Empty cells are always full. A full cell stays full until its bucket passes
/// `limit + hysteresis`; a placeholder only turns full again at `limit`.
pub fn resolve(
    current: Option<VisualState>,
    bucket: usize,
    is_empty: bool,
    limit: usize,
    hysteresis: usize,
) -> VisualState {
    if is_empty {
        return VisualState::ShowingFullCell;
    }
    let threshold = match current {
        Some(VisualState::ShowingFullCell) => limit + hysteresis,
        _ => limit,
    };
    if bucket <= threshold {
        VisualState::ShowingFullCell
    } else {
        VisualState::ShowingPlaceholder
    }
}

/// Per-cell full/placeholder choice.
#[derive(Debug)]
pub struct VisualStateResolver {
    limit: usize,
    hysteresis: usize,
    states: HashMap<CellId, Entry>,
}

impl VisualStateResolver {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            limit: config.full_cell_bucket_limit,
            hysteresis: config.lod_hysteresis,
            states: HashMap::new(),
        }
    }

    /// Re-resolve `id` after its partition info changed. Returns true and marks
    /// the entry dirty if the state changed (or the cell is new).
    pub fn update(&mut self, id: &CellId, bucket: usize, is_empty: bool) -> bool {
        let current = self.states.get(id).map(|e| e.state);
        let next = resolve(current, bucket, is_empty, self.limit, self.hysteresis);
        if current == Some(next) {
            return false;
        }
        tracing::debug!(cell = %id, ?next, bucket, "visual state changed");
        self.states.insert(
            id.clone(),
            Entry {
                state: next,
                dirty: true,
            },
        );
        true
    }

    pub fn state(&self, id: &CellId) -> Option<VisualState> {
        self.states.get(id).map(|e| e.state)
    }

    pub fn is_full(&self, id: &CellId) -> bool {
        self.state(id) == Some(VisualState::ShowingFullCell)
    }

    /// Entries whose state changed since the last call, clearing the flag.
    pub fn take_dirty(&mut self) -> Vec<(CellId, VisualState)> {
        let mut out = Vec::new();
        for (id, entry) in self.states.iter_mut() {
            if std::mem::take(&mut entry.dirty) {
                out.push((id.clone(), entry.state));
            }
        }
        out
    }
}
