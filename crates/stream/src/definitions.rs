use realmstream_common::{CellCoord, CellDefinition, CellId};
use std::collections::HashMap;

/// Resolved cell definitions of one realm session.
///
/// Each coordinate belongs to at most one definition. A definition that would
/// claim an already-owned coordinate is rejected whole.
#[derive(Debug, Default)]
pub struct DefinitionIndex {
    by_coord: HashMap<CellCoord, CellId>,
    by_id: HashMap<CellId, CellDefinition>,
}

impl DefinitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `def`. Returns false if it is already known or overlaps another
    /// definition.
    pub fn insert(&mut self, def: CellDefinition) -> bool {
        if self.by_id.contains_key(&def.id) {
            return false;
        }
        if let Some(owner) = def.coords.iter().find_map(|c| self.by_coord.get(c)) {
            tracing::warn!(cell = %def.id, %owner, "definition overlaps an existing cell, ignored");
            return false;
        }
        for coord in &def.coords {
            self.by_coord.insert(*coord, def.id.clone());
        }
        self.by_id.insert(def.id.clone(), def);
        true
    }

    pub fn get(&self, id: &CellId) -> Option<&CellDefinition> {
        self.by_id.get(id)
    }

    pub fn at(&self, coord: CellCoord) -> Option<&CellDefinition> {
        self.by_coord.get(&coord).and_then(|id| self.by_id.get(id))
    }

    pub fn contains_coord(&self, coord: CellCoord) -> bool {
        self.by_coord.contains_key(&coord)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellDefinition> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Definitions that are not synthesized empties.
    pub fn populated(&self) -> usize {
        self.by_id.values().filter(|d| !d.is_empty).count()
    }
}
