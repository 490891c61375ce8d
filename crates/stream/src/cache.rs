use crate::cell::CellInstance;
use parking_lot::RwLock;
use realmstream_common::{CellCoord, CellDefinition, CellId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CachedCell {
    definition: CellDefinition,
    instance: Arc<dyn CellInstance>,
}

#[derive(Debug, Default)]
struct CacheInner {
    by_coord: HashMap<CellCoord, CellId>,
    cells: HashMap<CellId, CachedCell>,
}

/// Coordinate to live cell registry.
///
/// Only the runtime scheduler holds a `CellCache` and can write to it; every
/// other party gets a [`CacheReader`]. Readers must expect entries to appear
/// and disappear between ticks.
#[derive(Debug, Default)]
pub struct CellCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl CellCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> CacheReader {
        CacheReader {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn insert(&mut self, definition: &CellDefinition, instance: Arc<dyn CellInstance>) {
        let mut inner = self.inner.write();
        for coord in &definition.coords {
            inner.by_coord.insert(*coord, definition.id.clone());
        }
        inner.cells.insert(
            definition.id.clone(),
            CachedCell {
                definition: definition.clone(),
                instance,
            },
        );
    }

    pub(crate) fn remove(&mut self, id: &CellId) -> bool {
        let mut inner = self.inner.write();
        let Some(cell) = inner.cells.remove(id) else {
            return false;
        };
        for coord in &cell.definition.coords {
            if inner.by_coord.get(coord) == Some(id) {
                inner.by_coord.remove(coord);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of a [`CellCache`].
#[derive(Debug, Clone)]
pub struct CacheReader {
    inner: Arc<RwLock<CacheInner>>,
}

impl CacheReader {
    /// Id of the cell occupying `coord`, if one is cached.
    pub fn cell_at(&self, coord: CellCoord) -> Option<CellId> {
        self.inner.read().by_coord.get(&coord).cloned()
    }

    pub fn instance_at(&self, coord: CellCoord) -> Option<Arc<dyn CellInstance>> {
        let inner = self.inner.read();
        let id = inner.by_coord.get(&coord)?;
        inner.cells.get(id).map(|c| c.instance.clone())
    }

    pub fn instance(&self, id: &CellId) -> Option<Arc<dyn CellInstance>> {
        self.inner.read().cells.get(id).map(|c| c.instance.clone())
    }

    pub fn definition(&self, id: &CellId) -> Option<CellDefinition> {
        self.inner.read().cells.get(id).map(|c| c.definition.clone())
    }

    /// Whether a cached, running instance covers `coord`.
    pub fn is_active_at(&self, coord: CellCoord) -> bool {
        self.instance_at(coord).is_some_and(|i| i.is_current())
    }

    pub fn contains(&self, id: &CellId) -> bool {
        self.inner.read().cells.contains_key(id)
    }

    pub fn ids(&self) -> Vec<CellId> {
        self.inner.read().cells.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmstream_common::CancelScope;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct StubCell {
        id: CellId,
        running: AtomicBool,
    }

    impl StubCell {
        fn new(id: &CellId) -> Arc<Self> {
            Arc::new(Self {
                id: id.clone(),
                running: AtomicBool::new(true),
            })
        }
    }

    impl CellInstance for StubCell {
        fn id(&self) -> &CellId {
            &self.id
        }
        fn start(&self, _rate_hz: f32, _scope: CancelScope) {}
        fn retarget(&self, _rate_hz: f32) {}
        fn dispose(&self) {
            self.running.store(false, Ordering::Relaxed);
        }
        fn is_current(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }
        fn is_broken(&self) -> bool {
            false
        }
        fn tick_number(&self) -> u64 {
            0
        }
    }

    fn block(id: &str, x0: i32, width: i32) -> CellDefinition {
        let coords: Vec<CellCoord> = (x0..x0 + width)
            .flat_map(|x| (0..2).map(move |z| CellCoord::new(x, z)))
            .collect();
        CellDefinition::new(CellId::new(id), coords[0], coords, None)
    }

    #[test]
    fn every_covered_coordinate_maps_to_its_owner() {
        let mut cache = CellCache::new();
        let reader = cache.reader();
        let defs: Vec<CellDefinition> = (0..5).map(|i| block(&format!("b{i}"), i * 3, 1 + i % 3)).collect();
        for def in &defs {
            cache.insert(def, StubCell::new(&def.id));
        }
        for def in &defs {
            for coord in &def.coords {
                assert_eq!(reader.cell_at(*coord).as_ref(), Some(&def.id));
            }
        }
        assert_eq!(reader.cell_at(CellCoord::new(-1, 0)), None);
        assert_eq!(reader.cell_at(CellCoord::new(0, 7)), None);
        assert_eq!(reader.len(), 5);
    }

    #[test]
    fn removal_clears_every_coordinate() {
        let mut cache = CellCache::new();
        let reader = cache.reader();
        let def = block("wide", 0, 3);
        cache.insert(&def, StubCell::new(&def.id));
        assert!(reader.is_active_at(CellCoord::new(2, 1)));
        assert!(cache.remove(&def.id));
        assert!(!cache.remove(&def.id));
        for coord in &def.coords {
            assert!(reader.cell_at(*coord).is_none());
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn inactive_instance_is_not_active() {
        let mut cache = CellCache::new();
        let def = block("a", 0, 1);
        let cell = StubCell::new(&def.id);
        cache.insert(&def, cell.clone());
        cell.dispose();
        assert!(!cache.reader().is_active_at(CellCoord::ORIGIN));
        assert!(cache.reader().contains(&def.id));
    }
}
