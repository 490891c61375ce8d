use crate::cache::{CacheReader, CellCache};
use crate::cell::CellInstance;
use crate::error::consistency_violation;
use crate::session::SessionContext;
use realmstream_common::{CancelScope, CellDefinition, CellId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct RunningCell {
    instance: Arc<dyn CellInstance>,
    scope: CancelScope,
    rate_hz: f32,
}

/// Owns every running cell instance and the cell cache.
///
/// Stopping a cell always cancels its scope and disposes the instance before
/// the cache entry is removed.
#[derive(Debug)]
pub struct RuntimeScheduler {
    ctx: Arc<SessionContext>,
    running: HashMap<CellId, RunningCell>,
    cache: CellCache,
    started: u64,
    stopped: u64,
}

impl RuntimeScheduler {
    pub fn new(ctx: Arc<SessionContext>, cache: CellCache) -> Self {
        Self {
            ctx,
            running: HashMap::new(),
            cache,
            started: 0,
            stopped: 0,
        }
    }

    /// Start `instance` at the rate for `bucket` and publish it in the cache.
    pub fn start(&mut self, def: &CellDefinition, instance: Arc<dyn CellInstance>, bucket: usize) {
        if self.running.contains_key(&def.id) {
            consistency_violation(format!("cell {} started twice", def.id));
        }
        let rate_hz = self.ctx.config().rate_for_bucket(bucket);
        let scope = self.ctx.scope.child(format!("cell:{}", def.id));
        instance.start(rate_hz, scope.clone());
        self.cache.insert(def, instance.clone());
        self.running.insert(
            def.id.clone(),
            RunningCell {
                instance,
                scope,
                rate_hz,
            },
        );
        self.started += 1;
        debug!(cell = %def.id, rate_hz, bucket, "cell started");
    }

    /// Adjust the rate of a running cell to its new bucket. Returns true if
    /// the rate changed.
    pub fn retarget(&mut self, id: &CellId, bucket: usize) -> bool {
        let rate_hz = self.ctx.config().rate_for_bucket(bucket);
        let Some(cell) = self.running.get_mut(id) else {
            return false;
        };
        if cell.rate_hz == rate_hz {
            return false;
        }
        cell.instance.retarget(rate_hz);
        cell.rate_hz = rate_hz;
        debug!(cell = %id, rate_hz, "cell retargeted");
        true
    }

    /// Stop and dispose `id`. Returns false if it was not running.
    pub fn stop(&mut self, id: &CellId) -> bool {
        let Some(cell) = self.running.remove(id) else {
            return false;
        };
        cell.scope.cancel();
        cell.instance.dispose();
        self.cache.remove(id);
        self.stopped += 1;
        debug!(cell = %id, "cell stopped");
        true
    }

    /// Stop every running cell.
    pub fn stop_all(&mut self) -> usize {
        let ids: Vec<CellId> = self.running.keys().cloned().collect();
        ids.iter().filter(|id| self.stop(id)).count()
    }

    /// Stop everything and hand the cache back.
    pub fn into_cache(mut self) -> CellCache {
        self.stop_all();
        std::mem::take(&mut self.cache)
    }

    pub fn cache(&self) -> CacheReader {
        self.cache.reader()
    }

    pub fn is_running(&self, id: &CellId) -> bool {
        self.running.contains_key(id)
    }

    pub fn running_ids(&self) -> impl Iterator<Item = &CellId> {
        self.running.keys()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn rate_of(&self, id: &CellId) -> Option<f32> {
        self.running.get(id).map(|c| c.rate_hz)
    }

    pub fn instance(&self, id: &CellId) -> Option<&Arc<dyn CellInstance>> {
        self.running.get(id).map(|c| &c.instance)
    }

    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn stopped(&self) -> u64 {
        self.stopped
    }
}
