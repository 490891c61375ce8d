//! The running-cell contract and a reference implementation.

use crate::error::StreamError;
use crate::lod::LodQuality;
use async_trait::async_trait;
use parking_lot::Mutex;
use realmstream_common::{CancelScope, CellDefinition, CellId, Manifest};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Handle to one cell's simulation.
///
/// The update loop is opaque to the scheduler: it only starts it, changes its
/// rate and disposes it.
pub trait CellInstance: Send + Sync + fmt::Debug {
    fn id(&self) -> &CellId;
    /// Start the update loop at `rate_hz`; it stops when `scope` is cancelled.
    fn start(&self, rate_hz: f32, scope: CancelScope);
    /// Change the update rate without restarting.
    fn retarget(&self, rate_hz: f32);
    /// Release everything held by the cell. Idempotent.
    fn dispose(&self);
    /// Started, not disposed, and its scope is still live.
    fn is_current(&self) -> bool;
    fn is_broken(&self) -> bool;
    fn tick_number(&self) -> u64;
}

/// Builds cell instances from a definition and its manifest.
#[async_trait]
pub trait CellFactory: Send + Sync {
    async fn create(
        &self,
        definition: &CellDefinition,
        manifest: Manifest,
    ) -> Result<Arc<dyn CellInstance>, StreamError>;

    /// Build the stand-in shown when the cell does not run. Placeholders need
    /// no manifest and are never started, only disposed.
    async fn create_placeholder(
        &self,
        definition: &CellDefinition,
        quality: LodQuality,
    ) -> Result<Arc<dyn CellInstance>, StreamError>;
}

#[derive(Debug)]
enum LoopState {
    Idle,
    Running { scope: CancelScope },
    Disposed,
}

/// Reference cell: a tokio task advancing a tick counter at a retargetable
/// rate.
#[derive(Debug)]
pub struct TickingCell {
    id: CellId,
    manifest: Manifest,
    runtime: Handle,
    ticks: Arc<AtomicU64>,
    rate: watch::Sender<f32>,
    state: Mutex<LoopState>,
    broken: AtomicBool,
    lod: Option<LodQuality>,
    counters: Arc<FactoryCounters>,
}

impl TickingCell {
    fn new(id: CellId, manifest: Manifest, runtime: Handle, counters: Arc<FactoryCounters>) -> Self {
        let (rate, _) = watch::channel(1.0);
        Self {
            id,
            manifest,
            runtime,
            ticks: Arc::new(AtomicU64::new(0)),
            rate,
            state: Mutex::new(LoopState::Idle),
            broken: AtomicBool::new(false),
            lod: None,
            counters,
        }
    }

    /// Quality of this placeholder; `None` for a runnable cell.
    pub fn lod(&self) -> Option<LodQuality> {
        self.lod
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn rate_hz(&self) -> f32 {
        *self.rate.borrow()
    }
}

fn period(rate_hz: f32) -> Duration {
    Duration::from_secs_f32(1.0 / rate_hz.max(0.1))
}

impl CellInstance for TickingCell {
    fn id(&self) -> &CellId {
        &self.id
    }

    fn start(&self, rate_hz: f32, scope: CancelScope) {
        let mut state = self.state.lock();
        if !matches!(*state, LoopState::Idle) {
            tracing::warn!(cell = %self.id, "start ignored, cell already started");
            return;
        }
        self.rate.send_replace(rate_hz);
        let mut rate_rx = self.rate.subscribe();
        let ticks = self.ticks.clone();
        let loop_scope = scope.clone();
        self.runtime.spawn(async move {
            loop {
                let hz = *rate_rx.borrow_and_update();
                tokio::select! {
                    biased;
                    _ = loop_scope.cancelled() => break,
                    changed = rate_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(period(hz)) => {
                        ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });
        *state = LoopState::Running { scope };
    }

    fn retarget(&self, rate_hz: f32) {
        self.rate.send_replace(rate_hz);
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, LoopState::Disposed) {
            LoopState::Running { scope } => {
                scope.cancel();
                self.counters.disposed.fetch_add(1, Ordering::Relaxed);
            }
            LoopState::Idle => {
                self.counters.disposed.fetch_add(1, Ordering::Relaxed);
            }
            LoopState::Disposed => {}
        }
    }

    fn is_current(&self) -> bool {
        match &*self.state.lock() {
            LoopState::Running { scope } => !scope.is_cancelled(),
            _ => false,
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    fn tick_number(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Creation and disposal counts shared by a factory and its cells.
#[derive(Debug, Default)]
pub struct FactoryCounters {
    created: AtomicUsize,
    disposed: AtomicUsize,
}

impl FactoryCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::Relaxed)
    }

    /// Instances created and not yet disposed.
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.disposed())
    }
}

/// Factory producing [`TickingCell`]s, with optional build delay and
/// per-cell failure injection.
#[derive(Debug)]
pub struct TickingCellFactory {
    runtime: Handle,
    counters: Arc<FactoryCounters>,
    delay: Mutex<Duration>,
    failing: Mutex<HashSet<CellId>>,
}

impl TickingCellFactory {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            counters: Arc::new(FactoryCounters::default()),
            delay: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn counters(&self) -> Arc<FactoryCounters> {
        self.counters.clone()
    }

    /// Delay every build by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_failing(&self, id: &CellId, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }
}

#[async_trait]
impl CellFactory for TickingCellFactory {
    async fn create(
        &self,
        definition: &CellDefinition,
        manifest: Manifest,
    ) -> Result<Arc<dyn CellInstance>, StreamError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&definition.id) {
            return Err(StreamError::load(&definition.id, "instantiation failed"));
        }
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(TickingCell::new(
            definition.id.clone(),
            manifest,
            self.runtime.clone(),
            self.counters.clone(),
        )))
    }

    /// Placeholders build without the configured delay.
    async fn create_placeholder(
        &self,
        definition: &CellDefinition,
        quality: LodQuality,
    ) -> Result<Arc<dyn CellInstance>, StreamError> {
        if self.failing.lock().contains(&definition.id) {
            return Err(StreamError::load(&definition.id, "placeholder failed"));
        }
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        let mut cell = TickingCell::new(
            definition.id.clone(),
            Manifest::empty(),
            self.runtime.clone(),
            self.counters.clone(),
        );
        cell.lod = Some(quality);
        Ok(Arc::new(cell))
    }
}
