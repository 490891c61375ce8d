//! The streaming scheduler.
//!
//! [`Streamer::tick`] is the only place steady-state decisions are made. Each
//! tick runs, in order: realm events, observer sampling, range, pointer
//! resolution, partitioning, LOD and eviction, load completion, teleport
//! progress, admission and placeholder planning. The admission and
//! placeholder budgets are checked at the end of every tick.

use crate::admission::{AdmissionGate, Candidate, Occupant};
use crate::cache::{CacheReader, CellCache};
use crate::definitions::DefinitionIndex;
use crate::error::{StreamError, consistency_violation};
use crate::load::{LoadEvent, LoadPipeline};
use crate::lod::{LodCandidate, LodPlanner, LodQuality, PlaceholderSet, Representation};
use crate::notify::{Notice, NoticeKind};
use crate::partition::{ObserverSampler, Partitioner};
use crate::pointers::PointerResolver;
use crate::range::RangeTracker;
use crate::realm::{RealmController, RealmEvent};
use crate::runtime::RuntimeScheduler;
use crate::session::{SessionContext, StreamServices};
use crate::stats::{StreamStats, TickTimer};
use crate::teleport::{ReadinessReport, TeleportCoordinator, TargetStatus, TeleportResolution};
use crate::visual::{VisualState, VisualStateResolver};
use realmstream_common::{CellCoord, CellDefinition, CellId, RealmDescriptor, SessionId, Transform};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, trace, warn};

/// Load state of a cell as reported to inspectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellLoadState {
    /// Synthesized for a coordinate without catalog content; never loaded.
    Empty,
    Pending,
    Loading,
    /// Not running; its placeholder is shown.
    Placeholder,
    Running,
    Failed,
}

/// One resolved cell as seen at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    pub id: CellId,
    pub base: CellCoord,
    pub coords: usize,
    pub load_state: CellLoadState,
    pub visual: Option<VisualState>,
    pub placeholder: Option<LodQuality>,
    pub bucket: Option<usize>,
    pub raw_sqr_distance: Option<f32>,
    pub is_behind: bool,
    pub rate_hz: Option<f32>,
    pub tick_number: Option<u64>,
}

/// Point-in-time view of the whole streamer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub realm: Option<String>,
    pub session: Option<SessionId>,
    pub observer: Transform,
    pub center: Option<CellCoord>,
    /// Coordinates in discovery range.
    pub in_range: usize,
    pub current_cell: Option<CellId>,
    pub teleport_target: Option<CellCoord>,
    pub fixed: bool,
    pub all_resolved: bool,
    pub budget: usize,
    /// Cells ordered by base coordinate.
    pub cells: Vec<CellSnapshot>,
    pub stats: StreamStats,
}

/// Components of one realm session.
#[derive(Debug)]
struct RealmSession {
    ctx: Arc<SessionContext>,
    range: RangeTracker,
    pointers: PointerResolver,
    definitions: DefinitionIndex,
    sampler: ObserverSampler,
    partitioner: Partitioner,
    gate: AdmissionGate,
    visuals: VisualStateResolver,
    loads: LoadPipeline,
    placeholder_loads: LoadPipeline,
    placeholders: PlaceholderSet,
    lods: LodPlanner,
    runtime: RuntimeScheduler,
    teleports: TeleportCoordinator,
    target_failure: Option<StreamError>,
}

impl RealmSession {
    fn open(ctx: Arc<SessionContext>, cache: CellCache) -> Self {
        let config = ctx.config();
        Self {
            range: RangeTracker::new(config.cell_size, config.load_radius, config.position_tolerance),
            pointers: PointerResolver::new(ctx.clone()),
            definitions: DefinitionIndex::new(),
            sampler: ObserverSampler::new(config.position_tolerance, config.angle_tolerance_deg),
            partitioner: Partitioner::new(config),
            gate: AdmissionGate::new(config),
            visuals: VisualStateResolver::new(config),
            loads: LoadPipeline::new(ctx.clone()),
            placeholder_loads: LoadPipeline::new(ctx.clone()),
            placeholders: PlaceholderSet::new(),
            lods: LodPlanner::new(config),
            runtime: RuntimeScheduler::new(ctx.clone(), cache),
            teleports: TeleportCoordinator::new(
                config.cell_size,
                config.teleport_timeout(),
                config.teleport_grace(),
                config.teleport_holding_height,
            ),
            target_failure: None,
            ctx,
        }
    }

    fn tick(&mut self, player: &mut Transform, now: Instant, stats: &mut StreamStats) {
        self.sampler.sample(player);
        let sample = self.sampler.current();
        if let Some(sample) = sample {
            self.range.update(sample.position);
        }

        let resolved = self.pointers.tick(&self.range);
        stats.definitions_resolved = resolved.definitions.len();
        for def in resolved.definitions {
            let (id, is_empty) = (def.id.clone(), def.is_empty);
            if self.definitions.insert(def) && is_empty {
                self.visuals.update(&id, 0, true);
            }
        }

        stats.partition_changes = self.partitioner.poll();
        let sample_dirty = self.sampler.take_dirty();
        self.partitioner
            .schedule(sample, sample_dirty, self.definitions.iter());

        let pinned = self.pinned_id();
        let unload_bucket = self.ctx.config().unload_bucket;
        for id in self.partitioner.take_dirty() {
            let Some(info) = self.partitioner.info(&id).copied() else {
                continue;
            };
            self.visuals.update(&id, info.bucket, false);
            if pinned.as_ref() == Some(&id) {
                continue;
            }
            if info.bucket >= unload_bucket {
                stats.disposed += usize::from(self.release(&id));
                stats.disposed += usize::from(self.release_placeholder(&id));
            } else {
                self.runtime.retarget(&id, info.bucket);
            }
        }
        for (id, state) in self.visuals.take_dirty() {
            if state == VisualState::ShowingPlaceholder && pinned.as_ref() != Some(&id) {
                stats.disposed += usize::from(self.release(&id));
            }
        }

        for event in self.loads.poll(now) {
            match event {
                LoadEvent::Ready { id, instance, .. } => {
                    let wanted = self
                        .definitions
                        .get(&id)
                        .filter(|_| pinned.as_ref() == Some(&id) || self.is_wanted(&id))
                        .cloned();
                    match wanted {
                        Some(def) => {
                            let bucket = self.partitioner.info(&id).map_or(0, |i| i.bucket);
                            self.runtime.start(&def, instance, bucket);
                            stats.started += 1;
                            // Swap: the full cell replaces its placeholder.
                            stats.disposed += usize::from(self.release_placeholder(&id));
                        }
                        None => {
                            debug!(cell = %id, "loaded cell no longer wanted");
                            instance.dispose();
                            stats.disposed += 1;
                        }
                    }
                }
                LoadEvent::Failed { id, error } => {
                    stats.failed += 1;
                    if pinned.as_ref() == Some(&id) {
                        self.target_failure = Some(error);
                    }
                }
                LoadEvent::Cancelled { .. } => {}
            }
        }
        for event in self.placeholder_loads.poll(now) {
            match event {
                LoadEvent::Ready {
                    id,
                    instance,
                    representation,
                } => match representation.placeholder_quality() {
                    Some(quality) if self.wants_placeholder(&id) => {
                        self.placeholders.show(&id, instance, quality);
                    }
                    _ => {
                        debug!(cell = %id, "placeholder no longer wanted");
                        instance.dispose();
                        stats.disposed += 1;
                    }
                },
                LoadEvent::Failed { .. } => stats.failed += 1,
                LoadEvent::Cancelled { .. } => {}
            }
        }

        if let Some(target) = self.teleports.target() {
            let status = self.status(target);
            match self.teleports.tick(&status, now) {
                Some(resolution) => self.finish_teleport(resolution, player),
                None => {
                    if let Some(hold) = self.teleports.holding_position() {
                        player.position = hold;
                    }
                }
            }
        }

        let observer =
            CellCoord::from_position(player.position, self.ctx.config().cell_size);
        if self.pointers.is_fixed() && !self.pointers.all_resolved() {
            trace!("fixed realm still resolving, admission deferred");
        } else {
            let admitted = self.admit(now, observer, stats);
            if self.teleports.is_pending() {
                trace!("teleport pending, placeholders deferred");
            } else {
                let remaining = self
                    .ctx
                    .config()
                    .max_admissions_per_tick
                    .saturating_sub(admitted);
                self.plan_placeholders(now, observer, remaining, stats);
            }
        }

        self.check_budgets();
        stats.loading = self.loads.loading_count();
        stats.running = self.runtime.running_count();
        stats.placeholders = self.placeholders.len();
        stats.reduced_placeholders = self.placeholders.count(LodQuality::Reduced);
        stats.placeholders_loading = self.placeholder_loads.loading_count();
    }

    fn check_budgets(&self) {
        let occupied = self.occupied();
        if occupied > self.gate.budget() {
            consistency_violation(format!(
                "{occupied} cells loading or running with a budget of {}",
                self.gate.budget()
            ));
        }
        let (full, reduced) = self.placeholder_slots();
        let (full_budget, reduced_budget) = self.lods.budgets();
        if full > full_budget || reduced > reduced_budget {
            consistency_violation(format!(
                "placeholders {full}/{reduced} exceed budgets {full_budget}/{reduced_budget}"
            ));
        }
        if let Some(id) = self.placeholders.ids().find(|id| self.runtime.is_running(id)) {
            consistency_violation(format!("cell {id} shows its placeholder while running"));
        }
    }

    /// Placeholder slots held (shown or loading) per quality.
    fn placeholder_slots(&self) -> (usize, usize) {
        let loading = self
            .placeholder_loads
            .loading_ids()
            .filter_map(|id| self.placeholder_loads.representation(id))
            .filter_map(Representation::placeholder_quality);
        let held = loading.chain(
            self.placeholders
                .ids()
                .filter_map(|id| self.placeholders.quality(id)),
        );
        held.fold((0, 0), |(full, reduced), quality| match quality {
            LodQuality::Full => (full + 1, reduced),
            LodQuality::Reduced => (full, reduced + 1),
        })
    }

    /// Whether `def` lies in the discovery range, or is exempt from it.
    fn in_reach(&self, def: &CellDefinition) -> bool {
        let statics = &self.ctx.config().static_pointers;
        self.pointers.is_fixed()
            || self.range.overlaps(&def.coords)
            || def.coords.iter().any(|c| statics.contains(c))
    }

    /// Start loads for the closest admissible cells. Returns how many started.
    fn admit(&mut self, now: Instant, observer: CellCoord, stats: &mut StreamStats) -> usize {
        let pinned = self.pinned_id();
        let unload_bucket = self.ctx.config().unload_bucket;
        let candidates: Vec<Candidate> = self
            .definitions
            .iter()
            .filter(|d| {
                !d.is_empty
                    && !self.loads.is_loading(&d.id)
                    && !self.runtime.is_running(&d.id)
                    && !self.loads.is_blocked(&d.id, now)
            })
            .filter_map(|d| {
                let info = self.partitioner.info(&d.id);
                if pinned.as_ref() == Some(&d.id) {
                    return Some(Candidate {
                        id: d.id.clone(),
                        base: d.base,
                        raw_sqr_distance: info.map_or(0.0, |i| i.raw_sqr_distance),
                        is_behind: false,
                        contains_observer: d.contains(observer),
                    });
                }
                let info = info?;
                let admissible =
                    info.bucket < unload_bucket && self.visuals.is_full(&d.id) && self.in_reach(d);
                admissible.then(|| Candidate {
                    id: d.id.clone(),
                    base: d.base,
                    raw_sqr_distance: info.raw_sqr_distance,
                    is_behind: info.is_behind,
                    contains_observer: d.contains(observer),
                })
            })
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let occupants: Vec<Occupant> = self
            .loads
            .loading_ids()
            .chain(self.runtime.running_ids())
            .map(|id| Occupant {
                id: id.clone(),
                raw_sqr_distance: self.partitioner.info(id).map_or(0.0, |i| i.raw_sqr_distance),
            })
            .collect();
        let decision = self.gate.decide(candidates, &occupants, pinned.as_ref());
        stats.waiting = decision.waiting;
        for id in &decision.preempt {
            stats.disposed += usize::from(self.release(id));
            stats.preempted += 1;
        }
        for id in &decision.admit {
            if let Some(def) = self.definitions.get(id).cloned() {
                self.loads.start(&def, Representation::Full);
                stats.admitted += 1;
            }
        }
        stats.admitted
    }

    /// Give placeholder slots to cells that do not run: those too far for a
    /// full representation, and, once the admission budget is full, those
    /// waiting for a slot. Loads started here share the per-tick cap with
    /// admission.
    fn plan_placeholders(
        &mut self,
        now: Instant,
        observer: CellCoord,
        max_loads: usize,
        stats: &mut StreamStats,
    ) {
        let unload_bucket = self.ctx.config().unload_bucket;
        let full_saturated = self.occupied() >= self.gate.budget();
        let mut wanted = HashSet::new();
        let mut candidates = Vec::new();
        for d in self.definitions.iter() {
            if d.is_empty || self.runtime.is_running(&d.id) || !self.in_reach(d) {
                continue;
            }
            let Some(info) = self.partitioner.info(&d.id) else {
                continue;
            };
            if info.bucket >= unload_bucket {
                continue;
            }
            let current = self.placeholder_quality(&d.id);
            if current.is_none()
                && ((self.visuals.is_full(&d.id) && !full_saturated)
                    || self.loads.is_loading(&d.id)
                    || self.placeholder_loads.is_blocked(&d.id, now))
            {
                continue;
            }
            wanted.insert(d.id.clone());
            candidates.push(LodCandidate {
                candidate: Candidate {
                    id: d.id.clone(),
                    base: d.base,
                    raw_sqr_distance: info.raw_sqr_distance,
                    is_behind: info.is_behind,
                    contains_observer: d.contains(observer),
                },
                current,
            });
        }

        let stale: Vec<CellId> = self
            .placeholders
            .ids()
            .chain(self.placeholder_loads.loading_ids())
            .filter(|id| !wanted.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            stats.disposed += usize::from(self.release_placeholder(id));
        }

        let plan = self.lods.plan(candidates, max_loads);
        for id in &plan.release {
            stats.disposed += usize::from(self.release_placeholder(id));
        }
        for (id, quality) in plan.load {
            if let Some(def) = self.definitions.get(&id).cloned() {
                self.placeholder_loads
                    .start(&def, Representation::Placeholder(quality));
                stats.placeholders_started += 1;
            }
        }
    }

    /// Cancel any load of `id` and stop its instance. Returns true if a
    /// running instance was disposed.
    fn release(&mut self, id: &CellId) -> bool {
        self.loads.cancel(id);
        self.runtime.stop(id)
    }

    /// Cancel any placeholder load of `id` and dispose the shown one.
    /// Returns true if a shown placeholder was disposed.
    fn release_placeholder(&mut self, id: &CellId) -> bool {
        self.placeholder_loads.cancel(id);
        self.placeholders.release(id)
    }

    /// Quality `id` holds, shown or loading.
    fn placeholder_quality(&self, id: &CellId) -> Option<LodQuality> {
        self.placeholders.quality(id).or_else(|| {
            self.placeholder_loads
                .representation(id)
                .and_then(Representation::placeholder_quality)
        })
    }

    fn wants_placeholder(&self, id: &CellId) -> bool {
        !self.runtime.is_running(id)
            && self
                .partitioner
                .info(id)
                .is_some_and(|i| i.bucket < self.ctx.config().unload_bucket)
    }

    fn is_wanted(&self, id: &CellId) -> bool {
        self.partitioner
            .info(id)
            .is_some_and(|i| i.bucket < self.ctx.config().unload_bucket)
            && self.visuals.is_full(id)
    }

    fn occupied(&self) -> usize {
        self.loads.loading_count() + self.runtime.running_count()
    }

    /// Id of the pending teleport's target cell, if it is resolved and not
    /// empty.
    fn pinned_id(&self) -> Option<CellId> {
        let target = self.teleports.target()?;
        self.definitions
            .at(target)
            .filter(|d| !d.is_empty)
            .map(|d| d.id.clone())
    }

    fn status(&self, target: CellCoord) -> TargetStatus {
        let definition = self.definitions.at(target).cloned();
        let failure = match &definition {
            None if self.pointers.is_failed(target) => Some(StreamError::Network(format!(
                "definition fetch for {target} failed"
            ))),
            _ => self.target_failure.clone(),
        };
        let definitions_complete = if self.pointers.is_fixed() {
            self.pointers.all_resolved()
        } else {
            self.pointers.is_processed(target)
        };
        TargetStatus {
            active: self.runtime.cache().is_active_at(target),
            definition,
            failure,
            definitions_complete,
        }
    }

    fn request_teleport(
        &mut self,
        target: CellCoord,
        player: &mut Transform,
        now: Instant,
    ) -> ReadinessReport {
        if self.teleports.target() != Some(target) {
            self.target_failure = None;
        }
        if let Some(id) = self.definitions.at(target).map(|d| d.id.clone()) {
            self.loads.clear_failure(&id);
        }
        let status = self.status(target);
        let (report, resolution) =
            self.teleports
                .request(target, *player, &status, &self.ctx.scope, now);
        match resolution {
            Some(resolution) => self.finish_teleport(resolution, player),
            None => {
                if let Some(position) = self.teleports.target_position() {
                    self.sampler.pin(position);
                }
                if let Some(hold) = self.teleports.holding_position() {
                    player.position = hold;
                }
            }
        }
        report
    }

    fn finish_teleport(&mut self, resolution: TeleportResolution, player: &mut Transform) {
        self.sampler.restore();
        self.target_failure = None;
        *player = resolution.player;
        if let Some(error) = &resolution.error {
            self.ctx.notify(Notice::new(
                NoticeKind::TeleportFailed,
                format!("Teleport to {} failed: {error}", resolution.target),
            ));
        }
    }

    fn force_reload(&mut self, coord: CellCoord) -> Result<CellId, StreamError> {
        let id = self
            .definitions
            .at(coord)
            .filter(|d| !d.is_empty)
            .map(|d| d.id.clone())
            .ok_or(StreamError::DefinitionMissing(coord))?;
        self.release(&id);
        self.loads.clear_failure(&id);
        info!(cell = %id, "cell released for reload");
        Ok(id)
    }

    fn promises_created(&self) -> u64 {
        self.loads.promises_created()
            + self.placeholder_loads.promises_created()
            + self.pointers.requests_started()
    }

    fn cells(&self) -> Vec<CellSnapshot> {
        let mut cells: Vec<CellSnapshot> = self
            .definitions
            .iter()
            .map(|def| {
                let info = self.partitioner.info(&def.id);
                let load_state = if def.is_empty {
                    CellLoadState::Empty
                } else if self.runtime.is_running(&def.id) {
                    CellLoadState::Running
                } else if self.loads.is_loading(&def.id) {
                    CellLoadState::Loading
                } else if self.placeholders.quality(&def.id).is_some() {
                    CellLoadState::Placeholder
                } else if self.loads.has_failed(&def.id) {
                    CellLoadState::Failed
                } else {
                    CellLoadState::Pending
                };
                CellSnapshot {
                    id: def.id.clone(),
                    base: def.base,
                    coords: def.coords.len(),
                    load_state,
                    visual: self.visuals.state(&def.id),
                    placeholder: self.placeholders.quality(&def.id),
                    bucket: info.map(|i| i.bucket),
                    raw_sqr_distance: info.map(|i| i.raw_sqr_distance),
                    is_behind: info.is_some_and(|i| i.is_behind),
                    rate_hz: self.runtime.rate_of(&def.id),
                    tick_number: self.runtime.instance(&def.id).map(|i| i.tick_number()),
                }
            })
            .collect();
        cells.sort_by_key(|c| c.base);
        cells
    }

    /// Cancel everything and hand back the cache and the number of promises
    /// the session created.
    fn close(mut self, player: &mut Transform) -> (CellCache, u64) {
        if let Some(resolution) = self.teleports.cancel() {
            self.finish_teleport(resolution, player);
        }
        self.ctx.scope.cancel();
        self.loads.shutdown();
        self.placeholder_loads.shutdown();
        let shown = self.placeholders.release_all();
        debug!(shown, "placeholders disposed");
        let promises = self.promises_created();
        info!(session = %self.ctx.id, realm = %self.ctx.identifier, "realm session closed");
        (self.runtime.into_cache(), promises)
    }
}

/// Streams cells of one realm at a time around an observer.
#[derive(Debug)]
pub struct Streamer {
    services: StreamServices,
    realms: RealmController,
    session: Option<RealmSession>,
    /// Holds the cache while no session owns it.
    parked: Option<CellCache>,
    reader: CacheReader,
    player: Transform,
    stats: StreamStats,
    timer: TickTimer,
    ticks: u64,
    retired_promises: u64,
}

impl Streamer {
    pub fn new(services: StreamServices) -> Self {
        let cache = CellCache::new();
        Self {
            realms: RealmController::new(&services),
            reader: cache.reader(),
            parked: Some(cache),
            services,
            session: None,
            player: Transform::default(),
            stats: StreamStats::default(),
            timer: TickTimer::default(),
            ticks: 0,
            retired_promises: 0,
        }
    }

    /// Switch to `identifier`. The current session, with every load and
    /// running cell, is torn down immediately; the new one starts once the
    /// realm descriptor arrives. Returns false for the realm already current.
    pub fn change_realm(&mut self, identifier: &str) -> bool {
        if !self.realms.change_realm(identifier) {
            return false;
        }
        self.close_session();
        true
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            let (cache, promises) = session.close(&mut self.player);
            self.retired_promises += promises;
            self.parked = Some(cache);
        }
    }

    fn open_session(&mut self, identifier: &str, descriptor: RealmDescriptor) {
        self.close_session();
        let Some(cache) = self.parked.take() else {
            consistency_violation("cell cache missing between sessions");
        };
        let ctx = SessionContext::new(self.services.clone(), identifier, descriptor);
        info!(
            session = %ctx.id,
            realm = identifier,
            base_url = %ctx.realm.base_url,
            fixed = ctx.realm.is_fixed(),
            "realm session opened"
        );
        self.session = Some(RealmSession::open(ctx, cache));
    }

    /// Run one scheduler tick.
    pub fn tick(&mut self) -> &StreamStats {
        self.ticks += 1;
        let _span = info_span!("stream_tick", tick = self.ticks).entered();
        let now = Instant::now();
        let mut stats = StreamStats {
            tick: self.ticks,
            ..StreamStats::default()
        };

        for event in self.realms.poll() {
            if let RealmEvent::Connected {
                identifier,
                descriptor,
                fallback,
            } = event
            {
                if fallback {
                    warn!(realm = %identifier, "reconnecting to previous realm");
                }
                self.open_session(&identifier, descriptor);
            }
        }

        let mut promises = self.retired_promises;
        if let Some(session) = &mut self.session {
            session.tick(&mut self.player, now, &mut stats);
            promises += session.promises_created();
        }
        stats.promises_created = promises;
        stats.tick_time = now.elapsed();
        self.timer.record(stats.tick_time);
        trace!(
            admitted = stats.admitted,
            started = stats.started,
            disposed = stats.disposed,
            loading = stats.loading,
            running = stats.running,
            "tick complete"
        );
        self.stats = stats;
        &self.stats
    }

    pub fn set_observer(&mut self, transform: Transform) {
        self.player = transform;
    }

    pub fn observer(&self) -> Transform {
        self.player
    }

    /// Jump the observer to `target`. The report resolves once the target
    /// cell runs, on this call already if it is active or empty.
    pub fn teleport_to(&mut self, target: CellCoord) -> Result<ReadinessReport, StreamError> {
        let session = self.session.as_mut().ok_or(StreamError::NoSession)?;
        Ok(session.request_teleport(target, &mut self.player, Instant::now()))
    }

    /// Cancel the pending teleport and put the observer back.
    pub fn cancel_teleport(&mut self) -> Option<TeleportResolution> {
        let session = self.session.as_mut()?;
        let resolution = session.teleports.cancel()?;
        session.finish_teleport(resolution.clone(), &mut self.player);
        Some(resolution)
    }

    pub fn is_teleporting(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.teleports.is_pending())
    }

    /// Whether the observer's cell was reached by a teleport within the
    /// grace window.
    pub fn is_just_teleported(&self) -> bool {
        self.session.as_ref().is_some_and(|s| {
            s.teleports
                .is_just_teleported(self.observer_coord(), Instant::now())
        })
    }

    /// Drop the cell the observer stands in, including any in-flight load,
    /// so it is admitted again as a fresh load.
    pub fn force_reload_current(&mut self) -> Result<CellId, StreamError> {
        let coord = self.observer_coord();
        let session = self.session.as_mut().ok_or(StreamError::NoSession)?;
        session.force_reload(coord)
    }

    fn observer_coord(&self) -> CellCoord {
        CellCoord::from_position(self.player.position, self.services.config.cell_size)
    }

    /// Cached cell the observer stands in.
    pub fn current_cell(&self) -> Option<CellId> {
        self.reader.cell_at(self.observer_coord())
    }

    pub fn cache(&self) -> CacheReader {
        self.reader.clone()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn timer(&self) -> &TickTimer {
        &self.timer
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn realm(&self) -> Option<&RealmDescriptor> {
        self.session.as_ref().map(|s| &s.ctx.realm)
    }

    pub fn config(&self) -> &crate::config::StreamConfig {
        &self.services.config
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let session = self.session.as_ref();
        StreamSnapshot {
            realm: session.map(|s| s.ctx.identifier.clone()),
            session: session.map(|s| s.ctx.id),
            observer: self.player,
            center: session.and_then(|s| s.range.center()),
            in_range: session.map_or(0, |s| s.range.cell_count()),
            current_cell: self.current_cell(),
            teleport_target: session.and_then(|s| s.teleports.target()),
            fixed: session.is_some_and(|s| s.pointers.is_fixed()),
            all_resolved: session.is_some_and(|s| s.pointers.all_resolved()),
            budget: self.services.config.admission_budget,
            cells: session.map(RealmSession::cells).unwrap_or_default(),
            stats: self.stats.clone(),
        }
    }

    /// Cancel everything: the pending realm change, the session and its
    /// cells.
    pub fn shutdown(&mut self) {
        self.realms.shutdown();
        self.close_session();
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaturationPolicy, StreamConfig};
    use crate::session::testing::*;
    use crate::teleport::{ReadinessOutcome, TeleportState};
    use std::time::Duration;

    const CELL: f32 = 16.0;

    fn connected(fixture: &Fixture) -> Streamer {
        let mut streamer = Streamer::new(fixture.services.clone());
        streamer.set_observer(Transform::from_position(CellCoord::ORIGIN.center(CELL)));
        assert!(streamer.change_realm("main"));
        streamer
    }

    async fn run_until(streamer: &mut Streamer, mut done: impl FnMut(&Streamer) -> bool) -> bool {
        for _ in 0..3_000 {
            streamer.tick();
            if done(streamer) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    fn active(streamer: &Streamer) -> &RealmSession {
        streamer.session.as_ref().expect("session open")
    }

    fn origin_id() -> CellId {
        CellId::new("cell:0,0")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn budget_caps_loading_and_running_cells() {
        let config = StreamConfig {
            load_radius: 2,
            admission_budget: 4,
            max_admissions_per_tick: 10,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 3);
        fixture.factory.set_delay(Duration::from_millis(20));
        let mut streamer = connected(&fixture);

        let mut first = None;
        let reached = run_until(&mut streamer, |s| {
            let stats = s.stats();
            assert!(stats.occupied() <= 4);
            if first.is_none() && stats.admitted > 0 {
                first = Some(stats.clone());
            }
            stats.running == 4
        })
        .await;
        assert!(reached);
        let first = first.unwrap();
        assert_eq!(first.admitted, 4);
        assert!(first.waiting >= 6);
        assert_eq!(streamer.current_cell(), Some(origin_id()));

        for _ in 0..20 {
            streamer.tick();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(streamer.stats().running, 4);
        assert_eq!(streamer.stats().loading, 0);
        assert_eq!(active(&streamer).loads.promises_created(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn far_bucket_disposes_within_the_tick_it_is_seen() {
        let config = StreamConfig {
            load_radius: 1,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 2);
        let mut streamer = connected(&fixture);
        let id = origin_id();
        assert!(run_until(&mut streamer, |s| s.cache().contains(&id)).await);
        let instance = streamer.cache().instance(&id).unwrap();

        streamer.set_observer(Transform::from_position(CellCoord::new(40, 0).center(CELL)));
        let evicted = run_until(&mut streamer, |s| {
            active(s).partitioner.info(&id).is_some_and(|i| i.bucket >= 5)
        })
        .await;
        assert!(evicted);
        assert!(!streamer.cache().contains(&id));
        assert!(!active(&streamer).runtime.is_running(&id));
        assert!(!instance.is_current());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teleport_to_active_cell_resolves_without_new_promises() {
        let config = StreamConfig {
            load_radius: 1,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 1);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, |s| s.cache().is_active_at(CellCoord::ORIGIN)).await);

        let loads = active(&streamer).loads.promises_created();
        let requests = active(&streamer).pointers.requests_started();
        let report = streamer.teleport_to(CellCoord::ORIGIN).unwrap();
        assert_eq!(report.try_outcome(), Some(ReadinessOutcome::Succeeded));
        assert_eq!(active(&streamer).loads.promises_created(), loads);
        assert_eq!(active(&streamer).pointers.requests_started(), requests);
        assert!(!streamer.is_teleporting());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teleport_loads_target_under_a_full_budget() {
        let config = StreamConfig {
            load_radius: 1,
            admission_budget: 4,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 4);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, |s| s.stats().running == 4).await);

        let target = CellCoord::new(4, -4);
        let report = streamer.teleport_to(target).unwrap();
        assert!(!report.is_resolved());
        assert!(streamer.is_teleporting());
        assert_eq!(streamer.observer().position.y, 500.0);

        assert!(run_until(&mut streamer, |_| report.is_resolved()).await);
        assert_eq!(report.try_outcome(), Some(ReadinessOutcome::Succeeded));
        assert_eq!(streamer.observer().position, target.center(CELL));
        assert!(streamer.cache().is_active_at(target));
        assert!(!active(&streamer).sampler.is_pinned());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teleport_times_out_and_restores_observer() {
        let config = StreamConfig {
            load_radius: 1,
            teleport_timeout_ms: 60,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 3);
        fixture.factory.set_delay(Duration::from_secs(5));
        let mut streamer = connected(&fixture);
        let origin = streamer.observer();
        assert!(run_until(&mut streamer, Streamer::is_connected).await);

        let report = streamer.teleport_to(CellCoord::new(3, 0)).unwrap();
        assert!(run_until(&mut streamer, |_| report.is_resolved()).await);
        assert_eq!(
            report.try_outcome(),
            Some(ReadinessOutcome::Failed(StreamError::Timeout(Duration::from_millis(60))))
        );
        assert_eq!(streamer.observer(), origin);
        assert!(
            fixture
                .notices
                .drain()
                .iter()
                .any(|n| n.kind == NoticeKind::TeleportFailed)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_teleport_is_silent() {
        let fixture = Fixture::new(StreamConfig::default(), 3);
        fixture.factory.set_delay(Duration::from_secs(5));
        let mut streamer = connected(&fixture);
        let origin = streamer.observer();
        assert!(run_until(&mut streamer, Streamer::is_connected).await);

        let report = streamer.teleport_to(CellCoord::new(3, 3)).unwrap();
        let resolution = streamer.cancel_teleport().unwrap();
        assert_eq!(resolution.state, TeleportState::Cancelled);
        assert_eq!(report.try_outcome(), Some(ReadinessOutcome::Cancelled));
        assert_eq!(streamer.observer(), origin);
        assert!(streamer.cancel_teleport().is_none());
        assert!(
            !fixture
                .notices
                .drain()
                .iter()
                .any(|n| n.kind == NoticeKind::TeleportFailed)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teleport_to_empty_coordinate_succeeds_once_resolved() {
        let fixture = Fixture::new(StreamConfig::default(), 1);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, Streamer::is_connected).await);

        let target = CellCoord::new(50, 50);
        let report = streamer.teleport_to(target).unwrap();
        assert!(run_until(&mut streamer, |_| report.is_resolved()).await);
        assert_eq!(report.try_outcome(), Some(ReadinessOutcome::Succeeded));
        assert_eq!(streamer.observer().position, target.center(CELL));
    }

    #[tokio::test]
    async fn teleport_needs_a_session() {
        let fixture = Fixture::new(StreamConfig::default(), 1);
        let mut streamer = Streamer::new(fixture.services.clone());
        assert!(matches!(
            streamer.teleport_to(CellCoord::ORIGIN),
            Err(StreamError::NoSession)
        ));
        assert!(matches!(
            streamer.force_reload_current(),
            Err(StreamError::NoSession)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn realm_change_disposes_every_cell() {
        let config = StreamConfig {
            load_radius: 1,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 2);
        fixture.catalog.add_realm(
            "other",
            RealmDescriptor {
                name: "other".into(),
                base_url: "mem://other".into(),
                fixed_cells: None,
            },
        );
        fixture.catalog.publish_grid("mem://other", 1, None);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, |s| s.stats().running >= 3).await);

        let cache = streamer.cache();
        let before: Vec<_> = cache.ids().iter().filter_map(|id| cache.instance(id)).collect();
        assert!(streamer.change_realm("other"));
        assert!(!streamer.is_connected());
        assert!(cache.is_empty());
        assert!(before.iter().all(|i| !i.is_current()));

        let switched = run_until(&mut streamer, |s| {
            s.realm().is_some_and(|r| r.base_url == "mem://other") && s.stats().running > 0
        })
        .await;
        assert!(switched);
        assert!(!streamer.change_realm("other"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_reload_replaces_current_cell() {
        let config = StreamConfig {
            load_radius: 1,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 1);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, |s| s.cache().is_active_at(CellCoord::ORIGIN)).await);
        let old = streamer.cache().instance_at(CellCoord::ORIGIN).unwrap();

        assert_eq!(streamer.force_reload_current().unwrap(), origin_id());
        assert!(!old.is_current());
        assert!(streamer.cache().instance_at(CellCoord::ORIGIN).is_none());

        assert!(run_until(&mut streamer, |s| s.cache().is_active_at(CellCoord::ORIGIN)).await);
        let new = streamer.cache().instance_at(CellCoord::ORIGIN).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fixed_realm_admits_only_after_every_definition() {
        let config = StreamConfig {
            pointer_batch_size: 1,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 0);
        let ids: Vec<CellId> = (0..3)
            .map(|i| {
                fixture
                    .catalog
                    .publish("mem://gallery", &format!("gallery-{i}"), vec![CellCoord::new(i, 0)])
                    .id
            })
            .collect();
        fixture.catalog.add_realm(
            "gallery",
            RealmDescriptor {
                name: "gallery".into(),
                base_url: "mem://gallery".into(),
                fixed_cells: Some(ids),
            },
        );
        fixture.catalog.set_latency(Duration::from_millis(10));
        let mut streamer = Streamer::new(fixture.services.clone());
        streamer.set_observer(Transform::from_position(CellCoord::ORIGIN.center(CELL)));
        streamer.change_realm("gallery");

        let all_running = run_until(&mut streamer, |s| {
            if let Some(session) = &s.session {
                if !session.pointers.all_resolved() {
                    assert_eq!(s.stats().occupied(), 0);
                }
            }
            s.stats().running == 3
        })
        .await;
        assert!(all_running);
        assert_eq!(fixture.catalog.counters().pointer_requests(), 0);
        assert!(streamer.snapshot().fixed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_reports_cell_states() {
        let config = StreamConfig {
            load_radius: 2,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 1);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, |s| s.cache().is_active_at(CellCoord::ORIGIN)).await);

        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.realm.as_deref(), Some("main"));
        assert_eq!(snapshot.current_cell, Some(origin_id()));
        assert_eq!(snapshot.in_range, 25);
        let origin = snapshot.cells.iter().find(|c| c.id == origin_id()).unwrap();
        assert_eq!(origin.load_state, CellLoadState::Running);
        assert_eq!(origin.placeholder, None);
        assert_eq!(origin.bucket, Some(0));
        assert_eq!(origin.rate_hz, Some(30.0));
        assert_eq!(origin.visual, Some(VisualState::ShowingFullCell));
        assert!(snapshot.cells.iter().any(|c| c.load_state == CellLoadState::Empty));
        assert!(snapshot.cells.windows(2).all(|w| w[0].base <= w[1].base));
        assert!(snapshot.stats.promises_created >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preempt_farther_swaps_out_the_farthest_cell_in_one_tick() {
        let config = StreamConfig {
            load_radius: 2,
            admission_budget: 1,
            max_admissions_per_tick: 10,
            saturation_policy: SaturationPolicy::PreemptFarther,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 3);
        let mut streamer = connected(&fixture);
        assert!(run_until(&mut streamer, |s| s.cache().contains(&origin_id())).await);
        let origin = streamer.cache().instance(&origin_id()).unwrap();
        assert_eq!(streamer.stats().preempted, 0);

        // The origin stays in a full bucket; only preemption can evict it.
        let near = CellId::new("cell:2,0");
        streamer.set_observer(Transform::from_position(CellCoord::new(2, 0).center(CELL)));
        assert!(run_until(&mut streamer, |s| s.stats().preempted > 0).await);

        let stats = streamer.stats().clone();
        assert_eq!(stats.preempted, 1);
        assert_eq!(stats.admitted, 1);
        assert!(stats.occupied() <= 1);
        assert!(!origin.is_current());
        assert!(!streamer.cache().contains(&origin_id()));
        assert!(active(&streamer).loads.is_loading(&near));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn realm_switch_and_shutdown_leave_no_live_instances() {
        let config = StreamConfig {
            load_radius: 1,
            admission_budget: 2,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 2);
        fixture.catalog.add_realm(
            "other",
            RealmDescriptor {
                name: "other".into(),
                base_url: "mem://other".into(),
                fixed_cells: None,
            },
        );
        fixture.catalog.publish_grid("mem://other", 1, None);
        fixture.factory.set_delay(Duration::from_millis(30));
        let counters = fixture.factory.counters();
        let mut streamer = connected(&fixture);
        assert!(
            run_until(&mut streamer, |s| s.stats().running == 2 && s.stats().placeholders == 7)
                .await
        );

        // Leave a full load in flight when the realm goes away.
        streamer.force_reload_current().unwrap();
        assert!(run_until(&mut streamer, |s| active(s).loads.is_loading(&origin_id())).await);
        assert!(streamer.change_realm("other"));
        assert!(until(|| counters.live() == 0).await);

        assert!(
            run_until(&mut streamer, |s| {
                s.realm().is_some_and(|r| r.base_url == "mem://other") && s.stats().running > 0
            })
            .await
        );
        assert!(counters.live() > 0);
        streamer.shutdown();
        assert!(until(|| counters.live() == 0).await);
        assert_eq!(counters.created(), counters.disposed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn saturated_budget_downgrades_waiting_cells_to_placeholders() {
        let config = StreamConfig {
            load_radius: 1,
            admission_budget: 2,
            max_admissions_per_tick: 20,
            lod_budget: 3,
            reduced_lod_budget: 2,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 1);
        let mut streamer = connected(&fixture);
        let settled = run_until(&mut streamer, |s| {
            let stats = s.stats();
            stats.running == 2 && stats.placeholders == 5 && stats.placeholders_loading == 0
        })
        .await;
        assert!(settled);
        assert_eq!(streamer.stats().reduced_placeholders, 2);

        let snapshot = streamer.snapshot();
        let origin = snapshot.cells.iter().find(|c| c.id == origin_id()).unwrap();
        assert_eq!(origin.load_state, CellLoadState::Running);
        assert_eq!(origin.placeholder, None);
        let with = |quality| {
            snapshot
                .cells
                .iter()
                .filter(|c| c.placeholder == Some(quality))
                .count()
        };
        assert_eq!(with(LodQuality::Full), 3);
        assert_eq!(with(LodQuality::Reduced), 2);
        let bare = snapshot
            .cells
            .iter()
            .filter(|c| c.load_state == CellLoadState::Pending)
            .count();
        assert_eq!(bare, 2);
        assert_eq!(fixture.factory.counters().live(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn distant_cells_show_placeholders_until_the_observer_leaves() {
        let config = StreamConfig {
            load_radius: 3,
            full_cell_bucket_limit: 0,
            lod_hysteresis: 0,
            max_admissions_per_tick: 20,
            lod_budget: 32,
            reduced_lod_budget: 64,
            ..StreamConfig::default()
        };
        let fixture = Fixture::new(config, 3);
        let counters = fixture.factory.counters();
        let mut streamer = connected(&fixture);
        let settled = run_until(&mut streamer, |s| {
            let stats = s.stats();
            stats.running == 9 && stats.placeholders == 40 && stats.placeholders_loading == 0
        })
        .await;
        assert!(settled);
        assert_eq!(streamer.stats().reduced_placeholders, 8);
        assert_eq!(counters.live(), 49);
        let far = streamer
            .snapshot()
            .cells
            .into_iter()
            .find(|c| c.base == CellCoord::new(3, 3))
            .unwrap();
        assert_eq!(far.visual, Some(VisualState::ShowingPlaceholder));
        assert_eq!(far.load_state, CellLoadState::Placeholder);

        streamer.set_observer(Transform::from_position(CellCoord::new(40, 0).center(CELL)));
        assert!(
            run_until(&mut streamer, |s| s.stats().running == 0 && s.stats().placeholders == 0)
                .await
        );
        assert!(until(|| counters.live() == 0).await);
    }
}
