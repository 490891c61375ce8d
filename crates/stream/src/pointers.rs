use crate::error::{StreamError, consistency_violation};
use crate::notify::{Notice, NoticeKind};
use crate::range::{RangeTracker, ring_coords};
use crate::session::SessionContext;
use realmstream_catalog::CatalogError;
use realmstream_common::{CellCoord, CellDefinition, CellId, Consume, Promise};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
enum Request {
    Pointers(Vec<CellCoord>),
    Ids(Vec<CellId>),
}

#[derive(Debug)]
struct Outstanding {
    request: Request,
    promise: Promise<Vec<CellDefinition>, CatalogError>,
}

#[derive(Debug)]
struct FixedCells {
    pending: VecDeque<CellId>,
    in_flight: bool,
}

/// Result of one resolver tick.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// Definitions resolved this tick, synthesized empties included.
    pub definitions: Vec<CellDefinition>,
    pub failure: Option<StreamError>,
    pub request_started: bool,
}

/// Discovers cell definitions around the observer.
///
/// Rings around the observer's cell are queued nearest first and requested in
/// batches, one request at a time. Every requested coordinate ends up in the
/// processed set whatever the outcome, so nothing is fetched twice in a
/// session. In a fixed realm radius discovery is replaced by fetching the
/// realm's cell list by id.
#[derive(Debug)]
pub struct PointerResolver {
    ctx: Arc<SessionContext>,
    batch_size: usize,
    static_pending: Vec<CellCoord>,
    processed: HashSet<CellCoord>,
    failed: HashSet<CellCoord>,
    queue: VecDeque<CellCoord>,
    queued_center: Option<CellCoord>,
    next_ring: u32,
    fixed: Option<FixedCells>,
    outstanding: Option<Outstanding>,
    requests_started: u64,
}

impl PointerResolver {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let config = ctx.config();
        let fixed = ctx.realm.fixed_cells.as_ref().map(|ids| FixedCells {
            pending: ids.iter().cloned().collect(),
            in_flight: false,
        });
        Self {
            batch_size: config.pointer_batch_size.max(1),
            static_pending: config.static_pointers.clone(),
            processed: HashSet::new(),
            failed: HashSet::new(),
            queue: VecDeque::new(),
            queued_center: None,
            next_ring: 0,
            fixed,
            outstanding: None,
            requests_started: 0,
            ctx,
        }
    }

    /// Poll the outstanding request, then start the next one if idle. Radius
    /// discovery only asks for coordinates `range` holds.
    pub fn tick(&mut self, range: &RangeTracker) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();
        self.poll(&mut outcome);
        if self.outstanding.is_none() && !self.ctx.scope.is_cancelled() {
            if let Some(request) = self.next_request(range) {
                self.send(request);
                outcome.request_started = true;
            }
        }
        outcome
    }

    fn poll(&mut self, outcome: &mut ResolveOutcome) {
        let Some(mut outstanding) = self.outstanding.take() else {
            return;
        };
        match outstanding.promise.try_consume() {
            Consume::Pending => self.outstanding = Some(outstanding),
            Consume::Succeeded(defs) => self.on_resolved(outstanding.request, defs, outcome),
            Consume::Failed(e) => self.on_failed(outstanding.request, e, outcome),
            Consume::Cancelled => {
                debug!(session = %self.ctx.id, "pointer request cancelled");
                if let Request::Ids(_) = outstanding.request {
                    if let Some(fixed) = &mut self.fixed {
                        fixed.in_flight = false;
                    }
                }
            }
            Consume::AlreadyConsumed => consistency_violation("pointer request consumed twice"),
        }
    }

    fn on_resolved(&mut self, request: Request, defs: Vec<CellDefinition>, outcome: &mut ResolveOutcome) {
        for def in &defs {
            self.processed.extend(def.coords.iter().copied());
        }
        match request {
            Request::Pointers(coords) => {
                let covered: HashSet<CellCoord> =
                    defs.iter().flat_map(|d| d.coords.iter().copied()).collect();
                let empties: Vec<CellDefinition> = coords
                    .into_iter()
                    .filter(|c| !covered.contains(c))
                    .map(CellDefinition::empty)
                    .collect();
                for empty in &empties {
                    self.processed.insert(empty.base);
                }
                debug!(resolved = defs.len(), empty = empties.len(), "pointer batch resolved");
                outcome.definitions.extend(defs);
                outcome.definitions.extend(empties);
            }
            Request::Ids(ids) => {
                let returned: HashSet<&CellId> = defs.iter().map(|d| &d.id).collect();
                for missing in ids.iter().filter(|id| !returned.contains(id)) {
                    warn!(cell = %missing, "fixed realm cell not found in catalog");
                }
                if let Some(fixed) = &mut self.fixed {
                    fixed.in_flight = false;
                }
                debug!(resolved = defs.len(), "fixed cell batch resolved");
                outcome.definitions.extend(defs);
            }
        }
    }

    fn on_failed(&mut self, request: Request, e: CatalogError, outcome: &mut ResolveOutcome) {
        let message = match request {
            Request::Pointers(coords) => {
                warn!(error = %e, count = coords.len(), "pointer batch failed, marking processed");
                self.failed.extend(coords.iter().copied());
                self.processed.extend(coords);
                format!("Failed to fetch cell definitions: {e}")
            }
            Request::Ids(ids) => {
                warn!(error = %e, count = ids.len(), "fixed cell batch failed");
                if let Some(fixed) = &mut self.fixed {
                    fixed.in_flight = false;
                }
                format!("Failed to fetch realm cells: {e}")
            }
        };
        self.ctx.notify(Notice::new(NoticeKind::FetchFailed, message));
        outcome.failure = Some(e.into());
    }

    fn next_request(&mut self, range: &RangeTracker) -> Option<Request> {
        let statics: Vec<CellCoord> = self
            .static_pending
            .iter()
            .copied()
            .filter(|c| !self.processed.contains(c))
            .take(self.batch_size)
            .collect();
        self.static_pending.retain(|c| !statics.contains(c));
        if !statics.is_empty() {
            return Some(Request::Pointers(statics));
        }

        if let Some(fixed) = &mut self.fixed {
            if fixed.pending.is_empty() {
                return None;
            }
            let take = self.batch_size.min(fixed.pending.len());
            let ids: Vec<CellId> = fixed.pending.drain(..take).collect();
            fixed.in_flight = true;
            return Some(Request::Ids(ids));
        }

        let center = range.center()?;
        let radius = range.radius();
        if self.queued_center != Some(center) {
            self.queued_center = Some(center);
            self.queue.clear();
            self.next_ring = 0;
        }
        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            match self.queue.pop_front() {
                Some(c) => {
                    if !self.processed.contains(&c) && range.contains(c) {
                        batch.push(c);
                    }
                }
                None => {
                    if self.next_ring > radius {
                        break;
                    }
                    self.queue.extend(ring_coords(center, self.next_ring));
                    self.next_ring += 1;
                }
            }
        }
        (!batch.is_empty()).then_some(Request::Pointers(batch))
    }

    fn send(&mut self, request: Request) {
        let catalog = self.ctx.catalog().clone();
        let base = self.ctx.base_url().to_string();
        let promise = match &request {
            Request::Pointers(coords) => {
                debug!(count = coords.len(), "requesting cell definitions by pointer");
                let coords = coords.clone();
                Promise::spawn(self.ctx.runtime(), &self.ctx.scope, async move {
                    catalog.fetch_by_pointers(&base, &coords).await
                })
            }
            Request::Ids(ids) => {
                debug!(count = ids.len(), "requesting fixed realm cells by id");
                let ids = ids.clone();
                Promise::spawn(self.ctx.runtime(), &self.ctx.scope, async move {
                    catalog.fetch_by_ids(&base, &ids).await
                })
            }
        };
        self.requests_started += 1;
        self.outstanding = Some(Outstanding { request, promise });
    }

    /// Whether every definition this realm will ever need has been requested
    /// and answered. Always true for volatile realms.
    pub fn all_resolved(&self) -> bool {
        match &self.fixed {
            Some(fixed) => {
                fixed.pending.is_empty() && !fixed.in_flight && self.static_pending.is_empty()
            }
            None => true,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn is_processed(&self, coord: CellCoord) -> bool {
        self.processed.contains(&coord)
    }

    pub fn is_failed(&self, coord: CellCoord) -> bool {
        self.failed.contains(&coord)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn requests_started(&self) -> u64 {
        self.requests_started
    }
}
