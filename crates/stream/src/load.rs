use crate::cell::CellInstance;
use crate::error::{StreamError, consistency_violation};
use crate::lod::Representation;
use crate::notify::{Notice, NoticeKind};
use crate::session::SessionContext;
use realmstream_common::{CancelScope, CellDefinition, CellId, Consume, Manifest, Promise};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type LoadPromise = Promise<Arc<dyn CellInstance>, StreamError>;

const REAP_INTERVAL: Duration = Duration::from_millis(5);

/// Outcome of a load observed by [`LoadPipeline::poll`].
#[derive(Debug)]
pub enum LoadEvent {
    Ready {
        id: CellId,
        instance: Arc<dyn CellInstance>,
        representation: Representation,
    },
    Failed {
        id: CellId,
        error: StreamError,
    },
    Cancelled {
        id: CellId,
    },
}

#[derive(Debug)]
struct InFlight {
    promise: LoadPromise,
    scope: CancelScope,
    representation: Representation,
    started: Instant,
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    attempts: u32,
    last: Instant,
}

/// Fetch-and-instantiate flow for admitted cells.
///
/// Each load is a promise on its own child scope of the session. Cancelled
/// loads move to a draining list until their task settles, so an instance
/// that finishes building after cancellation is still disposed. An instance
/// whose scope was cancelled while the factory was building it is disposed
/// inside the load itself and reported as cancelled.
///
/// Dropping the pipeline runs [`LoadPipeline::shutdown`].
#[derive(Debug)]
pub struct LoadPipeline {
    ctx: Arc<SessionContext>,
    in_flight: HashMap<CellId, InFlight>,
    draining: Vec<(CellId, LoadPromise)>,
    failures: HashMap<CellId, FailureRecord>,
    cooldown: Duration,
    max_attempts: u32,
    promises_created: u64,
}

impl LoadPipeline {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let config = ctx.config();
        Self {
            cooldown: config.load_retry_cooldown(),
            max_attempts: config.max_load_attempts.max(1),
            in_flight: HashMap::new(),
            draining: Vec::new(),
            failures: HashMap::new(),
            promises_created: 0,
            ctx,
        }
    }

    /// Start loading `def` as `representation`. Only the admission path may
    /// call this, and never for a cell that is already loading.
    pub fn start(&mut self, def: &CellDefinition, representation: Representation) {
        if self.in_flight.contains_key(&def.id) {
            consistency_violation(format!("cell {} admitted while already loading", def.id));
        }
        let scope = self.ctx.scope.child(format!("load:{}", def.id));
        let load_scope = scope.clone();
        let catalog = self.ctx.catalog().clone();
        let factory = self.ctx.factory().clone();
        let base_url = self.ctx.base_url().to_string();
        let def_owned = def.clone();
        let promise = Promise::spawn(self.ctx.runtime(), &scope, async move {
            let instance = match representation {
                Representation::Full => {
                    let manifest = match &def_owned.manifest {
                        Some(reference) => catalog
                            .fetch_manifest(&base_url, reference)
                            .await
                            .map_err(|e| StreamError::load(&def_owned.id, e))?,
                        None => Manifest::empty(),
                    };
                    factory.create(&def_owned, manifest).await?
                }
                Representation::Placeholder(quality) => {
                    factory.create_placeholder(&def_owned, quality).await?
                }
            };
            // The factory may finish after the scope was cancelled; nobody
            // will take ownership of the instance then.
            if load_scope.is_cancelled() {
                debug!(cell = %def_owned.id, "disposing instance built after cancellation");
                instance.dispose();
                return Err(StreamError::Cancelled);
            }
            Ok(instance)
        });
        debug!(cell = %def.id, ?representation, "load started");
        self.promises_created += 1;
        self.in_flight.insert(
            def.id.clone(),
            InFlight {
                promise,
                scope,
                representation,
                started: Instant::now(),
            },
        );
    }

    /// Cancel the load of `id`. Returns false if it was not loading.
    pub fn cancel(&mut self, id: &CellId) -> bool {
        let Some(load) = self.in_flight.remove(id) else {
            return false;
        };
        load.scope.cancel();
        debug!(cell = %id, "load cancelled");
        self.draining.push((id.clone(), load.promise));
        true
    }

    pub fn cancel_all(&mut self) {
        let ids: Vec<CellId> = self.in_flight.keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    /// Poll every load once.
    pub fn poll(&mut self, now: Instant) -> Vec<LoadEvent> {
        let mut events = Vec::new();
        let mut settled = Vec::new();
        for (id, load) in self.in_flight.iter_mut() {
            match load.promise.try_consume() {
                Consume::Pending => {}
                Consume::Succeeded(instance) => {
                    debug!(cell = %id, elapsed = ?load.started.elapsed(), "load finished");
                    settled.push(id.clone());
                    events.push(LoadEvent::Ready {
                        id: id.clone(),
                        instance,
                        representation: load.representation,
                    });
                }
                Consume::Failed(StreamError::Cancelled) | Consume::Cancelled => {
                    settled.push(id.clone());
                    events.push(LoadEvent::Cancelled { id: id.clone() });
                }
                Consume::Failed(error) => {
                    settled.push(id.clone());
                    events.push(LoadEvent::Failed {
                        id: id.clone(),
                        error,
                    });
                }
                Consume::AlreadyConsumed => {
                    consistency_violation(format!("load promise for {id} consumed twice"))
                }
            }
        }
        for id in settled {
            self.in_flight.remove(&id);
        }

        for event in &events {
            if let LoadEvent::Ready { id, .. } = event {
                self.failures.remove(id);
            }
            if let LoadEvent::Failed { id, error } = event {
                let record = self.failures.entry(id.clone()).or_insert(FailureRecord {
                    attempts: 0,
                    last: now,
                });
                record.attempts += 1;
                record.last = now;
                warn!(cell = %id, attempts = record.attempts, %error, "load failed");
                if error.is_user_visible() {
                    self.ctx.notify(Notice::new(
                        NoticeKind::LoadFailed,
                        format!("Cell {id} failed to load: {error}"),
                    ));
                }
            }
        }

        dispose_settled(&mut self.draining);
        events
    }

    /// Cancel every load and dispose whatever they built.
    ///
    /// Loads still running when this returns are handed to a reaper task on
    /// the session runtime, which disposes their instances once they settle.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel_all();
        dispose_settled(&mut self.draining);
        if self.draining.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.draining);
        debug!(pending = pending.len(), "handing unsettled loads to reaper");
        self.ctx.runtime().spawn(async move {
            while !pending.is_empty() {
                tokio::time::sleep(REAP_INTERVAL).await;
                dispose_settled(&mut pending);
            }
        });
    }

    /// Whether `id` must not be admitted at `now` because of earlier failures.
    pub fn is_blocked(&self, id: &CellId, now: Instant) -> bool {
        self.failures.get(id).is_some_and(|f| {
            f.attempts >= self.max_attempts || now.duration_since(f.last) < self.cooldown
        })
    }

    pub fn has_failed(&self, id: &CellId) -> bool {
        self.failures.contains_key(id)
    }

    pub fn clear_failure(&mut self, id: &CellId) {
        self.failures.remove(id);
    }

    pub fn is_loading(&self, id: &CellId) -> bool {
        self.in_flight.contains_key(id)
    }

    /// What the in-flight load of `id` builds.
    pub fn representation(&self, id: &CellId) -> Option<Representation> {
        self.in_flight.get(id).map(|load| load.representation)
    }

    pub fn loading_ids(&self) -> impl Iterator<Item = &CellId> {
        self.in_flight.keys()
    }

    pub fn loading_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    pub fn promises_created(&self) -> u64 {
        self.promises_created
    }
}

impl Drop for LoadPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consume every settled promise in `draining`, disposing built instances.
fn dispose_settled(draining: &mut Vec<(CellId, LoadPromise)>) {
    draining.retain_mut(|(id, promise)| match promise.try_consume() {
        Consume::Pending => true,
        Consume::Succeeded(instance) => {
            debug!(cell = %id, "disposing instance built after cancellation");
            instance.dispose();
            false
        }
        Consume::Failed(_) | Consume::Cancelled => false,
        Consume::AlreadyConsumed => {
            consistency_violation(format!("draining promise for {id} consumed twice"))
        }
    });
}
