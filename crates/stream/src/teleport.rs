//! Player-initiated jumps to arbitrary coordinates.
//!
//! A teleport pins the partition sampler to the target, holds the player above
//! it and waits, one tick at a time, for the target cell to become active. It
//! ends in exactly one of four states and every readiness report attached to
//! it is resolved with that outcome.

use crate::error::{StreamError, consistency_violation};
use glam::Vec3;
use realmstream_common::{CancelScope, CellCoord, CellDefinition, TeleportId, Transform};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Final outcome delivered to a [`ReadinessReport`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessOutcome {
    Succeeded,
    Cancelled,
    Failed(StreamError),
}

/// Completion handle handed to whoever requested a teleport.
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    rx: watch::Receiver<Option<ReadinessOutcome>>,
}

impl ReadinessReport {
    /// Wait for the outcome.
    pub async fn wait(&mut self) -> ReadinessOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(ReadinessOutcome::Cancelled),
            Err(_) => ReadinessOutcome::Cancelled,
        }
    }

    /// The outcome, if already resolved.
    pub fn try_outcome(&self) -> Option<ReadinessOutcome> {
        self.rx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Resolving half of a [`ReadinessReport`]. Dropping it unresolved reports
/// cancellation.
#[derive(Debug)]
struct ReadinessSender {
    tx: watch::Sender<Option<ReadinessOutcome>>,
    resolved: bool,
}

impl ReadinessSender {
    fn pair() -> (Self, ReadinessReport) {
        let (tx, rx) = watch::channel(None);
        (Self { tx, resolved: false }, ReadinessReport { rx })
    }

    fn resolve(&mut self, outcome: ReadinessOutcome) {
        if self.resolved {
            consistency_violation("readiness report resolved twice");
        }
        self.resolved = true;
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for ReadinessSender {
    fn drop(&mut self) {
        if !self.resolved {
            self.tx.send_replace(Some(ReadinessOutcome::Cancelled));
        }
    }
}

/// Terminal (or pending) state of a teleport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleportState {
    Pending,
    Succeeded,
    Cancelled,
    Faulted,
    TimedOut,
}

/// What the streamer knows about the target this tick.
#[derive(Debug, Clone, Default)]
pub struct TargetStatus {
    pub definition: Option<CellDefinition>,
    /// A running instance covers the target.
    pub active: bool,
    /// The target's definition fetch or load failed.
    pub failure: Option<StreamError>,
    /// No further definitions will arrive in this session.
    pub definitions_complete: bool,
}

impl TargetStatus {
    fn is_ready(&self) -> bool {
        self.active || self.definition.as_ref().is_some_and(|d| d.is_empty)
    }
}

/// A finished teleport, with where the player should end up.
#[derive(Debug, Clone, PartialEq)]
pub struct TeleportResolution {
    pub id: TeleportId,
    pub target: CellCoord,
    pub state: TeleportState,
    pub error: Option<StreamError>,
    /// Target position on success, the pre-teleport transform otherwise.
    pub player: Transform,
}

#[derive(Debug)]
struct TeleportIntent {
    id: TeleportId,
    target: CellCoord,
    position: Vec3,
    origin: Transform,
    deadline: Instant,
    scope: CancelScope,
    reports: Vec<ReadinessSender>,
}

/// Drives at most one teleport at a time.
#[derive(Debug)]
pub struct TeleportCoordinator {
    cell_size: f32,
    timeout: Duration,
    grace: Duration,
    holding_height: f32,
    active: Option<TeleportIntent>,
    just_teleported: Option<(CellCoord, Instant)>,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
}

impl TeleportCoordinator {
    pub fn new(cell_size: f32, timeout: Duration, grace: Duration, holding_height: f32) -> Self {
        Self {
            cell_size,
            timeout,
            grace,
            holding_height,
            active: None,
            just_teleported: None,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
        }
    }

    /// Request a teleport to `target`.
    ///
    /// A request for the pending target attaches another report to it; one for
    /// a different target cancels the pending teleport first. If `status` shows
    /// the target ready the teleport resolves on the spot and the resolution is
    /// returned alongside the already-succeeded report.
    pub fn request(
        &mut self,
        target: CellCoord,
        origin: Transform,
        status: &TargetStatus,
        parent: &CancelScope,
        now: Instant,
    ) -> (ReadinessReport, Option<TeleportResolution>) {
        let (mut sender, report) = ReadinessSender::pair();

        if let Some(intent) = &mut self.active {
            if intent.target == target {
                debug!(teleport = %intent.id, %target, "attached to pending teleport");
                intent.reports.push(sender);
                return (report, None);
            }
        }
        let superseded = self.cancel();
        // Keep the position the player had before any chained teleport.
        let origin = superseded.map(|r| r.player).unwrap_or(origin);

        let id = TeleportId::new();
        let position = target.center(self.cell_size);
        if status.is_ready() {
            sender.resolve(ReadinessOutcome::Succeeded);
            self.succeeded += 1;
            self.just_teleported = Some((target, now));
            info!(teleport = %id, %target, "teleport target already active");
            let resolution = TeleportResolution {
                id,
                target,
                state: TeleportState::Succeeded,
                error: None,
                player: Transform {
                    position,
                    rotation: origin.rotation,
                },
            };
            return (report, Some(resolution));
        }

        info!(teleport = %id, %target, "teleport pending");
        self.active = Some(TeleportIntent {
            id,
            target,
            position,
            origin,
            deadline: now + self.timeout,
            scope: parent.child(format!("teleport:{id}")),
            reports: vec![sender],
        });
        (report, None)
    }

    /// Check the pending teleport against this tick's view of its target.
    pub fn tick(&mut self, status: &TargetStatus, now: Instant) -> Option<TeleportResolution> {
        let intent = self.active.as_ref()?;
        let (state, error) = if intent.scope.is_cancelled() {
            (TeleportState::Cancelled, None)
        } else if status.is_ready() {
            (TeleportState::Succeeded, None)
        } else if let Some(error) = &status.failure {
            (TeleportState::Faulted, Some(error.clone()))
        } else if status.definitions_complete && status.definition.is_none() {
            (
                TeleportState::Faulted,
                Some(StreamError::DefinitionMissing(intent.target)),
            )
        } else if now >= intent.deadline {
            (TeleportState::TimedOut, Some(StreamError::Timeout(self.timeout)))
        } else {
            return None;
        };
        self.finish(state, error, now)
    }

    /// Cancel the pending teleport, if any.
    pub fn cancel(&mut self) -> Option<TeleportResolution> {
        let intent = self.active.as_ref()?;
        intent.scope.cancel();
        self.finish(TeleportState::Cancelled, None, Instant::now())
    }

    fn finish(
        &mut self,
        state: TeleportState,
        error: Option<StreamError>,
        now: Instant,
    ) -> Option<TeleportResolution> {
        let mut intent = self.active.take()?;
        let outcome = match (&state, &error) {
            (TeleportState::Succeeded, _) => ReadinessOutcome::Succeeded,
            (TeleportState::Cancelled, _) => ReadinessOutcome::Cancelled,
            (_, Some(error)) => ReadinessOutcome::Failed(error.clone()),
            (_, None) => ReadinessOutcome::Cancelled,
        };
        for report in &mut intent.reports {
            report.resolve(outcome.clone());
        }
        intent.scope.cancel();

        let player = match state {
            TeleportState::Succeeded => {
                self.succeeded += 1;
                self.just_teleported = Some((intent.target, now));
                info!(teleport = %intent.id, target = %intent.target, "teleport succeeded");
                Transform {
                    position: intent.position,
                    rotation: intent.origin.rotation,
                }
            }
            TeleportState::Cancelled => {
                self.cancelled += 1;
                debug!(teleport = %intent.id, "teleport cancelled");
                intent.origin
            }
            _ => {
                self.failed += 1;
                warn!(teleport = %intent.id, target = %intent.target, ?state, ?error, "teleport failed");
                intent.origin
            }
        };
        Some(TeleportResolution {
            id: intent.id,
            target: intent.target,
            state,
            error,
            player,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.active.is_some()
    }

    /// Target of the pending teleport.
    pub fn target(&self) -> Option<CellCoord> {
        self.active.as_ref().map(|i| i.target)
    }

    /// Where the partition sampler is pinned while the teleport is pending.
    pub fn target_position(&self) -> Option<Vec3> {
        self.active.as_ref().map(|i| i.position)
    }

    /// Where the player waits while the teleport is pending.
    pub fn holding_position(&self) -> Option<Vec3> {
        self.target_position().map(|p| p + Vec3::Y * self.holding_height)
    }

    /// Whether `coord` was the target of a teleport that succeeded within the
    /// grace window.
    pub fn is_just_teleported(&self, coord: CellCoord, now: Instant) -> bool {
        self.just_teleported
            .is_some_and(|(c, at)| c == coord && now.duration_since(at) < self.grace)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }
}
