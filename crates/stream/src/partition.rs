//! Distance partitioning of cells relative to the observer.
//!
//! The distance pass runs as a single background job on the rayon pool. Its
//! result comes back over a one-slot channel and is consumed on a later tick;
//! the tick never waits for it.

use crate::config::StreamConfig;
use crossbeam_channel::{Receiver, TryRecvError, bounded};
use glam::{Vec2, Vec3};
use rayon::prelude::*;
use realmstream_common::{CellCoord, CellDefinition, CellId, Transform};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Per-cell distance record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionInfo {
    pub bucket: usize,
    pub raw_sqr_distance: f32,
    pub is_behind: bool,
    /// Set when bucket, behind flag or distance changed since last read.
    pub dirty: bool,
}

/// Observer position and ground-plane facing used by a distance pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverSample {
    pub position: Vec3,
    pub forward: Vec3,
}

impl ObserverSample {
    pub fn from_transform(t: &Transform) -> Self {
        Self {
            position: t.position,
            forward: t.forward(),
        }
    }
}

/// Samples the observer with position and angle tolerances.
///
/// While pinned (a teleport is pending) the sample is frozen at the pinned
/// position and live updates are ignored; [`ObserverSampler::restore`] puts
/// back the sample taken before pinning.
#[derive(Debug)]
pub struct ObserverSampler {
    position_tolerance: f32,
    angle_tolerance: f32,
    current: Option<ObserverSample>,
    suspended: Option<Option<ObserverSample>>,
    dirty: bool,
}

impl ObserverSampler {
    pub fn new(position_tolerance: f32, angle_tolerance_deg: f32) -> Self {
        Self {
            position_tolerance,
            angle_tolerance: angle_tolerance_deg.to_radians(),
            current: None,
            suspended: None,
            dirty: false,
        }
    }

    /// Feed a live transform. Returns true when the sample was replaced.
    pub fn sample(&mut self, transform: &Transform) -> bool {
        if self.is_pinned() {
            return false;
        }
        let next = ObserverSample::from_transform(transform);
        let changed = match self.current {
            None => true,
            Some(prev) => {
                prev.position.distance(next.position) > self.position_tolerance
                    || prev.forward.angle_between(next.forward) > self.angle_tolerance
            }
        };
        if changed {
            self.current = Some(next);
            self.dirty = true;
        }
        changed
    }

    /// Freeze sampling at `position`, remembering the current sample.
    pub fn pin(&mut self, position: Vec3) {
        if self.suspended.is_none() {
            self.suspended = Some(self.current);
        }
        let forward = self.current.map(|s| s.forward).unwrap_or(Vec3::NEG_Z);
        self.current = Some(ObserverSample { position, forward });
        self.dirty = true;
    }

    /// Undo [`pin`](Self::pin).
    pub fn restore(&mut self) {
        if let Some(previous) = self.suspended.take() {
            self.current = previous;
            self.dirty = true;
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn current(&self) -> Option<ObserverSample> {
        self.current
    }

    /// Read and clear the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// Bucket for `sqr_distance`: the first threshold it does not exceed, or one
/// past the last threshold.
pub fn bucket_for(thresholds: &[f32], sqr_distance: f32) -> usize {
    thresholds.partition_point(|t| *t < sqr_distance)
}

/// Distance record of a cell occupying `coords` relative to `sample`.
///
/// Raw distance is to the nearest point of any occupied square (zero inside).
/// The behind flag looks at the nearest corner and is never set while the
/// observer stands inside the cell.
pub fn measure(
    sample: &ObserverSample,
    coords: &[CellCoord],
    cell_size: f32,
    thresholds: &[f32],
) -> (usize, f32, bool) {
    let eye = Vec2::new(sample.position.x, sample.position.z);
    let forward = Vec2::new(sample.forward.x, sample.forward.z);
    let mut raw = f32::INFINITY;
    let mut corner_sqr = f32::INFINITY;
    let mut nearest_corner = eye;
    for coord in coords {
        let min = coord.min_corner(cell_size);
        let max = min + Vec2::splat(cell_size);
        raw = raw.min(eye.distance_squared(eye.clamp(min, max)));
        for corner in [min, Vec2::new(max.x, min.y), max, Vec2::new(min.x, max.y)] {
            let d = eye.distance_squared(corner);
            if d < corner_sqr {
                corner_sqr = d;
                nearest_corner = corner;
            }
        }
    }
    let is_behind = raw > 0.0 && forward.dot(nearest_corner - eye) < 0.0;
    (bucket_for(thresholds, raw), raw, is_behind)
}

#[derive(Debug)]
struct Measured {
    id: CellId,
    bucket: usize,
    raw: f32,
    is_behind: bool,
}

/// Keeps partition info for every non-empty cell, recomputed by one
/// background job at a time.
#[derive(Debug)]
pub struct Partitioner {
    thresholds: Arc<[f32]>,
    cell_size: f32,
    raw_tolerance: f32,
    infos: HashMap<CellId, PartitionInfo>,
    in_flight: Option<Receiver<Vec<Measured>>>,
    needs_full_pass: bool,
    jobs_scheduled: u64,
    jobs_completed: u64,
}

impl Partitioner {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            thresholds: config.sqr_distance_buckets.clone().into(),
            cell_size: config.cell_size,
            raw_tolerance: config.raw_distance_tolerance,
            infos: HashMap::new(),
            in_flight: None,
            needs_full_pass: false,
            jobs_scheduled: 0,
            jobs_completed: 0,
        }
    }

    /// Consume the finished job, if any. Returns the number of cells whose
    /// info changed.
    pub fn poll(&mut self) -> usize {
        let Some(rx) = &self.in_flight else {
            return 0;
        };
        let results = match rx.try_recv() {
            Ok(results) => results,
            Err(TryRecvError::Empty) => return 0,
            Err(TryRecvError::Disconnected) => {
                error!("partition job ended without a result");
                self.in_flight = None;
                self.needs_full_pass = true;
                return 0;
            }
        };
        self.in_flight = None;
        self.jobs_completed += 1;

        let mut changed = 0;
        for m in results {
            match self.infos.get_mut(&m.id) {
                Some(info) => {
                    let moved = (m.raw - info.raw_sqr_distance).abs() > self.raw_tolerance;
                    if m.bucket != info.bucket || m.is_behind != info.is_behind || moved {
                        info.bucket = m.bucket;
                        info.is_behind = m.is_behind;
                        info.raw_sqr_distance = m.raw;
                        info.dirty = true;
                        changed += 1;
                    }
                }
                None => {
                    self.infos.insert(
                        m.id,
                        PartitionInfo {
                            bucket: m.bucket,
                            raw_sqr_distance: m.raw,
                            is_behind: m.is_behind,
                            dirty: true,
                        },
                    );
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Schedule the next job unless one is still running.
    ///
    /// New cells are always measured; existing ones only when the observer
    /// sample is dirty (remembered until a job can take it). Returns true if a
    /// job was started.
    pub fn schedule<'a>(
        &mut self,
        sample: Option<ObserverSample>,
        sample_dirty: bool,
        definitions: impl Iterator<Item = &'a CellDefinition>,
    ) -> bool {
        self.needs_full_pass |= sample_dirty;
        if self.in_flight.is_some() {
            return false;
        }
        let Some(sample) = sample else {
            return false;
        };
        let full = self.needs_full_pass;
        let cells: Vec<(CellId, Vec<CellCoord>)> = definitions
            .filter(|d| !d.is_empty && (full || !self.infos.contains_key(&d.id)))
            .map(|d| (d.id.clone(), d.coords.clone()))
            .collect();
        if cells.is_empty() {
            self.needs_full_pass = false;
            return false;
        }

        let (tx, rx) = bounded(1);
        let thresholds = self.thresholds.clone();
        let cell_size = self.cell_size;
        rayon::spawn(move || {
            let measured: Vec<Measured> = cells
                .into_par_iter()
                .map(|(id, coords)| {
                    let (bucket, raw, is_behind) = measure(&sample, &coords, cell_size, &thresholds);
                    Measured {
                        id,
                        bucket,
                        raw,
                        is_behind,
                    }
                })
                .collect();
            let _ = tx.send(measured);
        });
        debug!(full, "partition job scheduled");
        self.in_flight = Some(rx);
        self.needs_full_pass = false;
        self.jobs_scheduled += 1;
        true
    }

    pub fn info(&self, id: &CellId) -> Option<&PartitionInfo> {
        self.infos.get(id)
    }

    /// Ids whose info is dirty, clearing the flag.
    pub fn take_dirty(&mut self) -> Vec<CellId> {
        let mut dirty = Vec::new();
        for (id, info) in self.infos.iter_mut() {
            if std::mem::take(&mut info.dirty) {
                dirty.push(id.clone());
            }
        }
        dirty
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn jobs_scheduled(&self) -> u64 {
        self.jobs_scheduled
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::until;

    const CELL: f32 = 16.0;
    const BUCKETS: [f32; 3] = [256.0, 1024.0, 4096.0];

    fn looking_north(x: f32, z: f32) -> ObserverSample {
        ObserverSample {
            position: Vec3::new(x, 0.0, z),
            forward: Vec3::NEG_Z,
        }
    }

    #[test]
    fn bucket_boundaries_go_to_closer_bucket() {
        assert_eq!(bucket_for(&BUCKETS, 0.0), 0);
        assert_eq!(bucket_for(&BUCKETS, 256.0), 0);
        assert_eq!(bucket_for(&BUCKETS, 256.5), 1);
        assert_eq!(bucket_for(&BUCKETS, 4096.0), 2);
        assert_eq!(bucket_for(&BUCKETS, 5000.0), 3);
    }

    #[test]
    fn inside_cell_is_zero_and_not_behind() {
        let sample = looking_north(8.0, 8.0);
        let (bucket, raw, behind) = measure(&sample, &[CellCoord::ORIGIN], CELL, &BUCKETS);
        assert_eq!((bucket, raw, behind), (0, 0.0, false));
    }

    #[test]
    fn behind_flag_follows_facing() {
        let sample = looking_north(8.0, 8.0);
        // North is -Z: cell (0,-2) is ahead, (0,2) behind.
        let (_, ahead_raw, ahead_behind) = measure(&sample, &[CellCoord::new(0, -2)], CELL, &BUCKETS);
        let (_, back_raw, back_behind) = measure(&sample, &[CellCoord::new(0, 2)], CELL, &BUCKETS);
        assert!(!ahead_behind);
        assert!(back_behind);
        assert_eq!(ahead_raw, back_raw);
        assert_eq!(ahead_raw, 24.0 * 24.0);
    }

    #[test]
    fn multi_coordinate_cells_use_nearest_square() {
        let sample = looking_north(8.0, 8.0);
        let far_only = measure(&sample, &[CellCoord::new(5, 0)], CELL, &BUCKETS).1;
        let with_near = measure(&sample, &[CellCoord::new(5, 0), CellCoord::new(1, 0)], CELL, &BUCKETS).1;
        assert!(with_near < far_only);
        assert_eq!(with_near, 64.0);
    }

    #[test]
    fn sampler_tolerances_and_pinning() {
        let mut sampler = ObserverSampler::new(1.0, 10.0);
        let start = Transform::from_position(Vec3::ZERO);
        assert!(sampler.sample(&start));
        assert!(sampler.take_dirty());
        assert!(!sampler.sample(&Transform::from_position(Vec3::new(0.5, 0.0, 0.0))));
        assert!(sampler.sample(&Transform::looking(Vec3::ZERO, Vec3::X)));
        assert!(sampler.take_dirty());

        sampler.pin(Vec3::new(500.0, 0.0, 500.0));
        assert!(sampler.is_pinned());
        assert!(!sampler.sample(&Transform::from_position(Vec3::new(40.0, 0.0, 0.0))));
        assert_eq!(sampler.current().unwrap().position, Vec3::new(500.0, 0.0, 500.0));

        sampler.restore();
        assert!(!sampler.is_pinned());
        assert_eq!(sampler.current().unwrap().position, Vec3::ZERO);
        assert!(sampler.take_dirty());
    }

    fn defs() -> Vec<CellDefinition> {
        (0..6)
            .map(|i| {
                let c = CellCoord::new(i, 0);
                CellDefinition::new(CellId::new(format!("c{i}")), c, vec![c], None)
            })
            .chain(std::iter::once(CellDefinition::empty(CellCoord::new(0, 9))))
            .collect()
    }

    #[tokio::test]
    async fn job_results_are_consumed_on_a_later_poll() {
        let config = StreamConfig {
            sqr_distance_buckets: BUCKETS.to_vec(),
            ..StreamConfig::default()
        };
        let mut partitioner = Partitioner::new(&config);
        let defs = defs();
        assert!(partitioner.schedule(Some(looking_north(8.0, 8.0)), true, defs.iter()));
        // Single job in flight.
        assert!(!partitioner.schedule(Some(looking_north(8.0, 8.0)), false, defs.iter()));
        assert!(until(|| partitioner.poll() > 0).await);
        assert!(!partitioner.is_busy());

        // Empty definitions are never partitioned.
        assert_eq!(partitioner.len(), 6);
        let mut dirty = partitioner.take_dirty();
        dirty.sort();
        assert_eq!(dirty.len(), 6);
        assert!(partitioner.take_dirty().is_empty());
        assert_eq!(partitioner.info(&CellId::new("c0")).unwrap().bucket, 0);
        assert_eq!(partitioner.info(&CellId::new("c5")).unwrap().bucket, 3);
    }

    #[tokio::test]
    async fn small_moves_do_not_mark_dirty() {
        let config = StreamConfig {
            sqr_distance_buckets: BUCKETS.to_vec(),
            raw_distance_tolerance: 50.0,
            ..StreamConfig::default()
        };
        let mut partitioner = Partitioner::new(&config);
        let defs = defs();
        partitioner.schedule(Some(looking_north(8.0, 8.0)), true, defs.iter());
        until(|| partitioner.poll() > 0).await;
        partitioner.take_dirty();

        // A fifth of a unit east keeps every bucket and moves no distance
        // past the tolerance.
        assert!(partitioner.schedule(Some(looking_north(8.2, 8.0)), true, defs.iter()));
        until(|| {
            partitioner.poll();
            !partitioner.is_busy()
        })
        .await;
        assert_eq!(partitioner.jobs_completed(), 2);
        assert!(partitioner.take_dirty().is_empty());
    }
}
