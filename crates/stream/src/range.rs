use glam::Vec3;
use realmstream_common::CellCoord;
use std::collections::HashSet;

/// Coordinates at exactly ring distance `ring` from `center`, in a stable
/// order (clockwise from the minimum corner). Ring 0 is the center itself.
pub fn ring_coords(center: CellCoord, ring: u32) -> Vec<CellCoord> {
    if ring == 0 {
        return vec![center];
    }
    let r = ring.min(i32::MAX as u32) as i32;
    let mut out = Vec::with_capacity(8 * r as usize);
    for x in -r..=r {
        out.push(center.offset(x, -r));
    }
    for z in (-r + 1)..=r {
        out.push(center.offset(r, z));
    }
    for x in (-r..r).rev() {
        out.push(center.offset(x, r));
    }
    for z in ((-r + 1)..r).rev() {
        out.push(center.offset(-r, z));
    }
    out
}

/// Every coordinate within ring distance `radius` of `center`, nearest rings
/// first.
pub fn cells_in_radius(center: CellCoord, radius: u32) -> Vec<CellCoord> {
    (0..=radius).flat_map(|r| ring_coords(center, r)).collect()
}

/// Tracks the set of coordinates within range of the observer.
///
/// The set is only rebuilt when the observer has moved farther than the
/// position tolerance since the last rebuild and now stands in another cell.
/// Pointer discovery only asks for coordinates in the set, and only cells
/// overlapping it are admitted for loading.
#[derive(Debug)]
pub struct RangeTracker {
    cell_size: f32,
    radius: u32,
    tolerance: f32,
    last_position: Option<Vec3>,
    center: Option<CellCoord>,
    in_range: HashSet<CellCoord>,
}

impl RangeTracker {
    pub fn new(cell_size: f32, radius: u32, tolerance: f32) -> Self {
        Self {
            cell_size,
            radius,
            tolerance,
            last_position: None,
            center: None,
            in_range: HashSet::new(),
        }
    }

    /// Feed the observer position. Returns true when the in-range set changed.
    pub fn update(&mut self, position: Vec3) -> bool {
        if let Some(last) = self.last_position {
            if last.distance(position) <= self.tolerance && self.center.is_some() {
                return false;
            }
        }
        self.last_position = Some(position);
        let center = CellCoord::from_position(position, self.cell_size);
        if self.center == Some(center) {
            return false;
        }
        self.rebuild(center);
        true
    }

    fn rebuild(&mut self, center: CellCoord) {
        self.center = Some(center);
        self.in_range = cells_in_radius(center, self.radius).into_iter().collect();
        tracing::trace!(%center, radius = self.radius, cells = self.in_range.len(), "range rebuilt");
    }

    pub fn center(&self) -> Option<CellCoord> {
        self.center
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    pub fn contains(&self, coord: CellCoord) -> bool {
        self.in_range.contains(&coord)
    }

    /// Whether any of `coords` is in range.
    pub fn overlaps(&self, coords: &[CellCoord]) -> bool {
        coords.iter().any(|c| self.in_range.contains(c))
    }

    /// Number of coordinates in range.
    pub fn cell_count(&self) -> usize {
        self.in_range.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_sizes() {
        assert_eq!(ring_coords(CellCoord::ORIGIN, 0).len(), 1);
        assert_eq!(ring_coords(CellCoord::ORIGIN, 1).len(), 8);
        assert_eq!(ring_coords(CellCoord::ORIGIN, 3).len(), 24);
        let center = CellCoord::new(5, -2);
        for c in ring_coords(center, 2) {
            assert_eq!(center.ring_distance(c), 2);
        }
    }

    #[test]
    fn radius_one_around_origin_is_three_by_three() {
        let mut tracker = RangeTracker::new(16.0, 1, 1.0);
        assert!(tracker.update(CellCoord::ORIGIN.center(16.0)));
        assert_eq!(tracker.cell_count(), 9);
        for x in -1..=1 {
            for z in -1..=1 {
                assert!(tracker.contains(CellCoord::new(x, z)));
            }
        }
        assert!(!tracker.contains(CellCoord::new(2, 0)));
    }

    #[test]
    fn radius_set_matches_analytic_square() {
        let center = CellCoord::new(-4, 9);
        let cells = cells_in_radius(center, 3);
        let unique: HashSet<_> = cells.iter().copied().collect();
        assert_eq!(cells.len(), 49);
        assert_eq!(unique.len(), 49);
        assert!(cells.iter().all(|c| center.ring_distance(*c) <= 3));
        assert_eq!(cells[0], center);
    }

    #[test]
    fn small_moves_do_not_rebuild() {
        let mut tracker = RangeTracker::new(16.0, 2, 1.0);
        assert!(tracker.update(Vec3::new(8.0, 0.0, 8.0)));
        assert!(!tracker.update(Vec3::new(8.5, 0.0, 8.0)));
        // Moved past tolerance but still in the same cell.
        assert!(!tracker.update(Vec3::new(12.0, 0.0, 8.0)));
        assert!(tracker.update(Vec3::new(20.0, 0.0, 8.0)));
        assert_eq!(tracker.center(), Some(CellCoord::new(1, 0)));
        assert!(tracker.contains(CellCoord::new(3, 0)));
        assert!(!tracker.contains(CellCoord::new(-2, 0)));
    }

    #[test]
    fn overlap_counts_any_covered_coordinate() {
        let mut tracker = RangeTracker::new(16.0, 1, 1.0);
        assert!(!tracker.overlaps(&[CellCoord::ORIGIN]));
        tracker.update(Vec3::ZERO);
        assert!(tracker.overlaps(&[CellCoord::new(5, 5), CellCoord::new(1, 1)]));
        assert!(!tracker.overlaps(&[CellCoord::new(5, 5), CellCoord::new(2, 1)]));
        assert!(!tracker.overlaps(&[]));
    }

    #[test]
    fn rings_clamp_at_the_grid_edge() {
        let corner = CellCoord::new(i32::MAX, i32::MIN);
        let ring = ring_coords(corner, 1);
        assert_eq!(ring.len(), 8);
        assert!(ring.iter().all(|c| c.x >= i32::MAX - 1 && c.z <= i32::MIN + 1));
    }
}
