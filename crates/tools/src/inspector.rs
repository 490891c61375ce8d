use glam::Vec3;
use realmstream_common::{CellCoord, CellId};
use realmstream_stream::{CellLoadState, LodQuality, StreamSnapshot, VisualState};
use std::fmt;

/// Stream inspector for developer tooling.
///
/// Provides read-only queries against a [`StreamSnapshot`] for debugging and
/// the CLI.
pub struct StreamInspector;

impl StreamInspector {
    /// Produce a summary of the stream state.
    pub fn summary(snapshot: &StreamSnapshot) -> StreamSummary {
        let count = |state: CellLoadState| {
            snapshot
                .cells
                .iter()
                .filter(|c| c.load_state == state)
                .count()
        };
        StreamSummary {
            realm: snapshot.realm.clone(),
            tick: snapshot.stats.tick,
            observer: snapshot.observer.position,
            center: snapshot.center,
            in_range: snapshot.in_range,
            current_cell: snapshot.current_cell.clone(),
            teleporting: snapshot.teleport_target.is_some(),
            resolved: snapshot.cells.len(),
            empty: count(CellLoadState::Empty),
            loading: count(CellLoadState::Loading),
            running: count(CellLoadState::Running),
            failed: count(CellLoadState::Failed),
            placeholders: snapshot.stats.placeholders,
            reduced_placeholders: snapshot.stats.reduced_placeholders,
            budget: snapshot.budget,
            promises_created: snapshot.stats.promises_created,
        }
    }

    /// Info for the cell based at `coord`, if its definition is resolved.
    pub fn inspect_cell(snapshot: &StreamSnapshot, coord: CellCoord) -> Option<CellInfo> {
        snapshot
            .cells
            .iter()
            .find(|c| c.base == coord)
            .map(CellInfo::from)
    }

    /// Info for the cell with `id`.
    pub fn inspect_id(snapshot: &StreamSnapshot, id: &CellId) -> Option<CellInfo> {
        snapshot.cells.iter().find(|c| &c.id == id).map(CellInfo::from)
    }

    /// All non-empty cells, nearest first.
    pub fn list_cells(snapshot: &StreamSnapshot) -> Vec<CellInfo> {
        let mut cells: Vec<CellInfo> = snapshot
            .cells
            .iter()
            .filter(|c| c.load_state != CellLoadState::Empty)
            .map(CellInfo::from)
            .collect();
        cells.sort_by(|a, b| {
            let a_raw = a.raw_sqr_distance.unwrap_or(f32::INFINITY);
            let b_raw = b.raw_sqr_distance.unwrap_or(f32::INFINITY);
            a_raw.total_cmp(&b_raw).then_with(|| a.base.cmp(&b.base))
        });
        cells
    }
}

/// Summary of stream state for the inspector.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub realm: Option<String>,
    pub tick: u64,
    pub observer: Vec3,
    pub center: Option<CellCoord>,
    pub in_range: usize,
    pub current_cell: Option<CellId>,
    pub teleporting: bool,
    pub resolved: usize,
    pub empty: usize,
    pub loading: usize,
    pub running: usize,
    pub failed: usize,
    pub placeholders: usize,
    pub reduced_placeholders: usize,
    pub budget: usize,
    pub promises_created: u64,
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stream: realm={} tick={} observer=({:.1}, {:.1}, {:.1}) in_range={} cells={} empty={} loading={} running={}/{} failed={} placeholders={} ({} reduced)",
            self.realm.as_deref().unwrap_or("-"),
            self.tick,
            self.observer.x,
            self.observer.y,
            self.observer.z,
            self.in_range,
            self.resolved,
            self.empty,
            self.loading,
            self.running,
            self.budget,
            self.failed,
            self.placeholders,
            self.reduced_placeholders,
        )?;
        if let Some(cell) = &self.current_cell {
            write!(f, " current={cell}")?;
        }
        if self.teleporting {
            f.write_str(" teleporting")?;
        }
        Ok(())
    }
}

/// Detailed info about a single cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellInfo {
    pub id: CellId,
    pub base: CellCoord,
    pub load_state: CellLoadState,
    pub visual: Option<VisualState>,
    pub placeholder: Option<LodQuality>,
    pub bucket: Option<usize>,
    pub raw_sqr_distance: Option<f32>,
    pub rate_hz: Option<f32>,
    pub tick_number: Option<u64>,
}

impl From<&realmstream_stream::CellSnapshot> for CellInfo {
    fn from(cell: &realmstream_stream::CellSnapshot) -> Self {
        Self {
            id: cell.id.clone(),
            base: cell.base,
            load_state: cell.load_state,
            visual: cell.visual,
            placeholder: cell.placeholder,
            bucket: cell.bucket,
            raw_sqr_distance: cell.raw_sqr_distance,
            rate_hz: cell.rate_hz,
            tick_number: cell.tick_number,
        }
    }
}

impl fmt::Display for CellInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visual = match self.visual {
            Some(VisualState::ShowingFullCell) => "full",
            Some(VisualState::ShowingPlaceholder) => "placeholder",
            None => "-",
        };
        write!(
            f,
            "Cell [{}] {} state={:?} visual={visual}",
            self.base, self.id, self.load_state
        )?;
        if let Some(quality) = self.placeholder {
            write!(f, " lod={quality}")?;
        }
        if let (Some(bucket), Some(raw)) = (self.bucket, self.raw_sqr_distance) {
            write!(f, " bucket={bucket} dist={:.1}", raw.sqrt())?;
        }
        if let (Some(rate), Some(ticks)) = (self.rate_hz, self.tick_number) {
            write!(f, " rate={rate:.0}Hz ticks={ticks}")?;
        }
        Ok(())
    }
}
