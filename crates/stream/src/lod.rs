//! Placeholder level-of-detail budgeting.
//!
//! A cell that cannot run its simulation (too far, or the full budget is
//! taken) shows a placeholder instead. Placeholders come in two qualities,
//! each with its own budget: the best-ranked cells get full-quality
//! placeholders, the next ones reduced-quality, the rest nothing.

use crate::admission::{Candidate, rank};
use crate::cell::CellInstance;
use crate::config::StreamConfig;
use realmstream_common::CellId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Detail level of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LodQuality {
    Full,
    Reduced,
}

impl fmt::Display for LodQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LodQuality::Full => "full",
            LodQuality::Reduced => "reduced",
        })
    }
}

/// What a load builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representation {
    /// The runnable cell.
    Full,
    Placeholder(LodQuality),
}

impl Representation {
    pub fn placeholder_quality(self) -> Option<LodQuality> {
        match self {
            Representation::Full => None,
            Representation::Placeholder(quality) => Some(quality),
        }
    }
}

/// A cell that should show a placeholder, with the quality it holds now
/// (shown or loading).
#[derive(Debug, Clone, PartialEq)]
pub struct LodCandidate {
    pub candidate: Candidate,
    pub current: Option<LodQuality>,
}

/// Placeholder work for one tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LodPlan {
    /// Placeholders to drop before anything is loaded.
    pub release: Vec<CellId>,
    /// Placeholders to start loading, best ranked first.
    pub load: Vec<(CellId, LodQuality)>,
    /// Cells holding a slot they could not start loading this tick.
    pub waiting: usize,
}

/// Hands out placeholder slots in rank order.
#[derive(Debug, Clone)]
pub struct LodPlanner {
    full_budget: usize,
    reduced_budget: usize,
}

impl LodPlanner {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            full_budget: config.lod_budget,
            reduced_budget: config.reduced_lod_budget,
        }
    }

    pub fn budgets(&self) -> (usize, usize) {
        (self.full_budget, self.reduced_budget)
    }

    /// Assign a quality to every candidate and diff it against what each
    /// holds. A cell whose quality changes is released and reloaded; a cell
    /// left without a slot is released. At most `max_loads` loads start.
    pub fn plan(&self, mut candidates: Vec<LodCandidate>, max_loads: usize) -> LodPlan {
        candidates.sort_by(|a, b| rank(&a.candidate, &b.candidate, None));

        let (mut full, mut reduced) = (0, 0);
        let mut plan = LodPlan::default();
        for entry in candidates {
            let wanted = if full < self.full_budget {
                full += 1;
                Some(LodQuality::Full)
            } else if reduced < self.reduced_budget {
                reduced += 1;
                Some(LodQuality::Reduced)
            } else {
                None
            };
            if entry.current == wanted {
                continue;
            }
            let id = entry.candidate.id;
            if entry.current.is_some() {
                debug!(cell = %id, from = ?entry.current, to = ?wanted, "placeholder quality changed");
                plan.release.push(id.clone());
            }
            match wanted {
                Some(quality) if plan.load.len() < max_loads => plan.load.push((id, quality)),
                Some(_) => plan.waiting += 1,
                None => {}
            }
        }
        plan
    }
}

struct Shown {
    instance: Arc<dyn CellInstance>,
    quality: LodQuality,
}

/// Placeholders currently displayed, one per cell.
#[derive(Default)]
pub struct PlaceholderSet {
    shown: HashMap<CellId, Shown>,
}

impl PlaceholderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show `instance` for `id`, disposing whatever it showed before.
    pub fn show(&mut self, id: &CellId, instance: Arc<dyn CellInstance>, quality: LodQuality) {
        if let Some(old) = self.shown.insert(id.clone(), Shown { instance, quality }) {
            old.instance.dispose();
        }
    }

    /// Dispose the placeholder of `id`. Returns false if none was shown.
    pub fn release(&mut self, id: &CellId) -> bool {
        match self.shown.remove(id) {
            Some(shown) => {
                shown.instance.dispose();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&mut self) -> usize {
        let count = self.shown.len();
        for (_, shown) in self.shown.drain() {
            shown.instance.dispose();
        }
        count
    }

    pub fn quality(&self, id: &CellId) -> Option<LodQuality> {
        self.shown.get(id).map(|s| s.quality)
    }

    pub fn ids(&self) -> impl Iterator<Item = &CellId> {
        self.shown.keys()
    }

    pub fn count(&self, quality: LodQuality) -> usize {
        self.shown.values().filter(|s| s.quality == quality).count()
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

impl fmt::Debug for PlaceholderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaceholderSet")
            .field("full", &self.count(LodQuality::Full))
            .field("reduced", &self.count(LodQuality::Reduced))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellFactory, TickingCellFactory};
    use realmstream_common::{CellCoord, CellDefinition};
    use tokio::runtime::Handle;

    fn entry(x: i32, raw: f32, current: Option<LodQuality>) -> LodCandidate {
        LodCandidate {
            candidate: Candidate {
                id: CellId::new(format!("c{x}")),
                base: CellCoord::new(x, 0),
                raw_sqr_distance: raw,
                is_behind: false,
                contains_observer: false,
            },
            current,
        }
    }

    fn planner(full: usize, reduced: usize) -> LodPlanner {
        LodPlanner::new(&StreamConfig {
            lod_budget: full,
            reduced_lod_budget: reduced,
            ..StreamConfig::default()
        })
    }

    fn loads(plan: &LodPlan) -> Vec<(&str, LodQuality)> {
        plan.load.iter().map(|(id, q)| (id.as_str(), *q)).collect()
    }

    #[test]
    fn budgets_split_full_then_reduced_then_nothing() {
        let candidates = (0..6).rev().map(|x| entry(x, x as f32 * 10.0, None)).collect();
        let plan = planner(2, 3).plan(candidates, 10);
        assert_eq!(
            loads(&plan),
            [
                ("c0", LodQuality::Full),
                ("c1", LodQuality::Full),
                ("c2", LodQuality::Reduced),
                ("c3", LodQuality::Reduced),
                ("c4", LodQuality::Reduced),
            ]
        );
        assert!(plan.release.is_empty());
    }

    #[test]
    fn full_placeholder_pushed_out_of_budget_reloads_reduced() {
        // A nearer cell takes the only full slot from c5.
        let candidates = vec![entry(1, 1.0, None), entry(5, 50.0, Some(LodQuality::Full))];
        let plan = planner(1, 1).plan(candidates, 10);
        assert_eq!(plan.release, [CellId::new("c5")]);
        assert_eq!(loads(&plan), [("c1", LodQuality::Full), ("c5", LodQuality::Reduced)]);
    }

    #[test]
    fn cells_beyond_both_budgets_are_released() {
        let candidates = vec![
            entry(0, 0.0, Some(LodQuality::Full)),
            entry(1, 1.0, Some(LodQuality::Reduced)),
            entry(2, 2.0, Some(LodQuality::Reduced)),
        ];
        let plan = planner(1, 1).plan(candidates, 10);
        assert_eq!(plan.release, [CellId::new("c2")]);
        assert!(plan.load.is_empty());
    }

    #[test]
    fn stable_assignment_does_nothing() {
        let candidates = vec![
            entry(0, 0.0, Some(LodQuality::Full)),
            entry(1, 1.0, Some(LodQuality::Reduced)),
        ];
        assert_eq!(planner(1, 4).plan(candidates, 10), LodPlan::default());
    }

    #[test]
    fn load_cap_leaves_slots_waiting() {
        let candidates = (0..4).map(|x| entry(x, x as f32, None)).collect();
        let plan = planner(4, 0).plan(candidates, 1);
        assert_eq!(loads(&plan), [("c0", LodQuality::Full)]);
        assert_eq!(plan.waiting, 3);
    }

    #[tokio::test]
    async fn placeholder_set_disposes_replaced_and_released() {
        let factory = TickingCellFactory::new(Handle::current());
        let counters = factory.counters();
        let def = CellDefinition::new(CellId::new("a"), CellCoord::ORIGIN, vec![CellCoord::ORIGIN], None);
        let mut set = PlaceholderSet::new();

        let first = factory.create_placeholder(&def, LodQuality::Full).await.unwrap();
        set.show(&def.id, first, LodQuality::Full);
        let second = factory.create_placeholder(&def, LodQuality::Reduced).await.unwrap();
        set.show(&def.id, second, LodQuality::Reduced);
        assert_eq!(counters.live(), 1);
        assert_eq!(set.quality(&def.id), Some(LodQuality::Reduced));
        assert_eq!(set.count(LodQuality::Full), 0);

        assert!(set.release(&def.id));
        assert!(!set.release(&def.id));
        assert_eq!(counters.live(), 0);
        assert!(set.is_empty());
    }
}
