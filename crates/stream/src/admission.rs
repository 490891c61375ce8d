use crate::config::{SaturationPolicy, StreamConfig};
use realmstream_common::{CellCoord, CellId};
use std::cmp::Ordering;

/// A cell that wants to start loading.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: CellId,
    pub base: CellCoord,
    pub raw_sqr_distance: f32,
    pub is_behind: bool,
    /// The observer stands inside one of the cell's coordinates.
    pub contains_observer: bool,
}

/// A cell currently holding a budget slot (loading or active).
#[derive(Debug, Clone, PartialEq)]
pub struct Occupant {
    pub id: CellId,
    pub raw_sqr_distance: f32,
}

/// What to do this tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AdmissionDecision {
    /// Cells to release before anything is admitted.
    pub preempt: Vec<CellId>,
    /// Cells to start loading, closest first.
    pub admit: Vec<CellId>,
    /// Ranked candidates left waiting.
    pub waiting: usize,
}

/// Ranking order: pinned first, then the cell the observer stands in, then
/// ascending distance, cells in front before cells behind, then base
/// coordinate.
pub(crate) fn rank(a: &Candidate, b: &Candidate, pinned: Option<&CellId>) -> Ordering {
    let a_pinned = pinned == Some(&a.id);
    let b_pinned = pinned == Some(&b.id);
    b_pinned
        .cmp(&a_pinned)
        .then_with(|| b.contains_observer.cmp(&a.contains_observer))
        .then_with(|| a.raw_sqr_distance.total_cmp(&b.raw_sqr_distance))
        .then_with(|| a.is_behind.cmp(&b.is_behind))
        .then_with(|| a.base.cmp(&b.base))
}

/// Decides which cells may start loading.
///
/// Holds no ranking state between ticks: every decision is made from the
/// candidates and occupants passed in.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    budget: usize,
    max_per_tick: usize,
    policy: SaturationPolicy,
}

impl AdmissionGate {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            budget: config.admission_budget,
            max_per_tick: config.max_admissions_per_tick,
            policy: config.saturation_policy,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Sort candidates into admission order.
    pub fn rank(candidates: &mut [Candidate], pinned: Option<&CellId>) {
        candidates.sort_by(|a, b| rank(a, b, pinned));
    }

    /// Admit the closest candidates that fit the budget.
    ///
    /// `candidates` must not include occupants. When the budget is full a
    /// candidate waits, unless it is `pinned` or the policy is
    /// [`SaturationPolicy::PreemptFarther`]; then the farthest occupant is
    /// released for it (for the policy, only one strictly farther away).
    pub fn decide(
        &self,
        mut candidates: Vec<Candidate>,
        occupants: &[Occupant],
        pinned: Option<&CellId>,
    ) -> AdmissionDecision {
        Self::rank(&mut candidates, pinned);

        // Farthest first; a pinned occupant is never displaced.
        let mut victims: Vec<&Occupant> =
            occupants.iter().filter(|o| Some(&o.id) != pinned).collect();
        victims.sort_by(|a, b| b.raw_sqr_distance.total_cmp(&a.raw_sqr_distance));
        let mut victims = victims.into_iter().peekable();

        let mut free = self.budget.saturating_sub(occupants.len());
        let mut decision = AdmissionDecision::default();
        for candidate in &candidates {
            if decision.admit.len() >= self.max_per_tick {
                break;
            }
            if free > 0 {
                free -= 1;
                decision.admit.push(candidate.id.clone());
                continue;
            }
            let is_pinned = pinned == Some(&candidate.id);
            let victim = match (is_pinned, self.policy) {
                (true, _) => victims.next(),
                (false, SaturationPolicy::PreemptFarther) => {
                    victims.next_if(|v| v.raw_sqr_distance > candidate.raw_sqr_distance)
                }
                (false, SaturationPolicy::Wait) => None,
            };
            match victim {
                Some(victim) => {
                    tracing::debug!(
                        cell = %candidate.id,
                        preempted = %victim.id,
                        "budget full, preempting farther cell"
                    );
                    decision.preempt.push(victim.id.clone());
                    decision.admit.push(candidate.id.clone());
                }
                None => break,
            }
        }
        decision.waiting = candidates.len() - decision.admit.len();
        decision
    }
}
