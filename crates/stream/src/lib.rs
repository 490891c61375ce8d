//! Streaming: discovers, partitions, loads, runs and retires world cells
//! around an observer.
//!
//! # Invariants
//! - Loading plus running cells never exceed the admission budget.
//! - A cell shows its placeholder or its full representation, never both;
//!   showing the placeholder means its instance is gone.
//! - Every background fetch, load and cell loop belongs to the session scope
//!   and is cancelled with it.
//! - Decisions happen on the tick; background work only reports results.
//! - A teleport resolves exactly once.
//!
//! # Layout
//! [`Streamer`] owns one realm session at a time. The session wires
//! [`RangeTracker`], [`PointerResolver`], [`Partitioner`], [`AdmissionGate`],
//! [`LoadPipeline`], [`RuntimeScheduler`], [`VisualStateResolver`],
//! [`LodPlanner`] and [`TeleportCoordinator`] together; running cells are published through the
//! shared [`CellCache`].

mod admission;
mod cache;
mod cell;
mod config;
mod definitions;
mod error;
mod load;
mod lod;
mod notify;
mod partition;
mod pointers;
mod range;
mod realm;
mod runtime;
mod session;
mod stats;
mod streamer;
mod teleport;
mod visual;

pub use admission::{AdmissionDecision, AdmissionGate, Candidate, Occupant};
pub use cache::{CacheReader, CellCache};
pub use cell::{CellFactory, CellInstance, FactoryCounters, TickingCell, TickingCellFactory};
pub use config::{ConfigError, SaturationPolicy, StreamConfig};
pub use definitions::DefinitionIndex;
pub use error::StreamError;
pub use load::{LoadEvent, LoadPipeline};
pub use lod::{LodCandidate, LodPlan, LodPlanner, LodQuality, PlaceholderSet, Representation};
pub use notify::{ChannelSink, LogSink, Notice, NoticeBuffer, NoticeKind, NotificationSink};
pub use partition::{ObserverSample, ObserverSampler, PartitionInfo, Partitioner, bucket_for, measure};
pub use pointers::{PointerResolver, ResolveOutcome};
pub use range::{RangeTracker, cells_in_radius, ring_coords};
pub use realm::{RealmController, RealmEvent};
pub use runtime::RuntimeScheduler;
pub use session::{SessionContext, StreamServices};
pub use stats::{StreamStats, TickTimer};
pub use streamer::{CellLoadState, CellSnapshot, StreamSnapshot, Streamer};
pub use teleport::{
    ReadinessOutcome, ReadinessReport, TeleportCoordinator, TargetStatus, TeleportResolution,
    TeleportState,
};
pub use visual::{VisualState, VisualStateResolver};

pub fn crate_info() -> &'static str {
    "realmstream-stream v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("stream"));
    }
}
