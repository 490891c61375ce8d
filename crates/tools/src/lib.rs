//! Developer tooling: read-only inspection of a running streamer.
//!
//! # Invariants
//! - Tools never mutate the streamer; they work from snapshots.

mod inspector;

pub use inspector::{CellInfo, StreamInspector, StreamSummary};

pub fn crate_info() -> &'static str {
    "realmstream-tools v0.1.0"
}
