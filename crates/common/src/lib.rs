//! Common types shared across the realm streaming workspace.
//!
//! # Invariants
//! - Coordinates, ids and definitions are plain values; nothing here owns a
//!   running cell.
//! - A [`Promise`] hands out its outcome exactly once.
//! - Cancelling a [`CancelScope`] cancels every scope created beneath it.

pub mod cancel;
pub mod promise;
pub mod types;

pub use cancel::CancelScope;
pub use promise::{Consume, Promise, Resolver};
pub use types::{
    CellCoord, CellDefinition, CellId, ContentFile, Manifest, ManifestRef, ParsePointerError,
    RealmDescriptor, SessionId, TeleportId, Transform,
};

pub fn crate_info() -> &'static str {
    "realmstream-common v0.1.0"
}
