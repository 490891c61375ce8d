use async_trait::async_trait;
use realmstream_common::{CellCoord, CellDefinition, CellId, Manifest, ManifestRef, RealmDescriptor};

/// Errors from catalog operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("content {hash} does not match its hash")]
    Integrity { hash: String },
    #[error("content not found: {0}")]
    NotFound(String),
    #[error("realm unreachable: {0}")]
    RealmUnreachable(String),
    #[error("injected fault: {0}")]
    Injected(String),
}

/// Read access to a content catalog.
///
/// All calls are independent; implementations must be safe to call from
/// several tasks at once.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Definitions occupying any of `coords`. Coordinates with no definition
    /// are left out of the result.
    async fn fetch_by_pointers(
        &self,
        base_url: &str,
        coords: &[CellCoord],
    ) -> Result<Vec<CellDefinition>, CatalogError>;

    /// Definitions with the given ids. Unknown ids are left out of the result.
    async fn fetch_by_ids(
        &self,
        base_url: &str,
        ids: &[CellId],
    ) -> Result<Vec<CellDefinition>, CatalogError>;

    /// Descriptor of the realm identified by `realm`.
    async fn fetch_realm(&self, realm: &str) -> Result<RealmDescriptor, CatalogError>;

    /// Download and verify a manifest.
    async fn fetch_manifest(
        &self,
        base_url: &str,
        manifest: &ManifestRef,
    ) -> Result<Manifest, CatalogError>;
}
