use crate::client::{CatalogClient, CatalogError};
use crate::wire::{content_hash, verify_manifest};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use realmstream_common::{CellCoord, CellDefinition, CellId, Manifest, ManifestRef, RealmDescriptor};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Request counters, for tests and the CLI report.
#[derive(Debug, Default)]
pub struct CatalogCounters {
    pointer_requests: AtomicUsize,
    pointers_requested: AtomicUsize,
    id_requests: AtomicUsize,
    manifest_requests: AtomicUsize,
    realm_requests: AtomicUsize,
}

impl CatalogCounters {
    pub fn pointer_requests(&self) -> usize {
        self.pointer_requests.load(Ordering::Relaxed)
    }

    /// Total coordinates asked for across all pointer requests.
    pub fn pointers_requested(&self) -> usize {
        self.pointers_requested.load(Ordering::Relaxed)
    }

    pub fn id_requests(&self) -> usize {
        self.id_requests.load(Ordering::Relaxed)
    }

    pub fn manifest_requests(&self) -> usize {
        self.manifest_requests.load(Ordering::Relaxed)
    }

    pub fn realm_requests(&self) -> usize {
        self.realm_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct RealmContent {
    by_coord: HashMap<CellCoord, CellId>,
    definitions: HashMap<CellId, CellDefinition>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Faults {
    pointer_failures: usize,
    id_failures: usize,
    failing_manifests: HashSet<String>,
    unreachable_realms: HashSet<String>,
}

/// Catalog held entirely in memory.
///
/// Content is keyed by base URL, realms by identifier. Latency and failures
/// can be injected at runtime to exercise the streamer's recovery paths.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    realms: RwLock<HashMap<String, RealmDescriptor>>,
    content: RwLock<HashMap<String, RealmContent>>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    counters: CatalogCounters,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A volatile realm named `realm` whose catalog covers the square
    /// `[-extent, extent]` with one cell per coordinate.
    pub fn with_grid_world(realm: &str, base_url: &str, extent: i32) -> Self {
        let catalog = Self::new();
        catalog.add_realm(
            realm,
            RealmDescriptor {
                name: realm.to_string(),
                base_url: base_url.to_string(),
                fixed_cells: None,
            },
        );
        catalog.publish_grid(base_url, extent, None);
        catalog
    }

    pub fn counters(&self) -> &CatalogCounters {
        &self.counters
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn add_realm(&self, identifier: &str, descriptor: RealmDescriptor) {
        self.content
            .write()
            .entry(descriptor.base_url.clone())
            .or_default();
        self.realms
            .write()
            .insert(identifier.to_string(), descriptor);
    }

    /// Publish a cell occupying `coords` (first entry is the base) together
    /// with a generated manifest.
    pub fn publish(&self, base_url: &str, id: &str, coords: Vec<CellCoord>) -> CellDefinition {
        assert!(!coords.is_empty(), "a cell occupies at least one coordinate");
        let manifest = Manifest {
            main: format!("{id}/main.js"),
            files: Vec::new(),
        };
        let bytes = serde_json::to_vec(&manifest).unwrap_or_default();
        let hash = content_hash(&bytes);
        let def = CellDefinition::new(
            CellId::new(id),
            coords[0],
            coords,
            Some(ManifestRef(hash.clone())),
        );

        let mut content = self.content.write();
        let realm = content.entry(base_url.to_string()).or_default();
        for coord in &def.coords {
            realm.by_coord.insert(*coord, def.id.clone());
        }
        realm.blobs.insert(hash, bytes);
        realm.definitions.insert(def.id.clone(), def.clone());
        def
    }

    /// Publish one single-coordinate cell per coordinate of the square
    /// `[-extent, extent]`, leaving every `hole_every`-th coordinate empty.
    pub fn publish_grid(&self, base_url: &str, extent: i32, hole_every: Option<usize>) -> usize {
        let mut published = 0;
        let mut index = 0usize;
        for x in -extent..=extent {
            for z in -extent..=extent {
                index += 1;
                if hole_every.is_some_and(|n| n > 0 && index % n == 0) {
                    continue;
                }
                let coord = CellCoord::new(x, z);
                self.publish(base_url, &format!("cell:{coord}"), vec![coord]);
                published += 1;
            }
        }
        debug!(base_url, published, "published grid world");
        published
    }

    /// Make the stored manifest of `id` fail its integrity check.
    pub fn corrupt_manifest(&self, base_url: &str, id: &CellId) {
        let mut content = self.content.write();
        if let Some(realm) = content.get_mut(base_url) {
            let hash = realm
                .definitions
                .get(id)
                .and_then(|d| d.manifest.clone());
            if let Some(ManifestRef(hash)) = hash {
                realm.blobs.insert(hash, b"{\"main\":\"tampered\"}".to_vec());
            }
        }
    }

    /// Fail the next `n` pointer requests.
    pub fn fail_next_pointer_requests(&self, n: usize) {
        self.faults.lock().pointer_failures = n;
    }

    /// Fail the next `n` id requests.
    pub fn fail_next_id_requests(&self, n: usize) {
        self.faults.lock().id_failures = n;
    }

    /// Fail every manifest download for `id` until cleared.
    pub fn fail_manifest_for(&self, base_url: &str, id: &CellId, failing: bool) {
        let hash = self
            .content
            .read()
            .get(base_url)
            .and_then(|r| r.definitions.get(id))
            .and_then(|d| d.manifest.clone());
        if let Some(ManifestRef(hash)) = hash {
            let mut faults = self.faults.lock();
            if failing {
                faults.failing_manifests.insert(hash);
            } else {
                faults.failing_manifests.remove(&hash);
            }
        }
    }

    pub fn set_realm_unreachable(&self, identifier: &str, unreachable: bool) {
        let mut faults = self.faults.lock();
        if unreachable {
            faults.unreachable_realms.insert(identifier.to_string());
        } else {
            faults.unreachable_realms.remove(identifier);
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn fetch_by_pointers(
        &self,
        base_url: &str,
        coords: &[CellCoord],
    ) -> Result<Vec<CellDefinition>, CatalogError> {
        self.counters.pointer_requests.fetch_add(1, Ordering::Relaxed);
        self.counters
            .pointers_requested
            .fetch_add(coords.len(), Ordering::Relaxed);
        self.simulate_latency().await;
        if Self::take_fault(&mut self.faults.lock().pointer_failures) {
            return Err(CatalogError::Injected(format!(
                "pointer request for {} coordinates",
                coords.len()
            )));
        }

        let content = self.content.read();
        let realm = content
            .get(base_url)
            .ok_or_else(|| CatalogError::NotFound(base_url.to_string()))?;
        let mut seen = HashSet::new();
        Ok(coords
            .iter()
            .filter_map(|c| realm.by_coord.get(c))
            .filter(|id| seen.insert((*id).clone()))
            .filter_map(|id| realm.definitions.get(id).cloned())
            .collect())
    }

    async fn fetch_by_ids(
        &self,
        base_url: &str,
        ids: &[CellId],
    ) -> Result<Vec<CellDefinition>, CatalogError> {
        self.counters.id_requests.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        if Self::take_fault(&mut self.faults.lock().id_failures) {
            return Err(CatalogError::Injected(format!("id request for {} cells", ids.len())));
        }

        let content = self.content.read();
        let realm = content
            .get(base_url)
            .ok_or_else(|| CatalogError::NotFound(base_url.to_string()))?;
        Ok(ids
            .iter()
            .filter_map(|id| realm.definitions.get(id).cloned())
            .collect())
    }

    async fn fetch_realm(&self, realm: &str) -> Result<RealmDescriptor, CatalogError> {
        self.counters.realm_requests.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        if self.faults.lock().unreachable_realms.contains(realm) {
            return Err(CatalogError::RealmUnreachable(realm.to_string()));
        }
        self.realms
            .read()
            .get(realm)
            .cloned()
            .ok_or_else(|| CatalogError::RealmUnreachable(realm.to_string()))
    }

    async fn fetch_manifest(
        &self,
        base_url: &str,
        manifest: &ManifestRef,
    ) -> Result<Manifest, CatalogError> {
        self.counters.manifest_requests.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        if self.faults.lock().failing_manifests.contains(&manifest.0) {
            return Err(CatalogError::Injected(format!("manifest {}", manifest.0)));
        }
        let bytes = self
            .content
            .read()
            .get(base_url)
            .and_then(|r| r.blobs.get(&manifest.0).cloned())
            .ok_or_else(|| CatalogError::NotFound(manifest.0.clone()))?;
        verify_manifest(manifest, &bytes)
    }
}
