use crate::client::{CatalogClient, CatalogError};
use crate::wire::{AboutDto, EntityDto, IdsRequest, PointersRequest, verify_manifest};
use async_trait::async_trait;
use realmstream_common::{CellCoord, CellDefinition, CellId, Manifest, ManifestRef, RealmDescriptor};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Catalog backed by a content server over HTTP.
///
/// - `POST {base}/entities/active` with `{"pointers": [...]}` or `{"ids": [...]}`
/// - `GET {base}/contents/{hash}` for manifests
/// - `GET {realm}/about` for the realm descriptor
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: Client,
}

impl Default for HttpCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCatalog {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Client whose every request gives up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn post_entities<B: Serialize + Sync>(
        &self,
        base_url: &str,
        body: &B,
    ) -> Result<Vec<CellDefinition>, CatalogError> {
        let url = format!("{}/entities/active", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!(%url, status, "catalog rejected entity request");
            return Err(CatalogError::Status { url, status });
        }
        let entities: Vec<EntityDto> = response.json().await.map_err(|e| CatalogError::Malformed {
            url: url.clone(),
            message: e.to_string(),
        })?;
        debug!(%url, count = entities.len(), "entities fetched");
        entities
            .into_iter()
            .map(|e| e.into_definition(&url))
            .collect()
    }
}

fn request_error(url: &str, e: reqwest::Error) -> CatalogError {
    CatalogError::Request {
        url: url.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl CatalogClient for HttpCatalog {
    async fn fetch_by_pointers(
        &self,
        base_url: &str,
        coords: &[CellCoord],
    ) -> Result<Vec<CellDefinition>, CatalogError> {
        let body = PointersRequest {
            pointers: coords.iter().map(ToString::to_string).collect(),
        };
        self.post_entities(base_url, &body).await
    }

    async fn fetch_by_ids(
        &self,
        base_url: &str,
        ids: &[CellId],
    ) -> Result<Vec<CellDefinition>, CatalogError> {
        let body = IdsRequest {
            ids: ids.iter().map(|id| id.0.clone()).collect(),
        };
        self.post_entities(base_url, &body).await
    }

    async fn fetch_realm(&self, realm: &str) -> Result<RealmDescriptor, CatalogError> {
        let url = format!("{}/about", realm.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|_| CatalogError::RealmUnreachable(realm.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        let about: AboutDto = response.json().await.map_err(|e| CatalogError::Malformed {
            url: url.clone(),
            message: e.to_string(),
        })?;
        about.into_descriptor(realm)
    }

    async fn fetch_manifest(
        &self,
        base_url: &str,
        manifest: &ManifestRef,
    ) -> Result<Manifest, CatalogError> {
        let url = format!("{}/contents/{}", base_url.trim_end_matches('/'), manifest.0);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        match response.status().as_u16() {
            404 => return Err(CatalogError::NotFound(manifest.0.clone())),
            s if !(200..300).contains(&s) => return Err(CatalogError::Status { url, status: s }),
            _ => {}
        }
        let bytes = response.bytes().await.map_err(|e| request_error(&url, e))?;
        verify_manifest(manifest, &bytes)
    }
}
