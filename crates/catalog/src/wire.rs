//! JSON shapes exchanged with a content server, and their conversion into
//! workspace types.

use crate::client::CatalogError;
use realmstream_common::{CellCoord, CellDefinition, CellId, Manifest, ManifestRef, RealmDescriptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content entry holding a cell's manifest.
pub(crate) const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize)]
pub(crate) struct PointersRequest {
    pub pointers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct IdsRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EntityDto {
    pub id: String,
    #[serde(default)]
    pub pointers: Vec<String>,
    #[serde(default)]
    pub content: Vec<ContentEntryDto>,
    #[serde(default)]
    pub metadata: Option<EntityMetadataDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ContentEntryDto {
    pub file: String,
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EntityMetadataDto {
    #[serde(default)]
    pub scene: Option<SceneMetadataDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SceneMetadataDto {
    pub base: String,
    #[serde(default)]
    pub parcels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AboutDto {
    #[serde(default)]
    pub configurations: Option<AboutConfigurationsDto>,
    #[serde(default)]
    pub content: Option<AboutContentDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AboutConfigurationsDto {
    #[serde(default)]
    pub realm_name: Option<String>,
    #[serde(default)]
    pub scenes_urn: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AboutContentDto {
    pub public_url: String,
}

/// Lowercase hex SHA-256 of `bytes`, the content address used by manifests.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Check `bytes` against `reference` and decode the manifest.
pub fn verify_manifest(reference: &ManifestRef, bytes: &[u8]) -> Result<Manifest, CatalogError> {
    if content_hash(bytes) != reference.0 {
        return Err(CatalogError::Integrity {
            hash: reference.0.clone(),
        });
    }
    serde_json::from_slice(bytes).map_err(|e| CatalogError::Malformed {
        url: reference.0.clone(),
        message: e.to_string(),
    })
}

fn parse_coord(url: &str, pointer: &str) -> Result<CellCoord, CatalogError> {
    pointer.parse().map_err(|e: realmstream_common::ParsePointerError| {
        CatalogError::Malformed {
            url: url.to_string(),
            message: e.to_string(),
        }
    })
}

impl EntityDto {
    pub(crate) fn into_definition(self, url: &str) -> Result<CellDefinition, CatalogError> {
        let scene = self.metadata.and_then(|m| m.scene);
        let raw_coords = match &scene {
            Some(scene) if !scene.parcels.is_empty() => &scene.parcels,
            _ => &self.pointers,
        };
        let coords = raw_coords
            .iter()
            .map(|p| parse_coord(url, p))
            .collect::<Result<Vec<_>, _>>()?;
        let base = match &scene {
            Some(scene) => parse_coord(url, &scene.base)?,
            None => *coords.first().ok_or_else(|| CatalogError::Malformed {
                url: url.to_string(),
                message: format!("entity {} occupies no coordinates", self.id),
            })?,
        };
        let manifest = self
            .content
            .into_iter()
            .find(|c| c.file == MANIFEST_FILE)
            .map(|c| ManifestRef(c.hash));
        Ok(CellDefinition::new(CellId(self.id), base, coords, manifest))
    }
}

/// Entity id carried by a `urn:...:entity:<id>?<params>` reference.
pub(crate) fn urn_entity_id(urn: &str) -> Option<CellId> {
    let head = urn.split('?').next()?;
    let id = head.rsplit(':').next()?;
    (!id.is_empty()).then(|| CellId::new(id))
}

impl AboutDto {
    pub(crate) fn into_descriptor(self, realm: &str) -> Result<RealmDescriptor, CatalogError> {
        let base_url = self
            .content
            .map(|c| c.public_url.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CatalogError::Malformed {
                url: realm.to_string(),
                message: "about response has no content url".into(),
            })?;
        let config = self.configurations.unwrap_or_default();
        let fixed: Vec<CellId> = config
            .scenes_urn
            .iter()
            .filter_map(|u| urn_entity_id(u))
            .collect();
        Ok(RealmDescriptor {
            name: config.realm_name.unwrap_or_else(|| realm.to_string()),
            base_url,
            fixed_cells: (!fixed.is_empty()).then_some(fixed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_uses_scene_parcels_and_base() {
        let json = r#"{
            "id": "bafy-plaza",
            "pointers": ["0,0"],
            "content": [{"file": "manifest.json", "hash": "abc"}, {"file": "main.js", "hash": "def"}],
            "metadata": {"scene": {"base": "1,0", "parcels": ["0,0", "1,0"]}}
        }"#;
        let dto: EntityDto = serde_json::from_str(json).unwrap();
        let def = dto.into_definition("http://catalog").unwrap();
        assert_eq!(def.base, CellCoord::new(1, 0));
        assert_eq!(def.coords, vec![CellCoord::new(1, 0), CellCoord::new(0, 0)]);
        assert_eq!(def.manifest, Some(ManifestRef("abc".into())));
    }

    #[test]
    fn entity_without_metadata_falls_back_to_pointers() {
        let json = r#"{"id": "bafy-1", "pointers": ["-3,4"]}"#;
        let dto: EntityDto = serde_json::from_str(json).unwrap();
        let def = dto.into_definition("http://catalog").unwrap();
        assert_eq!(def.base, CellCoord::new(-3, 4));
        assert!(def.manifest.is_none());
    }

    #[test]
    fn entity_with_bad_pointer_is_malformed() {
        let json = r#"{"id": "bafy-1", "pointers": ["west"]}"#;
        let dto: EntityDto = serde_json::from_str(json).unwrap();
        assert!(matches!(
            dto.into_definition("http://catalog"),
            Err(CatalogError::Malformed { .. })
        ));
    }

    #[test]
    fn about_with_scenes_is_fixed() {
        let json = r#"{
            "configurations": {
                "realmName": "gallery.dcl.eth",
                "scenesUrn": ["urn:decentraland:entity:bafkgallery?=&baseUrl=https://x/contents/"]
            },
            "content": {"publicUrl": "https://worlds.example/contents/"}
        }"#;
        let about: AboutDto = serde_json::from_str(json).unwrap();
        let realm = about.into_descriptor("https://worlds.example/world/gallery").unwrap();
        assert_eq!(realm.name, "gallery.dcl.eth");
        assert_eq!(realm.base_url, "https://worlds.example/contents");
        assert_eq!(realm.fixed_cells, Some(vec![CellId::new("bafkgallery")]));
    }

    #[test]
    fn about_without_content_url_is_rejected() {
        let about: AboutDto = serde_json::from_str("{}").unwrap();
        assert!(about.into_descriptor("main").is_err());
    }

    #[test]
    fn manifest_integrity_is_checked() {
        let manifest = Manifest {
            main: "bin/main.js".into(),
            files: vec![],
        };
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let good = ManifestRef(content_hash(&bytes));
        assert_eq!(verify_manifest(&good, &bytes).unwrap(), manifest);

        let bad = ManifestRef("0000".into());
        assert_eq!(
            verify_manifest(&bad, &bytes),
            Err(CatalogError::Integrity { hash: "0000".into() })
        );
    }
}
