use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A 2D cell coordinate in the world grid (ignoring the Y axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub const ORIGIN: Self = Self { x: 0, z: 0 };

    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Cell containing a world position, for cells of `cell_size` world units.
    pub fn from_position(pos: Vec3, cell_size: f32) -> Self {
        Self {
            x: (pos.x / cell_size).floor() as i32,
            z: (pos.z / cell_size).floor() as i32,
        }
    }

    /// World-space corner with the smallest x and z.
    pub fn min_corner(&self, cell_size: f32) -> Vec2 {
        Vec2::new(self.x as f32 * cell_size, self.z as f32 * cell_size)
    }

    /// World-space center of the cell at ground height.
    pub fn center(&self, cell_size: f32) -> Vec3 {
        let min = self.min_corner(cell_size);
        Vec3::new(min.x + cell_size * 0.5, 0.0, min.y + cell_size * 0.5)
    }

    /// Ring distance (Chebyshev) between two coordinates.
    pub fn ring_distance(&self, other: CellCoord) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }

    /// Coordinate offset by `(dx, dz)`, clamped at the edges of the grid.
    pub fn offset(&self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            z: self.z.saturating_add(dz),
        }
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.z)
    }
}

/// Error parsing a `"x,z"` pointer string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cell pointer '{0}', expected \"x,z\"")]
pub struct ParsePointerError(pub String);

impl FromStr for CellCoord {
    type Err = ParsePointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, z) = s
            .split_once(',')
            .ok_or_else(|| ParsePointerError(s.to_string()))?;
        let x = x
            .trim()
            .parse()
            .map_err(|_| ParsePointerError(s.to_string()))?;
        let z = z
            .trim()
            .parse()
            .map_err(|_| ParsePointerError(s.to_string()))?;
        Ok(Self { x, z })
    }
}

/// Identifier of a cell definition as published by the content catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one realm session (lifetime of a connection to one realm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.0.to_string())
    }
}

/// Identifier of one teleport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeleportId(pub Uuid);

impl TeleportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TeleportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TeleportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.0.to_string())
    }
}

/// Content hash of a cell's manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestRef(pub String);

/// Immutable description of one cell as resolved from the catalog.
///
/// A definition may occupy several coordinates. Definitions synthesized for
/// coordinates the catalog has no entry for are flagged `is_empty` and carry no
/// manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDefinition {
    pub id: CellId,
    /// Base coordinate; always the first entry of `coords`.
    pub base: CellCoord,
    pub coords: Vec<CellCoord>,
    pub manifest: Option<ManifestRef>,
    pub is_empty: bool,
}

impl CellDefinition {
    pub fn new(
        id: CellId,
        base: CellCoord,
        coords: Vec<CellCoord>,
        manifest: Option<ManifestRef>,
    ) -> Self {
        let mut ordered = Vec::with_capacity(coords.len().max(1));
        ordered.push(base);
        ordered.extend(coords.into_iter().filter(|c| *c != base));
        Self {
            id,
            base,
            coords: ordered,
            manifest,
            is_empty: false,
        }
    }

    /// Placeholder definition for a coordinate the catalog knows nothing about.
    pub fn empty(coord: CellCoord) -> Self {
        Self {
            id: CellId(format!("empty:{coord}")),
            base: coord,
            coords: vec![coord],
            manifest: None,
            is_empty: true,
        }
    }

    pub fn contains(&self, coord: CellCoord) -> bool {
        self.coords.contains(&coord)
    }
}

/// A single content file referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFile {
    pub path: String,
    pub hash: String,
}

/// Downloaded content manifest of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Entry point of the cell's simulation.
    pub main: String,
    #[serde(default)]
    pub files: Vec<ContentFile>,
}

impl Manifest {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Realm descriptor as returned by the realm's `about` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmDescriptor {
    pub name: String,
    /// Base URL of the content catalog for this realm.
    pub base_url: String,
    /// When present the realm is "fixed": exactly these cells exist and
    /// radius-based discovery is bypassed.
    #[serde(default)]
    pub fixed_cells: Option<Vec<CellId>>,
}

impl RealmDescriptor {
    pub fn is_fixed(&self) -> bool {
        self.fixed_cells.is_some()
    }
}

/// Observer transform: position and orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Transform at `position` looking along `forward`.
    pub fn looking(position: Vec3, forward: Vec3) -> Self {
        let dir = forward.try_normalize().unwrap_or(Vec3::NEG_Z);
        Self {
            position,
            rotation: Quat::from_rotation_arc(Vec3::NEG_Z, dir),
        }
    }

    /// Unit forward vector (-Z in local space).
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }
}
