use realmstream_common::CellCoord;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// What the admission gate does when the budget is full and closer cells
/// still want to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Closer candidates wait until a slot frees up.
    #[default]
    Wait,
    /// A closer candidate displaces the farthest loading/active cell.
    PreemptFarther,
}

impl FromStr for SaturationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "preempt_farther" | "preempt-farther" => Ok(Self::PreemptFarther),
            other => Err(format!("unknown saturation policy '{other}'")),
        }
    }
}

/// Errors from loading or validating a [`StreamConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Streaming configuration: ranges, distance buckets, budgets and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Edge length of one cell in world units.
    pub cell_size: f32,
    /// Discovery radius in rings of cells around the observer.
    pub load_radius: u32,
    /// Maximum coordinates (or ids) per catalog request.
    pub pointer_batch_size: usize,
    /// Coordinates resolved before radius discovery starts.
    pub static_pointers: Vec<CellCoord>,
    /// Ascending squared-distance thresholds; bucket `i` holds distances
    /// `<= sqr_distance_buckets[i]`, anything farther falls in the last bucket.
    pub sqr_distance_buckets: Vec<f32>,
    /// Highest bucket still simulated at full fidelity.
    pub full_cell_bucket_limit: usize,
    /// Extra buckets a full cell may drift out before it becomes a placeholder.
    pub lod_hysteresis: usize,
    /// Cells in this bucket or beyond are out of range.
    pub unload_bucket: usize,
    /// Maximum cells loading or active at once.
    pub admission_budget: usize,
    pub max_admissions_per_tick: usize,
    pub saturation_policy: SaturationPolicy,
    /// Full-quality placeholders shown or loading at once.
    pub lod_budget: usize,
    /// Reduced-quality placeholders, used once `lod_budget` is taken.
    pub reduced_lod_budget: usize,
    /// Update rate per bucket; buckets past the end use the last entry.
    pub tick_rates_hz: Vec<f32>,
    /// Observer movement below this distance does not trigger recomputation.
    pub position_tolerance: f32,
    pub angle_tolerance_deg: f32,
    /// Squared-distance change below this does not mark partition info dirty.
    pub raw_distance_tolerance: f32,
    pub load_retry_cooldown_ms: u64,
    pub max_load_attempts: u32,
    pub teleport_timeout_ms: u64,
    pub teleport_grace_ms: u64,
    /// Height above the target the player is held at while a teleport waits.
    pub teleport_holding_height: f32,
    pub realm_change_retries: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cell_size: 16.0,
            load_radius: 6,
            pointer_batch_size: 32,
            static_pointers: Vec::new(),
            sqr_distance_buckets: vec![256.0, 1024.0, 4096.0, 9216.0, 16384.0],
            full_cell_bucket_limit: 2,
            lod_hysteresis: 1,
            unload_bucket: 5,
            admission_budget: 16,
            max_admissions_per_tick: 4,
            saturation_policy: SaturationPolicy::Wait,
            lod_budget: 32,
            reduced_lod_budget: 64,
            tick_rates_hz: vec![30.0, 20.0, 10.0, 5.0, 2.0],
            position_tolerance: 1.0,
            angle_tolerance_deg: 10.0,
            raw_distance_tolerance: 4.0,
            load_retry_cooldown_ms: 5_000,
            max_load_attempts: 3,
            teleport_timeout_ms: 30_000,
            teleport_grace_ms: 500,
            teleport_holding_height: 500.0,
            realm_change_retries: 3,
        }
    }
}

impl StreamConfig {
    /// Parse a YAML document. Missing fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// File (if any), then `REALMSTREAM_*` environment overrides, then
    /// validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparseable values are reported and the
    /// current value is kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Invalid {} '{}', keeping current value", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parse::<f32>(&lookup, "REALMSTREAM_CELL_SIZE") {
            self.cell_size = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_LOAD_RADIUS") {
            self.load_radius = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_POINTER_BATCH_SIZE") {
            self.pointer_batch_size = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_ADMISSION_BUDGET") {
            self.admission_budget = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_MAX_ADMISSIONS_PER_TICK") {
            self.max_admissions_per_tick = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_SATURATION_POLICY") {
            self.saturation_policy = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_LOD_BUDGET") {
            self.lod_budget = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_REDUCED_LOD_BUDGET") {
            self.reduced_lod_budget = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_TELEPORT_TIMEOUT_MS") {
            self.teleport_timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, "REALMSTREAM_REALM_CHANGE_RETRIES") {
            self.realm_change_retries = v;
        }
        if let Some(raw) = lookup("REALMSTREAM_STATIC_POINTERS") {
            let parsed: Result<Vec<CellCoord>, _> = raw
                .split(';')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(pointers) => self.static_pointers = pointers,
                Err(e) => tracing::warn!("Invalid REALMSTREAM_STATIC_POINTERS: {}", e),
            }
        }
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.cell_size > 0.0) {
            return Err("cell_size must be positive".to_string());
        }
        if self.admission_budget == 0 {
            return Err("admission_budget must be at least 1".to_string());
        }
        if self.max_admissions_per_tick == 0 {
            return Err("max_admissions_per_tick must be at least 1".to_string());
        }
        if self.pointer_batch_size == 0 {
            return Err("pointer_batch_size must be at least 1".to_string());
        }
        if self.sqr_distance_buckets.is_empty() {
            return Err("sqr_distance_buckets cannot be empty".to_string());
        }
        if self
            .sqr_distance_buckets
            .windows(2)
            .any(|w| !(w[0] < w[1]))
        {
            return Err("sqr_distance_buckets must be strictly ascending".to_string());
        }
        if self.unload_bucket < self.full_cell_bucket_limit {
            return Err("unload_bucket cannot be below full_cell_bucket_limit".to_string());
        }
        if self.tick_rates_hz.is_empty() {
            return Err("tick_rates_hz cannot be empty".to_string());
        }
        if self.tick_rates_hz.iter().any(|r| !(*r > 0.0)) {
            return Err("tick rates must be positive".to_string());
        }
        Ok(())
    }

    /// Update rate for a cell in `bucket`.
    pub fn rate_for_bucket(&self, bucket: usize) -> f32 {
        let last = self.tick_rates_hz.len().saturating_sub(1);
        self.tick_rates_hz
            .get(bucket.min(last))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn load_retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.load_retry_cooldown_ms)
    }

    pub fn teleport_timeout(&self) -> Duration {
        Duration::from_millis(self.teleport_timeout_ms)
    }

    pub fn teleport_grace(&self) -> Duration {
        Duration::from_millis(self.teleport_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.saturation_policy, SaturationPolicy::Wait);
    }

    #[test]
    fn yaml_overrides_only_given_fields() {
        let config = StreamConfig::from_yaml_str(
            "admission_budget: 4\nsaturation_policy: preempt_farther\nstatic_pointers:\n  - {x: 1, z: -2}\n",
        )
        .unwrap();
        assert_eq!(config.admission_budget, 4);
        assert_eq!(config.saturation_policy, SaturationPolicy::PreemptFarther);
        assert_eq!(config.static_pointers, vec![CellCoord::new(1, -2)]);
        assert_eq!(config.load_radius, StreamConfig::default().load_radius);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "load_radius: 2\nteleport_timeout_ms: 250").unwrap();
        let config = StreamConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.load_radius, 2);
        assert_eq!(config.teleport_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "admission_budget: 0").unwrap();
        assert!(matches!(
            StreamConfig::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn env_overrides_keep_default_on_garbage() {
        let vars: HashMap<&str, &str> = [
            ("REALMSTREAM_ADMISSION_BUDGET", "7"),
            ("REALMSTREAM_LOAD_RADIUS", "far"),
            ("REALMSTREAM_STATIC_POINTERS", "0,0;3,4"),
            ("REALMSTREAM_LOD_BUDGET", "0"),
            ("REALMSTREAM_REDUCED_LOD_BUDGET", "-3"),
        ]
        .into_iter()
        .collect();
        let mut config = StreamConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.admission_budget, 7);
        assert_eq!(config.load_radius, StreamConfig::default().load_radius);
        assert_eq!(config.lod_budget, 0);
        assert_eq!(config.reduced_lod_budget, 64);
        assert_eq!(
            config.static_pointers,
            vec![CellCoord::new(0, 0), CellCoord::new(3, 4)]
        );
    }

    #[test]
    fn validation_rejects_bad_buckets() {
        let mut config = StreamConfig::default();
        config.sqr_distance_buckets = vec![100.0, 50.0];
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.unload_bucket = 1;
        config.full_cell_bucket_limit = 3;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.tick_rates_hz.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rate_clamps_to_last_bucket() {
        let config = StreamConfig::default();
        assert_eq!(config.rate_for_bucket(0), 30.0);
        assert_eq!(config.rate_for_bucket(99), 2.0);
    }
}
