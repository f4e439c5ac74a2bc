use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::clusters::grid::GridDims;
use crate::error::ClusterError;

/// The cluster core configuration: grid resolution and the two capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default = "ClusterConfig::default_grid_dimensions")]
    pub grid_dimensions: GridDims,
    #[serde(default = "ClusterConfig::default_max_lights_per_cluster")]
    pub max_lights_per_cluster: u32,
    #[serde(default = "ClusterConfig::default_light_capacity")]
    pub light_capacity: u32,
}

impl ClusterConfig {
    fn default_grid_dimensions() -> GridDims {
        GridDims::new(36, 20, 64)
    }

    const fn default_max_lights_per_cluster() -> u32 {
        20
    }

    const fn default_light_capacity() -> u32 {
        256
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        self.grid_dimensions.validate()?;
        if self.max_lights_per_cluster == 0 {
            return Err(ClusterError::ZeroCapacity { what: "max lights per cluster" });
        }
        if self.light_capacity == 0 {
            return Err(ClusterError::ZeroCapacity { what: "light capacity" });
        }
        let slot_words = self.grid_dimensions.cluster_count() as u64 * u64::from(self.max_lights_per_cluster);
        if slot_words > u64::from(u32::MAX) {
            return Err(ClusterError::ResourceExhausted(format!(
                "{} clusters x {} lights need {slot_words} slots, more than a u32 index can address",
                self.grid_dimensions.cluster_count(),
                self.max_lights_per_cluster
            )));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            grid_dimensions: Self::default_grid_dimensions(),
            max_lights_per_cluster: Self::default_max_lights_per_cluster(),
            light_capacity: Self::default_light_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_fov_y_degrees")]
    pub fov_y_degrees: f32,
    #[serde(default = "CameraConfig::default_near")]
    pub near: f32,
    #[serde(default = "CameraConfig::default_far")]
    pub far: f32,
    #[serde(default = "CameraConfig::default_aspect")]
    pub aspect: f32,
    #[serde(default = "CameraConfig::default_orbit_radius")]
    pub orbit_radius: f32,
    /// Radians of yaw applied per frame while the camera is not frozen.
    #[serde(default = "CameraConfig::default_orbit_speed")]
    pub orbit_speed: f32,
    #[serde(default)]
    pub freeze: bool,
}

impl CameraConfig {
    const fn default_fov_y_degrees() -> f32 {
        60.0
    }

    const fn default_near() -> f32 {
        0.1
    }

    const fn default_far() -> f32 {
        100.0
    }

    fn default_aspect() -> f32 {
        16.0 / 9.0
    }

    const fn default_orbit_radius() -> f32 {
        30.0
    }

    const fn default_orbit_speed() -> f32 {
        0.02
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_degrees: Self::default_fov_y_degrees(),
            near: Self::default_near(),
            far: Self::default_far(),
            aspect: Self::default_aspect(),
            orbit_radius: Self::default_orbit_radius(),
            orbit_speed: Self::default_orbit_speed(),
            freeze: false,
        }
    }
}

/// Parameters for the generated demo light set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfig {
    #[serde(default = "SceneConfig::default_light_count")]
    pub light_count: u32,
    #[serde(default = "SceneConfig::default_seed")]
    pub seed: u64,
    #[serde(default = "SceneConfig::default_extent")]
    pub extent: f32,
    #[serde(default = "SceneConfig::default_min_range")]
    pub min_range: f32,
    #[serde(default = "SceneConfig::default_max_range")]
    pub max_range: f32,
    #[serde(default = "SceneConfig::default_spot_fraction")]
    pub spot_fraction: f32,
}

impl SceneConfig {
    const fn default_light_count() -> u32 {
        128
    }

    const fn default_seed() -> u64 {
        0x5eed
    }

    const fn default_extent() -> f32 {
        20.0
    }

    const fn default_min_range() -> f32 {
        1.5
    }

    const fn default_max_range() -> f32 {
        6.0
    }

    const fn default_spot_fraction() -> f32 {
        0.25
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            light_count: Self::default_light_count(),
            seed: Self::default_seed(),
            extent: Self::default_extent(),
            min_range: Self::default_min_range(),
            max_range: Self::default_max_range(),
            spot_fraction: Self::default_spot_fraction(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameConfig {
    #[serde(default = "FrameConfig::default_frame_count")]
    pub frame_count: u32,
    #[serde(default = "FrameConfig::default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

impl FrameConfig {
    const fn default_frame_count() -> u32 {
        120
    }

    const fn default_dispatch_timeout_ms() -> u64 {
        250
    }

    pub fn dispatch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dispatch_timeout_ms)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { frame_count: Self::default_frame_count(), dispatch_timeout_ms: Self::default_dispatch_timeout_ms() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub clusters: ClusterConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub grid: Option<GridDims>,
    pub max_lights_per_cluster: Option<u32>,
    pub light_count: Option<u32>,
    pub frame_count: Option<u32>,
    pub backend: Option<BackendKind>,
    pub freeze: Option<bool>,
    pub report_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        if let Some(grid) = overrides.grid {
            self.clusters.grid_dimensions = grid;
        }
        if let Some(max) = overrides.max_lights_per_cluster {
            self.clusters.max_lights_per_cluster = max;
        }
        if let Some(count) = overrides.light_count {
            self.scene.light_count = count;
        }
        if let Some(frames) = overrides.frame_count {
            self.frame.frame_count = frames;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(freeze) = overrides.freeze {
            self.camera.freeze = freeze;
        }
    }
}

impl AppConfigOverrides {
    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.grid.is_some() {
            fields.push("grid");
        }
        if self.max_lights_per_cluster.is_some() {
            fields.push("max_lights_per_cluster");
        }
        if self.light_count.is_some() {
            fields.push("lights");
        }
        if self.frame_count.is_some() {
            fields.push("frames");
        }
        if self.backend.is_some() {
            fields.push("backend");
        }
        if self.freeze.is_some() {
            fields.push("freeze");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{ "clusters": { "maxLightsPerCluster": 8 } }"#).unwrap();
        assert_eq!(cfg.clusters.max_lights_per_cluster, 8);
        assert_eq!(cfg.clusters.grid_dimensions, GridDims::new(36, 20, 64));
        assert_eq!(cfg.clusters.light_capacity, 256);
        assert_eq!(cfg.backend, BackendKind::Cpu);
        assert_eq!(cfg.frame, FrameConfig::default());
    }

    #[test]
    fn zero_capacities_fail_validation() {
        let mut cfg = ClusterConfig::default();
        cfg.light_capacity = 0;
        assert!(matches!(cfg.validate(), Err(ClusterError::ZeroCapacity { what: "light capacity" })));
        cfg = ClusterConfig { grid_dimensions: GridDims::new(4, 0, 4), ..ClusterConfig::default() };
        assert!(cfg.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn oversized_slot_arena_fails_validation() {
        let cfg = ClusterConfig { max_lights_per_cluster: u32::MAX, ..ClusterConfig::default() };
        assert!(matches!(cfg.validate(), Err(ClusterError::ResourceExhausted(_))));
        let cfg = ClusterConfig { max_lights_per_cluster: 1024, ..ClusterConfig::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut cfg = AppConfig::default();
        let overrides = AppConfigOverrides {
            grid: Some(GridDims::new(8, 8, 8)),
            backend: Some(BackendKind::Gpu),
            ..AppConfigOverrides::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.clusters.grid_dimensions, GridDims::new(8, 8, 8));
        assert_eq!(cfg.backend, BackendKind::Gpu);
        assert_eq!(cfg.clusters.max_lights_per_cluster, 20);
        assert_eq!(overrides.applied_fields(), vec!["grid", "backend"]);
    }
}
