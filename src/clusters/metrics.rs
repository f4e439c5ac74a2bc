use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::sync::FrameSyncStats;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub total_lights: u32,
    /// Lights listed in at least one cluster.
    pub visible_lights: u32,
    pub grid_dims: [u32; 3],
    pub active_clusters: u32,
    pub total_clusters: u32,
    pub average_lights_per_cluster: f32,
    pub max_lights_per_cluster: u32,
    /// Clusters whose candidate lights exceeded the per-cluster capacity.
    pub overflow_clusters: u32,
    /// Light/cluster pairs that intersected but did not fit.
    pub dropped_assignments: u32,
    pub light_assignments: u32,
}

impl ClusterMetrics {
    pub fn culled_lights(&self) -> u32 {
        self.total_lights.saturating_sub(self.visible_lights)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub epoch: u64,
    pub frustums_rebuilt: bool,
    pub fallback: bool,
    pub metrics: ClusterMetrics,
}

/// Per-frame metrics of a run, serialised as JSON for offline comparison.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub backend: String,
    pub frames: Vec<FrameRecord>,
    pub stats: FrameSyncStats,
}

impl FrameReport {
    pub fn new(backend: impl Into<String>) -> Self {
        Self { backend: backend.into(), ..Self::default() }
    }

    pub fn record(&mut self, record: FrameRecord) {
        self.frames.push(record);
    }

    pub fn peak_lights_per_cluster(&self) -> u32 {
        self.frames.iter().map(|frame| frame.metrics.max_lights_per_cluster).max().unwrap_or(0)
    }

    pub fn total_dropped_assignments(&self) -> u64 {
        self.frames.iter().map(|frame| frame.metrics.dropped_assignments as u64).sum()
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, format!("{json}\n"))
            .with_context(|| format!("Failed to write frame report {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read frame report {}", path.display()))?;
        let report = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse frame report {}", path.display()))?;
        Ok(report)
    }
}
