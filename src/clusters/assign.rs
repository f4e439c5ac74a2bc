use rayon::prelude::*;

use super::frustum::{ClusterFrustum, FrustumGrid};
use super::grid::{ClusterCoord, GridDims};
use super::lights::Light;
use super::metrics::ClusterMetrics;
use crate::error::ClusterError;

/// Per-cluster light index lists backed by one fixed-stride arena.
///
/// Cluster `c` owns `slots[c * max .. (c + 1) * max]`, of which the first `counts[c]` entries
/// are valid light indices in ascending order. Unused slots are always zero so two lists built
/// from the same inputs compare equal word for word.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterLightList {
    dims: GridDims,
    max_lights_per_cluster: u32,
    counts: Vec<u32>,
    /// Lights that touched each cluster, including the ones that did not fit.
    hits: Vec<u32>,
    slots: Vec<u32>,
    light_revision: u64,
    metrics: ClusterMetrics,
}

impl ClusterLightList {
    /// An empty list: every cluster holds zero lights.
    pub fn new(dims: GridDims, max_lights_per_cluster: u32) -> Result<Self, ClusterError> {
        let dims = dims.validate()?;
        if max_lights_per_cluster == 0 {
            return Err(ClusterError::ZeroCapacity { what: "max lights per cluster" });
        }
        let cluster_count = dims.cluster_count();
        let slots = zeroed_words(cluster_count, max_lights_per_cluster as usize, "light slot arena")?;
        Ok(Self {
            dims,
            max_lights_per_cluster,
            counts: zeroed_words(cluster_count, 1, "cluster counts")?,
            hits: zeroed_words(cluster_count, 1, "cluster hit totals")?,
            slots,
            light_revision: 0,
            metrics: ClusterMetrics {
                grid_dims: dims.as_array(),
                total_clusters: cluster_count as u32,
                ..ClusterMetrics::default()
            },
        })
    }

    /// Builds a list from raw per-cluster hit totals (uncapped) and the slot arena written
    /// by an assignment pass.
    pub(crate) fn from_hits(
        dims: GridDims,
        max_lights_per_cluster: u32,
        hits: &[u32],
        mut slots: Vec<u32>,
        total_lights: u32,
    ) -> Result<Self, ClusterError> {
        let mut list = Self::new(dims, max_lights_per_cluster)?;
        let stride = max_lights_per_cluster as usize;
        if hits.len() != list.counts.len() {
            return Err(ClusterError::ReadbackSize { expected: list.counts.len(), actual: hits.len() });
        }
        if slots.len() != list.slots.len() {
            return Err(ClusterError::ReadbackSize { expected: list.slots.len(), actual: slots.len() });
        }
        for (cluster, (&hit, count)) in hits.iter().zip(list.counts.iter_mut()).enumerate() {
            let limited = hit.min(max_lights_per_cluster);
            slots[cluster * stride + limited as usize..(cluster + 1) * stride].fill(0);
            *count = limited;
        }
        list.hits.copy_from_slice(hits);
        list.slots = slots;
        list.metrics.total_lights = total_lights;
        list.refresh_metrics();
        Ok(list)
    }

    /// Overwrites one cluster's list, keeping at most `max_lights_per_cluster` entries.
    /// Returns the number written, or `None` when the cluster index is out of range.
    pub fn write_cluster(&mut self, cluster_index: usize, lights: &[u32]) -> Option<usize> {
        let stride = self.max_lights_per_cluster as usize;
        let count = self.counts.get_mut(cluster_index)?;
        let written = lights.len().min(stride);
        let cluster_slots = &mut self.slots[cluster_index * stride..(cluster_index + 1) * stride];
        cluster_slots[..written].copy_from_slice(&lights[..written]);
        cluster_slots[written..].fill(0);
        *count = written as u32;
        self.hits[cluster_index] = u32::try_from(lights.len()).unwrap_or(u32::MAX);
        if let Some(&highest) = lights[..written].iter().max() {
            self.metrics.total_lights = self.metrics.total_lights.max(highest.saturating_add(1));
        }
        self.refresh_metrics();
        Some(written)
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn max_lights_per_cluster(&self) -> u32 {
        self.max_lights_per_cluster
    }

    pub fn cluster_count(&self) -> usize {
        self.counts.len()
    }

    pub fn count(&self, cluster_index: usize) -> u32 {
        self.counts.get(cluster_index).copied().unwrap_or(0)
    }

    pub fn lights(&self, cluster_index: usize) -> &[u32] {
        let count = self.count(cluster_index) as usize;
        if count == 0 {
            return &[];
        }
        let start = cluster_index * self.max_lights_per_cluster as usize;
        &self.slots[start..start + count]
    }

    pub fn lights_at(&self, coord: ClusterCoord) -> &[u32] {
        if !self.dims.contains(coord) {
            return &[];
        }
        self.lights(self.dims.flat_index(coord))
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn slots(&self) -> &[u32] {
        &self.slots
    }

    /// Lookup-table words as consumed by shading: all counts, then the slot arena.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.counts.len() + self.slots.len());
        words.extend_from_slice(&self.counts);
        words.extend_from_slice(&self.slots);
        words
    }

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    /// Revision of the light table this list was assigned from.
    pub fn light_revision(&self) -> u64 {
        self.light_revision
    }

    pub(crate) fn set_light_revision(&mut self, revision: u64) {
        self.light_revision = revision;
    }

    fn refresh_metrics(&mut self) {
        let mut seen = vec![false; self.metrics.total_lights as usize];
        let mut assignments = 0u32;
        let mut active = 0u32;
        let mut peak = 0u32;
        for cluster in 0..self.counts.len() {
            let lights = self.lights(cluster);
            if lights.is_empty() {
                continue;
            }
            active += 1;
            peak = peak.max(lights.len() as u32);
            assignments = assignments.saturating_add(lights.len() as u32);
            for &light in lights {
                if let Some(flag) = seen.get_mut(light as usize) {
                    *flag = true;
                }
            }
        }
        let mut overflow_clusters = 0u32;
        let mut dropped = 0u32;
        for (&hit, &count) in self.hits.iter().zip(&self.counts) {
            if hit > count {
                overflow_clusters += 1;
                dropped = dropped.saturating_add(hit - count);
            }
        }
        let total_clusters = self.counts.len() as u32;
        self.metrics.overflow_clusters = overflow_clusters;
        self.metrics.dropped_assignments = dropped;
        self.metrics.visible_lights = seen.iter().filter(|flag| **flag).count() as u32;
        self.metrics.active_clusters = active;
        self.metrics.max_lights_per_cluster = peak;
        self.metrics.light_assignments = assignments;
        self.metrics.average_lights_per_cluster =
            if total_clusters > 0 { assignments as f32 / total_clusters as f32 } else { 0.0 };
    }
}

/// Assigns every light to every cluster its bounding sphere touches.
///
/// Clusters are processed in parallel; each one writes only its own slot range. A cluster
/// receives light indices in ascending order and silently stops at `max_lights_per_cluster`,
/// the remainder is only visible in [`ClusterMetrics::dropped_assignments`].
pub fn assign_lights(
    grid: &FrustumGrid,
    lights: &[Light],
    max_lights_per_cluster: u32,
) -> Result<ClusterLightList, ClusterError> {
    if max_lights_per_cluster == 0 {
        return Err(ClusterError::ZeroCapacity { what: "max lights per cluster" });
    }
    let dims = grid.dims();
    let stride = max_lights_per_cluster as usize;
    let mut slots = zeroed_words(dims.cluster_count(), stride, "light slot arena")?;
    let mut hits = zeroed_words(dims.cluster_count(), 1, "cluster hit totals")?;
    slots
        .par_chunks_mut(stride)
        .zip(hits.par_iter_mut())
        .zip(grid.frustums().par_iter())
        .for_each(|((cluster_slots, hit_count), frustum)| {
            *hit_count = assign_cluster(frustum, lights, cluster_slots);
        });
    ClusterLightList::from_hits(dims, max_lights_per_cluster, &hits, slots, lights.len() as u32)
}

/// A zero-filled buffer of `clusters * stride` words. Allocation failure is reported instead of
/// aborting.
fn zeroed_words(clusters: usize, stride: usize, what: &str) -> Result<Vec<u32>, ClusterError> {
    let len = clusters.checked_mul(stride).ok_or_else(|| {
        ClusterError::ResourceExhausted(format!("{what} of {clusters} x {stride} words overflows usize"))
    })?;
    let mut words = Vec::new();
    words
        .try_reserve_exact(len)
        .map_err(|err| ClusterError::ResourceExhausted(format!("{what} of {len} words: {err}")))?;
    words.resize(len, 0);
    Ok(words)
}

/// Writes the indices of lights touching `frustum` into `slots`, ascending, until it is full.
/// Returns how many lights intersected, including the ones that did not fit.
pub fn assign_cluster(frustum: &ClusterFrustum, lights: &[Light], slots: &mut [u32]) -> u32 {
    let mut hits = 0u32;
    for (index, light) in lights.iter().enumerate() {
        if !light.intersects_cluster(frustum) {
            continue;
        }
        if let Some(slot) = slots.get_mut(hits as usize) {
            *slot = index as u32;
        }
        hits = hits.saturating_add(1);
    }
    hits
}
