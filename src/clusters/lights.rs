use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use super::frustum::ClusterFrustum;
use crate::config::SceneConfig;
use crate::error::ClusterError;

pub const LIGHT_KIND_POINT: u32 = 0;
pub const LIGHT_KIND_SPOT: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub range: f32,
    pub color: Vec3,
    pub intensity: f32,
}

impl PointLight {
    pub fn new(position: Vec3, range: f32, color: Vec3, intensity: f32) -> Self {
        Self { position, range: range.max(0.0), color, intensity }
    }

    pub fn intersects_cluster(&self, frustum: &ClusterFrustum) -> bool {
        frustum.intersects_sphere(self.position, self.range)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpotLight {
    pub position: Vec3,
    pub range: f32,
    pub color: Vec3,
    pub intensity: f32,
    pub direction: Vec3,
    /// Cosine of the cone half-angle.
    pub cutoff_cos: f32,
}

impl SpotLight {
    pub fn new(
        position: Vec3,
        range: f32,
        color: Vec3,
        intensity: f32,
        direction: Vec3,
        cutoff_cos: f32,
    ) -> Self {
        Self {
            position,
            range: range.max(0.0),
            color,
            intensity,
            direction: direction.normalize_or_zero(),
            cutoff_cos: cutoff_cos.clamp(-1.0, 1.0),
        }
    }

    /// Uses the full range sphere and ignores the cone, so a spot light may be listed in
    /// clusters its cone never reaches but is never missing from one it does.
    pub fn intersects_cluster(&self, frustum: &ClusterFrustum) -> bool {
        frustum.intersects_sphere(self.position, self.range)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Light {
    Point(PointLight),
    Spot(SpotLight),
}

impl Light {
    pub fn kind(&self) -> u32 {
        match self {
            Light::Point(_) => LIGHT_KIND_POINT,
            Light::Spot(_) => LIGHT_KIND_SPOT,
        }
    }

    pub fn position(&self) -> Vec3 {
        match self {
            Light::Point(light) => light.position,
            Light::Spot(light) => light.position,
        }
    }

    pub fn range(&self) -> f32 {
        match self {
            Light::Point(light) => light.range,
            Light::Spot(light) => light.range,
        }
    }

    pub fn intersects_cluster(&self, frustum: &ClusterFrustum) -> bool {
        match self {
            Light::Point(light) => light.intersects_cluster(frustum),
            Light::Spot(light) => light.intersects_cluster(frustum),
        }
    }

    pub fn to_gpu(&self) -> LightGpu {
        match self {
            Light::Point(light) => LightGpu {
                position_range: light.position.extend(light.range).to_array(),
                color_intensity: light.color.extend(light.intensity).to_array(),
                direction_cutoff: [0.0, 0.0, 0.0, -1.0],
                kind: [LIGHT_KIND_POINT, 0, 0, 0],
            },
            Light::Spot(light) => LightGpu {
                position_range: light.position.extend(light.range).to_array(),
                color_intensity: light.color.extend(light.intensity).to_array(),
                direction_cutoff: light.direction.extend(light.cutoff_cos).to_array(),
                kind: [LIGHT_KIND_SPOT, 0, 0, 0],
            },
        }
    }
}

impl From<PointLight> for Light {
    fn from(light: PointLight) -> Self {
        Light::Point(light)
    }
}

impl From<SpotLight> for Light {
    fn from(light: SpotLight) -> Self {
        Light::Spot(light)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightGpu {
    pub position_range: [f32; 4],
    pub color_intensity: [f32; 4],
    pub direction_cutoff: [f32; 4],
    pub kind: [u32; 4],
}

/// The authoritative light list for a scene.
///
/// Every change bumps `revision`; cluster lists remember the revision they were assigned
/// from so a stale list is never presented for a newer light set.
#[derive(Debug, Clone)]
pub struct LightTable {
    lights: Arc<Vec<Light>>,
    capacity: usize,
    revision: u64,
    truncated: usize,
}

impl LightTable {
    pub fn new(capacity: u32) -> Result<Self, ClusterError> {
        if capacity == 0 {
            return Err(ClusterError::ZeroCapacity { what: "light capacity" });
        }
        Ok(Self { lights: Arc::new(Vec::new()), capacity: capacity as usize, revision: 0, truncated: 0 })
    }

    /// Replaces the table. Lights past the capacity are dropped; returns how many were.
    pub fn load(&mut self, lights: impl IntoIterator<Item = Light>) -> usize {
        let mut kept = Vec::new();
        let mut truncated = 0usize;
        for light in lights {
            if kept.len() < self.capacity {
                kept.push(light);
            } else {
                truncated += 1;
            }
        }
        if truncated > 0 {
            log::warn!(
                "{truncated} light(s) exceeded the light table capacity (max {}). Extra lights will be ignored.",
                self.capacity
            );
        }
        self.lights = Arc::new(kept);
        self.truncated = truncated;
        self.revision += 1;
        truncated
    }

    pub fn get(&self, index: usize) -> Option<&Light> {
        self.lights.get(index)
    }

    pub fn set(&mut self, index: usize, light: Light) -> Result<(), ClusterError> {
        let len = self.lights.len();
        let slot = Arc::make_mut(&mut self.lights)
            .get_mut(index)
            .ok_or(ClusterError::LightIndexOutOfRange { index, len })?;
        *slot = light;
        self.revision += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[Light] {
        &self.lights
    }

    /// Shared, immutable view of the current lights for an in-flight assignment.
    pub fn snapshot(&self) -> Arc<Vec<Light>> {
        Arc::clone(&self.lights)
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn truncated(&self) -> usize {
        self.truncated
    }
}

/// Deterministic light field for demo scenes, spread over a cube of half-size `extent`.
pub fn scatter_lights(scene: &SceneConfig) -> Vec<Light> {
    let mut rng = StdRng::seed_from_u64(scene.seed);
    let min_range = scene.min_range.max(0.0);
    let max_range = scene.max_range.max(min_range + f32::EPSILON);
    let extent = scene.extent.max(f32::EPSILON);
    (0..scene.light_count)
        .map(|_| {
            let position = Vec3::new(
                rng.gen_range(-extent..extent),
                rng.gen_range(-extent..extent),
                rng.gen_range(-extent..extent),
            );
            let range = rng.gen_range(min_range..max_range);
            let color = Vec3::new(rng.gen_range(0.2..1.0), rng.gen_range(0.2..1.0), rng.gen_range(0.2..1.0));
            let intensity = rng.gen_range(0.5..4.0);
            if rng.gen_bool(scene.spot_fraction.clamp(0.0, 1.0) as f64) {
                let direction = Vec3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..-0.1),
                    rng.gen_range(-1.0..1.0),
                );
                let cutoff = rng.gen_range(15.0_f32..45.0).to_radians().cos();
                Light::Spot(SpotLight::new(position, range, color, intensity, direction, cutoff))
            } else {
                Light::Point(PointLight::new(position, range, color, intensity))
            }
        })
        .collect()
}
