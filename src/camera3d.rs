use glam::{Mat4, Quat, Vec2, Vec3};

use crate::config::CameraConfig;

const DEFAULT_UP: Vec3 = Vec3::Y;
const SNAPSHOT_QUANTIZE: f64 = 1.0e-4;
// quantised steps stay below this magnitude; larger values key on their exact bits
const QUANTIZED_LIMIT: i64 = 1 << 62;

/// Perspective camera driving the cluster grid. Projections use a [0, 1] depth range.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self { position, target, up: DEFAULT_UP, fov_y_radians, near, far }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_radians, aspect.max(0.0001), self.near, self.far)
    }

    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        self.projection_matrix(aspect) * self.view_matrix()
    }

    /// Freezes the current matrices into an immutable per-frame value.
    pub fn snapshot(&self, aspect: f32) -> CameraSnapshot {
        CameraSnapshot::new(self.view_matrix(), self.projection_matrix(aspect))
    }
}

/// View and projection matrices captured once per frame.
///
/// Frustum building and assignment only ever see a snapshot, never a live camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSnapshot {
    pub view: Mat4,
    pub projection: Mat4,
}

/// Quantised form of a [`CameraSnapshot`]; equal keys produce the same frustum grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    view: [i64; 16],
    projection: [i64; 16],
}

impl CameraSnapshot {
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self { view, projection }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey { view: quantize_matrix(self.view), projection: quantize_matrix(self.projection) }
    }
}

fn quantize_matrix(mat: Mat4) -> [i64; 16] {
    let mut key = [0i64; 16];
    for (dst, value) in key.iter_mut().zip(mat.to_cols_array()) {
        *dst = quantize(value);
    }
    key
}

fn quantize(value: f32) -> i64 {
    let scaled = (f64::from(value) / SNAPSHOT_QUANTIZE).round();
    if scaled.abs() < QUANTIZED_LIMIT as f64 {
        return scaled as i64;
    }
    let bits = i64::from(value.to_bits());
    if value.is_sign_negative() {
        -QUANTIZED_LIMIT - 1 - bits
    } else {
        QUANTIZED_LIMIT + bits
    }
}

/// Orbit-style controller storing yaw/pitch around a target.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub radius: f32,
    pub yaw_radians: f32,
    pub pitch_radians: f32,
}

impl OrbitCamera {
    pub fn new(target: Vec3, radius: f32) -> Self {
        Self { target, radius: radius.max(0.01), yaw_radians: 0.0, pitch_radians: 0.0 }
    }

    pub fn to_camera(&self, fov_y_radians: f32, near: f32, far: f32) -> Camera3D {
        let rotation = Quat::from_euler(glam::EulerRot::YXZ, self.yaw_radians, self.pitch_radians, 0.0);
        let offset = rotation * Vec3::new(0.0, 0.0, self.radius);
        Camera3D::new(self.target + offset, self.target, fov_y_radians, near, far)
    }

    pub fn to_configured_camera(&self, config: &CameraConfig) -> Camera3D {
        self.to_camera(config.fov_y_degrees.to_radians(), config.near, config.far)
    }

    pub fn orbit(&mut self, delta: Vec2) {
        self.yaw_radians += delta.x;
        self.pitch_radians = (self.pitch_radians + delta.y)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera3d_view_projection_is_finite() {
        let camera = Camera3D::new(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, 60.0_f32.to_radians(), 0.1, 1000.0);
        let vp = camera.view_projection(1280.0 / 720.0);
        assert!(!vp.to_cols_array().iter().any(|v| v.is_nan() || v.is_infinite()));
    }

    #[test]
    fn orbit_camera_orbits_target() {
        let mut orbit = OrbitCamera::new(Vec3::ZERO, 5.0);
        orbit.orbit(Vec2::new(0.5, 0.25));
        let camera = orbit.to_camera(45.0f32.to_radians(), 0.1, 500.0);
        assert!(camera.position.distance(Vec3::ZERO) > 1.0);
        assert!(camera.position.distance(Vec3::ZERO) < 10.0);
    }

    #[test]
    fn snapshot_key_ignores_float_noise() {
        let camera = Camera3D::new(Vec3::new(0.0, 2.0, 9.0), Vec3::ZERO, 1.0, 0.5, 50.0);
        let snapshot = camera.snapshot(1.5);
        let mut jittered = snapshot;
        jittered.view.w_axis.x += 1.0e-7;
        assert_eq!(snapshot.key(), jittered.key());

        let mut moved = camera.clone();
        moved.position.x += 0.25;
        assert_ne!(snapshot.key(), moved.snapshot(1.5).key());
    }

    #[test]
    fn snapshot_key_separates_distant_cameras() {
        let target = Vec3::new(250_000.0, 0.0, 0.0);
        let near_origin = Camera3D::new(target + Vec3::Z * 11.0, target, 1.0, 1.0, 19.0);
        let mut further = near_origin.clone();
        further.position.x = 260_000.0;
        further.target.x = 260_000.0;
        assert_ne!(near_origin.snapshot(1.0).key(), further.snapshot(1.0).key());

        let huge = CameraSnapshot::new(Mat4::from_translation(Vec3::new(1.0e20, 0.0, 0.0)), Mat4::IDENTITY);
        let larger = CameraSnapshot::new(Mat4::from_translation(Vec3::new(2.0e20, 0.0, 0.0)), Mat4::IDENTITY);
        let negative = CameraSnapshot::new(Mat4::from_translation(Vec3::new(-1.0e20, 0.0, 0.0)), Mat4::IDENTITY);
        assert_ne!(huge.key(), larger.key());
        assert_ne!(huge.key(), negative.key());
        assert_eq!(huge.key(), huge.key());
    }
}
