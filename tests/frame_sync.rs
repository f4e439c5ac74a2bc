use std::time::Duration;

use glam::Vec3;
use kestrel_clusters::camera3d::{Camera3D, CameraSnapshot};
use kestrel_clusters::clusters::{
    AssignmentTask, ClusterCoord, ClusterLightList, ComputeBackend, CpuBackend, FrameStage, FrameSynchronizer,
    GridDims, Light, PointLight, TaskHandle,
};
use kestrel_clusters::config::ClusterConfig;
use kestrel_clusters::ClusterError;

/// CPU backend whose `wait` can be made to time out, standing in for a hung dispatch.
struct StallingBackend {
    inner: CpuBackend,
    stalled: bool,
    submitted: usize,
}

impl StallingBackend {
    fn new() -> Self {
        Self { inner: CpuBackend::new(), stalled: false, submitted: 0 }
    }
}

impl ComputeBackend for StallingBackend {
    fn label(&self) -> &'static str {
        "stalling"
    }

    fn submit(&mut self, task: AssignmentTask) -> Result<TaskHandle, ClusterError> {
        self.submitted += 1;
        self.inner.submit(task)
    }

    fn wait(&mut self, handle: TaskHandle, timeout: Duration) -> Result<ClusterLightList, ClusterError> {
        if self.stalled {
            return Err(ClusterError::DispatchTimeout { task: handle.id(), waited_ms: timeout.as_millis() });
        }
        self.inner.wait(handle, Duration::from_secs(10))
    }
}

fn config() -> ClusterConfig {
    ClusterConfig { grid_dimensions: GridDims::new(4, 4, 4), max_lights_per_cluster: 8, light_capacity: 4 }
}

fn camera_at(z: f32) -> CameraSnapshot {
    Camera3D::new(Vec3::new(0.0, 0.0, z), Vec3::ZERO, 90.0_f32.to_radians(), 1.0, 19.0).snapshot(1.0)
}

fn origin_light() -> Light {
    Light::Point(PointLight::new(Vec3::ZERO, 1.0, Vec3::ONE, 1.0))
}

fn stalling_sync() -> FrameSynchronizer<StallingBackend> {
    let mut sync = FrameSynchronizer::new(StallingBackend::new(), &config(), Duration::from_millis(5)).unwrap();
    sync.load_lights([origin_light()]).unwrap();
    sync
}

#[test]
fn full_epoch_exposes_lookup_to_shading() {
    let mut sync = FrameSynchronizer::new(CpuBackend::new(), &config(), Duration::from_secs(10)).unwrap();
    sync.load_lights([origin_light()]).unwrap();
    let frame = sync.run_frame(&camera_at(11.0)).unwrap();
    let center = frame.lookup(Vec3::new(0.01, 0.01, 0.0)).expect("visible");
    assert_eq!(center.coord, ClusterCoord::new(2, 2, 2));
    assert_eq!(center.lights, &[0]);
    assert_eq!(frame.lights().len(), 1);
    assert!(frame.frustums_rebuilt());
    assert_eq!(frame.metrics().visible_lights, 1);
    drop(frame);
    assert_eq!(sync.stage(), FrameStage::Idle);
    assert_eq!(sync.stats().frames, 1);
}

#[test]
fn timed_out_dispatch_shades_previous_lists() {
    let mut sync = stalling_sync();
    let first = sync.run_frame(&camera_at(11.0)).unwrap().light_list().clone();

    sync.backend_mut().stalled = true;
    let frame = sync.run_frame(&camera_at(12.0)).unwrap();
    assert!(frame.is_fallback());
    assert_eq!(frame.light_list(), &first);
    // the new grid was built but shading still reads the one the previous lists belong to
    assert!(!frame.frustums_rebuilt());
    assert!(!frame.record().frustums_rebuilt);
    // lookups stay consistent with the grid the previous lists were built against
    assert_eq!(frame.lookup(Vec3::new(0.01, 0.01, 0.0)).unwrap().coord, ClusterCoord::new(2, 2, 2));
    drop(frame);
    assert!(sync.has_straggler());
    assert_eq!(sync.stats().timeouts, 1);
    assert_eq!(sync.stats().fallbacks, 1);
    assert_eq!(sync.stats().frustum_rebuilds, 2);
}

#[test]
fn straggler_blocks_new_dispatch_until_drained() {
    let mut sync = stalling_sync();
    sync.run_frame(&camera_at(11.0)).unwrap().finish();
    sync.backend_mut().stalled = true;
    sync.run_frame(&camera_at(12.0)).unwrap().finish();
    assert_eq!(sync.backend().submitted, 2);

    // still stalled: the straggler is not drained and nothing new is submitted
    let frame = sync.run_frame(&camera_at(13.0)).unwrap();
    assert!(frame.is_fallback());
    drop(frame);
    assert_eq!(sync.backend().submitted, 2);

    sync.backend_mut().stalled = false;
    let frame = sync.run_frame(&camera_at(14.0)).unwrap();
    assert!(!frame.is_fallback());
    drop(frame);
    assert!(!sync.has_straggler());
    assert_eq!(sync.stats().stragglers_drained, 1);
    assert_eq!(sync.backend().submitted, 3);
}

#[test]
fn stale_lists_are_never_reused_after_light_changes() {
    let mut sync = stalling_sync();
    sync.run_frame(&camera_at(11.0)).unwrap().finish();
    sync.set_light(0, Light::Point(PointLight::new(Vec3::new(0.0, 3.0, 0.0), 1.0, Vec3::ONE, 1.0))).unwrap();

    sync.backend_mut().stalled = true;
    let err = sync.run_frame(&camera_at(11.0)).err().expect("no current lists to fall back to");
    assert!(matches!(err, ClusterError::DispatchTimeout { .. }));
    assert_eq!(sync.stage(), FrameStage::Idle);
    assert_eq!(sync.published_list().map(|list| list.light_revision()), Some(1));
    assert_eq!(sync.lights().revision(), 2);
}

#[test]
fn first_frame_timeout_is_an_error() {
    let mut sync = stalling_sync();
    sync.backend_mut().stalled = true;
    assert!(sync.run_frame(&camera_at(11.0)).is_err());
    assert_eq!(sync.stage(), FrameStage::Idle);
    assert!(sync.published_list().is_none());
}

#[test]
fn light_table_truncates_to_capacity() {
    let mut sync = stalling_sync();
    let lights = (0..7).map(|i| Light::Point(PointLight::new(Vec3::splat(i as f32), 1.0, Vec3::ONE, 1.0)));
    assert_eq!(sync.load_lights(lights).unwrap(), 3);
    assert_eq!(sync.lights().len(), 4);
    let frame = sync.run_frame(&camera_at(11.0)).unwrap();
    assert!(frame.light_list().slots().iter().all(|&index| index < 4));
    assert_eq!(frame.metrics().total_lights, 4);
}

#[test]
fn config_errors_surface_at_construction() {
    let bad = ClusterConfig { max_lights_per_cluster: 0, ..config() };
    let err = FrameSynchronizer::new(CpuBackend::new(), &bad, Duration::from_millis(1)).err().unwrap();
    assert!(err.is_configuration());
}
