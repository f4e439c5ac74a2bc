use anyhow::{Context, Result};
use glam::{Vec2, Vec3};

use crate::camera3d::OrbitCamera;
use crate::clusters::backend::{ComputeBackend, CpuBackend};
use crate::clusters::gpu::WgpuBackend;
use crate::clusters::lights::scatter_lights;
use crate::clusters::metrics::FrameReport;
use crate::clusters::sync::FrameSynchronizer;
use crate::config::{AppConfig, AppConfigOverrides, BackendKind};

pub const DEFAULT_CONFIG_PATH: &str = "config/clusters.json";

const ORBIT_PITCH_RADIANS: f32 = -0.35;

/// Loads the configuration and applies CLI overrides. An explicit `--config` must load;
/// the default path silently falls back to built-in defaults.
pub fn resolve_config(overrides: &AppConfigOverrides) -> Result<AppConfig> {
    let mut config = match &overrides.config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(DEFAULT_CONFIG_PATH),
    };
    config.apply_overrides(overrides);
    let applied = overrides.applied_fields();
    if !applied.is_empty() {
        log::info!("CLI overrides applied: {}", applied.join(", "));
    }
    config.clusters.validate().context("Invalid cluster configuration")?;
    Ok(config)
}

fn create_backend(kind: BackendKind) -> Box<dyn ComputeBackend> {
    match kind {
        BackendKind::Cpu => Box::new(CpuBackend::new()),
        BackendKind::Gpu => match pollster::block_on(WgpuBackend::new_headless()) {
            Ok(backend) => Box::new(backend),
            Err(err) => {
                log::warn!("GPU cluster backend unavailable ({err:#}); using the CPU backend");
                Box::new(CpuBackend::new())
            }
        },
    }
}

/// Orbits a camera through a generated light field for the configured number of frames and
/// returns the per-frame cluster metrics.
pub fn run_config(config: &AppConfig) -> Result<FrameReport> {
    let backend = create_backend(config.backend);
    log::info!(
        "Clustered lighting: grid {}x{}x{}, {} lights/cluster, {} backend",
        config.clusters.grid_dimensions.x,
        config.clusters.grid_dimensions.y,
        config.clusters.grid_dimensions.z,
        config.clusters.max_lights_per_cluster,
        backend.label()
    );
    let mut report = FrameReport::new(backend.label());
    let mut sync = FrameSynchronizer::new(backend, &config.clusters, config.frame.dispatch_timeout())
        .context("Failed to set up the frame synchronizer")?;

    let truncated = sync.load_lights(scatter_lights(&config.scene))?;
    log::info!("Loaded {} lights ({truncated} over capacity)", sync.lights().len());

    let mut orbit = OrbitCamera::new(Vec3::ZERO, config.camera.orbit_radius);
    orbit.orbit(Vec2::new(0.0, ORBIT_PITCH_RADIANS));
    for _ in 0..config.frame.frame_count {
        if !config.camera.freeze {
            orbit.orbit(Vec2::new(config.camera.orbit_speed, 0.0));
        }
        let snapshot = orbit.to_configured_camera(&config.camera).snapshot(config.camera.aspect);
        let frame = sync.run_frame(&snapshot).with_context(|| format!("Frame {} failed", report.frames.len()))?;
        let record = frame.record();
        log::debug!(
            "epoch {}: {} active clusters, {} visible lights, peak {}{}",
            record.epoch,
            record.metrics.active_clusters,
            record.metrics.visible_lights,
            record.metrics.max_lights_per_cluster,
            if record.fallback { " (previous lists)" } else { "" }
        );
        report.record(record);
    }
    report.stats = sync.stats().clone();

    log::info!(
        "{} frames: {} frustum rebuilds, {} fallbacks, peak {} lights/cluster, {} dropped assignments",
        report.stats.frames,
        report.stats.frustum_rebuilds,
        report.stats.fallbacks,
        report.peak_lights_per_cluster(),
        report.total_dropped_assignments()
    );
    Ok(report)
}

pub fn run(overrides: AppConfigOverrides) -> Result<FrameReport> {
    let config = resolve_config(&overrides)?;
    let report = run_config(&config)?;
    if let Some(path) = &overrides.report_path {
        report.write_to_path(path)?;
        log::info!("Wrote frame report to {}", path.display());
    }
    Ok(report)
}
