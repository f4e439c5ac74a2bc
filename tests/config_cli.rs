use std::fs;

use kestrel_clusters::app::{resolve_config, run, run_config};
use kestrel_clusters::cli::CliOverrides;
use kestrel_clusters::clusters::{FrameReport, GridDims};
use kestrel_clusters::config::{AppConfig, BackendKind};
use tempfile::tempdir;

const SMALL_CONFIG: &str = r#"{
    "clusters": { "gridDimensions": [8, 6, 12], "maxLightsPerCluster": 4, "lightCapacity": 32 },
    "camera": { "orbitRadius": 15.0, "far": 60.0 },
    "scene": { "lightCount": 48, "extent": 8.0 },
    "frame": { "frameCount": 3, "dispatchTimeoutMs": 5000 }
}"#;

#[test]
fn cli_overrides_layer_over_the_config_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clusters.json");
    fs::write(&path, SMALL_CONFIG).unwrap();
    let path_arg = path.to_string_lossy().to_string();
    let args =
        ["kestrel_clusters", "--config", path_arg.as_str(), "--grid", "4x4x4", "--lights", "10", "--backend", "cpu"];
    let overrides = CliOverrides::parse(args).unwrap().into_config_overrides();
    let config = resolve_config(&overrides).unwrap();
    assert_eq!(config.clusters.grid_dimensions, GridDims::new(4, 4, 4));
    assert_eq!(config.clusters.max_lights_per_cluster, 4);
    assert_eq!(config.scene.light_count, 10);
    assert_eq!(config.camera.orbit_radius, 15.0);
    assert_eq!(config.backend, BackendKind::Cpu);
}

#[test]
fn explicit_config_path_must_exist() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.json");
    let missing_arg = missing.to_string_lossy().to_string();
    let overrides = CliOverrides::parse(["app", "--config", missing_arg.as_str()]).unwrap().into_config_overrides();
    let err = resolve_config(&overrides).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to read config file"));
}

#[test]
fn zero_grid_override_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clusters.json");
    fs::write(&path, SMALL_CONFIG).unwrap();
    let path_arg = path.to_string_lossy().to_string();
    let overrides =
        CliOverrides::parse(["app", "--config", path_arg.as_str(), "--grid", "4x0x4"]).unwrap().into_config_overrides();
    let err = resolve_config(&overrides).unwrap_err();
    assert!(format!("{err:#}").contains("Invalid cluster configuration"));
}

#[test]
fn oversized_max_per_cluster_is_rejected_before_allocation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clusters.json");
    fs::write(&path, SMALL_CONFIG).unwrap();
    let path_arg = path.to_string_lossy().to_string();
    let args = ["app", "--config", path_arg.as_str(), "--max-per-cluster", "4294967295"];
    let overrides = CliOverrides::parse(args).unwrap().into_config_overrides();
    let err = resolve_config(&overrides).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Invalid cluster configuration"), "{message}");
    assert!(message.contains("resources exhausted"), "{message}");
}

#[test]
fn shipped_config_parses() {
    let config = AppConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/clusters.json")).unwrap();
    assert_eq!(config.clusters.grid_dimensions, GridDims::new(36, 20, 64));
    assert_eq!(config.clusters.max_lights_per_cluster, 20);
    assert_eq!(config.clusters.light_capacity, 256);
    config.clusters.validate().unwrap();
}

#[test]
fn demo_run_writes_a_frame_report() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("clusters.json");
    let report_path = dir.path().join("report.json");
    fs::write(&config_path, SMALL_CONFIG).unwrap();
    let args = [
        "app".to_string(),
        "--config".to_string(),
        config_path.to_string_lossy().to_string(),
        "--report".to_string(),
        report_path.to_string_lossy().to_string(),
    ];
    let report = run(CliOverrides::parse(args).unwrap().into_config_overrides()).unwrap();
    assert_eq!(report.frames.len(), 3);
    assert_eq!(report.stats.frames, 3);
    assert!(report.frames.iter().all(|frame| frame.metrics.max_lights_per_cluster <= 4));

    let loaded = FrameReport::load(&report_path).unwrap();
    assert_eq!(loaded, report);
}

#[test]
fn frozen_camera_builds_frustums_once() {
    let mut config: AppConfig = serde_json::from_str(SMALL_CONFIG).unwrap();
    config.camera.freeze = true;
    config.frame.frame_count = 4;
    let report = run_config(&config).unwrap();
    assert_eq!(report.stats.frustum_rebuilds, 1);
    assert_eq!(report.stats.frustum_reuses, 3);
    assert_eq!(report.stats.assignment_reuses, 3);
    assert!(report.frames[1..].iter().all(|frame| frame.metrics == report.frames[0].metrics));
}
