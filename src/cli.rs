use crate::clusters::grid::GridDims;
use crate::config::{AppConfigOverrides, BackendKind};
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

const SUPPORTED_FLAGS: &str =
    "--config, --grid, --max-per-cluster, --lights, --frames, --backend, --freeze, --report";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config_path: Option<PathBuf>,
    grid: Option<GridDims>,
    max_lights_per_cluster: Option<u32>,
    light_count: Option<u32>,
    frame_count: Option<u32>,
    backend: Option<BackendKind>,
    freeze: Option<bool>,
    report_path: Option<PathBuf>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config_path = Some(PathBuf::from(value)),
                "grid" => overrides.grid = Some(parse_grid(&value)?),
                "max-per-cluster" => {
                    overrides.max_lights_per_cluster = Some(
                        value.parse::<u32>().with_context(|| format!("Invalid max-per-cluster '{value}'"))?,
                    );
                }
                "lights" => {
                    overrides.light_count =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid light count '{value}'"))?);
                }
                "frames" => {
                    overrides.frame_count =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                "backend" => overrides.backend = Some(parse_backend(&value)?),
                "freeze" => overrides.freeze = Some(parse_bool_flag("freeze", &value)?),
                "report" => overrides.report_path = Some(PathBuf::from(value)),
                _ => bail!("Unknown flag '{flag}'. Supported flags: {SUPPORTED_FLAGS}."),
            }
        }
        Ok(overrides)
    }

    pub fn into_config_overrides(self) -> AppConfigOverrides {
        AppConfigOverrides {
            config_path: self.config_path,
            grid: self.grid,
            max_lights_per_cluster: self.max_lights_per_cluster,
            light_count: self.light_count,
            frame_count: self.frame_count,
            backend: self.backend,
            freeze: self.freeze,
            report_path: self.report_path,
        }
    }
}

/// Parses `XxYxZ`, e.g. `16x9x24`.
fn parse_grid(value: &str) -> Result<GridDims> {
    let axes = value
        .split(['x', 'X'])
        .map(|axis| axis.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid grid '{value}'. Use XxYxZ, e.g. 16x9x24."))?;
    match axes.as_slice() {
        [x, y, z] => Ok(GridDims::new(*x, *y, *z)),
        _ => bail!("Invalid grid '{value}'. Use XxYxZ, e.g. 16x9x24."),
    }
}

fn parse_backend(value: &str) -> Result<BackendKind> {
    match value.to_ascii_lowercase().as_str() {
        "cpu" => Ok(BackendKind::Cpu),
        "gpu" | "wgpu" => Ok(BackendKind::Gpu),
        other => bail!("Invalid backend '{other}'. Use cpu or gpu."),
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grid_and_capacities() {
        let args = ["app", "--grid", "16x9x24", "--max-per-cluster", "32", "--lights", "500", "--freeze", "on"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.grid, Some(GridDims::new(16, 9, 24)));
        assert_eq!(overrides.max_lights_per_cluster, Some(32));
        assert_eq!(overrides.light_count, Some(500));
        assert_eq!(overrides.freeze, Some(true));
        assert_eq!(overrides.backend, None);
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["app", "--backend", "gpu", "--frames", "10", "--backend", "cpu"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.backend, Some(BackendKind::Cpu));
        assert_eq!(overrides.frame_count, Some(10));
    }

    #[test]
    fn malformed_grid_errors() {
        assert!(CliOverrides::parse(["app", "--grid", "16x9"]).is_err());
        assert!(CliOverrides::parse(["app", "--grid", "16xax4"]).is_err());
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["app", "--lights"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = CliOverrides::parse(["app", "--width", "800"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
    }
}
