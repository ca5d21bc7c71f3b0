//! Configuration file handling for multicam.
//!
//! Loads configuration from `<config_dir>/multicam/config.toml` or a custom path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{CameraProfile, CameraRole, DEFAULT_CALIBRATION_ITERATIONS};
use crate::sim::SimulatedCamera;
use crate::sync::{CorrelationPolicy, FrameIdPolicy, SessionConfig, TimeoutPolicy, TriggerMode};

/// Upper bound on every configured timeout.
const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Upper bound on `session.timeout_factor`, one hour at 1 fps.
const MAX_TIMEOUT_FACTOR: f64 = 3_600.0;

/// Configuration file structure for multicam.
/// Loaded from <config_dir>/multicam/config.toml (or custom path via --config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default, rename = "camera", skip_serializing_if = "Vec::is_empty")]
    pub cameras: Vec<CameraProfile>,
    #[serde(default, skip_serializing_if = "SimulatorConfig::is_empty")]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub tolerance_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerMode>,
    pub frame_ids: FrameIdPolicy,
    pub max_frame_id_gap: u64,
    pub timeout_factor: f64,
    pub timeout_floor_ms: u64,
    pub fallback_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub calibration_iterations: usize,
    pub retries: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tolerance_us: 1000,
            trigger: None,
            frame_ids: FrameIdPolicy::default(),
            max_frame_id_gap: 1,
            timeout_factor: 2.0,
            timeout_floor_ms: 100,
            fallback_timeout_ms: 1000,
            command_timeout_ms: 500,
            calibration_iterations: DEFAULT_CALIBRATION_ITERATIONS,
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("captures"),
            extension: "raw".to_string(),
        }
    }
}

/// Virtual cameras for running without hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SimulatorConfig {
    #[serde(default, rename = "device")]
    pub devices: Vec<SimulatedDeviceConfig>,
}

impl SimulatorConfig {
    fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDeviceConfig {
    pub serial: String,
    #[serde(default)]
    pub latency_us: u64,
}

impl From<&SimulatedDeviceConfig> for SimulatedCamera {
    fn from(device: &SimulatedDeviceConfig) -> Self {
        SimulatedCamera::new(device.serial.as_str())
            .with_latency(Duration::from_micros(device.latency_us))
    }
}

impl Config {
    /// Load configuration from a file path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed or is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_path);

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.clone(),
                source: e,
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.clone(),
                source: e,
            })?;
            config.validate()?;
            Ok(config)
        } else {
            log::debug!("no config at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Check constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            if camera.serial.trim().is_empty() {
                return Err(ConfigError::Invalid("camera serial is empty".to_string()));
            }
            if !seen.insert(camera.serial.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "camera {} is listed more than once",
                    camera.serial
                )));
            }
        }

        let primaries = self
            .cameras
            .iter()
            .filter(|c| c.role == CameraRole::Primary)
            .count();
        if primaries > 1 {
            return Err(ConfigError::Invalid(format!(
                "{} cameras have role 'primary', at most one may",
                primaries
            )));
        }

        if self.session.tolerance_us == 0 {
            return Err(ConfigError::Invalid(
                "session.tolerance_us must be greater than 0".to_string(),
            ));
        }
        let factor = self.session.timeout_factor;
        if !(factor.is_finite() && factor > 0.0 && factor <= MAX_TIMEOUT_FACTOR) {
            return Err(ConfigError::Invalid(format!(
                "session.timeout_factor must be in (0, {}]",
                MAX_TIMEOUT_FACTOR
            )));
        }
        for (name, value) in [
            ("timeout_floor_ms", self.session.timeout_floor_ms),
            ("fallback_timeout_ms", self.session.fallback_timeout_ms),
            ("command_timeout_ms", self.session.command_timeout_ms),
        ] {
            if value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid(format!(
                    "session.{} must be at most {} (one hour)",
                    name, MAX_TIMEOUT_MS
                )));
            }
        }
        Ok(())
    }

    /// Engine settings derived from the `[session]` table.
    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            trigger_mode: s.trigger,
            command_timeout: Duration::from_millis(s.command_timeout_ms),
            correlation: CorrelationPolicy {
                tolerance: Duration::from_micros(s.tolerance_us),
                frame_ids: s.frame_ids,
                max_frame_id_gap: s.max_frame_id_gap,
            },
            timeouts: TimeoutPolicy {
                factor: s.timeout_factor,
                floor: Duration::from_millis(s.timeout_floor_ms),
                fallback: Duration::from_millis(s.fallback_timeout_ms),
            },
        }
    }

    /// Cameras the simulator backend should expose.
    ///
    /// Without a `[simulator]` table, one virtual camera per configured serial.
    pub fn simulated_cameras(&self) -> Vec<SimulatedCamera> {
        if self.simulator.devices.is_empty() {
            self.cameras
                .iter()
                .map(|c| SimulatedCamera::new(c.serial.as_str()))
                .collect()
        } else {
            self.simulator.devices.iter().map(SimulatedCamera::from).collect()
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Config file '{}' already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("Failed to render configuration: {0}")]
    Serialize(#[source] toml::ser::Error),
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("multicam").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from(".config/multicam/config.toml"))
}

/// Starter configuration written by `config init`.
pub const DEFAULT_CONFIG: &str = r#"# multicam configuration

[session]
# Largest accepted distance between a frame's exposure and the trigger (µs)
tolerance_us = 1000
# "hardware" or "software"; unset picks hardware for more than one camera
# trigger = "hardware"
# "equal", "adjacent" or "timestamp-only"
frame_ids = "timestamp-only"
max_frame_id_gap = 1
# Pull timeout = timeout_factor / frame rate, at least timeout_floor_ms
timeout_factor = 2.0
timeout_floor_ms = 100
fallback_timeout_ms = 1000
command_timeout_ms = 500
calibration_iterations = 20
# Re-trigger an event this many times when a camera does not deliver
retries = 0

[output]
directory = "captures"
extension = "raw"

[[camera]]
serial = "CAM-PRIMARY"
role = "primary"
[camera.parameters]
Gain = 0.0
ExposureTime = 10000.0
AcquisitionFrameRate = 30.0

[[camera]]
serial = "CAM-SECONDARY"
role = "secondary"
[camera.parameters]
Gain = 0.0
ExposureTime = 10000.0
AcquisitionFrameRate = 30.0
"#;

/// Write [`DEFAULT_CONFIG`] to `path`, refusing to overwrite.
pub fn init(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    let io_err = |e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, DEFAULT_CONFIG).map_err(io_err)
}
