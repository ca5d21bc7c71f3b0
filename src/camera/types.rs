//! Camera types and data structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Gain in dB.
pub const GAIN: &str = "Gain";
/// Exposure time in microseconds.
pub const EXPOSURE_TIME: &str = "ExposureTime";
/// Acquisition frame rate in frames per second.
pub const FRAME_RATE: &str = "AcquisitionFrameRate";
/// Delay between trigger reception and exposure start, in microseconds.
pub const TRIGGER_DELAY: &str = "TriggerDelay";
/// Pixel format name (e.g. `Mono8`).
pub const PIXEL_FORMAT: &str = "PixelFormat";

/// Role of a camera within a synchronized rig.
///
/// The primary camera drives the shared trigger line in hardware mode and is
/// always armed and triggered last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    Primary,
    #[default]
    Secondary,
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraRole::Primary => write!(f, "primary"),
            CameraRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// A single device parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Bool(_) | ParameterValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

/// Ordered parameter map. Applied in key order during configuration.
pub type Parameters = BTreeMap<String, ParameterValue>;

/// Declarative configuration for one physical camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraProfile {
    /// Vendor-assigned serial number
    pub serial: String,
    #[serde(default)]
    pub role: CameraRole,
    #[serde(default)]
    pub parameters: Parameters,
}

impl CameraProfile {
    pub fn new(serial: impl Into<String>, role: CameraRole) -> Self {
        Self {
            serial: serial.into(),
            role,
            parameters: Parameters::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn frame_rate(&self) -> Option<f64> {
        frame_rate(&self.parameters)
    }
}

/// Configured frame rate, if present and positive.
pub fn frame_rate(parameters: &Parameters) -> Option<f64> {
    parameters
        .get(FRAME_RATE)
        .and_then(ParameterValue::as_f64)
        .filter(|fps| *fps > 0.0)
}

/// Configured trigger-to-exposure delay; zero when unset.
pub fn trigger_delay(parameters: &Parameters) -> Duration {
    parameters
        .get(TRIGGER_DELAY)
        .and_then(ParameterValue::as_f64)
        .filter(|us| *us > 0.0)
        .map(|us| Duration::from_nanos((us * 1_000.0) as u64))
        .unwrap_or(Duration::ZERO)
}

/// Lifecycle state of a [`DeviceHandle`](super::DeviceHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Configured,
    Streaming,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Configured => "configured",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// A frame pulled from one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Serial of the camera that produced this frame
    pub source_serial: String,
    /// Device-assigned, per-device monotonic sequence number
    pub frame_id: u64,
    /// Device clock value in nanoseconds (device-specific epoch)
    pub device_timestamp: u64,
    /// Device timestamp mapped onto the host wall clock
    pub captured_at: SystemTime,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    /// Raw pixel buffer
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(CameraRole::Primary.to_string(), "primary");
        assert_eq!(CameraRole::Secondary.to_string(), "secondary");
    }

    #[test]
    fn test_role_default_is_secondary() {
        assert_eq!(CameraRole::default(), CameraRole::Secondary);
    }

    #[test]
    fn test_parameter_value_as_f64() {
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParameterValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(ParameterValue::Bool(true).as_f64(), None);
        assert_eq!(ParameterValue::from("Mono8").as_f64(), None);
    }

    #[test]
    fn test_profile_frame_rate() {
        let profile = CameraProfile::new("A", CameraRole::Primary).with_parameter(FRAME_RATE, 30.0);
        assert_eq!(profile.frame_rate(), Some(30.0));

        let profile = CameraProfile::new("A", CameraRole::Primary).with_parameter(FRAME_RATE, 0.0);
        assert_eq!(profile.frame_rate(), None);
    }

    #[test]
    fn test_trigger_delay_microseconds() {
        let mut params = Parameters::new();
        assert_eq!(trigger_delay(&params), Duration::ZERO);

        params.insert(TRIGGER_DELAY.to_string(), ParameterValue::Float(250.0));
        assert_eq!(trigger_delay(&params), Duration::from_micros(250));

        params.insert(TRIGGER_DELAY.to_string(), ParameterValue::Int(-5));
        assert_eq!(trigger_delay(&params), Duration::ZERO);
    }

    #[test]
    fn test_frame_bytes_per_pixel() {
        let mut frame = Frame {
            source_serial: "A".to_string(),
            frame_id: 0,
            device_timestamp: 0,
            captured_at: SystemTime::UNIX_EPOCH,
            width: 1,
            height: 1,
            bits_per_pixel: 8,
            payload: vec![0],
        };
        assert_eq!(frame.bytes_per_pixel(), 1);
        frame.bits_per_pixel = 12;
        assert_eq!(frame.bytes_per_pixel(), 2);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Streaming.to_string(), "streaming");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}
