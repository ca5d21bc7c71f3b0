//! Error types for camera and capture operations.
//!
//! Device-level failures carry the serial of the camera involved so that a
//! caller can always tell which camera failed and how.

use std::fmt;
use std::time::Duration;

use super::types::ConnectionState;

/// Errors raised by device handles, the registry and the capture engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CameraError {
    #[error("Camera {0} not found. Run 'list-cameras' to see connected devices")]
    DeviceNotFound(String),

    #[error("Camera {0} is already claimed by another handle")]
    DeviceBusy(String),

    #[error("Device enumeration failed: {0}")]
    DiscoveryFailed(String),

    #[error("Camera {serial}: invalid value for '{name}': {reason}")]
    InvalidParameter {
        serial: String,
        name: String,
        reason: String,
    },

    #[error("Camera {serial}: cannot {operation} while {state}")]
    IllegalState {
        serial: String,
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Camera {serial}: no frame within {timeout:?}")]
    Timeout { serial: String, timeout: Duration },

    #[error("Camera {serial}: acquisition fault: {message}")]
    AcquisitionFault { serial: String, message: String },

    #[error("Failed to arm {}", format_failures(.failed))]
    PartialArmFailure { failed: Vec<(String, ErrorKind)> },

    #[error("Cameras not streaming: {}", .serials.join(", "))]
    NotReady { serials: Vec<String> },

    #[error("Hardware trigger needs exactly one primary camera, found {primaries}")]
    TriggerTopology { primaries: usize },

    #[error("Cameras disagree on '{name}': {}", .serials.join(", "))]
    InconsistentConfiguration { name: String, serials: Vec<String> },

    #[error("Cameras requested more than once: {}", .serials.join(", "))]
    DuplicateCamera { serials: Vec<String> },

    #[error("Capture request cancelled")]
    Cancelled,

    #[error("Capture session {session} has already run; start a new session")]
    SessionSpent { session: u64 },
}

fn format_failures(failed: &[(String, ErrorKind)]) -> String {
    failed
        .iter()
        .map(|(serial, kind)| format!("{} ({})", serial, kind))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CameraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CameraError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            CameraError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            CameraError::DiscoveryFailed(_) => ErrorKind::AcquisitionFault,
            CameraError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            CameraError::IllegalState { .. } => ErrorKind::IllegalState,
            CameraError::Timeout { .. } => ErrorKind::Timeout,
            CameraError::AcquisitionFault { .. } => ErrorKind::AcquisitionFault,
            CameraError::PartialArmFailure { .. } => ErrorKind::PartialArmFailure,
            CameraError::NotReady { .. } => ErrorKind::NotReady,
            CameraError::TriggerTopology { .. } => ErrorKind::TriggerTopology,
            CameraError::InconsistentConfiguration { .. } | CameraError::DuplicateCamera { .. } => {
                ErrorKind::InconsistentConfiguration
            }
            CameraError::Cancelled => ErrorKind::Cancelled,
            CameraError::SessionSpent { .. } => ErrorKind::IllegalState,
        }
    }

    /// Serials this error is about, in the order they were reported.
    pub fn serials(&self) -> Vec<String> {
        match self {
            CameraError::DeviceNotFound(serial) | CameraError::DeviceBusy(serial) => {
                vec![serial.clone()]
            }
            CameraError::InvalidParameter { serial, .. }
            | CameraError::IllegalState { serial, .. }
            | CameraError::Timeout { serial, .. }
            | CameraError::AcquisitionFault { serial, .. } => vec![serial.clone()],
            CameraError::PartialArmFailure { failed } => {
                failed.iter().map(|(serial, _)| serial.clone()).collect()
            }
            CameraError::NotReady { serials }
            | CameraError::InconsistentConfiguration { serials, .. }
            | CameraError::DuplicateCamera { serials } => serials.clone(),
            CameraError::DiscoveryFailed(_)
            | CameraError::TriggerTopology { .. }
            | CameraError::Cancelled
            | CameraError::SessionSpent { .. } => Vec::new(),
        }
    }
}

/// Discriminant of a [`CameraError`], kept as a handle's `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    DeviceNotFound,
    DeviceBusy,
    InvalidParameter,
    IllegalState,
    Timeout,
    AcquisitionFault,
    PartialArmFailure,
    NotReady,
    TriggerTopology,
    InconsistentConfiguration,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A capture request that did not produce a correlated set.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Capture failed ({kind}): {source}")]
pub struct SessionError {
    pub kind: ErrorKind,
    /// Cameras responsible for the failure (empty when not camera-specific)
    pub serials: Vec<String>,
    #[source]
    pub source: CameraError,
}

impl From<CameraError> for SessionError {
    fn from(source: CameraError) -> Self {
        Self {
            kind: source.kind(),
            serials: source.serials(),
            source,
        }
    }
}
