//! multicam-sync library crate.
//!
//! Synchronized acquisition from several cameras: device lifecycle, shared
//! triggering and cross-camera frame correlation. The `multicam` binary is a
//! thin CLI over these modules.

pub mod camera;
pub mod cli;
pub mod config;
pub mod export;
pub mod naming;
pub mod sim;
pub mod sync;

pub use camera::{
    CameraDriver, CameraError, CameraProfile, CameraRegistry, CameraRole, DeviceHandle, ErrorKind,
    Frame, SessionError,
};
pub use sync::{CaptureSession, CorrelatedSet, CorrelationStatus, SessionConfig};
