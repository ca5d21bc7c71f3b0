//! Camera access for the capture engine.
//!
//! This module wraps individual cameras and the driver behind them:
//! - Driver boundary via [`CameraDriver`]
//! - Per-camera lifecycle via [`DeviceHandle`]
//! - Discovery and ownership via [`CameraRegistry`]
//! - Device-to-host time mapping via [`DeviceClock`]

mod clock;
mod device;
mod driver;
mod errors;
mod registry;
pub mod types;

pub use clock::{abs_diff, epoch_ns, DeviceClock, DEFAULT_CALIBRATION_ITERATIONS};
pub use device::{DeviceHandle, FrameSource, DEFAULT_COMMAND_TIMEOUT};
pub use driver::{CameraDriver, DeviceCommand, DeviceId, DriverError, RawImage, TriggerSource};
pub use errors::{CameraError, ErrorKind, SessionError};
pub use registry::CameraRegistry;
pub use types::{CameraProfile, CameraRole, ConnectionState, Frame, ParameterValue, Parameters};
