//! Opaque device-driver boundary.
//!
//! A vendor SDK binding (or the in-process simulator) implements
//! [`CameraDriver`]. Nothing from the SDK crosses this trait: devices are
//! addressed by an opaque [`DeviceId`] returned from `open`, and images come
//! back as plain [`RawImage`] values.

use std::time::Duration;

use super::types::ParameterValue;

/// Driver-issued handle for an opened device.
pub type DeviceId = u64;

/// Where an armed device takes its trigger from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Triggered by an explicit [`DeviceCommand::Trigger`].
    Software,
    /// Triggered by the shared electrical input line.
    Line,
}

/// Commands executed on a streaming device with a bounded latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Enter trigger-wait. With `strobe`, the device drives the shared
    /// trigger line when it starts exposing.
    Arm { source: TriggerSource, strobe: bool },
    /// Leave trigger-wait.
    Disarm,
    /// Start exposure on a device armed with [`TriggerSource::Software`].
    Trigger,
}

/// One image as returned by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub frame_id: u64,
    /// Device clock in nanoseconds since the device's own epoch
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    pub data: Vec<u8>,
    /// Set when the transfer did not complete
    pub incomplete: bool,
}

/// Errors reported by a driver implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("device {0} not present")]
    NotFound(String),
    #[error("device {0} already open")]
    Busy(String),
    #[error("unknown device handle {0}")]
    InvalidHandle(DeviceId),
    #[error("parameter '{name}' rejected: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("device not acquiring")]
    NotAcquiring,
    #[error("operation timed out")]
    Timeout,
    #[error("acquisition fault: {0}")]
    Fault(String),
    #[error("device disconnected")]
    Disconnected,
}

/// The primitives the engine needs from a camera SDK.
///
/// Implementations must be usable from several worker threads at once; every
/// blocking call takes an explicit bound.
pub trait CameraDriver: Send + Sync {
    /// Serials of every device currently reachable.
    fn enumerate(&self) -> Result<Vec<String>, DriverError>;

    fn open(&self, serial: &str) -> Result<DeviceId, DriverError>;

    fn get_parameter(&self, device: DeviceId, name: &str) -> Result<ParameterValue, DriverError>;

    fn set_parameter(
        &self,
        device: DeviceId,
        name: &str,
        value: &ParameterValue,
    ) -> Result<(), DriverError>;

    fn start_acquisition(&self, device: DeviceId) -> Result<(), DriverError>;

    fn stop_acquisition(&self, device: DeviceId) -> Result<(), DriverError>;

    fn execute(
        &self,
        device: DeviceId,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Latch and read the device clock, in nanoseconds.
    fn latch_timestamp(&self, device: DeviceId) -> Result<u64, DriverError>;

    /// Block until the next image is available or `timeout` elapses.
    fn get_next_image(&self, device: DeviceId, timeout: Duration) -> Result<RawImage, DriverError>;

    fn close(&self, device: DeviceId) -> Result<(), DriverError>;
}
