//! Handle for one physical camera.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::clock::{DeviceClock, DEFAULT_CALIBRATION_ITERATIONS};
use super::driver::{CameraDriver, DeviceCommand, DeviceId, DriverError, RawImage, TriggerSource};
use super::errors::{CameraError, ErrorKind};
use super::types::{self, CameraRole, ConnectionState, Frame, ParameterValue, Parameters};

/// Bound on the disarm issued while stopping a stream.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Detached reader for the frames of a streaming handle.
///
/// Lets a worker thread wait on the device without borrowing the handle.
/// The outcome goes back through [`DeviceHandle::settle_pull`].
#[derive(Clone)]
pub struct FrameSource {
    serial: String,
    driver: Arc<dyn CameraDriver>,
    device: DeviceId,
    clock: DeviceClock,
}

impl FrameSource {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn next_image(&self, timeout: Duration) -> Result<RawImage, DriverError> {
        self.driver.get_next_image(self.device, timeout)
    }

    /// Wait up to `timeout` for the next complete frame.
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame, DriverError> {
        let image = self.next_image(timeout)?;
        if image.incomplete {
            return Err(DriverError::Fault(format!(
                "frame {} incomplete",
                image.frame_id
            )));
        }
        Ok(Frame {
            source_serial: self.serial.clone(),
            frame_id: image.frame_id,
            device_timestamp: image.timestamp_ns,
            captured_at: self.clock.to_wall_clock(image.timestamp_ns),
            width: image.width,
            height: image.height,
            bits_per_pixel: image.bits_per_pixel,
            payload: image.data,
        })
    }
}

/// Wraps one physical camera behind a [`CameraDriver`].
///
/// A handle moves through `Disconnected → Connected → Configured →
/// Streaming`; `Error` is entered when the device disappears or refuses to
/// stop. `stop_stream` and `disconnect` are idempotent and are also run on
/// drop, so a handle never leaves its device acquiring.
pub struct DeviceHandle {
    serial: String,
    role: CameraRole,
    driver: Arc<dyn CameraDriver>,
    device: Option<DeviceId>,
    state: ConnectionState,
    last_error: Option<ErrorKind>,
    /// Last successfully applied parameter values
    parameters: Parameters,
    clock: DeviceClock,
    calibration_iterations: usize,
    command_timeout: Duration,
    armed: bool,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("serial", &self.serial)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("armed", &self.armed)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    /// Create a disconnected handle for `serial`.
    pub fn new(serial: impl Into<String>, role: CameraRole, driver: Arc<dyn CameraDriver>) -> Self {
        Self {
            serial: serial.into(),
            role,
            driver,
            device: None,
            state: ConnectionState::Disconnected,
            last_error: None,
            parameters: Parameters::new(),
            clock: DeviceClock::default(),
            calibration_iterations: DEFAULT_CALIBRATION_ITERATIONS,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            armed: false,
        }
    }

    /// Set the number of latch samples used for clock calibration.
    pub fn with_calibration_iterations(mut self, iterations: usize) -> Self {
        self.calibration_iterations = iterations;
        self
    }

    /// Bound on the disarm issued by `stop_stream`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn role(&self) -> CameraRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn clock(&self) -> DeviceClock {
        self.clock
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_streaming(&self) -> bool {
        self.state == ConnectionState::Streaming
    }

    /// Configured frame rate, if any.
    pub fn frame_rate(&self) -> Option<f64> {
        types::frame_rate(&self.parameters)
    }

    /// Configured trigger-to-exposure delay.
    pub fn trigger_delay(&self) -> Duration {
        types::trigger_delay(&self.parameters)
    }

    /// Open the device and calibrate its clock.
    ///
    /// # Errors
    /// * `CameraError::DeviceNotFound` - The serial is not in the discovery list
    /// * `CameraError::DeviceBusy` - Another handle already holds the device
    /// * `CameraError::IllegalState` - The handle is already connected
    pub fn connect(&mut self) -> Result<(), CameraError> {
        if self.state != ConnectionState::Disconnected {
            return Err(self.illegal("connect"));
        }

        let present = self
            .driver
            .enumerate()
            .map_err(|e| self.map_driver_error(e))?;
        if !present.iter().any(|s| s == &self.serial) {
            return Err(self.record(CameraError::DeviceNotFound(self.serial.clone())));
        }

        let device = self
            .driver
            .open(&self.serial)
            .map_err(|e| self.map_driver_error(e))?;
        self.device = Some(device);

        if let Err(e) = self.calibrate(device) {
            let _ = self.driver.close(device);
            self.device = None;
            return Err(self.map_driver_error(e));
        }

        self.state = ConnectionState::Connected;
        self.last_error = None;
        log::info!(
            "{} - connected ({}, clock offset {} ns)",
            self.serial,
            self.role,
            self.clock.offset_ns()
        );
        Ok(())
    }

    /// Re-estimate the device clock offset.
    ///
    /// Long-running devices drift; call this before a burst of captures.
    pub fn recalibrate_clock(&mut self) -> Result<(), CameraError> {
        let device = self.open_device("recalibrate clock")?;
        self.calibrate(device).map_err(|e| self.map_driver_error(e))
    }

    fn calibrate(&mut self, device: DeviceId) -> Result<(), DriverError> {
        let driver = Arc::clone(&self.driver);
        let estimated = DeviceClock::estimate::<DriverError>(self.calibration_iterations, || {
            let device_ns = driver.latch_timestamp(device)?;
            Ok((SystemTime::now(), device_ns))
        })?;
        if let Some(clock) = estimated {
            self.clock = clock;
        }
        Ok(())
    }

    /// Apply `parameters` all-or-nothing.
    ///
    /// Values are applied in key order. If any value is rejected, every value
    /// already written is restored to what the device held before the call.
    ///
    /// # Errors
    /// * `CameraError::IllegalState` - Not Connected/Configured (e.g. Streaming)
    /// * `CameraError::InvalidParameter` - A value is outside the accepted range
    pub fn configure(&mut self, parameters: &Parameters) -> Result<(), CameraError> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Configured
        ) {
            return Err(self.illegal("configure"));
        }
        let device = self.open_device("configure")?;

        let mut applied: Vec<(&str, Option<ParameterValue>)> = Vec::new();
        for (name, value) in parameters {
            let prior = self.driver.get_parameter(device, name).ok();
            match self.driver.set_parameter(device, name, value) {
                Ok(()) => applied.push((name.as_str(), prior)),
                Err(e) => {
                    self.rollback(device, &applied);
                    let err = match e {
                        DriverError::InvalidValue { reason, .. } => CameraError::InvalidParameter {
                            serial: self.serial.clone(),
                            name: name.clone(),
                            reason,
                        },
                        other => self.map_driver_error(other),
                    };
                    log::warn!("{} - configuration rejected: {}", self.serial, err);
                    return Err(self.record(err));
                }
            }
        }

        for (name, value) in parameters {
            self.parameters.insert(name.clone(), value.clone());
        }
        self.state = ConnectionState::Configured;
        log::info!(
            "{} - configured {} parameter(s)",
            self.serial,
            parameters.len()
        );
        Ok(())
    }

    fn rollback(&self, device: DeviceId, applied: &[(&str, Option<ParameterValue>)]) {
        for (name, prior) in applied.iter().rev() {
            let Some(prior) = prior else {
                continue;
            };
            if let Err(e) = self.driver.set_parameter(device, name, prior) {
                log::error!(
                    "{} - failed to restore '{}' to {}: {}",
                    self.serial,
                    name,
                    prior,
                    e
                );
            }
        }
    }

    /// Transition Configured → Streaming.
    pub fn start_stream(&mut self) -> Result<(), CameraError> {
        if self.state != ConnectionState::Configured {
            return Err(self.illegal("start stream"));
        }
        let device = self.open_device("start stream")?;
        self.driver
            .start_acquisition(device)
            .map_err(|e| self.map_driver_error(e))?;
        self.state = ConnectionState::Streaming;
        log::info!("{} - stream started", self.serial);
        Ok(())
    }

    /// Stop acquisition. A no-op unless the device is acquiring.
    ///
    /// Safe from the `Error` state; a device that refuses to stop is left in
    /// `Error`.
    pub fn stop_stream(&mut self) -> Result<(), CameraError> {
        let Some(device) = self.device else {
            return Ok(());
        };
        if self.armed {
            if let Err(e) = self.disarm(self.command_timeout) {
                log::warn!("{} - disarm failed: {}", self.serial, e);
            }
        }
        match self.state {
            ConnectionState::Streaming => {}
            ConnectionState::Error => {
                let _ = self.driver.stop_acquisition(device);
                return Ok(());
            }
            _ => return Ok(()),
        }

        match self.driver.stop_acquisition(device) {
            Ok(()) | Err(DriverError::NotAcquiring) => {
                self.state = ConnectionState::Configured;
                log::info!("{} - stream stopped", self.serial);
                Ok(())
            }
            Err(e) => {
                let err = self.map_driver_error(e);
                self.state = ConnectionState::Error;
                Err(err)
            }
        }
    }

    /// Block until a frame arrives, the device faults, or `timeout` elapses.
    ///
    /// # Errors
    /// * `CameraError::Timeout` - No frame within `timeout`
    /// * `CameraError::AcquisitionFault` - The device reported a fault or an
    ///   incomplete image
    /// * `CameraError::IllegalState` - The handle is not streaming
    pub fn pull_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        let source = self.frame_source()?;
        let result = source.next_frame(timeout);
        self.settle_pull(result, timeout)
    }

    /// Reader for this handle's frames that can be moved to another thread.
    pub fn frame_source(&self) -> Result<FrameSource, CameraError> {
        if self.state != ConnectionState::Streaming {
            return Err(self.illegal("pull frame"));
        }
        let device = self.open_device("pull frame")?;
        Ok(FrameSource {
            serial: self.serial.clone(),
            driver: Arc::clone(&self.driver),
            device,
            clock: self.clock,
        })
    }

    /// Record the outcome of a [`FrameSource`] pull of at most `timeout`.
    pub fn settle_pull(
        &mut self,
        result: Result<Frame, DriverError>,
        timeout: Duration,
    ) -> Result<Frame, CameraError> {
        match result {
            Ok(frame) => Ok(frame),
            Err(DriverError::Timeout) => Err(self.record(CameraError::Timeout {
                serial: self.serial.clone(),
                timeout,
            })),
            Err(e) => Err(self.map_driver_error(e)),
        }
    }

    /// Discard every frame already queued on the device.
    ///
    /// Returns how many were dropped. A frame that arrived after its event
    /// gave up on it would otherwise be taken for the next event's frame.
    pub fn flush_frames(&mut self) -> Result<usize, CameraError> {
        let source = self.frame_source()?;
        let mut discarded = 0;
        loop {
            match source.next_image(Duration::ZERO) {
                Ok(image) => {
                    log::debug!("{} - dropping stale frame {}", self.serial, image.frame_id);
                    discarded += 1;
                }
                Err(DriverError::Timeout) => break,
                Err(e) => return Err(self.map_driver_error(e)),
            }
        }
        if discarded > 0 {
            log::warn!("{} - discarded {} stale frame(s)", self.serial, discarded);
        }
        Ok(discarded)
    }

    /// Take the handle out of service after a pull outlived its deadline.
    ///
    /// The driver call may still be blocked on another thread, so the handle
    /// is not streamed from again until it is released and prepared anew.
    pub fn mark_stalled(&mut self, timeout: Duration) -> CameraError {
        log::error!(
            "{} - frame pull did not return within {:?}",
            self.serial,
            timeout
        );
        self.state = ConnectionState::Error;
        self.record(CameraError::Timeout {
            serial: self.serial.clone(),
            timeout,
        })
    }

    /// Put a streaming device into trigger-wait.
    pub fn arm(
        &mut self,
        source: TriggerSource,
        strobe: bool,
        timeout: Duration,
    ) -> Result<(), CameraError> {
        if self.state != ConnectionState::Streaming {
            return Err(self.illegal("arm"));
        }
        self.command(DeviceCommand::Arm { source, strobe }, timeout)?;
        self.armed = true;
        log::debug!("{} - armed ({:?}, strobe={})", self.serial, source, strobe);
        Ok(())
    }

    /// Leave trigger-wait. A no-op when not armed.
    pub fn disarm(&mut self, timeout: Duration) -> Result<(), CameraError> {
        if !self.armed {
            return Ok(());
        }
        let result = self.command(DeviceCommand::Disarm, timeout);
        // The device will not be triggered by this engine again either way.
        self.armed = false;
        if result.is_ok() {
            log::debug!("{} - disarmed", self.serial);
        }
        result
    }

    /// Issue a software trigger to an armed device.
    pub fn trigger(&mut self, timeout: Duration) -> Result<(), CameraError> {
        if !self.armed {
            return Err(self.illegal("trigger unarmed device"));
        }
        self.command(DeviceCommand::Trigger, timeout)
    }

    fn command(&mut self, command: DeviceCommand, timeout: Duration) -> Result<(), CameraError> {
        let device = self.open_device("execute command")?;
        match self.driver.execute(device, command, timeout) {
            Ok(()) => Ok(()),
            Err(DriverError::Timeout) => Err(self.record(CameraError::Timeout {
                serial: self.serial.clone(),
                timeout,
            })),
            Err(e) => Err(self.map_driver_error(e)),
        }
    }

    /// Stop streaming and close the device. Idempotent.
    pub fn disconnect(&mut self) -> Result<(), CameraError> {
        let stopped = self.stop_stream();
        if let Some(device) = self.device.take() {
            if let Err(e) = self.driver.close(device) {
                log::warn!("{} - close failed: {}", self.serial, e);
            }
            log::info!("{} - disconnected", self.serial);
        }
        self.armed = false;
        self.state = ConnectionState::Disconnected;
        stopped
    }

    /// Mark the device as gone after a hot-unplug notification.
    pub fn mark_lost(&mut self) {
        log::warn!("{} - removed", self.serial);
        self.armed = false;
        self.state = ConnectionState::Error;
        self.last_error = Some(ErrorKind::DeviceNotFound);
    }

    fn open_device(&self, operation: &'static str) -> Result<DeviceId, CameraError> {
        self.device.ok_or_else(|| self.illegal(operation))
    }

    fn illegal(&self, operation: &'static str) -> CameraError {
        CameraError::IllegalState {
            serial: self.serial.clone(),
            operation,
            state: self.state,
        }
    }

    fn record(&mut self, err: CameraError) -> CameraError {
        self.last_error = Some(err.kind());
        err
    }

    fn map_driver_error(&mut self, e: DriverError) -> CameraError {
        let serial = self.serial.clone();
        let err = match e {
            DriverError::NotFound(_) => CameraError::DeviceNotFound(serial),
            DriverError::Busy(_) => CameraError::DeviceBusy(serial),
            DriverError::InvalidValue { name, reason } => CameraError::InvalidParameter {
                serial,
                name,
                reason,
            },
            DriverError::Timeout => CameraError::Timeout {
                serial,
                timeout: Duration::ZERO,
            },
            DriverError::Disconnected => {
                self.state = ConnectionState::Error;
                self.armed = false;
                CameraError::DeviceNotFound(serial)
            }
            DriverError::NotAcquiring => CameraError::IllegalState {
                serial,
                operation: "acquire",
                state: self.state,
            },
            DriverError::Fault(message) => CameraError::AcquisitionFault { serial, message },
            DriverError::InvalidHandle(_) => CameraError::AcquisitionFault {
                serial,
                message: e.to_string(),
            },
        };
        self.record(err)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
