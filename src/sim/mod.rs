//! In-process simulated camera driver.
//!
//! Implements [`CameraDriver`] for a set of virtual cameras sharing one
//! trigger line. Each camera has its own clock epoch, a configurable
//! trigger-to-timestamp latency and optional injected faults, which makes the
//! capture engine testable without hardware and lets the binary run a demo
//! rig.
//!
//! Frame delivery follows the usual SDK shape: a trigger enqueues an image
//! and `get_next_image` waits on a condition variable with a deadline.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::camera::types::{EXPOSURE_TIME, FRAME_RATE, GAIN, PIXEL_FORMAT, TRIGGER_DELAY};
use crate::camera::{
    CameraDriver, DeviceCommand, DeviceId, DriverError, ParameterValue, Parameters, RawImage,
    TriggerSource,
};

/// Faults a simulated camera can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimFault {
    #[default]
    None,
    /// Accepts triggers but never delivers a frame
    DropFrames,
    /// Delivers frames flagged incomplete
    IncompleteFrames,
    /// Rejects every arm command
    RejectArm,
    /// Every command takes this long to complete
    SlowCommands(Duration),
}

/// Description of one virtual camera.
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    pub serial: String,
    pub width: u32,
    pub height: u32,
    /// Delay between trigger and the frame's device timestamp
    pub latency: Duration,
    /// How long the device has been powered on when the driver starts
    pub uptime: Option<Duration>,
    pub fault: SimFault,
}

impl SimulatedCamera {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            width: 64,
            height: 48,
            latency: Duration::ZERO,
            uptime: None,
            fault: SimFault::None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime = Some(uptime);
        self
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.fault = fault;
        self
    }
}

struct SimDevice {
    camera: SimulatedCamera,
    /// Wall-clock instant the device clock counts from
    boot: SystemTime,
    present: bool,
    handle: Option<DeviceId>,
    params: Parameters,
    acquiring: bool,
    armed: Option<(TriggerSource, bool)>,
    next_frame_id: u64,
    queue: VecDeque<RawImage>,
}

impl SimDevice {
    fn new(camera: SimulatedCamera, index: usize) -> Self {
        let uptime = camera
            .uptime
            .unwrap_or_else(|| Duration::from_secs(100 * (index as u64 + 1)));
        let boot = SystemTime::now()
            .checked_sub(uptime)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            camera,
            boot,
            present: true,
            handle: None,
            params: default_parameters(),
            acquiring: false,
            armed: None,
            next_frame_id: 0,
            queue: VecDeque::new(),
        }
    }

    fn clock_ns(&self, at: SystemTime) -> u64 {
        at.duration_since(self.boot)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn bytes_per_pixel(&self) -> usize {
        match self.params.get(PIXEL_FORMAT).and_then(ParameterValue::as_str) {
            Some("Mono16") => 2,
            _ => 1,
        }
    }

    fn expose(&mut self, at: SystemTime) {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        if self.camera.fault == SimFault::DropFrames {
            log::debug!("sim {} - dropping frame {}", self.camera.serial, frame_id);
            return;
        }
        let bpp = self.bytes_per_pixel();
        let len = self.camera.width as usize * self.camera.height as usize * bpp;
        self.queue.push_back(RawImage {
            frame_id,
            timestamp_ns: self.clock_ns(at) + self.camera.latency.as_nanos() as u64,
            width: self.camera.width,
            height: self.camera.height,
            bits_per_pixel: (bpp * 8) as u8,
            data: vec![(frame_id % 256) as u8; len],
            incomplete: self.camera.fault == SimFault::IncompleteFrames,
        });
    }

    fn reset_stream(&mut self) {
        self.acquiring = false;
        self.armed = None;
        self.queue.clear();
    }
}

fn default_parameters() -> Parameters {
    let mut params = Parameters::new();
    params.insert(GAIN.to_string(), ParameterValue::Float(0.0));
    params.insert(EXPOSURE_TIME.to_string(), ParameterValue::Float(10_000.0));
    params.insert(FRAME_RATE.to_string(), ParameterValue::Float(30.0));
    params.insert(TRIGGER_DELAY.to_string(), ParameterValue::Float(0.0));
    params.insert(PIXEL_FORMAT.to_string(), ParameterValue::from("Mono8"));
    params
}

/// Range check the way the camera's node map does it.
fn validate(name: &str, value: &ParameterValue) -> Result<(), DriverError> {
    let range = match name {
        GAIN => 0.0..=47.0,
        EXPOSURE_TIME => 5.0..=1_000_000.0,
        FRAME_RATE => 1.0..=120.0,
        TRIGGER_DELAY => 0.0..=65_520.0,
        PIXEL_FORMAT => {
            return match value.as_str() {
                Some("Mono8") | Some("Mono16") => Ok(()),
                _ => Err(DriverError::InvalidValue {
                    name: name.to_string(),
                    reason: format!("{} is not one of Mono8, Mono16", value),
                }),
            };
        }
        _ => {
            return Err(DriverError::InvalidValue {
                name: name.to_string(),
                reason: "unknown parameter".to_string(),
            })
        }
    };
    match value.as_f64() {
        Some(v) if range.contains(&v) => Ok(()),
        _ => Err(DriverError::InvalidValue {
            name: name.to_string(),
            reason: format!(
                "{} outside {}..={}",
                value,
                range.start(),
                range.end()
            ),
        }),
    }
}

struct SimState {
    devices: Vec<SimDevice>,
    next_handle: DeviceId,
    /// Reported by `enumerate` while set
    bus_error: Option<String>,
}

impl SimState {
    fn by_handle(&mut self, handle: DeviceId) -> Result<&mut SimDevice, DriverError> {
        self.devices
            .iter_mut()
            .find(|d| d.handle == Some(handle))
            .ok_or(DriverError::InvalidHandle(handle))
    }

    fn by_serial(&mut self, serial: &str) -> Option<&mut SimDevice> {
        self.devices.iter_mut().find(|d| d.camera.serial == serial)
    }
}

/// A set of virtual cameras wired to one trigger line.
pub struct SimulatedDriver {
    state: Mutex<SimState>,
    frame_ready: Condvar,
}

impl SimulatedDriver {
    pub fn new(cameras: Vec<SimulatedCamera>) -> Self {
        let devices = cameras
            .into_iter()
            .enumerate()
            .map(|(i, camera)| SimDevice::new(camera, i))
            .collect();
        Self {
            state: Mutex::new(SimState {
                devices,
                next_handle: 1,
                bus_error: None,
            }),
            frame_ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a hot-unplug.
    pub fn unplug(&self, serial: &str) {
        let mut state = self.lock();
        if let Some(device) = state.by_serial(serial) {
            device.present = false;
            device.reset_stream();
        }
        self.frame_ready.notify_all();
    }

    /// Re-attach an unplugged camera as a fresh, unopened device.
    pub fn plug(&self, serial: &str) {
        let mut state = self.lock();
        if let Some(device) = state.by_serial(serial) {
            device.present = true;
            device.handle = None;
        }
    }

    /// Make device enumeration fail with `message` until cleared with `None`.
    pub fn set_bus_error(&self, message: Option<&str>) {
        self.lock().bus_error = message.map(str::to_string);
    }

    /// Move a device clock forward, as a free-running oscillator drifts.
    pub fn advance_clock(&self, serial: &str, by: Duration) {
        if let Some(device) = self.lock().by_serial(serial) {
            device.boot = device.boot.checked_sub(by).unwrap_or(device.boot);
        }
    }

    pub fn set_fault(&self, serial: &str, fault: SimFault) {
        if let Some(device) = self.lock().by_serial(serial) {
            device.camera.fault = fault;
        }
    }

    /// Current device-side value of a parameter.
    pub fn parameter(&self, serial: &str, name: &str) -> Option<ParameterValue> {
        self.lock()
            .by_serial(serial)
            .and_then(|d| d.params.get(name).cloned())
    }

    pub fn is_armed(&self, serial: &str) -> bool {
        self.lock()
            .by_serial(serial)
            .is_some_and(|d| d.armed.is_some())
    }

    pub fn is_acquiring(&self, serial: &str) -> bool {
        self.lock().by_serial(serial).is_some_and(|d| d.acquiring)
    }

    pub fn is_open(&self, serial: &str) -> bool {
        self.lock()
            .by_serial(serial)
            .is_some_and(|d| d.handle.is_some())
    }

    fn command_latency(&self, handle: DeviceId) -> Result<Duration, DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        Ok(match device.camera.fault {
            SimFault::SlowCommands(latency) => latency,
            _ => Duration::ZERO,
        })
    }
}

impl CameraDriver for SimulatedDriver {
    fn enumerate(&self) -> Result<Vec<String>, DriverError> {
        let state = self.lock();
        if let Some(message) = &state.bus_error {
            return Err(DriverError::Fault(message.clone()));
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| d.present)
            .map(|d| d.camera.serial.clone())
            .collect())
    }

    fn open(&self, serial: &str) -> Result<DeviceId, DriverError> {
        let mut state = self.lock();
        let handle = state.next_handle;
        let device = state
            .by_serial(serial)
            .filter(|d| d.present)
            .ok_or_else(|| DriverError::NotFound(serial.to_string()))?;
        if device.handle.is_some() {
            return Err(DriverError::Busy(serial.to_string()));
        }
        device.handle = Some(handle);
        state.next_handle += 1;
        Ok(handle)
    }

    fn get_parameter(&self, handle: DeviceId, name: &str) -> Result<ParameterValue, DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        device
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::InvalidValue {
                name: name.to_string(),
                reason: "unknown parameter".to_string(),
            })
    }

    fn set_parameter(
        &self,
        handle: DeviceId,
        name: &str,
        value: &ParameterValue,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        if !device.present {
            return Err(DriverError::Disconnected);
        }
        validate(name, value)?;
        device.params.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn start_acquisition(&self, handle: DeviceId) -> Result<(), DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        if !device.present {
            return Err(DriverError::Disconnected);
        }
        device.acquiring = true;
        device.next_frame_id = 0;
        device.queue.clear();
        Ok(())
    }

    fn stop_acquisition(&self, handle: DeviceId) -> Result<(), DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        if !device.acquiring {
            return Err(DriverError::NotAcquiring);
        }
        device.reset_stream();
        self.frame_ready.notify_all();
        Ok(())
    }

    fn execute(
        &self,
        handle: DeviceId,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let latency = self.command_latency(handle)?;
        if latency > timeout {
            thread::sleep(timeout);
            return Err(DriverError::Timeout);
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        if !device.present {
            return Err(DriverError::Disconnected);
        }
        if !device.acquiring {
            return Err(DriverError::NotAcquiring);
        }

        match command {
            DeviceCommand::Arm { source, strobe } => {
                if device.camera.fault == SimFault::RejectArm {
                    return Err(DriverError::Fault("trigger arm rejected".to_string()));
                }
                device.armed = Some((source, strobe));
            }
            DeviceCommand::Disarm => device.armed = None,
            DeviceCommand::Trigger => {
                let strobe = match device.armed {
                    Some((TriggerSource::Software, strobe)) => strobe,
                    _ => {
                        return Err(DriverError::Fault(
                            "not armed for software trigger".to_string(),
                        ))
                    }
                };
                let at = SystemTime::now();
                device.expose(at);
                if strobe {
                    for other in state.devices.iter_mut() {
                        let on_line = matches!(other.armed, Some((TriggerSource::Line, _)));
                        if on_line && other.present && other.acquiring {
                            other.expose(at);
                        }
                    }
                }
                self.frame_ready.notify_all();
            }
        }
        Ok(())
    }

    fn latch_timestamp(&self, handle: DeviceId) -> Result<u64, DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        if !device.present {
            return Err(DriverError::Disconnected);
        }
        Ok(device.clock_ns(SystemTime::now()))
    }

    fn get_next_image(&self, handle: DeviceId, timeout: Duration) -> Result<RawImage, DriverError> {
        // An unrepresentable deadline waits without one
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            {
                let device = state.by_handle(handle)?;
                if !device.present {
                    return Err(DriverError::Disconnected);
                }
                if !device.acquiring {
                    return Err(DriverError::NotAcquiring);
                }
                if let Some(image) = device.queue.pop_front() {
                    return Ok(image);
                }
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::Timeout);
                    }
                    self.frame_ready
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => self
                    .frame_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn close(&self, handle: DeviceId) -> Result<(), DriverError> {
        let mut state = self.lock();
        let device = state.by_handle(handle)?;
        device.reset_stream();
        device.handle = None;
        self.frame_ready.notify_all();
        Ok(())
    }
}
