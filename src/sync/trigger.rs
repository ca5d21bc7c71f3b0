//! Arming and firing the cameras of one capture event.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::camera::{CameraError, CameraRole, DeviceHandle, ErrorKind, TriggerSource};

/// How the cameras of an event are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// The primary's strobe drives a shared line that every secondary
    /// listens on. One command starts all exposures.
    Hardware,
    /// Each camera receives its own trigger command in quick succession.
    Software,
}

impl TriggerMode {
    /// Hardware whenever more than one camera takes part.
    pub fn preferred(camera_count: usize) -> Self {
        if camera_count > 1 {
            TriggerMode::Hardware
        } else {
            TriggerMode::Software
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Hardware => write!(f, "hardware"),
            TriggerMode::Software => write!(f, "software"),
        }
    }
}

/// Record of one fired trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct FireEvent {
    /// Host wall-clock instant the first trigger command was issued
    pub issued_at: SystemTime,
    pub mode: TriggerMode,
    /// Cameras whose trigger command failed after firing began
    pub misfired: BTreeMap<String, CameraError>,
}

/// Puts a set of streaming handles into trigger-wait and fires them.
///
/// Secondaries are always armed before the primary, so every listener is
/// waiting by the time the primary can start an exposure. A failed `arm`
/// disarms whatever it had armed before returning.
#[derive(Debug)]
pub struct TriggerCoordinator {
    mode: TriggerMode,
    command_timeout: Duration,
    /// Serials armed by this coordinator, in arm order
    armed: Vec<String>,
}

impl TriggerCoordinator {
    pub fn new(mode: TriggerMode, command_timeout: Duration) -> Self {
        Self {
            mode,
            command_timeout,
            armed: Vec::new(),
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn armed(&self) -> &[String] {
        &self.armed
    }

    /// Arm every handle.
    ///
    /// # Errors
    /// * `CameraError::IllegalState` - A handle is not Streaming; nothing is armed
    /// * `CameraError::TriggerTopology` - Hardware mode without exactly one primary
    /// * `CameraError::PartialArmFailure` - One or more handles refused; the
    ///   others have been disarmed again
    pub fn arm(&mut self, handles: &mut [&mut DeviceHandle]) -> Result<(), CameraError> {
        if let Some(handle) = handles.iter().find(|h| !h.is_streaming()) {
            return Err(CameraError::IllegalState {
                serial: handle.serial().to_string(),
                operation: "arm",
                state: handle.state(),
            });
        }

        let primaries = handles
            .iter()
            .filter(|h| h.role() == CameraRole::Primary)
            .count();
        if self.mode == TriggerMode::Hardware && primaries != 1 {
            return Err(CameraError::TriggerTopology { primaries });
        }

        let mut failed: Vec<(String, ErrorKind)> = Vec::new();
        for index in arm_order(handles) {
            let handle = &mut handles[index];
            let (source, strobe) = match (self.mode, handle.role()) {
                (TriggerMode::Hardware, CameraRole::Primary) => (TriggerSource::Software, true),
                (TriggerMode::Hardware, CameraRole::Secondary) => (TriggerSource::Line, false),
                (TriggerMode::Software, _) => (TriggerSource::Software, false),
            };
            match handle.arm(source, strobe, self.command_timeout) {
                Ok(()) => self.armed.push(handle.serial().to_string()),
                Err(e) => {
                    log::warn!("{} - arm failed: {}", handle.serial(), e);
                    failed.push((handle.serial().to_string(), e.kind()));
                }
            }
        }

        if failed.is_empty() {
            log::info!("armed {} camera(s) for {} trigger", self.armed.len(), self.mode);
            return Ok(());
        }

        self.disarm_all(handles);
        Err(CameraError::PartialArmFailure { failed })
    }

    /// Start the exposure on every armed handle.
    ///
    /// Once the first trigger command is out the event cannot be taken back,
    /// so later command failures are reported in [`FireEvent::misfired`]
    /// rather than as an error.
    ///
    /// # Errors
    /// * `CameraError::PartialArmFailure` - Not every handle is armed; the
    ///   armed ones are disarmed and nothing is fired
    pub fn fire(&mut self, handles: &mut [&mut DeviceHandle]) -> Result<FireEvent, CameraError> {
        let unarmed: Vec<(String, ErrorKind)> = handles
            .iter()
            .filter(|h| !h.is_armed() || !self.armed.iter().any(|s| s == h.serial()))
            .map(|h| (h.serial().to_string(), ErrorKind::IllegalState))
            .collect();
        if !unarmed.is_empty() {
            self.disarm_all(handles);
            return Err(CameraError::PartialArmFailure { failed: unarmed });
        }

        let order = arm_order(handles);
        let issued_at = SystemTime::now();
        let mut misfired = BTreeMap::new();
        for index in order {
            let handle = &mut handles[index];
            if self.mode == TriggerMode::Hardware && handle.role() != CameraRole::Primary {
                continue;
            }
            if let Err(e) = handle.trigger(self.command_timeout) {
                log::error!("{} - trigger failed after fire: {}", handle.serial(), e);
                misfired.insert(handle.serial().to_string(), e);
            }
        }

        log::debug!("fired {} trigger", self.mode);
        Ok(FireEvent {
            issued_at,
            mode: self.mode,
            misfired,
        })
    }

    /// Take every handle out of trigger-wait. Failures are logged, not returned.
    pub fn disarm_all(&mut self, handles: &mut [&mut DeviceHandle]) {
        for handle in handles.iter_mut() {
            if let Err(e) = handle.disarm(self.command_timeout) {
                log::warn!("{} - disarm failed: {}", handle.serial(), e);
            }
        }
        self.armed.clear();
    }
}

/// Secondaries first, then the primary, otherwise in the given order.
fn arm_order(handles: &[&mut DeviceHandle]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..handles.len()).collect();
    order.sort_by_key(|&i| handles[i].role() == CameraRole::Primary);
    order
}
