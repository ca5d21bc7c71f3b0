//! Discovery and ownership of bound cameras.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use super::clock::DEFAULT_CALIBRATION_ITERATIONS;
use super::device::{DeviceHandle, DEFAULT_COMMAND_TIMEOUT};
use super::driver::CameraDriver;
use super::errors::CameraError;
use super::types::CameraProfile;

/// Owns every [`DeviceHandle`] in the process, keyed by serial.
///
/// A serial is bound at most once. Capture sessions borrow handles through
/// [`CameraRegistry::lend`]; the exclusive borrow is what keeps two sessions
/// from driving the same camera at the same time.
pub struct CameraRegistry {
    driver: Arc<dyn CameraDriver>,
    handles: BTreeMap<String, DeviceHandle>,
    calibration_iterations: usize,
    command_timeout: Duration,
}

impl std::fmt::Debug for CameraRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraRegistry")
            .field("bound", &self.handles.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CameraRegistry {
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self {
            driver,
            handles: BTreeMap::new(),
            calibration_iterations: DEFAULT_CALIBRATION_ITERATIONS,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_calibration_iterations(mut self, iterations: usize) -> Self {
        self.calibration_iterations = iterations;
        self
    }

    /// Bound on the disarm a handle issues while stopping its stream.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Snapshot of the serials the driver can currently reach.
    ///
    /// A device listed here may be gone by the time it is bound.
    pub fn discover(&self) -> Result<BTreeSet<String>, CameraError> {
        let serials = self.driver.enumerate().map_err(|e| {
            log::error!("device enumeration failed: {}", e);
            CameraError::DiscoveryFailed(e.to_string())
        })?;
        Ok(serials.into_iter().collect())
    }

    /// Connect the camera named by `profile` and take ownership of it.
    ///
    /// # Errors
    /// * `CameraError::DeviceBusy` - The serial is already bound, here or by
    ///   another process-level handle
    /// * `CameraError::DeviceNotFound` - The device is not reachable now
    pub fn bind(&mut self, profile: &CameraProfile) -> Result<&mut DeviceHandle, CameraError> {
        if self.handles.contains_key(&profile.serial) {
            return Err(CameraError::DeviceBusy(profile.serial.clone()));
        }

        let mut handle = DeviceHandle::new(
            profile.serial.clone(),
            profile.role,
            Arc::clone(&self.driver),
        )
        .with_calibration_iterations(self.calibration_iterations)
        .with_command_timeout(self.command_timeout);
        handle.connect()?;

        Ok(self
            .handles
            .entry(profile.serial.clone())
            .or_insert(handle))
    }

    /// Bind, configure and start streaming in one step.
    ///
    /// A camera that fails configuration or stream start is released again.
    pub fn prepare(&mut self, profile: &CameraProfile) -> Result<&mut DeviceHandle, CameraError> {
        let serial = profile.serial.clone();
        let prepared = {
            let handle = self.bind(profile)?;
            handle
                .configure(&profile.parameters)
                .and_then(|_| handle.start_stream())
        };
        if let Err(e) = prepared {
            let _ = self.release(&serial);
            return Err(e);
        }
        self.get_mut(&serial)
            .ok_or(CameraError::DeviceNotFound(serial))
    }

    /// Disconnect and drop the handle for `serial`.
    pub fn release(&mut self, serial: &str) -> Result<(), CameraError> {
        let mut handle = self
            .handles
            .remove(serial)
            .ok_or_else(|| CameraError::DeviceNotFound(serial.to_string()))?;
        handle.disconnect()
    }

    /// Release every bound camera, reporting the first failure.
    pub fn release_all(&mut self) -> Result<(), CameraError> {
        let serials: Vec<String> = self.handles.keys().cloned().collect();
        let mut first_error = None;
        for serial in serials {
            if let Err(e) = self.release(&serial) {
                log::warn!("{} - release failed: {}", serial, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Record a hot-unplug of a bound camera.
    pub fn mark_removed(&mut self, serial: &str) {
        if let Some(handle) = self.handles.get_mut(serial) {
            handle.mark_lost();
        }
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceHandle> {
        self.handles.get(serial)
    }

    pub fn get_mut(&mut self, serial: &str) -> Option<&mut DeviceHandle> {
        self.handles.get_mut(serial)
    }

    pub fn bound_serials(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn is_bound(&self, serial: &str) -> bool {
        self.handles.contains_key(serial)
    }

    /// Borrow the handles for `serials`, in the order given.
    ///
    /// # Errors
    /// * `CameraError::DuplicateCamera` - A serial is requested more than once
    /// * `CameraError::NotReady` - One or more serials are not bound
    pub fn lend(&mut self, serials: &[String]) -> Result<Vec<&mut DeviceHandle>, CameraError> {
        let mut seen = BTreeSet::new();
        let mut duplicates: Vec<String> = Vec::new();
        for serial in serials {
            if !seen.insert(serial.as_str()) && !duplicates.contains(serial) {
                duplicates.push(serial.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(CameraError::DuplicateCamera {
                serials: duplicates,
            });
        }

        let missing: Vec<String> = serials
            .iter()
            .filter(|s| !self.handles.contains_key(s.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CameraError::NotReady { serials: missing });
        }

        let mut lent: Vec<&mut DeviceHandle> = self
            .handles
            .iter_mut()
            .filter(|(serial, _)| serials.contains(serial))
            .map(|(_, handle)| handle)
            .collect();
        lent.sort_by_key(|h| {
            serials
                .iter()
                .position(|s| s == h.serial())
                .unwrap_or(usize::MAX)
        });
        Ok(lent)
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
