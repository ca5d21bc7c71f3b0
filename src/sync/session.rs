//! One user-initiated capture request.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::correlator::{
    CorrelatedSet, CorrelationPolicy, CorrelationStatus, FrameCorrelator, TimeoutPolicy,
};
use super::trigger::{TriggerCoordinator, TriggerMode};
use crate::camera::types::PIXEL_FORMAT;
use crate::camera::{CameraError, CameraProfile, CameraRegistry, DeviceHandle, SessionError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`CaptureSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Validating,
    Armed,
    Capturing,
    Completed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Settings shared by every session of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// `None` picks hardware triggering whenever more than one camera takes part
    pub trigger_mode: Option<TriggerMode>,
    /// Bound on arm, disarm and trigger commands
    pub command_timeout: Duration,
    pub correlation: CorrelationPolicy,
    pub timeouts: TimeoutPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            trigger_mode: None,
            command_timeout: Duration::from_millis(500),
            correlation: CorrelationPolicy::default(),
            timeouts: TimeoutPolicy::default(),
        }
    }
}

/// Cancels a capture request that has not fired yet.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives validation, arming, firing and correlation for one event.
///
/// A session runs once. Whether it completes or errors, the next request
/// needs a new session, so no armed state carries over between requests.
#[derive(Debug)]
pub struct CaptureSession {
    id: u64,
    state: SessionState,
    config: SessionConfig,
    cancel: CancelToken,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: SessionState::Idle,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Capture one correlated set from the cameras named by `profiles`.
    ///
    /// Every camera must already be bound and streaming in `registry`.
    /// Skew and missing frames are reported in the returned set; only
    /// structural failures (not ready, arm failure, cancel) are errors.
    pub fn request_capture(
        &mut self,
        registry: &mut CameraRegistry,
        profiles: &[CameraProfile],
    ) -> Result<CorrelatedSet, SessionError> {
        if self.state != SessionState::Idle {
            return Err(CameraError::SessionSpent { session: self.id }.into());
        }
        let serials: Vec<String> = profiles.iter().map(|p| p.serial.clone()).collect();
        match registry.lend(&serials) {
            Ok(mut handles) => self.run_capture(&mut handles),
            Err(e) => {
                self.enter(SessionState::Errored);
                log::error!("session {} - {}", self.id, e);
                Err(e.into())
            }
        }
    }

    /// Capture one correlated set from already-borrowed handles.
    pub fn run_capture(
        &mut self,
        handles: &mut [&mut DeviceHandle],
    ) -> Result<CorrelatedSet, SessionError> {
        if self.state != SessionState::Idle {
            return Err(CameraError::SessionSpent { session: self.id }.into());
        }

        self.enter(SessionState::Validating);
        if let Err(e) = validate(handles) {
            return Err(self.fail(handles, e));
        }

        let mode = self
            .config
            .trigger_mode
            .unwrap_or_else(|| TriggerMode::preferred(handles.len()));
        let mut coordinator = TriggerCoordinator::new(mode, self.config.command_timeout);

        if self.cancel.is_cancelled() {
            return Err(self.fail(handles, CameraError::Cancelled));
        }
        if let Err(e) = coordinator.arm(handles) {
            return Err(self.fail(handles, e));
        }
        self.enter(SessionState::Armed);

        if let Err(e) = flush_stale(handles) {
            return Err(self.fail(handles, e));
        }
        if self.cancel.is_cancelled() {
            return Err(self.fail(handles, CameraError::Cancelled));
        }
        let event = match coordinator.fire(handles) {
            Ok(event) => event,
            Err(e) => return Err(self.fail(handles, e)),
        };

        // Past this point the event runs to completion.
        self.enter(SessionState::Capturing);
        let correlator = FrameCorrelator::new(self.config.correlation, self.config.timeouts);
        let set = correlator.collect(handles, &event);
        coordinator.disarm_all(handles);

        self.enter(SessionState::Completed);
        if set.status() == CorrelationStatus::Incomplete {
            log::warn!("session {} - completed with a degraded set", self.id);
        }
        Ok(set)
    }

    fn enter(&mut self, state: SessionState) {
        log::debug!("session {} - {} -> {}", self.id, self.state, state);
        self.state = state;
    }

    fn fail(&mut self, handles: &mut [&mut DeviceHandle], err: CameraError) -> SessionError {
        for handle in handles.iter_mut() {
            if let Err(e) = handle.disarm(self.config.command_timeout) {
                log::warn!("{} - disarm failed: {}", handle.serial(), e);
            }
        }
        self.enter(SessionState::Errored);
        log::error!("session {} - {}", self.id, err);
        err.into()
    }
}

/// Every handle streaming, with one agreed pixel format.
fn validate(handles: &[&mut DeviceHandle]) -> Result<(), CameraError> {
    let not_ready: Vec<String> = handles
        .iter()
        .filter(|h| !h.is_streaming())
        .map(|h| h.serial().to_string())
        .collect();
    if handles.is_empty() || !not_ready.is_empty() {
        return Err(CameraError::NotReady { serials: not_ready });
    }

    let formats: Vec<(String, String)> = handles
        .iter()
        .filter_map(|h| {
            let format = h.parameters().get(PIXEL_FORMAT)?;
            Some((h.serial().to_string(), format.to_string()))
        })
        .collect();
    let distinct: BTreeSet<&str> = formats.iter().map(|(_, f)| f.as_str()).collect();
    if distinct.len() > 1 {
        return Err(CameraError::InconsistentConfiguration {
            name: PIXEL_FORMAT.to_string(),
            serials: formats.into_iter().map(|(serial, _)| serial).collect(),
        });
    }
    Ok(())
}

/// Drop frames left queued by earlier events.
fn flush_stale(handles: &mut [&mut DeviceHandle]) -> Result<(), CameraError> {
    for handle in handles.iter_mut() {
        handle.flush_frames()?;
    }
    Ok(())
}

/// Capture with whole-event re-triggers.
///
/// Each attempt gets a fresh session. An `Incomplete` set is retried while
/// attempts remain; the last set is returned either way. Errors are not
/// retried.
pub fn capture_with_retry(
    registry: &mut CameraRegistry,
    profiles: &[CameraProfile],
    config: &SessionConfig,
    retries: u32,
    cancel: &CancelToken,
) -> Result<CorrelatedSet, SessionError> {
    let mut attempt = 0;
    loop {
        let mut session = CaptureSession::new(config.clone()).with_cancel_token(cancel.clone());
        let set = session.request_capture(registry, profiles)?;
        if set.status() != CorrelationStatus::Incomplete || attempt >= retries {
            return Ok(set);
        }
        attempt += 1;
        log::warn!(
            "incomplete capture, re-triggering (attempt {}/{})",
            attempt,
            retries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::CameraRole;
    use crate::camera::ErrorKind;
    use crate::sim::{SimFault, SimulatedCamera, SimulatedDriver};

    fn config() -> SessionConfig {
        SessionConfig {
            correlation: CorrelationPolicy::default().with_tolerance(Duration::from_millis(20)),
            timeouts: TimeoutPolicy {
                factor: 2.0,
                floor: Duration::from_millis(50),
                fallback: Duration::from_millis(150),
            },
            ..SessionConfig::default()
        }
    }

    fn profiles() -> Vec<CameraProfile> {
        vec![
            CameraProfile::new("A", CameraRole::Primary),
            CameraProfile::new("B", CameraRole::Secondary),
        ]
    }

    fn rig(cameras: Vec<SimulatedCamera>) -> (Arc<SimulatedDriver>, CameraRegistry) {
        let driver = Arc::new(SimulatedDriver::new(cameras));
        let mut registry = CameraRegistry::new(driver.clone()).with_calibration_iterations(3);
        for profile in profiles() {
            registry.prepare(&profile).unwrap();
        }
        (driver, registry)
    }

    #[test]
    fn test_capture_completes() {
        let (driver, mut registry) =
            rig(vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")]);
        let mut session = CaptureSession::new(config());
        let set = session.request_capture(&mut registry, &profiles()).unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(set.status(), CorrelationStatus::Matched);
        assert_eq!(set.frames().len(), 2);
        assert!(set.failures().is_empty());
        assert!(!driver.is_armed("A"));
        assert!(!driver.is_armed("B"));
    }

    #[test]
    fn test_session_is_single_use() {
        let (_driver, mut registry) =
            rig(vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")]);
        let mut session = CaptureSession::new(config());
        session.request_capture(&mut registry, &profiles()).unwrap();
        let err = session
            .request_capture(&mut registry, &profiles())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalState);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn test_not_streaming_is_not_ready() {
        let (_driver, mut registry) =
            rig(vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")]);
        registry.get_mut("B").unwrap().stop_stream().unwrap();
        let mut session = CaptureSession::new(config());
        let err = session
            .request_capture(&mut registry, &profiles())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(err.serials, vec!["B".to_string()]);
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[test]
    fn test_unbound_camera_is_not_ready() {
        let (_driver, mut registry) =
            rig(vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")]);
        registry.release("B").unwrap();
        let mut session = CaptureSession::new(config());
        let err = session
            .request_capture(&mut registry, &profiles())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[test]
    fn test_arm_failure_errors_session() {
        let (driver, mut registry) = rig(vec![
            SimulatedCamera::new("A"),
            SimulatedCamera::new("B").with_fault(SimFault::RejectArm),
        ]);
        let mut session = CaptureSession::new(config());
        let err = session
            .request_capture(&mut registry, &profiles())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PartialArmFailure);
        assert_eq!(err.serials, vec!["B".to_string()]);
        assert_eq!(session.state(), SessionState::Errored);
        assert!(!driver.is_armed("A"));
    }

    #[test]
    fn test_cancel_before_arm() {
        let (driver, mut registry) =
            rig(vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut session = CaptureSession::new(config()).with_cancel_token(cancel);
        let err = session
            .request_capture(&mut registry, &profiles())
            .unwrap_err();
        assert_eq!(err.source, CameraError::Cancelled);
        assert_eq!(session.state(), SessionState::Errored);
        assert!(!driver.is_armed("A"));
        assert!(!driver.is_armed("B"));
    }

    #[test]
    fn test_mixed_pixel_formats_rejected() {
        let driver = Arc::new(SimulatedDriver::new(vec![
            SimulatedCamera::new("A"),
            SimulatedCamera::new("B"),
        ]));
        let mut registry = CameraRegistry::new(driver).with_calibration_iterations(3);
        let profiles = vec![
            CameraProfile::new("A", CameraRole::Primary).with_parameter(PIXEL_FORMAT, "Mono8"),
            CameraProfile::new("B", CameraRole::Secondary).with_parameter(PIXEL_FORMAT, "Mono16"),
        ];
        for profile in &profiles {
            registry.prepare(profile).unwrap();
        }
        let mut session = CaptureSession::new(config());
        let err = session.request_capture(&mut registry, &profiles).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InconsistentConfiguration);
        assert_eq!(err.serials, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_duplicate_profile_rejected() {
        let (driver, mut registry) =
            rig(vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")]);
        let mut profiles = profiles();
        profiles.push(CameraProfile::new("B", CameraRole::Secondary));
        let mut session = CaptureSession::new(config());
        let err = session
            .request_capture(&mut registry, &profiles)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InconsistentConfiguration);
        assert_eq!(err.serials, vec!["B".to_string()]);
        assert_eq!(session.state(), SessionState::Errored);
        assert!(!driver.is_armed("A"));
    }

    #[test]
    fn test_retry_gives_up_after_limit() {
        let (_driver, mut registry) = rig(vec![
            SimulatedCamera::new("A"),
            SimulatedCamera::new("B").with_fault(SimFault::DropFrames),
        ]);
        let set = capture_with_retry(
            &mut registry,
            &profiles(),
            &config(),
            2,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(set.status(), CorrelationStatus::Incomplete);
        assert_eq!(set.failures()["B"].kind(), ErrorKind::Timeout);
        assert!(set.frame("A").is_some());
    }

    #[test]
    fn test_retry_recovers_after_fault_clears() {
        let (driver, mut registry) = rig(vec![
            SimulatedCamera::new("A"),
            SimulatedCamera::new("B").with_fault(SimFault::DropFrames),
        ]);
        let first = capture_with_retry(
            &mut registry,
            &profiles(),
            &config(),
            0,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(first.status(), CorrelationStatus::Incomplete);

        driver.set_fault("B", SimFault::None);
        let second = capture_with_retry(
            &mut registry,
            &profiles(),
            &config(),
            1,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(second.frames().len(), 2);
    }
}
