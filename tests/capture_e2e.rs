//! End-to-end capture tests against the simulated camera rig.
//!
//! These cover the three-camera acceptance scenario:
//! - All frames near the trigger give a matched set
//! - A late camera gives a flagged set that still holds every frame
//! - A camera that never delivers gives an incomplete set naming it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use multicam_sync::camera::{
    CameraDriver, CameraProfile, CameraRegistry, CameraRole, ConnectionState, DeviceCommand,
    DeviceId, DriverError, ErrorKind, Frame, ParameterValue, RawImage,
};
use multicam_sync::sim::{SimFault, SimulatedCamera, SimulatedDriver};
use multicam_sync::sync::{
    CaptureSession, CorrelationPolicy, CorrelationStatus, SessionConfig, SessionState,
    TimeoutPolicy, TriggerMode,
};

fn profiles() -> Vec<CameraProfile> {
    vec![
        CameraProfile::new("A", CameraRole::Primary),
        CameraProfile::new("B", CameraRole::Secondary),
        CameraProfile::new("C", CameraRole::Secondary),
    ]
}

fn rig(c: SimulatedCamera) -> (Arc<SimulatedDriver>, CameraRegistry) {
    let driver = Arc::new(SimulatedDriver::new(vec![
        SimulatedCamera::new("A").with_latency(Duration::from_millis(1)),
        SimulatedCamera::new("B").with_latency(Duration::from_micros(2_500)),
        c,
    ]));
    let mut registry = CameraRegistry::new(driver.clone()).with_calibration_iterations(5);
    for profile in profiles() {
        registry.prepare(&profile).expect("camera should start streaming");
    }
    (driver, registry)
}

fn config(mode: TriggerMode) -> SessionConfig {
    SessionConfig {
        trigger_mode: Some(mode),
        correlation: CorrelationPolicy::default().with_tolerance(Duration::from_millis(10)),
        timeouts: TimeoutPolicy {
            factor: 2.0,
            floor: Duration::from_millis(50),
            fallback: Duration::from_millis(150),
        },
        ..SessionConfig::default()
    }
}

/// Cameras exposing shortly after the trigger are matched.
#[test]
fn test_hardware_trigger_matched() {
    let (driver, mut registry) =
        rig(SimulatedCamera::new("C").with_latency(Duration::from_millis(4)));
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));

    let set = session.request_capture(&mut registry, &profiles()).unwrap();

    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(set.status(), CorrelationStatus::Matched);
    assert_eq!(set.frames().len(), 3);
    assert!(set.max_timestamp_skew() >= Duration::from_millis(4));
    assert!(set.max_timestamp_skew() <= Duration::from_millis(10));
    for serial in ["A", "B", "C"] {
        assert!(!driver.is_armed(serial), "{} left armed", serial);
    }
}

/// A late camera flags the set but its frame is kept.
#[test]
fn test_late_camera_skew_exceeded() {
    let (_driver, mut registry) =
        rig(SimulatedCamera::new("C").with_latency(Duration::from_millis(25)));
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));

    let set = session.request_capture(&mut registry, &profiles()).unwrap();

    assert_eq!(set.status(), CorrelationStatus::SkewExceeded);
    assert_eq!(set.frames().len(), 3);
    assert!(set.failures().is_empty());
    assert!(set.skews()["C"] > set.tolerance());
    assert!(set.skews()["A"] <= set.tolerance());
}

/// A camera that never delivers is reported as timed out; the others are kept.
#[test]
fn test_missing_camera_incomplete() {
    let (_driver, mut registry) = rig(SimulatedCamera::new("C").with_fault(SimFault::DropFrames));
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));

    let set = session.request_capture(&mut registry, &profiles()).unwrap();

    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(set.status(), CorrelationStatus::Incomplete);
    assert!(set.frame("A").is_some());
    assert!(set.frame("B").is_some());
    assert!(set.frame("C").is_none());
    assert_eq!(set.failures()["C"].kind(), ErrorKind::Timeout);
}

/// An incomplete transfer is an acquisition fault, not a frame.
#[test]
fn test_incomplete_image_is_acquisition_fault() {
    let (_driver, mut registry) =
        rig(SimulatedCamera::new("C").with_fault(SimFault::IncompleteFrames));
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));

    let set = session.request_capture(&mut registry, &profiles()).unwrap();

    assert_eq!(set.status(), CorrelationStatus::Incomplete);
    assert_eq!(set.failures()["C"].kind(), ErrorKind::AcquisitionFault);
}

/// Software triggering reaches every camera too.
#[test]
fn test_software_trigger_collects_all() {
    let (_driver, mut registry) = rig(SimulatedCamera::new("C"));
    let mut session = CaptureSession::new(config(TriggerMode::Software));

    let set = session.request_capture(&mut registry, &profiles()).unwrap();

    assert_eq!(set.frames().len(), 3);
    assert!(set.failures().is_empty());
}

/// A camera unplugged after streaming started fails the arm step, and the
/// rest are not left armed.
#[test]
fn test_unplugged_camera_fails_arm() {
    let (driver, mut registry) = rig(SimulatedCamera::new("C"));
    driver.unplug("C");
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));

    let err = session
        .request_capture(&mut registry, &profiles())
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::PartialArmFailure);
    assert_eq!(err.serials, vec!["C".to_string()]);
    assert_eq!(session.state(), SessionState::Errored);
    assert!(!driver.is_armed("A"));
    assert!(!driver.is_armed("B"));
}

/// Frame ids restart with each stream and advance per event.
#[test]
fn test_frame_ids_advance_per_event() {
    let (_driver, mut registry) = rig(SimulatedCamera::new("C"));
    let mut ids: Vec<u64> = Vec::new();
    for _ in 0..3 {
        let mut session = CaptureSession::new(config(TriggerMode::Hardware));
        let set = session.request_capture(&mut registry, &profiles()).unwrap();
        let frame: &Frame = set.frame("B").unwrap();
        ids.push(frame.frame_id);
    }
    assert_eq!(ids, vec![0, 1, 2]);
}

/// Frames are stamped on the host clock despite per-device epochs.
#[test]
fn test_captured_at_is_host_time() {
    let (_driver, mut registry) = rig(SimulatedCamera::new("C"));
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));
    let set = session.request_capture(&mut registry, &profiles()).unwrap();

    let a = set.frame("A").unwrap();
    let c = set.frame("C").unwrap();
    // Device clocks started 100 s apart
    assert!(c.device_timestamp > a.device_timestamp + 50_000_000_000);
    let gap = match a.captured_at.duration_since(c.captured_at) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    assert!(gap < Duration::from_millis(10));
}

/// Simulator whose first frame pull for one camera stalls.
///
/// The stalled call sleeps for `stall`, ignoring the requested timeout, and
/// reports a timeout while leaving any queued frame in place.
struct StallingDriver {
    inner: SimulatedDriver,
    serial: String,
    stall: Duration,
    device: Mutex<Option<DeviceId>>,
    stalled: AtomicBool,
}

impl StallingDriver {
    fn new(cameras: Vec<SimulatedCamera>, serial: &str, stall: Duration) -> Self {
        Self {
            inner: SimulatedDriver::new(cameras),
            serial: serial.to_string(),
            stall,
            device: Mutex::new(None),
            stalled: AtomicBool::new(false),
        }
    }
}

impl CameraDriver for StallingDriver {
    fn enumerate(&self) -> Result<Vec<String>, DriverError> {
        self.inner.enumerate()
    }

    fn open(&self, serial: &str) -> Result<DeviceId, DriverError> {
        let device = self.inner.open(serial)?;
        if serial == self.serial {
            *self.device.lock().unwrap() = Some(device);
        }
        Ok(device)
    }

    fn get_parameter(&self, device: DeviceId, name: &str) -> Result<ParameterValue, DriverError> {
        self.inner.get_parameter(device, name)
    }

    fn set_parameter(
        &self,
        device: DeviceId,
        name: &str,
        value: &ParameterValue,
    ) -> Result<(), DriverError> {
        self.inner.set_parameter(device, name, value)
    }

    fn start_acquisition(&self, device: DeviceId) -> Result<(), DriverError> {
        self.inner.start_acquisition(device)
    }

    fn stop_acquisition(&self, device: DeviceId) -> Result<(), DriverError> {
        self.inner.stop_acquisition(device)
    }

    fn execute(
        &self,
        device: DeviceId,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.inner.execute(device, command, timeout)
    }

    fn latch_timestamp(&self, device: DeviceId) -> Result<u64, DriverError> {
        self.inner.latch_timestamp(device)
    }

    fn get_next_image(&self, device: DeviceId, timeout: Duration) -> Result<RawImage, DriverError> {
        let target = *self.device.lock().unwrap() == Some(device);
        if target && !timeout.is_zero() && !self.stalled.swap(true, Ordering::SeqCst) {
            thread::sleep(self.stall);
            return Err(DriverError::Timeout);
        }
        self.inner.get_next_image(device, timeout)
    }

    fn close(&self, device: DeviceId) -> Result<(), DriverError> {
        self.inner.close(device)
    }
}

fn stalling_rig(stall: Duration) -> CameraRegistry {
    let driver = Arc::new(StallingDriver::new(
        vec![SimulatedCamera::new("A"), SimulatedCamera::new("B")],
        "B",
        stall,
    ));
    let mut registry = CameraRegistry::new(driver).with_calibration_iterations(5);
    for profile in &profiles()[..2] {
        registry.prepare(profile).expect("camera should start streaming");
    }
    registry
}

/// A frame that arrives after its pull gave up is not taken for the next
/// event's frame.
#[test]
fn test_late_frame_not_carried_into_next_event() {
    let mut registry = stalling_rig(Duration::from_millis(20));
    let all = profiles();
    let pair = &all[..2];

    let mut first = CaptureSession::new(config(TriggerMode::Hardware));
    let set = first.request_capture(&mut registry, pair).unwrap();
    assert_eq!(set.status(), CorrelationStatus::Incomplete);
    assert_eq!(set.failures()["B"].kind(), ErrorKind::Timeout);
    assert!(registry.get("B").unwrap().is_streaming());

    let mut second = CaptureSession::new(config(TriggerMode::Hardware));
    let set = second.request_capture(&mut registry, pair).unwrap();
    assert_eq!(set.status(), CorrelationStatus::Matched);
    assert_eq!(set.frame("A").unwrap().frame_id, 1);
    assert_eq!(set.frame("B").unwrap().frame_id, 1);
}

/// A driver call that ignores its timeout does not hold the session past
/// its deadline, and the stuck camera is taken out of service.
#[test]
fn test_wedged_pull_bounded_by_deadline() {
    let mut registry = stalling_rig(Duration::from_secs(2));
    let all = profiles();
    let pair = &all[..2];

    let started = Instant::now();
    let mut session = CaptureSession::new(config(TriggerMode::Hardware));
    let set = session.request_capture(&mut registry, pair).unwrap();

    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert_eq!(set.status(), CorrelationStatus::Incomplete);
    assert_eq!(set.failures()["B"].kind(), ErrorKind::Timeout);
    assert!(set.frame("A").is_some());
    assert_eq!(registry.get("B").unwrap().state(), ConnectionState::Error);

    let mut next = CaptureSession::new(config(TriggerMode::Hardware));
    let err = next.request_capture(&mut registry, pair).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotReady);
    assert_eq!(err.serials, vec!["B".to_string()]);
}

/// The three-camera scenario at the default 1 ms tolerance: exposures at
/// 0.2, 0.5 and 0.9 ms match; moving the last camera to 1.4 ms flags the set.
#[test]
fn test_default_tolerance_three_camera_scenario() {
    let rig_at = |c_latency_us: u64| {
        let driver = Arc::new(SimulatedDriver::new(vec![
            SimulatedCamera::new("A").with_latency(Duration::from_micros(200)),
            SimulatedCamera::new("B").with_latency(Duration::from_micros(500)),
            SimulatedCamera::new("C").with_latency(Duration::from_micros(c_latency_us)),
        ]));
        let mut registry = CameraRegistry::new(driver);
        for profile in profiles() {
            registry.prepare(&profile).expect("camera should start streaming");
        }
        registry
    };
    let session_config = SessionConfig {
        trigger_mode: Some(TriggerMode::Hardware),
        ..SessionConfig::default()
    };
    assert_eq!(session_config.correlation.tolerance, Duration::from_millis(1));

    let mut registry = rig_at(900);
    let mut session = CaptureSession::new(session_config.clone());
    let set = session.request_capture(&mut registry, &profiles()).unwrap();
    assert_eq!(set.status(), CorrelationStatus::Matched, "skews {:?}", set.skews());
    assert!(set.skews()["A"] >= Duration::from_micros(200));
    assert!(set.skews()["C"] >= Duration::from_micros(900));
    assert!(set.skews()["A"] < set.skews()["B"]);
    assert!(set.skews()["B"] < set.skews()["C"]);

    let mut registry = rig_at(1_400);
    let mut session = CaptureSession::new(session_config);
    let set = session.request_capture(&mut registry, &profiles()).unwrap();
    assert_eq!(set.status(), CorrelationStatus::SkewExceeded, "skews {:?}", set.skews());
    assert_eq!(set.frames().len(), 3);
    assert!(set.skews()["C"] >= Duration::from_micros(1_400));
    assert!(set.skews()["A"] <= set.tolerance());
    assert!(set.skews()["B"] <= set.tolerance());
}
