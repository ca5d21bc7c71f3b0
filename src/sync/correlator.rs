//! Pulling one frame per camera and deciding whether they belong together.
//!
//! After a trigger fires, every handle is drained on its own worker thread
//! with an independent timeout. The supervisor waits on a channel with one
//! overall deadline and assembles whatever arrived into a [`CorrelatedSet`].
//! Cameras that did not deliver are listed with the reason. A worker still
//! blocked in the driver at the deadline is abandoned and its handle is taken
//! out of service.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use super::trigger::FireEvent;
use crate::camera::{abs_diff, CameraError, DeviceHandle, DriverError, Frame};

/// Extra time the supervisor waits beyond the longest pull budget.
const WORKER_GRACE: Duration = Duration::from_millis(50);

/// How frame ids take part in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameIdPolicy {
    /// All frame ids must be identical (shared hardware counter).
    Equal,
    /// Frame ids may differ by at most `max_frame_id_gap`.
    Adjacent,
    /// Ids are independent per device; only timestamps are compared.
    #[default]
    TimestampOnly,
}

/// Matching rules for one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationPolicy {
    /// Largest accepted distance between a frame's exposure start and the fire
    /// instant
    pub tolerance: Duration,
    pub frame_ids: FrameIdPolicy,
    pub max_frame_id_gap: u64,
}

impl Default for CorrelationPolicy {
    fn default() -> Self {
        Self {
            tolerance: Duration::from_millis(1),
            frame_ids: FrameIdPolicy::default(),
            max_frame_id_gap: 1,
        }
    }
}

impl CorrelationPolicy {
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Whether the frame ids satisfy the configured policy.
    pub fn frame_ids_consistent<'a>(&self, frames: impl IntoIterator<Item = &'a Frame>) -> bool {
        let ids: Vec<u64> = frames.into_iter().map(|f| f.frame_id).collect();
        let (Some(min), Some(max)) = (ids.iter().min(), ids.iter().max()) else {
            return true;
        };
        match self.frame_ids {
            FrameIdPolicy::Equal => min == max,
            FrameIdPolicy::Adjacent => max - min <= self.max_frame_id_gap,
            FrameIdPolicy::TimestampOnly => true,
        }
    }
}

/// Per-camera pull budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    /// Multiple of the frame period
    pub factor: f64,
    pub floor: Duration,
    /// Used when a camera has no frame rate configured
    pub fallback: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            factor: 2.0,
            floor: Duration::from_millis(100),
            fallback: Duration::from_millis(1000),
        }
    }
}

impl TimeoutPolicy {
    pub fn for_frame_rate(&self, frame_rate: Option<f64>) -> Duration {
        let Some(rate) = frame_rate.filter(|r| r.is_finite() && *r > 0.0) else {
            return self.fallback;
        };
        let scaled = self.factor / rate;
        if !scaled.is_finite() || scaled <= 0.0 {
            return self.fallback;
        }
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.fallback)
            .max(self.floor)
    }
}

/// Outcome of one correlated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationStatus {
    /// Every camera delivered, within tolerance and frame-id policy
    Matched,
    /// Every camera delivered but the set is outside tolerance or id policy
    SkewExceeded,
    /// At least one camera did not deliver
    Incomplete,
}

impl fmt::Display for CorrelationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationStatus::Matched => write!(f, "matched"),
            CorrelationStatus::SkewExceeded => write!(f, "skew-exceeded"),
            CorrelationStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// One frame per camera believed to show the same trigger event.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedSet {
    frames: BTreeMap<String, Frame>,
    failures: BTreeMap<String, CameraError>,
    skews: BTreeMap<String, Duration>,
    max_timestamp_skew: Duration,
    tolerance: Duration,
    status: CorrelationStatus,
    fired_at: SystemTime,
    frame_ids_consistent: bool,
}

impl CorrelatedSet {
    pub fn frames(&self) -> &BTreeMap<String, Frame> {
        &self.frames
    }

    pub fn frame(&self, serial: &str) -> Option<&Frame> {
        self.frames.get(serial)
    }

    /// Cameras that did not deliver, with the reason.
    pub fn failures(&self) -> &BTreeMap<String, CameraError> {
        &self.failures
    }

    /// Distance of each delivered frame from the fire instant.
    pub fn skews(&self) -> &BTreeMap<String, Duration> {
        &self.skews
    }

    pub fn max_timestamp_skew(&self) -> Duration {
        self.max_timestamp_skew
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub fn status(&self) -> CorrelationStatus {
        self.status
    }

    pub fn fired_at(&self) -> SystemTime {
        self.fired_at
    }

    pub fn frame_ids_consistent(&self) -> bool {
        self.frame_ids_consistent
    }

    pub fn is_matched(&self) -> bool {
        self.status == CorrelationStatus::Matched
    }
}

/// Result of one camera's pull for an event.
#[derive(Debug, Clone)]
pub struct Pull {
    pub serial: String,
    pub result: Result<Frame, CameraError>,
    /// Configured trigger-to-exposure delay of the camera
    pub trigger_delay: Duration,
}

/// Build the set for one event from the per-camera pulls.
///
/// A frame's skew is the distance between its exposure start (capture time
/// minus the camera's trigger delay) and the fire instant. A skew equal to
/// the tolerance still matches. Cameras in `expected` without a pull are
/// reported as timed out.
pub fn assemble(
    expected: &[String],
    pulls: Vec<Pull>,
    fired_at: SystemTime,
    policy: &CorrelationPolicy,
) -> CorrelatedSet {
    let mut frames = BTreeMap::new();
    let mut failures = BTreeMap::new();
    let mut skews = BTreeMap::new();

    for pull in pulls {
        match pull.result {
            Ok(frame) => {
                let exposed_at = frame
                    .captured_at
                    .checked_sub(pull.trigger_delay)
                    .unwrap_or(frame.captured_at);
                skews.insert(pull.serial.clone(), abs_diff(exposed_at, fired_at));
                frames.insert(pull.serial, frame);
            }
            Err(e) => {
                failures.insert(pull.serial, e);
            }
        }
    }

    for serial in expected {
        if !frames.contains_key(serial) && !failures.contains_key(serial) {
            failures.insert(
                serial.clone(),
                CameraError::Timeout {
                    serial: serial.clone(),
                    timeout: Duration::ZERO,
                },
            );
        }
    }

    let max_timestamp_skew = skews.values().copied().max().unwrap_or(Duration::ZERO);
    let frame_ids_consistent = policy.frame_ids_consistent(frames.values());
    let status = if !failures.is_empty() {
        CorrelationStatus::Incomplete
    } else if max_timestamp_skew <= policy.tolerance && frame_ids_consistent {
        CorrelationStatus::Matched
    } else {
        CorrelationStatus::SkewExceeded
    };

    CorrelatedSet {
        frames,
        failures,
        skews,
        max_timestamp_skew,
        tolerance: policy.tolerance,
        status,
        fired_at,
        frame_ids_consistent,
    }
}

/// Drains one frame per handle after a fire and correlates them.
#[derive(Debug, Clone, Default)]
pub struct FrameCorrelator {
    policy: CorrelationPolicy,
    timeouts: TimeoutPolicy,
}

impl FrameCorrelator {
    pub fn new(policy: CorrelationPolicy, timeouts: TimeoutPolicy) -> Self {
        Self { policy, timeouts }
    }

    pub fn policy(&self) -> &CorrelationPolicy {
        &self.policy
    }

    /// Pull timeout for `handle`, covering its trigger delay.
    pub fn pull_timeout(&self, handle: &DeviceHandle) -> Duration {
        self.timeouts
            .for_frame_rate(handle.frame_rate())
            .saturating_add(handle.trigger_delay())
    }

    /// Pull exactly one frame from every handle and assemble the set.
    ///
    /// Never retries. Cameras whose trigger misfired are not pulled and are
    /// reported with the trigger error. Returns once every worker reported or
    /// the longest pull budget plus a short grace has passed.
    pub fn collect(&self, handles: &mut [&mut DeviceHandle], event: &FireEvent) -> CorrelatedSet {
        let expected: Vec<String> = handles.iter().map(|h| h.serial().to_string()).collect();
        let mut pulls = Vec::with_capacity(handles.len());
        // Index into `handles` and pull timeout of every running worker
        let mut pending: BTreeMap<usize, Duration> = BTreeMap::new();
        let mut budget = Duration::ZERO;
        let (tx, rx) = mpsc::channel::<(usize, Result<Frame, DriverError>)>();

        for (index, handle) in handles.iter().enumerate() {
            let serial = handle.serial().to_string();
            let trigger_delay = handle.trigger_delay();
            if let Some(err) = event.misfired.get(&serial) {
                pulls.push(Pull {
                    serial,
                    result: Err(err.clone()),
                    trigger_delay,
                });
                continue;
            }

            let source = match handle.frame_source() {
                Ok(source) => source,
                Err(e) => {
                    pulls.push(Pull {
                        serial,
                        result: Err(e),
                        trigger_delay,
                    });
                    continue;
                }
            };
            let timeout = self.pull_timeout(handle);
            let tx = tx.clone();
            thread::spawn(move || {
                let result = source.next_frame(timeout);
                // The supervisor may have stopped listening
                let _ = tx.send((index, result));
            });
            budget = budget.max(timeout);
            pending.insert(index, timeout);
        }
        drop(tx);

        let started = Instant::now();
        let wait = budget.saturating_add(WORKER_GRACE);
        while !pending.is_empty() {
            let remaining = wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((index, result)) => {
                    let Some(timeout) = pending.remove(&index) else {
                        continue;
                    };
                    let handle = &mut handles[index];
                    let result = handle.settle_pull(result, timeout);
                    if let Err(e) = &result {
                        log::warn!("{} - no frame: {}", handle.serial(), e);
                    }
                    pulls.push(Pull {
                        serial: handle.serial().to_string(),
                        result,
                        trigger_delay: handle.trigger_delay(),
                    });
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        if !pending.is_empty() {
            log::warn!("frame collection deadline reached after {:?}", wait);
        }
        for (index, timeout) in pending {
            let handle = &mut handles[index];
            let result = Err(handle.mark_stalled(timeout));
            pulls.push(Pull {
                serial: handle.serial().to_string(),
                result,
                trigger_delay: handle.trigger_delay(),
            });
        }

        let set = assemble(&expected, pulls, event.issued_at, &self.policy);
        match set.status() {
            CorrelationStatus::Matched => log::info!(
                "correlated {} frame(s), max skew {:?}",
                set.frames().len(),
                set.max_timestamp_skew()
            ),
            CorrelationStatus::SkewExceeded => log::warn!(
                "skew {:?} exceeds tolerance {:?} (frame ids consistent: {})",
                set.max_timestamp_skew(),
                set.tolerance(),
                set.frame_ids_consistent()
            ),
            CorrelationStatus::Incomplete => log::warn!(
                "incomplete set: missing {}",
                set.failures().keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ErrorKind;
    use std::time::UNIX_EPOCH;

    fn fired_at() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn frame(serial: &str, frame_id: u64, offset_us: i64) -> Frame {
        let at = if offset_us >= 0 {
            fired_at() + Duration::from_micros(offset_us as u64)
        } else {
            fired_at() - Duration::from_micros(offset_us.unsigned_abs())
        };
        Frame {
            source_serial: serial.to_string(),
            frame_id,
            device_timestamp: 0,
            captured_at: at,
            width: 2,
            height: 2,
            bits_per_pixel: 8,
            payload: vec![0; 4],
        }
    }

    fn ok(serial: &str, offset_us: i64) -> Pull {
        Pull {
            serial: serial.to_string(),
            result: Ok(frame(serial, 0, offset_us)),
            trigger_delay: Duration::ZERO,
        }
    }

    fn abc() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    fn policy() -> CorrelationPolicy {
        CorrelationPolicy::default()
    }

    #[test]
    fn test_all_within_tolerance_is_matched() {
        let pulls = vec![ok("A", 200), ok("B", 500), ok("C", 900)];
        let set = assemble(&abc(), pulls, fired_at(), &policy());
        assert_eq!(set.status(), CorrelationStatus::Matched);
        assert_eq!(set.frames().len(), 3);
        assert_eq!(set.max_timestamp_skew(), Duration::from_micros(900));
    }

    #[test]
    fn test_late_frame_is_skew_exceeded_but_kept() {
        let pulls = vec![ok("A", 200), ok("B", 500), ok("C", 1_400)];
        let set = assemble(&abc(), pulls, fired_at(), &policy());
        assert_eq!(set.status(), CorrelationStatus::SkewExceeded);
        assert_eq!(set.frames().len(), 3);
        assert_eq!(set.max_timestamp_skew(), Duration::from_micros(1_400));
    }

    #[test]
    fn test_missing_camera_is_incomplete() {
        let pulls = vec![
            ok("A", 200),
            ok("B", 500),
            Pull {
                serial: "C".to_string(),
                result: Err(CameraError::Timeout {
                    serial: "C".to_string(),
                    timeout: Duration::from_millis(100),
                }),
                trigger_delay: Duration::ZERO,
            },
        ];
        let set = assemble(&abc(), pulls, fired_at(), &policy());
        assert_eq!(set.status(), CorrelationStatus::Incomplete);
        assert_eq!(set.frames().keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(set.failures()["C"].kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_absent_pull_reported_as_timeout() {
        let set = assemble(&abc(), vec![ok("A", 0), ok("B", 0)], fired_at(), &policy());
        assert_eq!(set.status(), CorrelationStatus::Incomplete);
        assert_eq!(set.failures()["C"].kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_skew_at_tolerance_boundary() {
        let tolerance = Duration::from_millis(1);
        let exact = assemble(&abc()[..1], vec![ok("A", 1_000)], fired_at(), &policy());
        assert_eq!(exact.max_timestamp_skew(), tolerance);
        assert_eq!(exact.status(), CorrelationStatus::Matched);

        let mut late = frame("A", 0, 1_000);
        late.captured_at += Duration::from_nanos(1);
        let pull = Pull {
            serial: "A".to_string(),
            result: Ok(late),
            trigger_delay: Duration::ZERO,
        };
        let over = assemble(&abc()[..1], vec![pull], fired_at(), &policy());
        assert_eq!(over.status(), CorrelationStatus::SkewExceeded);
    }

    #[test]
    fn test_frame_before_fire_counts_by_distance() {
        let set = assemble(&abc()[..1], vec![ok("A", -300)], fired_at(), &policy());
        assert_eq!(set.max_timestamp_skew(), Duration::from_micros(300));
        assert!(set.is_matched());
    }

    #[test]
    fn test_trigger_delay_is_subtracted() {
        let pull = Pull {
            serial: "A".to_string(),
            result: Ok(frame("A", 0, 5_300)),
            trigger_delay: Duration::from_millis(5),
        };
        let set = assemble(&abc()[..1], vec![pull], fired_at(), &policy());
        assert_eq!(set.skews()["A"], Duration::from_micros(300));
        assert!(set.is_matched());
    }

    #[test]
    fn test_frame_id_policies() {
        let ids = |a, b| {
            vec![
                Pull {
                    serial: "A".to_string(),
                    result: Ok(frame("A", a, 100)),
                    trigger_delay: Duration::ZERO,
                },
                Pull {
                    serial: "B".to_string(),
                    result: Ok(frame("B", b, 100)),
                    trigger_delay: Duration::ZERO,
                },
            ]
        };
        let all = abc();
        let serials = &all[..2];

        let equal = CorrelationPolicy {
            frame_ids: FrameIdPolicy::Equal,
            ..policy()
        };
        assert!(assemble(serials, ids(7, 7), fired_at(), &equal).is_matched());
        let set = assemble(serials, ids(7, 8), fired_at(), &equal);
        assert_eq!(set.status(), CorrelationStatus::SkewExceeded);
        assert!(!set.frame_ids_consistent());

        let adjacent = CorrelationPolicy {
            frame_ids: FrameIdPolicy::Adjacent,
            ..policy()
        };
        assert!(assemble(serials, ids(7, 8), fired_at(), &adjacent).is_matched());
        assert!(!assemble(serials, ids(7, 9), fired_at(), &adjacent).is_matched());

        assert!(assemble(serials, ids(0, 1_000), fired_at(), &policy()).is_matched());
    }

    #[test]
    fn test_timeout_from_frame_rate() {
        let timeouts = TimeoutPolicy::default();
        assert_eq!(timeouts.for_frame_rate(Some(10.0)), Duration::from_millis(200));
        // 2 / 120 fps is below the floor
        assert_eq!(timeouts.for_frame_rate(Some(120.0)), Duration::from_millis(100));
        assert_eq!(timeouts.for_frame_rate(None), Duration::from_millis(1000));
        assert_eq!(timeouts.for_frame_rate(Some(0.0)), Duration::from_millis(1000));
    }

    #[test]
    fn test_oversized_timeout_factor_falls_back() {
        let timeouts = TimeoutPolicy {
            factor: 1e300,
            ..TimeoutPolicy::default()
        };
        assert_eq!(timeouts.for_frame_rate(Some(30.0)), Duration::from_millis(1000));

        let huge_floor = TimeoutPolicy {
            floor: Duration::MAX,
            ..TimeoutPolicy::default()
        };
        assert_eq!(huge_floor.for_frame_rate(Some(30.0)), Duration::MAX);
    }

    #[test]
    fn test_frame_id_policy_serde_names() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            policy: FrameIdPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"timestamp-only\"").unwrap();
        assert_eq!(w.policy, FrameIdPolicy::TimestampOnly);
        let w: Wrapper = toml::from_str("policy = \"adjacent\"").unwrap();
        assert_eq!(w.policy, FrameIdPolicy::Adjacent);
    }
}
