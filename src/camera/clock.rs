//! Device clock calibration.
//!
//! Camera timestamps count nanoseconds from the device's own power-on, so
//! they are not comparable across cameras. Each handle estimates the offset
//! between its device clock and the host wall clock by latching the device
//! timer several times and keeping the median of `host - device`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default number of latch samples per calibration.
pub const DEFAULT_CALIBRATION_ITERATIONS: usize = 20;

/// Mapping from a device clock onto the host wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceClock {
    /// Host epoch nanoseconds minus device nanoseconds
    offset_ns: i128,
}

impl DeviceClock {
    pub fn from_offset_ns(offset_ns: i128) -> Self {
        Self { offset_ns }
    }

    pub fn offset_ns(&self) -> i128 {
        self.offset_ns
    }

    /// Host wall-clock time of a device timestamp.
    pub fn to_wall_clock(&self, device_ns: u64) -> SystemTime {
        let epoch_ns = device_ns as i128 + self.offset_ns;
        if epoch_ns >= 0 {
            UNIX_EPOCH + duration_from_ns(epoch_ns as u128)
        } else {
            UNIX_EPOCH
        }
    }

    /// Estimate the offset from `(host time, device latch)` samples.
    ///
    /// Returns `None` when no sample could be taken.
    pub fn estimate<E>(
        iterations: usize,
        mut sample: impl FnMut() -> Result<(SystemTime, u64), E>,
    ) -> Result<Option<Self>, E> {
        let mut offsets = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let (host, device_ns) = sample()?;
            offsets.push(epoch_ns(host) - device_ns as i128);
        }
        Ok(median(&mut offsets).map(Self::from_offset_ns))
    }
}

/// Nanoseconds since the Unix epoch (negative before it).
pub fn epoch_ns(t: SystemTime) -> i128 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}

/// Absolute distance between two wall-clock instants.
pub fn abs_diff(a: SystemTime, b: SystemTime) -> Duration {
    match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    }
}

fn duration_from_ns(ns: u128) -> Duration {
    let secs = (ns / 1_000_000_000) as u64;
    let nanos = (ns % 1_000_000_000) as u32;
    Duration::new(secs, nanos)
}

fn median(values: &mut [i128]) -> Option<i128> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2)
    } else {
        Some(values[mid])
    }
}
