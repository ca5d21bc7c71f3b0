//! Writing a correlated set to disk.
//!
//! Each frame's payload is written as-is under its [`FrameName`], and one
//! JSON sidecar per event records the correlation result so the files can be
//! grouped again later.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::camera::{CameraProfile, ErrorKind};
use crate::naming::{sidecar_file_name, FrameName};
use crate::sync::{CorrelatedSet, CorrelationStatus};

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    counter: u64,
    status: CorrelationStatus,
    fired_at: String,
    max_skew_us: f64,
    tolerance_us: f64,
    frame_ids_consistent: bool,
    frames: Vec<FrameRecord<'a>>,
    failures: BTreeMap<&'a str, FailureRecord>,
}

#[derive(Debug, Serialize)]
struct FrameRecord<'a> {
    serial: &'a str,
    camera_index: usize,
    file: String,
    frame_id: u64,
    device_timestamp_ns: u64,
    captured_at: String,
    skew_us: f64,
    width: u32,
    height: u32,
    bits_per_pixel: u8,
}

#[derive(Debug, Serialize)]
struct FailureRecord {
    kind: ErrorKind,
    message: String,
}

/// Write every frame of `set` plus its sidecar into `dir`.
///
/// Returns the written paths, frames first in serial order, sidecar last.
pub fn write_capture(
    dir: &Path,
    set: &CorrelatedSet,
    profiles: &[CameraProfile],
    counter: u64,
    extension: &str,
) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(set.frames().len() + 1);
    let mut frames = Vec::with_capacity(set.frames().len());
    for (serial, frame) in set.frames() {
        let camera_index = profiles
            .iter()
            .position(|p| &p.serial == serial)
            .map_or(0, |i| i + 1);
        let file = FrameName {
            serial,
            captured_at: frame.captured_at,
            camera_index,
            frame_id: frame.frame_id,
            counter,
            extension,
        }
        .file_name();

        let path = dir.join(&file);
        fs::write(&path, &frame.payload)?;
        log::debug!("wrote {}", path.display());
        written.push(path);

        frames.push(FrameRecord {
            serial,
            camera_index,
            file,
            frame_id: frame.frame_id,
            device_timestamp_ns: frame.device_timestamp,
            captured_at: rfc3339(frame.captured_at),
            skew_us: set
                .skews()
                .get(serial)
                .map_or(0.0, |d| d.as_secs_f64() * 1e6),
            width: frame.width,
            height: frame.height,
            bits_per_pixel: frame.bits_per_pixel,
        });
    }

    let failures = set
        .failures()
        .iter()
        .map(|(serial, err)| {
            (
                serial.as_str(),
                FailureRecord {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            )
        })
        .collect();

    let record = EventRecord {
        counter,
        status: set.status(),
        fired_at: rfc3339(set.fired_at()),
        max_skew_us: set.max_timestamp_skew().as_secs_f64() * 1e6,
        tolerance_us: set.tolerance().as_secs_f64() * 1e6,
        frame_ids_consistent: set.frame_ids_consistent(),
        frames,
        failures,
    };

    let sidecar = dir.join(sidecar_file_name(counter));
    let mut writer = BufWriter::new(File::create(&sidecar)?);
    serde_json::to_writer_pretty(&mut writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    written.push(sidecar);

    log::info!(
        "saved event {} ({}) to {}",
        counter,
        set.status(),
        dir.display()
    );
    Ok(written)
}

fn rfc3339(at: SystemTime) -> String {
    DateTime::<Local>::from(at).to_rfc3339()
}
