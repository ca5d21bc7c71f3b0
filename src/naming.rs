//! File names for exported frames.
//!
//! `SERIAL_<serial>_DATETIME_<date-time>_CAM_<index>_FRAMEID_<id>_COUNTER_<n>.<ext>`
//! where the date-time is local time as `YYYY-MM-DD-HH:MM:SS-ffffff`.

use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime};

const DATETIME_FORMAT: &str = "%Y-%m-%d-%H:%M:%S-%6f";

/// Fields that make up one frame's file name.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameName<'a> {
    pub serial: &'a str,
    pub captured_at: SystemTime,
    /// 1-based position of the camera in the configured rig
    pub camera_index: usize,
    pub frame_id: u64,
    pub counter: u64,
    pub extension: &'a str,
}

impl FrameName<'_> {
    pub fn file_name(&self) -> String {
        let local: DateTime<Local> = DateTime::from(self.captured_at);
        format_file_name(
            self.serial,
            &format_datetime(&local.naive_local()),
            self.camera_index,
            self.frame_id,
            self.counter,
            self.extension,
        )
    }
}

/// Date-time component of a frame file name.
pub fn format_datetime(at: &NaiveDateTime) -> String {
    at.format(DATETIME_FORMAT).to_string()
}

fn format_file_name(
    serial: &str,
    datetime: &str,
    camera_index: usize,
    frame_id: u64,
    counter: u64,
    extension: &str,
) -> String {
    format!(
        "SERIAL_{}_DATETIME_{}_CAM_{}_FRAMEID_{}_COUNTER_{}.{}",
        serial,
        datetime,
        camera_index,
        frame_id,
        counter,
        extension.trim_start_matches('.')
    )
}

/// Name of the metadata file written next to an event's frames.
pub fn sidecar_file_name(counter: u64) -> String {
    format!("COUNTER_{}.json", counter)
}
