//! CLI enum types for trigger selection.

use clap::ValueEnum;

use crate::sync::TriggerMode;

/// Trigger mode override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TriggerArg {
    Hardware,
    Software,
}

impl From<TriggerArg> for TriggerMode {
    fn from(t: TriggerArg) -> Self {
        match t {
            TriggerArg::Hardware => TriggerMode::Hardware,
            TriggerArg::Software => TriggerMode::Software,
        }
    }
}
