//! Command-line interface definitions and helpers.
//!
//! This module contains all CLI argument parsing, enums, and subcommand handlers.

mod args;
mod commands;
mod enums;

pub use args::{Args, CaptureArgs, Command, ConfigAction};
pub use commands::{
    backend, capture, handle_config_action, list_cameras, setup_ctrlc_handler, CliError,
};
pub use enums::TriggerArg;
