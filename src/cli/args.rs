//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::enums::TriggerArg;

/// Synchronized capture from several industrial cameras
#[derive(Parser, Debug)]
#[command(name = "multicam")]
#[command(version, about = "Synchronized multi-camera capture", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file path
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List reachable cameras by serial
    ListCameras,
    /// Capture one or more correlated events and save them
    Capture(CaptureArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct CaptureArgs {
    /// Number of events to capture
    #[arg(long, short = 'n', default_value = "1")]
    pub count: u32,

    /// Delay between events in milliseconds
    #[arg(long, default_value = "0")]
    pub delay_ms: u64,

    /// Counter value of the first event
    #[arg(long, default_value = "0")]
    pub counter: u64,

    /// Output directory (default: output.directory from config)
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    /// Trigger mode (default: hardware for more than one camera)
    #[arg(long)]
    pub trigger: Option<TriggerArg>,

    /// Skew tolerance in microseconds
    #[arg(long)]
    pub tolerance_us: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Create default config file
    Init,
}
