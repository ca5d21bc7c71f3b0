//! Subcommand handlers for list-cameras, capture and config actions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::args::{CaptureArgs, ConfigAction};
use crate::camera::{CameraDriver, CameraError, CameraRegistry, SessionError};
use crate::config::{self, Config, ConfigError};
use crate::export;
use crate::sim::SimulatedDriver;
use crate::sync::{capture_with_retry, CancelToken, CorrelatedSet};

/// Largest accepted lateness of a burst event before it is reported.
const DRIFT_WARNING: Duration = Duration::from_millis(1);

/// Errors surfaced to the user by a subcommand.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Failed to save capture: {0}")]
    Export(#[from] std::io::Error),
    #[error("No cameras configured. Add [[camera]] entries to {}", .0.display())]
    NoCameras(PathBuf),
}

/// Camera backend for this process.
///
/// The binary ships with the simulator; a vendor SDK binding plugs in here by
/// implementing [`CameraDriver`].
pub fn backend(config: &Config) -> Arc<dyn CameraDriver> {
    let cameras = config.simulated_cameras();
    log::info!("using simulated backend with {} camera(s)", cameras.len());
    Arc::new(SimulatedDriver::new(cameras))
}

/// Install a Ctrl+C handler that cancels pending capture requests.
pub fn setup_ctrlc_handler(cancel: CancelToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        cancel.cancel();
        eprintln!("\nReceived Ctrl+C, stopping after the current event...");
    })
}

/// List reachable cameras and print them to stdout.
pub fn list_cameras(driver: Arc<dyn CameraDriver>, config: &Config) -> Result<(), CliError> {
    let registry = CameraRegistry::new(driver);
    let serials = registry.discover()?;
    if serials.is_empty() {
        println!("No cameras found.");
        println!();
        println!("Make sure the cameras are connected and powered.");
        return Ok(());
    }

    println!("Available cameras:");
    for serial in &serials {
        match config.cameras.iter().find(|c| &c.serial == serial) {
            Some(profile) => println!("  {} ({})", serial, profile.role),
            None => println!("  {} (not configured)", serial),
        }
    }
    for profile in &config.cameras {
        if !serials.contains(&profile.serial) {
            println!("  {} (configured, not found)", profile.serial);
        }
    }
    Ok(())
}

/// Run a burst of capture events and save each one.
///
/// Returns the number of events saved.
pub fn capture(
    driver: Arc<dyn CameraDriver>,
    config: &Config,
    config_path: &Path,
    args: &CaptureArgs,
    cancel: &CancelToken,
) -> Result<u32, CliError> {
    let mut config = config.clone();
    if let Some(trigger) = args.trigger {
        config.session.trigger = Some(trigger.into());
    }
    if let Some(tolerance_us) = args.tolerance_us {
        config.session.tolerance_us = tolerance_us;
    }
    config.validate()?;
    if config.cameras.is_empty() {
        return Err(CliError::NoCameras(config_path.to_path_buf()));
    }

    let session = config.session_config();
    let mut registry = CameraRegistry::new(driver)
        .with_calibration_iterations(config.session.calibration_iterations)
        .with_command_timeout(session.command_timeout);
    for profile in &config.cameras {
        registry.prepare(profile)?;
    }
    recalibrate_clocks(&mut registry);

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| config.output.directory.clone());
    let delay = Duration::from_millis(args.delay_ms);

    let mut saved = 0;
    let start = Instant::now();
    for i in 0..args.count {
        if cancel.is_cancelled() {
            log::warn!("capture interrupted after {} event(s)", saved);
            break;
        }

        let scheduled = delay
            .checked_mul(i)
            .and_then(|offset| start.checked_add(offset))
            .unwrap_or(start);
        let now = Instant::now();
        if now < scheduled {
            thread::sleep(scheduled - now);
        } else if now - scheduled > DRIFT_WARNING {
            log::warn!(
                "event {} started {:?} late; lower the rate or the camera count",
                i,
                now - scheduled
            );
        }

        let counter = args.counter + u64::from(i);
        let set = match capture_with_retry(
            &mut registry,
            &config.cameras,
            &session,
            config.session.retries,
            cancel,
        ) {
            Ok(set) => set,
            Err(e) if e.source == CameraError::Cancelled => {
                log::warn!("capture interrupted after {} event(s)", saved);
                break;
            }
            Err(e) => return Err(e.into()),
        };

        print_summary(counter, &set);
        export::write_capture(&out, &set, &config.cameras, counter, &config.output.extension)?;
        saved += 1;
    }

    registry.release_all()?;
    Ok(saved)
}

/// Refresh every bound camera's clock offset before a burst.
///
/// A camera that cannot be recalibrated keeps its previous offset.
fn recalibrate_clocks(registry: &mut CameraRegistry) {
    for serial in registry.bound_serials() {
        let Some(handle) = registry.get_mut(&serial) else {
            continue;
        };
        match handle.recalibrate_clock() {
            Ok(()) => log::debug!(
                "{} - clock offset {} ns",
                serial,
                handle.clock().offset_ns()
            ),
            Err(e) => log::warn!("{} - clock recalibration failed: {}", serial, e),
        }
    }
}

fn print_summary(counter: u64, set: &CorrelatedSet) {
    println!(
        "COUNTER {}: {} ({} frame(s), max skew {:?})",
        counter,
        set.status(),
        set.frames().len(),
        set.max_timestamp_skew()
    );
    for (serial, err) in set.failures() {
        println!("  {}: {}", serial, err);
    }
}

/// Handle config subcommand actions.
pub fn handle_config_action(action: ConfigAction, config_path: &Path) -> Result<(), CliError> {
    match action {
        ConfigAction::Show => {
            let config = Config::load(Some(config_path))?;
            if config_path.exists() {
                println!("Config file: {} (exists)", config_path.display());
            } else {
                println!("Config file: {} (not found, showing defaults)", config_path.display());
            }
            println!();
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Init => {
            config::init(config_path)?;
            println!("Created config file: {}", config_path.display());
        }
    }
    Ok(())
}
