use clap::Parser;

use multicam_sync::cli::{self, Args, Command, CliError};
use multicam_sync::config::{self, Config};
use multicam_sync::sync::CancelToken;

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn run(args: Args) -> Result<(), CliError> {
    let config_path = args.config.clone().unwrap_or_else(config::default_path);

    match args.command {
        Command::Config { action } => cli::handle_config_action(action, &config_path),
        Command::ListCameras => {
            let config = Config::load(Some(config_path.as_path()))?;
            cli::list_cameras(cli::backend(&config), &config)
        }
        Command::Capture(capture) => {
            let config = Config::load(Some(config_path.as_path()))?;
            let cancel = CancelToken::new();
            if let Err(e) = cli::setup_ctrlc_handler(cancel.clone()) {
                log::warn!("Failed to set Ctrl+C handler: {}", e);
            }
            let saved = cli::capture(
                cli::backend(&config),
                &config,
                &config_path,
                &capture,
                &cancel,
            )?;
            log::info!("saved {} event(s)", saved);
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
