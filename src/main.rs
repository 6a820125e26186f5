use std::{path::PathBuf, process};

use clap::Parser;
use nsbridge_lib::settings::{Overrides, SettingsStore};

/// Exit code for anything that stops a session from starting.
const STARTUP_FAILURE: i32 = 2;

/// Mirrors a Nightscout site onto an OpenAPS rig over its websocket.
#[derive(Debug, Parser)]
#[command(name = "nsbridge", version, about)]
struct Cli {
    /// Nightscout base URL
    #[arg(long, env = "NIGHTSCOUT_HOST")]
    host: Option<String>,

    /// API secret sent with the authorize request
    #[arg(long, env = "API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,

    /// OpenAPS working directory (tools run and artifacts land here)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// JSON settings file
    #[arg(long, env = "NSBRIDGE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Device id this rig answers bolus requests for
    #[arg(long)]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() {
    // Reads RUST_LOG, defaulting to info
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = match SettingsStore::open(cli.settings) {
        Ok(store) => store,
        Err(err) => {
            log::error!("{err:#}");
            process::exit(STARTUP_FAILURE);
        }
    };
    if let Some(path) = store.path() {
        log::debug!("settings from {}", path.display());
    }
    store.apply(Overrides {
        host: cli.host,
        api_secret: cli.api_secret,
        device_id: cli.device_id,
        workdir: cli.workdir,
    });

    match nsbridge_lib::run(store.settings()).await {
        Ok(exit) => process::exit(exit.exit_code()),
        Err(err) => {
            log::error!("could not start: {err:#}");
            process::exit(STARTUP_FAILURE);
        }
    }
}
