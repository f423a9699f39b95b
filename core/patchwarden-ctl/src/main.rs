//! patchwarden: inspect and edit persisted patch settings.
//!
//! Works on the settings file a host writes, so patch state can be changed
//! while the host is not running. Changes take effect on the host's next
//! startup replay.
//!
//! ## Subcommands
//!
//! - `status`: debug flag and every persisted patch
//! - `enable` / `disable`: set one patch's persisted flag
//! - `debug-log`: toggle the global debug-log flag
//! - `clear`: the "Clear Settings Cache" host command
//! - `disable-all`: mark every persisted patch inactive

mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use patchwarden_core::{load_config, FileSettings, PatchError};

#[derive(Parser)]
#[command(name = "patchwarden")]
#[command(about = "Persisted patch settings for patchwarden hosts")]
#[command(version)]
struct Cli {
    /// Settings file to operate on (defaults to the storage root's settings.json)
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Configuration file (defaults to the storage root's patchwarden.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the debug flag and every persisted patch
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Mark a patch active for the next host start
    Enable {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Mark a patch inactive for the next host start
    Disable {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Turn the global debug log on or off
    DebugLog {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Remove every persisted patch flag
    Clear {
        /// Leave the debug-log flag untouched
        #[arg(long)]
        keep_debug_log: bool,
    },

    /// Mark every persisted patch inactive
    DisableAll,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn open_settings(cli: &Cli) -> Result<FileSettings, PatchError> {
    let path = match &cli.settings {
        Some(path) => path.clone(),
        None => load_config(cli.config.clone())?
            .storage_paths()?
            .settings_file(),
    };
    tracing::debug!(path = %path.display(), "Using settings file");
    FileSettings::load(&path)
}

fn run(cli: &Cli) -> Result<(), PatchError> {
    let settings = open_settings(cli)?;
    let mut out = std::io::stdout().lock();

    match &cli.command {
        Commands::Status { json } => commands::status(&settings, *json, &mut out),
        Commands::Enable { id } => commands::set_active(&settings, id, true, &mut out),
        Commands::Disable { id } => commands::set_active(&settings, id, false, &mut out),
        Commands::DebugLog { state } => {
            commands::debug_log(&settings, matches!(state, Switch::On), &mut out)
        }
        Commands::Clear { keep_debug_log } => commands::clear(&settings, !keep_debug_log, &mut out),
        Commands::DisableAll => commands::disable_all(&settings, &mut out),
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        tracing::error!(error = %e, "patchwarden command failed");
        std::process::exit(1);
    }
}
