use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod backend;
mod cancel;
mod config;
mod constants;
mod error;
mod ffmpeg;
mod info;
mod layout;
mod library;
mod mpv;
mod orchestrator;
mod preprocess;
mod state;
mod transition;

use crate::config::{ConfigFile, ConfigSource};
use crate::info::InfoScreen;
use crate::library::LocalLibrary;
use crate::mpv::MpvOptions;
use crate::orchestrator::Orchestrator;
use crate::state::StateStore;

#[derive(Parser, Debug)]
#[command(name = "signage", version, about = "Slideshow and video signage player")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play in the foreground until SIGINT or SIGTERM
    Run {
        #[arg(short, long, env = "SIGNAGE_CONFIG", default_value = "/etc/signage/config.toml")]
        config: PathBuf,

        #[arg(short, long, env = "SIGNAGE_STATE", default_value = "/var/lib/signage/state.json")]
        state: PathBuf,

        /// Start with the info screen forced on
        #[arg(long)]
        info: bool,

        /// mpv executable used for persistent players
        #[arg(long, env = "SIGNAGE_MPV", default_value = "mpv")]
        mpv: String,
    },
    /// Print the current playback state as JSON
    Status {
        #[arg(short, long, env = "SIGNAGE_STATE", default_value = "/var/lib/signage/state.json")]
        state: PathBuf,
    },
    /// Render the info screen once
    RenderInfo {
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, env = "SIGNAGE_CONFIG", default_value = "/etc/signage/config.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Run { config, state, info, mpv } => run(config, state, info, mpv),
        Command::Status { state: path } => {
            let record = state::read_record(&path);
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::RenderInfo { output, config } => {
            let config = ConfigFile::open(&config)
                .with_context(|| format!("loading {}", config.display()))?
                .snapshot();
            let screen = InfoScreen::new(output);
            let path = screen.render(&info::hostname(), &info::ip_addresses(), false, &info::details(&config))?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn run(config: PathBuf, state: PathBuf, info_on_start: bool, mpv: String) -> Result<()> {
    let config = ConfigFile::open(&config).with_context(|| format!("loading {}", config.display()))?;
    if let Some(parent) = state.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    info!(state = %state.display(), "Starting signage player");

    let library = Arc::new(LocalLibrary);
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        library.clone(),
        library,
        Arc::new(StateStore::new(state)),
    )
    .with_mpv_options(MpvOptions { binary: mpv, ..MpvOptions::default() });

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGUSR1, SIGUSR2])
        .context("installing signal handlers")?;
    if info_on_start {
        orchestrator.set_info_override(true);
    }
    orchestrator.start();

    for signal in signals.forever() {
        match signal {
            SIGHUP => orchestrator.reload(),
            SIGUSR1 => orchestrator.set_info_override(true),
            SIGUSR2 => orchestrator.set_info_override(false),
            _ => {
                info!(signal, "Shutting down");
                break;
            }
        }
    }
    orchestrator.stop();
    Ok(())
}
