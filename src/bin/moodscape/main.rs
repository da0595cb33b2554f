//! moodscape - mood-driven ambient soundscapes in the terminal
//!
//! Run with: cargo run -- --mood calm
//! Bounce:   cargo run -- --render calm.wav --seconds 60 --mood calm

mod app;
mod ui;

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use color_eyre::eyre::{eyre, Result as EyreResult, WrapErr};
use moodscape::{EngineConfig, ModuleCatalog, MoodBook, OfflineSession};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "moodscape", version, about = "Generative ambient soundscapes driven by moods")]
struct Args {
    /// Mood book to load instead of the built-in one
    #[arg(long, value_name = "TOML")]
    moods: Option<PathBuf>,

    /// Engine configuration overrides
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Mood to start with; the first mood in the book otherwise
    #[arg(long)]
    mood: Option<String>,

    /// Render offline to this WAV file instead of playing live
    #[arg(long, value_name = "WAV")]
    render: Option<PathBuf>,

    /// Length of an offline render
    #[arg(long, default_value_t = 30.0)]
    seconds: f64,

    /// Sample rate of an offline render
    #[arg(long, default_value_t = 44_100)]
    sample_rate: u32,

    /// Log file used while the TUI owns the terminal
    #[arg(long, default_value = "moodscape.log")]
    log: PathBuf,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("moodscape=info"))
}

fn main() -> EyreResult<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path).wrap_err_with(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let book = match &args.moods {
        Some(path) => MoodBook::load(path).wrap_err_with(|| format!("loading {}", path.display()))?,
        None => MoodBook::builtin()?,
    };
    let moods = book.resolve(&ModuleCatalog::builtin())?;

    match &args.render {
        Some(path) => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();

            let mut session = OfflineSession::new(config, moods, args.sample_rate as f32);
            if !session.orchestrator_mut().set_playing(true, args.mood.as_deref()) {
                return Err(eyre!("could not start mood {:?}", args.mood));
            }
            let frames = session
                .bounce(args.seconds, path)
                .wrap_err_with(|| format!("writing {}", path.display()))?;
            println!("wrote {} frames to {}", frames, path.display());
            Ok(())
        }
        None => {
            let log = File::create(&args.log).wrap_err_with(|| format!("creating {}", args.log.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_ansi(false)
                .with_writer(Mutex::new(log))
                .init();

            app::run(config, moods, args.mood)
        }
    }
}
