//! Reframe CLI: inspect, remux and fast-start MPEG-4 files.
//!
//! Usage:
//!   reframe inspect <PATH>        Show the box layout and tracks of a file
//!   reframe faststart <INPUT>     Move the movie header ahead of the media data
//!   reframe remux [OPTIONS]       Merge elementary video/audio files
//!   reframe presets               List codec presets and fragment effects
//!   reframe config                Print the effective engine configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "reframe",
    about = "Media transcoding engine tools",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the box layout and tracks of an MP4 file
    Inspect {
        /// Path to the MP4 file
        path: PathBuf,

        /// Also print every box inside moov
        #[arg(long)]
        tree: bool,

        /// Print track formats as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite an MP4 so playback can start before the download finishes
    Faststart {
        /// Input MP4 file
        input: PathBuf,

        /// Output file (default: <input>.faststart.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the rewrite report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Merge elementary video and audio files into one container
    Remux {
        /// Elementary video file
        #[arg(long)]
        video: Option<PathBuf>,

        /// Elementary audio file
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Output container: mp4|webm
        #[arg(long, default_value = "mp4")]
        container: String,

        /// Skip the fast-start rewrite of MP4 output
        #[arg(long)]
        no_fast_start: bool,
    },

    /// List codec presets and fragment effects
    Presets,

    /// Print the effective engine configuration
    Config {
        /// Write the defaults to the config file if none exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    reframe_common::logging::init_logging(&reframe_common::config::LoggingConfig {
        level: log_level.to_string(),
        json: false,
        file: None,
    });

    match cli.command {
        Commands::Inspect { path, tree, json } => commands::inspect::run(path, tree, json),
        Commands::Faststart {
            input,
            output,
            json,
        } => commands::faststart::run(input, output, json),
        Commands::Remux {
            video,
            audio,
            output,
            container,
            no_fast_start,
        } => commands::remux::run(video, audio, output, container, !no_fast_start),
        Commands::Presets => commands::presets::run(),
        Commands::Config { init } => commands::config::run(init),
    }
}
