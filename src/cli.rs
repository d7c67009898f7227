use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "shellcache",
    about = "Offline-first caching worker for a web app shell"
)]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./shellcache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Walk a build directory and write a precache manifest with content revisions.
    GenerateManifest {
        /// Directory containing the built application shell.
        dir: PathBuf,
        /// Output path for the manifest JSON.
        #[arg(long, default_value = "precache-manifest.json")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
