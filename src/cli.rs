//! CLI arguments for the node bootstrapper

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// argonode - multi-protocol proxy node bootstrapper
#[derive(Parser, Debug)]
#[command(name = "argonode")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (default)
    Run,

    /// Print the effective settings and exit
    ShowConfig,
}
