//! Command line argument definitions

use std::path::PathBuf;

use clap::Parser;

/// Drive a [`nat64session::Engine`] from a config file and walk through a
/// small scripted demonstration of its packet-path API.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the config file
    pub config_file: PathBuf,

    /// Enable verbose logging
    #[clap(short, long)]
    pub verbose: bool,
}
