//! Command-line interface for metasys.
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

/// Command-line interface for metasys.
#[derive(Parser, Debug)]
#[command(name = "metasys", version, author)]
#[command(about = "A staged process supervisor with bounded-rate restarts", long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    pub config: Option<PathBuf>,

    /// Increase logging verbosity (repeatable).
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Shut down the running instance found via its pid file.
    #[arg(short = 's', long = "shutdown")]
    pub shutdown: bool,

    /// Same as -s.
    #[arg(short = 'k', hide = true)]
    pub kill: bool,

    /// Print a commented example configuration and exit.
    #[arg(short = 'C', long = "example-config")]
    pub example_config: bool,

    /// Detach from the terminal and run in the background.
    #[arg(short = 'd', long)]
    pub daemonize: bool,
}

impl Cli {
    /// Log level selected by the verbosity count.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Whether `-s` or `-k` was given.
    pub fn wants_shutdown(&self) -> bool {
        self.shutdown || self.kill
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
