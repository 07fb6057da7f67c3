use clap::Parser as ClapParser;
use std::path::PathBuf;

#[derive(ClapParser, Debug)]
#[command(
    author,
    version,
    about = "Session analyzer - one analysis worker per editing session",
    long_about = "Reads commands from stdin (start, stop, lookup, status, logs, quit) and \
                  keeps at most one out-of-process analysis worker alive per session."
)]
pub struct Args {
    /// Path to a TOML config file (defaults to <config dir>/session-analyzer/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}
