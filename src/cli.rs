use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version = concat!("Ver:", env!("CARGO_PKG_VERSION")))]
#[command(about = "Local endpoint health-monitoring engine")]
pub struct Cli {
    /// Workspace directory for state, locks, and shared snapshots
    #[arg(short = 'w', long = "workspace", default_value = ".vigil")]
    pub workspace: PathBuf,

    /// Monitoring configuration file (TOML)
    #[arg(short = 'c', long = "config", default_value = "vigil.toml")]
    pub config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long = "check-config")]
    pub check_config: bool,

    /// Log filter, e.g. "info" or "vigil=debug"
    #[arg(long = "log", default_value = "info")]
    pub log: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
