use clap::Parser;

/// Command line arguments for the studio-sync service.
#[derive(Debug, Parser)]
#[command(name = "studio-sync", version, about = "Back-office synchronization engine")]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<String>,
}
