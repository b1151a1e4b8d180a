//! Command line surface.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "laminar", version, about = "layered multi-protocol forwarding proxy")]
pub struct Args {
    /// Config file path.
    #[arg(short = 'c', long = "config", default_value = "laminar.toml", global = true)]
    pub config: String,

    /// Enable the admin API server (needs app.admin_pass in config).
    #[arg(long = "ea", global = true)]
    pub enable_admin: bool,

    /// Admin server path prefix, must start with '/'.
    #[arg(long = "spp", default_value = "/api", global = true)]
    pub admin_path_prefix: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start all configured listeners.
    Run,
    /// Validate the configuration and exit.
    Check,
}
