use std::path::PathBuf;

use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// fireward - provisions and tears down jailed Firecracker microVMs
#[derive(Debug, Parser)]
#[command(name = "fireward", author, about, version, styles=styles::styles())]
pub struct FirewardArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: FirewardSubcommand,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum FirewardSubcommand {
    /// Serve the HTTP API
    #[command(name = "serve")]
    Serve {
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop an instance without going through the server
    #[command(name = "stop")]
    Stop {
        /// Id of the instance
        #[arg(long)]
        id: String,

        /// Architecture of the host running the instance
        #[arg(long, default_value = std::env::consts::ARCH)]
        arch: String,

        /// Pid of the hypervisor, required on aarch64
        #[arg(long)]
        pid: Option<u32>,

        /// Overrides the configured chroot base directory
        #[arg(long)]
        chroot_base: Option<PathBuf>,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
