// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "Zero-downtime blue/green deployment of compose services to remote hosts")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy the compose project to the given hosts
    Deploy {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Version tag to deploy (default: current git revision)
        #[arg(long)]
        tag: Option<String>,
    },

    /// Roll hosts back to their recorded deployment (lock-gated)
    Rollback {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Restrict the rollback to one service
        #[arg(long)]
        service: Option<String>,
    },

    /// Show the deployment state recorded on a host
    Status {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Print the state as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
pub struct ConnectionArgs {
    /// Target host (repeatable)
    #[arg(long = "host", required = true)]
    pub hosts: Vec<String>,

    /// Path to the compose file
    #[arg(short = 'f', long, default_value = "docker-compose.yml")]
    pub file: PathBuf,

    /// SSH user
    #[arg(long, default_value = "root")]
    pub ssh_user: String,

    /// SSH port
    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,

    /// SSH private key file (default: agent, then ~/.ssh keys,
    /// then the STEVEDORE_SSH_KEY environment variable)
    #[arg(short = 'i', long)]
    pub identity_file: Option<PathBuf>,

    /// Accept unknown host keys (trust on first use)
    #[arg(long)]
    pub trust_host: bool,

    /// Remote directory for staged files and the state ledger
    #[arg(long, default_value = ".stevedore")]
    pub remote_dir: String,

    /// Remote directory holding the proxy's dynamic configuration
    #[arg(long, default_value = "traefik/dynamic")]
    pub proxy_dir: String,

    /// Image registry URL (credentials via REGISTRY_USERNAME / REGISTRY_PASSWORD)
    #[arg(long)]
    pub registry: Option<String>,
}
