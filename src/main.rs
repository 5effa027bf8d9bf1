//! peerlink node
//!
//! Command-line entry point: runs the protocol servers, checks a
//! configuration or lists the address book.

use clap::{Parser, Subcommand};
use peerlink::cli::{self, Overrides};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer connection server with DDOS admission control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "peerlink.toml")]
    config: PathBuf,

    /// Data directory for the address book and markers
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Client mode: dial out but never serve
    #[arg(long)]
    client: bool,

    /// Open (true) or skip (false) listeners on every server
    #[arg(long)]
    listen: Option<bool>,

    /// Worker threads per server
    #[arg(short, long)]
    threads: Option<usize>,

    /// Peer to keep connected (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Accept loopback and private peer addresses
    #[arg(long)]
    allow_local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Run,

    /// Show which servers the configuration starts
    CheckConfig,

    /// List known peers
    Peers {
        /// How many to show
        #[arg(short = 'n', long, default_value = "50")]
        count: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let overrides = Overrides {
        data_dir: cli.data_dir,
        client: cli.client,
        listen: cli.listen,
        threads: cli.threads,
        connect: cli.connect,
        allow_local: cli.allow_local,
    };
    let config = cli::load_config(&cli.config, &overrides)?;

    match cli.command {
        Commands::CheckConfig => cli::cmd_check_config(&config),

        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_run(config))
        }

        Commands::Peers { count } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_peers(&config, count))
        }
    }
}
