//! shepherdd: the Shepherd daemon.
//!
//! Runs the self-healing loop of the hosting platform: every interval it
//! probes each service pool, removes dead instances, and moves the
//! applications of a dead application host onto the least-loaded
//! survivors.
//!
//! # Usage
//!
//! ```text
//! shepherdd run --config /etc/shepherd/shepherd.toml
//! shepherdd register --config shepherd.toml --pool app --address 10.0.0.7:9000 --score 3
//! shepherdd instances --config shepherd.toml --pool app
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shepherd_core::ShepherdConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,shepherdd=debug,shepherd=debug";

#[derive(Parser)]
#[command(name = "shepherdd", about = "Shepherd cleanup and rescheduling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic cleanup loop until interrupted.
    Run {
        #[arg(long, short, default_value = "/etc/shepherd/shepherd.toml")]
        config: PathBuf,
    },
    /// Register an instance in a pool, or update its score.
    Register {
        #[arg(long, short, default_value = "/etc/shepherd/shepherd.toml")]
        config: PathBuf,

        #[arg(long)]
        pool: String,

        /// Instance address, host:port.
        #[arg(long)]
        address: String,

        #[arg(long, default_value = "0")]
        score: u64,
    },
    /// List the instances registered in a pool.
    Instances {
        #[arg(long, short, default_value = "/etc/shepherd/shepherd.toml")]
        config: PathBuf,

        #[arg(long)]
        pool: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => {
            let config = ShepherdConfig::from_file(&config)?;
            daemon::run(config).await
        }
        Command::Register {
            config,
            pool,
            address,
            score,
        } => {
            let config = ShepherdConfig::from_file(&config)?;
            daemon::register(&config, &pool, &address, score)
        }
        Command::Instances { config, pool } => {
            let config = ShepherdConfig::from_file(&config)?;
            for instance in daemon::instances(&config, &pool)? {
                println!("{}\tscore={}", instance.address, instance.score);
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
