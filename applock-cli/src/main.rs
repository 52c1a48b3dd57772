mod commands;
mod report;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "applock",
    about = "Hold and inspect named application locks",
    version
)]
struct Cli {
    /// Lock database shared by every process that contends for the locks
    #[arg(long, global = true, default_value = "applock.db", env = "APPLOCK_DB")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a session lock, hold it, then release it
    Hold {
        /// Lock name
        name: String,

        /// Seconds to wait for the lock before giving up
        #[arg(short, long, default_value = "5", env = "APPLOCK_TIMEOUT")]
        timeout: i64,

        /// Seconds to hold the lock once acquired (Ctrl-C releases early)
        #[arg(long, default_value = "10")]
        hold: u64,

        /// Report a failed acquisition instead of exiting with an error
        #[arg(long)]
        no_throw: bool,
    },

    /// List every lock currently recorded in the database
    List,

    /// Remove a lock left behind by a crashed process
    ForceRelease {
        /// Lock name
        name: String,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Hold {
            name,
            timeout,
            hold,
            no_throw,
        } => commands::hold(&cli.db, &name, timeout, hold, no_throw).await,
        Commands::List => commands::list(&cli.db),
        Commands::ForceRelease { name } => commands::force_release(&cli.db, &name),
        Commands::Version => {
            println!("applock {}", env!("CARGO_PKG_VERSION"));
            println!("Application lock handles over a shared lock database");
            Ok(())
        }
    }
}
