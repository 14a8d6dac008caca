//! Cadence: campaign pacing daemon
//!
//! Binary with subcommands:
//! - `daemon`: Run the scheduler and lifecycle API
//! - `migrate`: Apply pending database migrations and exit

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod dispatch;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Campaign pacing daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon and lifecycle API
    Daemon {
        /// PostgreSQL connection URL
        #[arg(long, env = "CADENCE_DATABASE_URL")]
        database_url: String,

        /// Dispatcher endpoint that performs platform actions
        #[arg(long, env = "CADENCE_DISPATCH_URL")]
        dispatch_url: Option<String>,

        /// API server port
        #[arg(long, env = "CADENCE_PORT", default_value = "8080")]
        port: u16,

        /// Log every action instead of calling the dispatcher
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply pending database migrations and exit
    Migrate {
        /// PostgreSQL connection URL
        #[arg(long, env = "CADENCE_DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            database_url,
            dispatch_url,
            port,
            dry_run,
        } => {
            daemon::run(daemon::DaemonConfig {
                database_url,
                dispatch_url,
                port,
                dry_run,
            })
            .await
        }

        Commands::Migrate { database_url } => {
            let pool = cadence_store::connect(&database_url)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            cadence_store::run_migrations(&pool)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            tracing::info!("migrations applied");
            Ok(())
        }
    }
}
