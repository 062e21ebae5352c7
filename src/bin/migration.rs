use clap::{Parser, Subcommand};
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::{error, info};

use prodflow::{config, migrator::Migrator};

#[derive(Debug, Parser)]
#[command(name = "migration", about = "Manage the prodflow database schema")]
struct Cli {
    /// Falls back to the application configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations
    Up {
        #[arg(short, long)]
        steps: Option<u32>,
    },
    /// Roll back applied migrations
    Down {
        #[arg(short, long, default_value_t = 1)]
        steps: u32,
    },
    /// Drop every table and re-apply all migrations
    Fresh,
    /// List migrations and whether they are applied
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (database_url, log_level) = match (cli.database_url, cli.log_level) {
        (Some(url), Some(level)) => (url, level),
        (url, level) => {
            let cfg = config::load_config()?;
            (
                url.unwrap_or(cfg.database_url),
                level.unwrap_or(cfg.log_level),
            )
        }
    };
    config::init_tracing(&log_level, false);

    info!("Connecting to database");
    let mut options = ConnectOptions::new(database_url);
    options
        .max_connections(5)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    let result = match cli.command.unwrap_or(Command::Up { steps: None }) {
        Command::Up { steps } => Migrator::up(&db, steps).await,
        Command::Down { steps } => Migrator::down(&db, Some(steps)).await,
        Command::Fresh => Migrator::fresh(&db).await,
        Command::Status => Migrator::status(&db).await,
    };

    if let Err(e) = result {
        error!("Migration command failed: {}", e);
        return Err(e.into());
    }
    info!("Migration command completed");
    Ok(())
}
