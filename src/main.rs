use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use festival_bootstrap::config::LoaderConfig;
use festival_bootstrap::db::{Database, run_migrations};
use festival_bootstrap::error::LoaderError;
use festival_bootstrap::loader::{BootstrapOptions, Bootstrapper};
use festival_bootstrap::models::JsonFileSource;
use festival_bootstrap::retry::retry;

#[derive(Parser, Debug)]
#[command(
    name = "festival-bootstrap",
    about = "Load events, ticket types, settings and admin access from a JSON configuration"
)]
struct Args {
    /// Path to the bootstrap configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Rows per batch insert statement.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Transaction timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Replace stored settings with the configured values.
    #[arg(long)]
    overwrite_settings: bool,

    /// Assume the schema is already in place.
    #[arg(long)]
    skip_migrations: bool,

    /// Verify everything, then roll back.
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn apply(&self, config: &mut LoaderConfig) {
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.transaction_timeout = Duration::from_millis(timeout_ms);
        }
        if self.overwrite_settings {
            config.overwrite_settings = true;
        }
    }
}

async fn open_database(config: &LoaderConfig, migrate: bool) -> Result<Database, LoaderError> {
    let db = retry(
        || Database::connect(&config.database_url, config.max_connections),
        config.retry_attempts,
        config.retry_base_delay,
    )
    .await?;

    if migrate {
        run_migrations(db.pool()).await?;
    }
    Ok(db)
}

#[tokio::main]
async fn main() -> ExitCode {
    festival_bootstrap::init_logger();

    let args = Args::parse();
    let mut config = LoaderConfig::from_env();
    args.apply(&mut config);

    let db = match open_database(&config, !args.skip_migrations).await {
        Ok(db) => db,
        Err(err) => {
            log::error!("could not prepare database: {}", err);
            eprintln!("bootstrap failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let options = BootstrapOptions {
        dry_run: args.dry_run,
        ..BootstrapOptions::from(&config)
    };
    let bootstrapper = Bootstrapper::new(db.clone(), options);
    let run = bootstrapper.run(&JsonFileSource::new(&args.config)).await;
    db.close().await;

    println!("{}", run.summary());
    ExitCode::from(run.exit_code())
}
