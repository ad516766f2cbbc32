use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};
use tracing::{error, info};

use weather_etl_core::{PgWeatherStore, Settings, WeatherStore, run_once, schedule};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-etl", version, about = "Load hourly Tomorrow.io weather data into PostgreSQL")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Path to config.toml. Falls back to $WEATHER_ETL_CONFIG, then the platform config dir.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(self) -> anyhow::Result<Settings> {
        let path = Settings::resolve_path(self.config)?;
        let settings = Settings::load(&path)?;
        info!(path = %path.display(), locations = settings.locations.len(), "Configuration loaded");
        Ok(settings)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline once for every configured location and exit.
    Run {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Run once at startup, then on a fixed interval until interrupted.
    Schedule {
        #[command(flatten)]
        config: ConfigArgs,

        /// Minutes between scheduled runs.
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
        every_minutes: u64,
    },

    /// Create the `weather_data` table if it does not exist.
    Migrate {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the default configuration file location.
    ConfigPath,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Run { config } => {
                let settings = config.load()?;
                let summary = run_once(&settings).await.context("ETL run aborted")?;
                info!(records = summary.records_attempted, "ETL process finished");
            }
            Command::Schedule { config, every_minutes } => {
                let settings = config.load()?;
                let period = Duration::from_secs(every_minutes * 60);

                schedule::run_every(period, shutdown_signal(), || run_once(&settings)).await;
            }
            Command::Migrate { config } => {
                let settings = config.load()?;
                let mut store = PgWeatherStore::connect(&settings.db).await?;
                let migrated = store.migrate().await;
                store.close().await;
                migrated?;
                info!("Database schema is up to date");
            }
            Command::ConfigPath => {
                println!("{}", Settings::config_file_path()?.display());
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
