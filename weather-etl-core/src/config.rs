use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, path::PathBuf, time::Duration};

use crate::model::Location;

pub const API_KEY_ENV: &str = "TOMORROW_IO_API_KEY";
pub const CONFIG_PATH_ENV: &str = "WEATHER_ETL_CONFIG";

pub const MAX_LOOKBACK_HOURS: i64 = 24 * 7;
pub const MAX_HORIZON_DAYS: i64 = 15;
pub const MAX_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_RETRY_BACKOFF_SECONDS: f64 = 60.0;
pub const MAX_RATE_LIMIT_SLEEP_SECONDS: f64 = 3600.0;

/// A value that must never end up in logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Tomorrow.io request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(alias = "forecast_endpoint")]
    pub endpoint: String,
    /// Usually supplied through `TOMORROW_IO_API_KEY` rather than the file.
    #[serde(default)]
    pub key: Secret,
    pub fields: Vec<String>,
    pub timesteps: Vec<String>,
    pub units: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: f64,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_horizon_days")]
    pub horizon_days: i64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Reject values that would overflow the request window or the retry sleeps.
    fn validate(&self) -> Result<()> {
        if !(0..=MAX_LOOKBACK_HOURS).contains(&self.lookback_hours) {
            bail!("Invalid configuration file: api.lookback_hours must be within 0..={MAX_LOOKBACK_HOURS}");
        }
        if !(1..=MAX_HORIZON_DAYS).contains(&self.horizon_days) {
            bail!("Invalid configuration file: api.horizon_days must be within 1..={MAX_HORIZON_DAYS}");
        }
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            bail!("Invalid configuration file: api.timeout_seconds must be within 1..={MAX_TIMEOUT_SECONDS}");
        }
        if !(0.0..=MAX_RETRY_BACKOFF_SECONDS).contains(&self.retry_backoff_seconds) {
            bail!(
                "Invalid configuration file: api.retry_backoff_seconds must be within 0..={MAX_RETRY_BACKOFF_SECONDS}"
            );
        }
        self.timestep_minutes()?;
        Ok(())
    }

    /// Granularity of the first configured timestep, in minutes.
    pub fn timestep_minutes(&self) -> Result<u32> {
        let first = self
            .timesteps
            .first()
            .ok_or_else(|| anyhow!("Invalid configuration file: api.timesteps is empty"))?;
        parse_timestep_minutes(first)
    }
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_lookback_hours() -> i64 {
    24
}

fn default_horizon_days() -> i64 {
    5
}

fn default_rate_limit_sleep() -> f64 {
    2.0
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Fully resolved PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub database: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

/// The `[db]` table as written in the file; every field may come from `PG*` instead.
#[derive(Debug, Deserialize)]
struct DbSection {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<Secret>,
    database: Option<String>,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    acquire_timeout_seconds: u64,
}

impl Default for DbSection {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            max_connections: default_max_connections(),
            acquire_timeout_seconds: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    api: ApiConfig,
    #[serde(default)]
    db: Option<DbSection>,
    locations: Vec<Location>,
    #[serde(default = "default_rate_limit_sleep")]
    rate_limit_sleep_seconds: f64,
}

/// Validated, immutable settings handed to the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api: ApiConfig,
    pub db: DbConfig,
    pub locations: Vec<Location>,
    pub rate_limit_sleep_seconds: f64,
}

impl Settings {
    /// Load settings from `path`, applying overrides from the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Configuration file missing: {}", path.display());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&contents, |name| std::env::var(name).ok())
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Parse and validate `contents`. `env` resolves environment overrides by name.
    pub fn from_toml_str(contents: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: FileConfig = toml::from_str(contents).context("Invalid configuration file")?;
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let mut api = file.api;
        if let Some(key) = env(API_KEY_ENV) {
            api.key = Secret::new(key);
        }
        if api.key.is_empty() {
            bail!("Missing API key: set {API_KEY_ENV}");
        }
        api.validate()?;

        let db = resolve_db(file.db.unwrap_or_default(), &env)?;

        if !(0.0..=MAX_RATE_LIMIT_SLEEP_SECONDS).contains(&file.rate_limit_sleep_seconds) {
            bail!(
                "Invalid configuration file: rate_limit_sleep_seconds must be within 0..={MAX_RATE_LIMIT_SLEEP_SECONDS}"
            );
        }

        Ok(Self {
            api,
            db,
            locations: file.locations,
            rate_limit_sleep_seconds: file.rate_limit_sleep_seconds,
        })
    }

    pub fn rate_limit_pause(&self) -> Duration {
        Duration::try_from_secs_f64(self.rate_limit_sleep_seconds).unwrap_or(Duration::ZERO)
    }

    /// Explicit path first, then `WEATHER_ETL_CONFIG`, then the platform config dir.
    pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        Self::config_file_path()
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-etl", "weather-etl")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }
}

fn resolve_db(section: DbSection, env: &impl Fn(&str) -> Option<String>) -> Result<DbConfig> {
    let port = match env("PGPORT") {
        Some(raw) => Some(
            raw.trim()
                .parse::<u16>()
                .with_context(|| format!("Database configuration incomplete: invalid PGPORT '{raw}'"))?,
        ),
        None => section.port,
    };
    let host = env("PGHOST").or(section.host);
    let user = env("PGUSER").or(section.user);
    let password = env("PGPASSWORD").map(Secret::new).or(section.password);
    let database = env("PGDATABASE").or(section.database);

    let missing: Vec<&str> = [
        ("PGHOST", host.is_none()),
        ("PGPORT", port.is_none()),
        ("PGUSER", user.is_none()),
        ("PGPASSWORD", password.is_none()),
        ("PGDATABASE", database.is_none()),
    ]
    .into_iter()
    .filter_map(|(name, absent)| absent.then_some(name))
    .collect();

    match (host, port, user, password, database) {
        (Some(host), Some(port), Some(user), Some(password), Some(database)) => Ok(DbConfig {
            host,
            port,
            user,
            password,
            database,
            max_connections: section.max_connections,
            acquire_timeout_seconds: section.acquire_timeout_seconds,
        }),
        _ => bail!("Database configuration incomplete: missing {}", missing.join(", ")),
    }
}

/// `"1h"` -> 60, `"30m"` -> 30.
pub fn parse_timestep_minutes(timestep: &str) -> Result<u32> {
    let timestep = timestep.trim();
    let unsupported = || {
        anyhow!("Unsupported timestep unit in config: {timestep}. Only 'h' or 'm' supported.")
    };

    let unit = timestep.chars().last().ok_or_else(unsupported)?;
    let value: u32 = timestep[..timestep.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| unsupported())?;

    match unit.to_ascii_lowercase() {
        'h' => value.checked_mul(60).ok_or_else(|| {
            anyhow!("Invalid configuration file: timestep {timestep} is too large")
        }),
        'm' => Ok(value),
        _ => Err(unsupported()),
    }
}
