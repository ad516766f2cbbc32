//! Idempotent persistence of weather records into PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::{fmt::Debug, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{config::DbConfig, error::StoreError, model::WeatherRecord};

/// Rows that collide on `(latitude, longitude, time_stamp, is_forecast)` are left untouched.
const INSERT_WEATHER_DATA: &str = r#"
    INSERT INTO weather_data
        (latitude, longitude, time_stamp, is_forecast,
         temperature, wind_speed, humidity, precipitation_type)
    SELECT * FROM unnest(
        $1::float8[], $2::float8[], $3::timestamptz[], $4::bool[],
        $5::float8[], $6::float8[], $7::float8[], $8::float8[]
    )
    ON CONFLICT (latitude, longitude, time_stamp, is_forecast) DO NOTHING
"#;

/// Sink for normalized weather records.
#[async_trait]
pub trait WeatherStore: Send + Sync + Debug {
    /// Submit `records` in one atomic write and return how many passed validation.
    ///
    /// The count includes rows that already existed and were skipped on conflict.
    async fn bulk_upsert(&self, records: &[WeatherRecord]) -> Result<usize, StoreError>;

    /// Release pooled connections. Safe to call more than once.
    async fn close(&mut self);
}

/// Column-major view of the storable subset of a batch, ready for `unnest`.
#[derive(Debug, Default, PartialEq)]
struct Columns {
    latitude: Vec<f64>,
    longitude: Vec<f64>,
    time_stamp: Vec<DateTime<Utc>>,
    is_forecast: Vec<bool>,
    temperature: Vec<Option<f64>>,
    wind_speed: Vec<Option<f64>>,
    humidity: Vec<Option<f64>>,
    precipitation_type: Vec<Option<f64>>,
}

impl Columns {
    fn from_records(records: &[WeatherRecord]) -> Self {
        let mut cols = Self::default();
        for record in records {
            let Some((lat, lon, ts, is_forecast)) = record.key() else {
                continue;
            };
            cols.latitude.push(lat);
            cols.longitude.push(lon);
            cols.time_stamp.push(ts);
            cols.is_forecast.push(is_forecast);
            cols.temperature.push(record.temperature);
            cols.wind_speed.push(record.wind_speed);
            cols.humidity.push(record.humidity);
            cols.precipitation_type.push(record.precipitation_type);
        }
        cols
    }

    fn len(&self) -> usize {
        self.latitude.len()
    }
}

#[derive(Debug, Clone)]
pub struct PgWeatherStore {
    pool: PgPool,
}

pub fn connect_options(db: &DbConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(db.password.expose())
        .database(&db.database)
}

impl PgWeatherStore {
    /// Build the pool and check that the database is reachable.
    pub async fn connect(db: &DbConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .acquire_timeout(Duration::from_secs(db.acquire_timeout_seconds))
            .connect_with(connect_options(db))
            .await
            .map_err(StoreError::Connect)?;

        info!(host = %db.host, database = %db.database, "Database pool initialized");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create `weather_data` and its natural-key constraint if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(StoreError::Migrate)
    }

    async fn insert(&self, cols: Columns) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(INSERT_WEATHER_DATA)
            .bind(cols.latitude)
            .bind(cols.longitude)
            .bind(cols.time_stamp)
            .bind(cols.is_forecast)
            .bind(cols.temperature)
            .bind(cols.wind_speed)
            .bind(cols.humidity)
            .bind(cols.precipitation_type)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }
}

#[async_trait]
impl WeatherStore for PgWeatherStore {
    async fn bulk_upsert(&self, records: &[WeatherRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let cols = Columns::from_records(records);
        let attempted = cols.len();

        if attempted < records.len() {
            warn!(
                dropped = records.len() - attempted,
                "Skipping records missing latitude, longitude, timestamp or is_forecast"
            );
        }
        if attempted == 0 {
            return Ok(0);
        }

        if let Err(source) = self.insert(cols).await {
            error!(error = %source, records = attempted, "Bulk insert failed");
            return Err(StoreError::Write { records: attempted, source });
        }

        debug!(records = attempted, "Bulk insert committed");
        Ok(attempted)
    }

    async fn close(&mut self) {
        self.pool.close().await;
    }
}
