//! Core library for the `weather-etl` service.
//!
//! This crate defines:
//! - Configuration loading & validation
//! - The Tomorrow.io forecast client with retry/backoff handling
//! - Idempotent PostgreSQL persistence of hourly records
//! - The per-location pipeline and its periodic scheduler
//!
//! It is used by `weather-etl-cli`, but can also be embedded in other binaries or services.

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod schedule;
pub mod store;

pub use config::{ApiConfig, DbConfig, Secret, Settings};
pub use error::{FetchError, PipelineError, StoreError, TransportError};
pub use model::{Location, RunSummary, WeatherRecord};
pub use pipeline::{PipelineRunner, run_once};
pub use provider::{TomorrowProvider, WeatherProvider};
pub use store::{PgWeatherStore, WeatherStore};
