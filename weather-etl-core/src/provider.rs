use async_trait::async_trait;
use std::fmt::Debug;

use crate::{error::FetchError, model::WeatherRecord};

pub mod retry;
pub mod tomorrow;

pub use tomorrow::{HttpReply, HttpTransport, ReqwestTransport, TomorrowProvider};

/// Source of hourly weather records for a coordinate pair.
///
/// Returned records carry no coordinates; the caller attaches them.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    async fn fetch(&self, lat: f64, lon: f64) -> Result<Vec<WeatherRecord>, FetchError>;

    /// Release the underlying HTTP session. Later fetches fail with [`FetchError::Closed`].
    async fn close(&mut self);
}
