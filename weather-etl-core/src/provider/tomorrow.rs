use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{fmt::Debug, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ApiConfig, MAX_HORIZON_DAYS, MAX_LOOKBACK_HOURS},
    error::{FetchError, TransportError},
    model::WeatherRecord,
    provider::retry::{Decision, Failure, RetryPolicy},
};

use super::WeatherProvider;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// The single GET the forecast client needs.
#[async_trait]
pub trait HttpTransport: Send + Sync + Debug {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpReply, TransportError>;

    fn close(&mut self) {}
}

#[derive(Debug)]
pub struct ReqwestTransport {
    http: Option<Client>,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder().timeout(timeout).build().map_err(FetchError::Client)?;
        Ok(Self { http: Some(http) })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() || err.is_redirect() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpReply, TransportError> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| TransportError::Network("HTTP client closed".to_string()))?;

        let res = http.get(url).query(query).send().await.map_err(transport_error)?;
        let status = res.status().as_u16();
        let body = res.text().await.map_err(transport_error)?;

        Ok(HttpReply { status, body })
    }

    fn close(&mut self) {
        self.http = None;
    }
}

/// Tomorrow.io v4 forecast client.
#[derive(Debug)]
pub struct TomorrowProvider<T = ReqwestTransport> {
    url: String,
    key: String,
    fields: String,
    timesteps: String,
    units: String,
    lookback: ChronoDuration,
    horizon: ChronoDuration,
    policy: RetryPolicy,
    transport: T,
    closed: bool,
}

impl TomorrowProvider<ReqwestTransport> {
    pub fn from_config(api: &ApiConfig) -> Result<Self, FetchError> {
        let transport = ReqwestTransport::new(api.timeout())?;
        Ok(Self::with_transport(api, transport))
    }
}

impl<T: HttpTransport> TomorrowProvider<T> {
    pub fn with_transport(api: &ApiConfig, transport: T) -> Self {
        info!(url = %format!("{}{}", api.base_url, api.endpoint), "Tomorrow.io forecast client initialized");

        Self {
            url: format!("{}{}", api.base_url, api.endpoint),
            key: api.key.expose().to_string(),
            fields: api.fields.join(","),
            timesteps: api.timesteps.join(","),
            units: api.units.clone(),
            lookback: ChronoDuration::hours(api.lookback_hours.clamp(0, MAX_LOOKBACK_HOURS)),
            horizon: ChronoDuration::days(api.horizon_days.clamp(1, MAX_HORIZON_DAYS)),
            policy: RetryPolicy {
                max_attempts: api.max_retries,
                backoff_base: api.retry_backoff_seconds,
            },
            transport,
            closed: false,
        }
    }

    fn query(&self, location: &str, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let iso = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);

        vec![
            ("location", location.to_string()),
            ("timesteps", self.timesteps.clone()),
            ("units", self.units.clone()),
            ("fields", self.fields.clone()),
            ("startTime", iso(now - self.lookback)),
            ("endTime", iso(now + self.horizon)),
            ("apikey", self.key.clone()),
        ]
    }

    async fn call_api(&self, query: &[(&str, String)], location: &str) -> Result<String, FetchError> {
        let mut last_failure = String::from("no attempts configured");

        for attempt in 0..self.policy.max_attempts {
            let (failure, err) = match self.transport.get(&self.url, query).await {
                Ok(reply) if (200..300).contains(&reply.status) => return Ok(reply.body),
                Ok(reply) => {
                    last_failure = format!("status {}", reply.status);
                    let err = FetchError::Status {
                        location: location.to_string(),
                        status: reply.status,
                        body: truncate_body(&reply.body),
                    };
                    (Failure::Status(reply.status), err)
                }
                Err(source) => {
                    last_failure = source.to_string();
                    let failure = match &source {
                        TransportError::InvalidRequest(_) => Failure::InvalidRequest,
                        _ => Failure::Transport,
                    };
                    let err = FetchError::Transport { location: location.to_string(), source };
                    (failure, err)
                }
            };

            match self.policy.decide(attempt, failure) {
                Decision::RetryAfter(wait) => {
                    warn!(location, attempt, ?failure, wait_secs = wait.as_secs_f64(), "Transient API error, retrying");
                    tokio::time::sleep(wait).await;
                }
                Decision::Fail if failure == Failure::Status(429) => {
                    error!(
                        location,
                        "Tomorrow.io rate limit exceeded; free tier allows only 25 requests/hour. \
                         Skipping until next scheduled run"
                    );
                    return Err(FetchError::RateLimited { location: location.to_string() });
                }
                Decision::Fail => {
                    error!(location, ?failure, "API failure");
                    return Err(err);
                }
                Decision::Exhausted => {
                    error!(location, attempts = attempt + 1, "API retries exhausted");
                    return Err(FetchError::RetriesExhausted {
                        location: location.to_string(),
                        attempts: attempt + 1,
                        last: last_failure,
                    });
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            location: location.to_string(),
            attempts: self.policy.max_attempts,
            last: last_failure,
        })
    }

    /// Fetch `[now - lookback, now + horizon]` for one coordinate pair, treating `now` as the
    /// fetch instant for every record produced.
    pub async fn fetch_at(
        &self,
        lat: f64,
        lon: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<WeatherRecord>, FetchError> {
        if self.closed {
            return Err(FetchError::Closed);
        }

        let location = format!("{lat},{lon}");
        info!(location, "Fetching forecast");

        let body = self.call_api(&self.query(&location, now), &location).await?;
        let records = parse_hourly(&body, now, &location)?;

        if records.is_empty() {
            warn!(location, "No hourly data returned");
        } else {
            info!(location, records = records.len(), "Parsed hourly records");
        }
        Ok(records)
    }
}

#[async_trait]
impl<T: HttpTransport> WeatherProvider for TomorrowProvider<T> {
    async fn fetch(&self, lat: f64, lon: f64) -> Result<Vec<WeatherRecord>, FetchError> {
        self.fetch_at(lat, lon, Utc::now()).await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.transport.close();
            self.closed = true;
            debug!("Tomorrow.io forecast client closed");
        }
    }
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    timelines: Option<Timelines>,
}

#[derive(Debug, Deserialize)]
struct Timelines {
    #[serde(default)]
    hourly: Option<Vec<Interval>>,
}

#[derive(Debug, Deserialize)]
struct Interval {
    time: String,
    #[serde(default)]
    values: Option<Map<String, Value>>,
}

/// Normalize a `timelines.hourly[]` payload. Missing or non-numeric measurements become `None`.
pub fn parse_hourly(
    body: &str,
    fetched_at: DateTime<Utc>,
    location: &str,
) -> Result<Vec<WeatherRecord>, FetchError> {
    let parsed: ForecastResponse = serde_json::from_str(body)
        .map_err(|source| FetchError::Parse { location: location.to_string(), source })?;

    let intervals = parsed.timelines.and_then(|t| t.hourly).unwrap_or_default();

    intervals
        .into_iter()
        .map(|interval| {
            let timestamp = DateTime::parse_from_rfc3339(&interval.time)
                .map_err(|source| FetchError::InvalidTimestamp {
                    location: location.to_string(),
                    value: interval.time.clone(),
                    source,
                })?
                .with_timezone(&Utc);

            let value = |name: &str| {
                interval.values.as_ref().and_then(|v| v.get(name)).and_then(Value::as_f64)
            };

            Ok(WeatherRecord {
                temperature: value("temperature"),
                wind_speed: value("windSpeed"),
                humidity: value("humidity"),
                precipitation_type: value("precipitationType"),
                ..WeatherRecord::at(timestamp, fetched_at)
            })
        })
        .collect()
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() > MAX {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    } else {
        body.to_string()
    }
}
