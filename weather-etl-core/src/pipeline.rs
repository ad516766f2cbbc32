//! One run of the fetch → normalize → load loop over all configured locations.

use std::time::Duration;
use tracing::{error, info, warn};

use crate::{
    config::Settings,
    error::{PipelineError, report},
    model::{Location, RunSummary},
    provider::{TomorrowProvider, WeatherProvider},
    store::{PgWeatherStore, WeatherStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocationOutcome {
    Skipped,
    Empty,
    Loaded(usize),
    Failed,
}

/// Iterates locations sequentially, isolating failures to the location that caused them.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    locations: Vec<Location>,
    pause: Duration,
}

impl PipelineRunner {
    /// `pause` is slept after every location that issued a request.
    pub fn new(locations: Vec<Location>, pause: Duration) -> Self {
        Self { locations, pause }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.locations.clone(), settings.rate_limit_pause())
    }

    /// Process every location, then close both collaborators.
    pub async fn run<P, S>(&self, provider: &mut P, store: &mut S) -> RunSummary
    where
        P: WeatherProvider + ?Sized,
        S: WeatherStore + ?Sized,
    {
        info!(locations = self.locations.len(), "Starting run");
        let mut summary = RunSummary::default();

        for location in &self.locations {
            match process_location(location, &*provider, &*store).await {
                LocationOutcome::Skipped => {
                    summary.locations_skipped += 1;
                    continue;
                }
                LocationOutcome::Empty => summary.locations_empty += 1,
                LocationOutcome::Loaded(n) => {
                    summary.locations_loaded += 1;
                    summary.records_attempted += n;
                }
                LocationOutcome::Failed => summary.locations_failed += 1,
            }

            tokio::time::sleep(self.pause).await;
        }

        provider.close().await;
        store.close().await;

        info!(
            records = summary.records_attempted,
            loaded = summary.locations_loaded,
            empty = summary.locations_empty,
            skipped = summary.locations_skipped,
            failed = summary.locations_failed,
            "Run complete"
        );
        summary
    }
}

async fn process_location<P, S>(location: &Location, provider: &P, store: &S) -> LocationOutcome
where
    P: WeatherProvider + ?Sized,
    S: WeatherStore + ?Sized,
{
    let Some((lat, lon)) = location.coordinates() else {
        warn!(%location, "Skipping location without lat/lon");
        return LocationOutcome::Skipped;
    };

    info!(%location, "Processing location");

    let records = match provider.fetch(lat, lon).await {
        Ok(records) => records,
        Err(err) => {
            error!(%location, error = %report(&err), "Fetch failed; continuing with next location");
            return LocationOutcome::Failed;
        }
    };

    if records.is_empty() {
        warn!(%location, "No data returned; skipping load");
        return LocationOutcome::Empty;
    }

    let records: Vec<_> = records.into_iter().map(|r| r.with_coordinates(lat, lon)).collect();

    match store.bulk_upsert(&records).await {
        Ok(attempted) => {
            info!(%location, records = attempted, "Load completed");
            LocationOutcome::Loaded(attempted)
        }
        Err(err) => {
            error!(%location, error = %report(&err), "Load failed; continuing with next location");
            LocationOutcome::Failed
        }
    }
}

/// Build both collaborators from `settings` and run once.
///
/// Only collaborator construction is fatal; everything after that is isolated per location.
pub async fn run_once(settings: &Settings) -> Result<RunSummary, PipelineError> {
    let mut provider = TomorrowProvider::from_config(&settings.api).map_err(|err| {
        error!(error = %report(&err), "Failed to initialize forecast client; terminating run");
        PipelineError::Provider(err)
    })?;

    let mut store = match PgWeatherStore::connect(&settings.db).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %report(&err), "Failed to initialize database; terminating run");
            provider.close().await;
            return Err(PipelineError::Store(err));
        }
    };

    Ok(PipelineRunner::from_settings(settings).run(&mut provider, &mut store).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ApiConfig, DbConfig, Secret},
        error::{FetchError, StoreError},
        model::WeatherRecord,
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::time::Instant;

    fn temps(values: &[f64]) -> Vec<WeatherRecord> {
        let now = Utc.with_ymd_and_hms(2025, 12, 15, 15, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, t)| WeatherRecord {
                temperature: Some(*t),
                ..WeatherRecord::at(now + chrono::Duration::hours(i as i64), now)
            })
            .collect()
    }

    #[derive(Debug, Default)]
    struct FakeProvider {
        responses: Mutex<VecDeque<Result<Vec<WeatherRecord>, FetchError>>>,
        calls: Mutex<Vec<(f64, f64)>>,
        closed: AtomicUsize,
    }

    impl FakeProvider {
        fn new(responses: Vec<Result<Vec<WeatherRecord>, FetchError>>) -> Self {
            Self { responses: Mutex::new(responses.into()), ..Default::default() }
        }

        fn calls(&self) -> Vec<(f64, f64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WeatherProvider for FakeProvider {
        async fn fetch(&self, lat: f64, lon: f64) -> Result<Vec<WeatherRecord>, FetchError> {
            self.calls.lock().unwrap().push((lat, lon));
            self.responses.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Default)]
    struct FakeStore {
        batches: Mutex<Vec<Vec<WeatherRecord>>>,
        fail_batches: Vec<usize>,
        closed: AtomicUsize,
    }

    impl FakeStore {
        fn batches(&self) -> Vec<Vec<WeatherRecord>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WeatherStore for FakeStore {
        async fn bulk_upsert(&self, records: &[WeatherRecord]) -> Result<usize, StoreError> {
            let mut batches = self.batches.lock().unwrap();
            let index = batches.len();
            batches.push(records.to_vec());
            if self.fail_batches.contains(&index) {
                return Err(StoreError::Write {
                    records: records.len(),
                    source: sqlx::Error::PoolTimedOut,
                });
            }
            Ok(records.iter().filter(|r| r.is_storable()).count())
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn two_locations() -> Vec<Location> {
        vec![Location::new(25.9, -97.4), Location::new(25.8, -97.5)]
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_counts_records_and_pauses_between_locations() {
        let runner = PipelineRunner::new(two_locations(), Duration::from_secs(2));
        let mut provider = FakeProvider::new(vec![Ok(temps(&[10.0, 11.0])), Ok(temps(&[12.0]))]);
        let mut store = FakeStore::default();
        let start = Instant::now();

        let summary = runner.run(&mut provider, &mut store).await;

        assert_eq!(summary.records_attempted, 3);
        assert_eq!(summary.locations_loaded, 2);
        assert_eq!(provider.calls(), vec![(25.9, -97.4), (25.8, -97.5)]);

        let batches = store.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].iter().all(|r| r.latitude == Some(25.9) && r.longitude == Some(-97.4)));
        assert!(batches[1].iter().all(|r| r.latitude == Some(25.8) && r.longitude == Some(-97.5)));

        // One pause per location.
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
        assert_eq!(store.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_invalid_location() {
        let mut locations = two_locations();
        locations.push(Location { lat: Some(10.0), lon: None });
        let runner = PipelineRunner::new(locations, Duration::ZERO);
        let mut provider = FakeProvider::new(vec![Ok(temps(&[10.0])), Ok(temps(&[10.0]))]);
        let mut store = FakeStore::default();

        let summary = runner.run(&mut provider, &mut store).await;

        assert_eq!(summary.records_attempted, 2);
        assert_eq!(summary.locations_skipped, 1);
        assert_eq!(provider.calls().len(), 2);
        assert_eq!(store.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_response_skips_load() {
        let runner = PipelineRunner::new(two_locations(), Duration::ZERO);
        let mut provider = FakeProvider::new(vec![Ok(Vec::new()), Ok(temps(&[12.0]))]);
        let mut store = FakeStore::default();

        let summary = runner.run(&mut provider, &mut store).await;

        assert_eq!(summary.records_attempted, 1);
        assert_eq!(summary.locations_empty, 1);
        assert_eq!(store.batches().len(), 1);
        assert_eq!(store.batches()[0][0].latitude, Some(25.8));
    }

    #[tokio::test(start_paused = true)]
    async fn continues_after_fetch_failure() {
        let locations = vec![
            Location::new(25.9, -97.4),
            Location::new(25.8, -97.5),
            Location::new(25.7, -97.6),
        ];
        let runner = PipelineRunner::new(locations, Duration::from_secs(1));
        let mut provider = FakeProvider::new(vec![
            Ok(temps(&[10.0, 11.0])),
            Err(FetchError::RateLimited { location: "25.8,-97.5".to_string() }),
            Ok(temps(&[12.0, 13.0, 14.0])),
        ]);
        let mut store = FakeStore::default();
        let start = Instant::now();

        let summary = runner.run(&mut provider, &mut store).await;

        assert_eq!(provider.calls(), vec![(25.9, -97.4), (25.8, -97.5), (25.7, -97.6)]);
        assert_eq!(summary.records_attempted, 5);
        assert_eq!(summary.locations_failed, 1);
        assert_eq!(store.batches().len(), 2);
        // A failed request still counts against the upstream quota.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_isolated_to_its_location() {
        let runner = PipelineRunner::new(two_locations(), Duration::ZERO);
        let mut provider = FakeProvider::new(vec![Ok(temps(&[10.0, 11.0])), Ok(temps(&[12.0]))]);
        let mut store = FakeStore { fail_batches: vec![0], ..Default::default() };

        let summary = runner.run(&mut provider, &mut store).await;

        assert_eq!(summary.records_attempted, 1);
        assert_eq!(summary.locations_failed, 1);
        assert_eq!(summary.locations_loaded, 1);
        assert_eq!(store.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collaborators_are_closed_when_every_location_fails() {
        let runner = PipelineRunner::new(two_locations(), Duration::ZERO);
        let mut provider = FakeProvider::new(vec![
            Err(FetchError::Closed),
            Err(FetchError::Closed),
        ]);
        let mut store = FakeStore::default();

        let summary = runner.run(&mut provider, &mut store).await;

        assert_eq!(summary.records_attempted, 0);
        assert_eq!(summary.locations_failed, 2);
        assert!(store.batches().is_empty());
        assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
        assert_eq!(store.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trait_objects_are_accepted() {
        let runner = PipelineRunner::new(two_locations(), Duration::ZERO);
        let mut provider: Box<dyn WeatherProvider> =
            Box::new(FakeProvider::new(vec![Ok(temps(&[1.0])), Ok(temps(&[2.0]))]));
        let mut store: Box<dyn WeatherStore> = Box::new(FakeStore::default());

        let summary = runner.run(provider.as_mut(), store.as_mut()).await;

        assert_eq!(summary.records_attempted, 2);
    }

    #[tokio::test]
    async fn run_once_aborts_when_database_is_unreachable() {
        let settings = Settings {
            api: ApiConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                endpoint: "/v4/weather/forecast".to_string(),
                key: Secret::new("dummy-api-key"),
                fields: vec!["temperature".to_string()],
                timesteps: vec!["1h".to_string()],
                units: "metric".to_string(),
                timeout_seconds: 1,
                max_retries: 1,
                retry_backoff_seconds: 2.0,
                lookback_hours: 24,
                horizon_days: 5,
            },
            db: DbConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                user: "postgres".to_string(),
                password: Secret::new("postgres"),
                database: "tomorrow".to_string(),
                max_connections: 1,
                acquire_timeout_seconds: 1,
            },
            locations: two_locations(),
            rate_limit_sleep_seconds: 0.0,
        };

        let err = run_once(&settings).await.unwrap_err();

        assert!(matches!(err, PipelineError::Store(StoreError::Connect(_))));
    }
}
