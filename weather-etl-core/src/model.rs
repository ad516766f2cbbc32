use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One hourly interval as produced by the provider and consumed by the store.
///
/// `latitude`/`longitude` are absent in the API payload; the pipeline injects them
/// before the record is handed to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub is_forecast: bool,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation_type: Option<f64>,
}

impl WeatherRecord {
    /// Build a record for `timestamp`, classifying it against the instant the data was fetched.
    pub fn at(timestamp: DateTime<Utc>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            latitude: None,
            longitude: None,
            timestamp,
            is_forecast: timestamp > fetched_at,
            temperature: None,
            wind_speed: None,
            humidity: None,
            precipitation_type: None,
        }
    }

    pub fn with_coordinates(mut self, lat: f64, lon: f64) -> Self {
        self.latitude = Some(lat);
        self.longitude = Some(lon);
        self
    }

    /// The natural key `(latitude, longitude, timestamp, is_forecast)`, if complete.
    pub fn key(&self) -> Option<(f64, f64, DateTime<Utc>, bool)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => {
                Some((lat, lon, self.timestamp, self.is_forecast))
            }
            _ => None,
        }
    }

    pub fn is_storable(&self) -> bool {
        self.key().is_some()
    }
}

/// A configured coordinate pair. Entries missing either field are skipped by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat: Some(lat), lon: Some(lon) }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.lat.zip(self.lon)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: Option<f64>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
        write!(f, "{},{}", show(self.lat), show(self.lon))
    }
}

/// Outcome of one pass over all configured locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    /// Records that passed validation and were submitted to the store.
    pub records_attempted: usize,
    pub locations_loaded: usize,
    pub locations_empty: usize,
    pub locations_skipped: usize,
    pub locations_failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn is_forecast_is_strictly_after_fetch_instant() {
        let now = Utc.with_ymd_and_hms(2025, 12, 15, 15, 0, 0).unwrap();

        assert!(!WeatherRecord::at(now, now).is_forecast);
        assert!(!WeatherRecord::at(now - chrono::Duration::hours(1), now).is_forecast);
        assert!(WeatherRecord::at(now + chrono::Duration::hours(1), now).is_forecast);
    }

    #[test]
    fn record_without_coordinates_is_not_storable() {
        let now = Utc::now();
        let rec = WeatherRecord::at(now, now);
        assert!(!rec.is_storable());

        let rec = rec.with_coordinates(25.9, -97.4);
        assert!(rec.is_storable());

        let nan = WeatherRecord::at(now, now).with_coordinates(f64::NAN, -97.4);
        assert!(!nan.is_storable());
    }

    #[test]
    fn location_display_marks_missing_fields() {
        assert_eq!(Location::new(25.9, -97.4).to_string(), "25.9,-97.4");
        let partial = Location { lat: Some(10.0), lon: None };
        assert_eq!(partial.to_string(), "10,?");
        assert_eq!(partial.coordinates(), None);
    }
}
