use thiserror::Error;

/// Failure of the HTTP layer before any status code was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("Rate limit exceeded for {location}; skipping until the next run")]
    RateLimited { location: String },

    #[error("Forecast request for {location} failed with status {status}: {body}")]
    Status {
        location: String,
        status: u16,
        body: String,
    },

    #[error("Forecast request for {location} failed")]
    Transport {
        location: String,
        #[source]
        source: TransportError,
    },

    #[error("Forecast request for {location} gave up after {attempts} attempt(s); last failure: {last}")]
    RetriesExhausted {
        location: String,
        attempts: u32,
        last: String,
    },

    #[error("Failed to parse forecast JSON for {location}")]
    Parse {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed interval timestamp '{value}' for {location}")]
    InvalidTimestamp {
        location: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Forecast client has been closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to PostgreSQL")]
    Connect(#[source] sqlx::Error),

    #[error("Bulk insert of {records} weather record(s) failed")]
    Write {
        records: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to apply database migrations")]
    Migrate(#[source] sqlx::migrate::MigrateError),
}

/// Run-fatal errors: a run cannot start without both collaborators.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to initialize forecast client")]
    Provider(#[source] FetchError),

    #[error("Failed to initialize weather store")]
    Store(#[source] StoreError),
}

/// Render an error with its whole `source()` chain on one line.
pub fn report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_includes_sources() {
        let err = FetchError::Transport {
            location: "25.9,-97.4".to_string(),
            source: TransportError::Timeout,
        };
        assert_eq!(report(&err), "Forecast request for 25.9,-97.4 failed: request timed out");
    }
}
