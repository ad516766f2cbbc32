use std::{error::Error, fmt::Debug, future::Future, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::error::report;

/// Run `job` immediately, then once per `period`, until `shutdown` resolves.
///
/// Runs never overlap: a tick that comes due while a run is in progress is coalesced
/// into a single run started as soon as the current one returns. A failing run is logged
/// and the loop waits for the next tick. Shutdown takes priority over a due tick.
/// Returns the number of runs started.
pub async fn run_every<F, Fut, T, E>(
    period: Duration,
    shutdown: impl Future<Output = ()>,
    mut job: F,
) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Debug,
    E: Error + 'static,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(period_secs = period.as_secs_f64(), "Scheduler started");
    let mut runs = 0;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!(runs, "Scheduler shutting down gracefully");
                break;
            }
            _ = ticker.tick() => {
                runs += 1;
                let kind = if runs == 1 { "bootstrap" } else { "scheduled" };
                info!(run = runs, kind, "Run started");

                match job().await {
                    Ok(outcome) => info!(run = runs, ?outcome, "Run finished"),
                    Err(err) => error!(
                        run = runs,
                        error = %report(&err),
                        "Run failed; waiting for next trigger"
                    ),
                }
            }
        }
    }

    runs
}
