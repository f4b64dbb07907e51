//! Degraded-mode delivery: re-fetch the full history on a fixed interval.

use super::{CurrentRun, SyncError, TimelineBackend};
use crate::model::TimelineEvent;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Growth gate for a polled history: only a strictly larger set can carry new events.
pub(crate) fn has_grown(fetched: usize, accepted: usize) -> bool {
    fetched > accepted
}

/// Parameters for the poll loop of one viewed run.
pub(crate) struct PollParams<B> {
    pub backend: B,
    pub run_id: String,
    pub interval: Duration,
    pub generation: u64,
    pub current: CurrentRun,
}

/// Poll until the run stops being current or `sink` refuses a result.
///
/// The first fetch happens one interval after activation. Fetch errors are handed to `sink`
/// like any other result and do not stop the loop.
pub(crate) async fn run_poll_loop<B, F>(params: PollParams<B>, mut sink: F)
where
    B: TimelineBackend,
    F: FnMut(Result<Vec<TimelineEvent>, SyncError>) -> bool,
{
    let PollParams {
        backend,
        run_id,
        interval,
        generation,
        current,
    } = params;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !current.is_current(generation) {
            tracing::debug!(%run_id, generation, "poll loop superseded");
            return;
        }
        let result = backend.fetch_history(&run_id).await;
        if !current.is_current(generation) {
            tracing::debug!(%run_id, generation, "discarding stale poll result");
            return;
        }
        if !sink(result) {
            return;
        }
    }
}
