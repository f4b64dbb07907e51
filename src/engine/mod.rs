//! Data sources for a run timeline: one-shot history, the live SSE channel, and the poll loop.

pub(crate) mod history;
pub(crate) mod live;
pub(crate) mod poll;

use crate::model::TimelineEvent;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;

pub(crate) use history::HttpBackend;
pub(crate) use live::{CloseReason, LiveSignal, SseFrame};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    FetchStatus { status: u16, url: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

/// The job backend as seen by the timeline engine.
///
/// `fetch_history` must be idempotent; `open_stream` yields raw transport frames and owns its
/// own reconnects. Dropping the stream closes the subscription.
pub trait TimelineBackend: Clone + Send + Sync + 'static {
    fn fetch_history(&self, run_id: &str)
        -> BoxFuture<'static, Result<Vec<TimelineEvent>, SyncError>>;

    fn open_stream(&self, run_id: &str) -> BoxStream<'static, SseFrame>;
}

/// Shared cell holding the generation of the currently viewed run.
///
/// Every pending operation carries the generation it was issued for and compares it here
/// before touching session state or re-arming itself.
#[derive(Debug, Clone, Default)]
pub struct CurrentRun(Arc<AtomicU64>);

impl CurrentRun {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.get() == generation
    }

    /// Invalidate every outstanding operation and return the new generation.
    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}
