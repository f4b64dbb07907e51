//! HTTP access to the job backend: history fetches and active-run lookup.

use super::live;
use super::{SyncError, TimelineBackend};
use crate::model::{SyncConfig, TimelineEvent};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    events: Vec<TimelineEvent>,
    // The backend reports its own storage failures in-band with an empty event list.
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestActiveResponse {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    pub http: reqwest::Client,
    pub base_url: Url,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl HttpBackend {
    pub fn new(cfg: &SyncConfig) -> Result<Self, SyncError> {
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|e| SyncError::InvalidBaseUrl(format!("{}: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidBaseUrl(cfg.base_url.clone()));
        }
        // No overall request timeout: the same client carries the long-lived event stream.
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            reconnect_delay: cfg.reconnect_delay,
            max_reconnect_delay: cfg.max_reconnect_delay,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn history_url(&self, run_id: &str) -> Result<Url, SyncError> {
        self.endpoint(&["events", "history", run_id])
    }

    pub fn stream_url(&self, run_id: &str) -> Result<Url, SyncError> {
        self.endpoint(&["events", "stream", run_id])
    }

    /// Look up the most recently started run that is still executing.
    pub async fn latest_active_run(&self) -> Result<Option<String>, SyncError> {
        let url = self.endpoint(&["runs", "latest", "active"])?;
        let resp = self.http.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::FetchStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await?;
        let latest: LatestActiveResponse = serde_json::from_slice(&body)?;
        if latest.run_id.is_none() {
            tracing::info!(
                detail = latest.message.as_deref().unwrap_or(""),
                "no active run reported"
            );
        }
        Ok(latest.run_id.filter(|id| !id.is_empty()))
    }
}

/// Fetch every event recorded so far for `run_id`, in backend (chronological) order.
pub(crate) async fn fetch_history(
    http: &reqwest::Client,
    url: Url,
    run_id: &str,
) -> Result<Vec<TimelineEvent>, SyncError> {
    let resp = http.get(url.clone()).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SyncError::FetchStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let body = resp.bytes().await?;
    let page: HistoryResponse = serde_json::from_slice(&body)?;
    if let Some(err) = page.error.as_deref() {
        tracing::warn!(run_id, error = err, "backend reported a history error");
    }
    let mut events = page.events;
    for ev in &mut events {
        if ev.run_id.is_empty() {
            ev.run_id = run_id.to_string();
        }
    }
    tracing::debug!(run_id, count = events.len(), "history fetched");
    Ok(events)
}

impl TimelineBackend for HttpBackend {
    fn fetch_history(
        &self,
        run_id: &str,
    ) -> BoxFuture<'static, Result<Vec<TimelineEvent>, SyncError>> {
        let url = match self.history_url(run_id) {
            Ok(url) => url,
            Err(e) => return futures::future::ready(Err(e)).boxed(),
        };
        let http = self.http.clone();
        let run_id = run_id.to_string();
        async move { fetch_history(&http, url, &run_id).await }.boxed()
    }

    fn open_stream(&self, run_id: &str) -> BoxStream<'static, live::SseFrame> {
        match self.stream_url(run_id) {
            Ok(url) => live::sse_frames(
                &self.http,
                url,
                self.reconnect_delay,
                self.max_reconnect_delay,
            ),
            Err(e) => live::failed_stream(e.to_string()),
        }
    }
}
