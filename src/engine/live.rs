//! Live channel over the backend's server-sent event stream.
//!
//! Transport frames are normalised into [`SseFrame`] so the channel state machine can be fed by
//! `reqwest-eventsource` in production and by scripted streams in tests.

use crate::model::TimelineEvent;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::Url;
use reqwest_eventsource::retry::ExponentialBackoff;
use reqwest_eventsource::{Event, EventSource};
use std::time::Duration;

/// Reserved event names that never carry a timeline event.
const CONTROL_CONNECTED: &str = "connected";
const CONTROL_COMPLETE: &str = "complete";
const CONTROL_DISCONNECTED: &str = "disconnected";

/// Raw transport frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Open,
    Message { name: String, data: String },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TerminalEvent,
    CompleteSignal,
    SourceEnded,
}

/// What the live channel reports to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveSignal {
    Opened,
    Event(TimelineEvent),
    TransportError(String),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Degraded,
    Closed,
}

/// `Connecting -> Open -> (Degraded <-> Open)* -> Closed`.
#[derive(Debug)]
pub struct LiveChannel {
    run_id: String,
    state: ChannelState,
}

impl LiveChannel {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: ChannelState::Connecting,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn open(&mut self, out: &mut Vec<LiveSignal>) {
        if self.state != ChannelState::Open {
            self.state = ChannelState::Open;
            out.push(LiveSignal::Opened);
        }
    }

    pub fn on_frame(&mut self, frame: SseFrame) -> Vec<LiveSignal> {
        let mut out = Vec::new();
        if self.state == ChannelState::Closed {
            return out;
        }
        match frame {
            SseFrame::Open => self.open(&mut out),
            SseFrame::Error(message) => match self.state {
                ChannelState::Open => {
                    self.state = ChannelState::Degraded;
                    out.push(LiveSignal::TransportError(message));
                }
                ChannelState::Connecting => out.push(LiveSignal::TransportError(message)),
                // Already degraded: the transport is still retrying.
                ChannelState::Degraded | ChannelState::Closed => {
                    tracing::debug!(
                        run_id = %self.run_id,
                        error = %message,
                        "transport still failing"
                    );
                }
            },
            SseFrame::Message { name, data } => match name.as_str() {
                CONTROL_CONNECTED => self.open(&mut out),
                CONTROL_COMPLETE => {
                    self.state = ChannelState::Closed;
                    out.push(LiveSignal::Closed(CloseReason::CompleteSignal));
                }
                CONTROL_DISCONNECTED => {}
                _ => {
                    // Data implies a working transport even if the open frame was missed.
                    self.open(&mut out);
                    if let Some(event) = self.decode(&name, &data) {
                        let terminal = event.kind.is_terminal();
                        out.push(LiveSignal::Event(event));
                        if terminal {
                            self.state = ChannelState::Closed;
                            out.push(LiveSignal::Closed(CloseReason::TerminalEvent));
                        }
                    }
                }
            },
        }
        out
    }

    /// The underlying stream finished without a close having been observed.
    pub fn on_end(&mut self) -> Option<LiveSignal> {
        if self.state == ChannelState::Closed {
            return None;
        }
        self.state = ChannelState::Closed;
        Some(LiveSignal::Closed(CloseReason::SourceEnded))
    }

    fn decode(&self, name: &str, data: &str) -> Option<TimelineEvent> {
        let mut value: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    event = name,
                    error = %e,
                    "dropping undecodable stream message"
                );
                return None;
            }
        };
        // The event name is the kind; payloads may omit it.
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key("event_type") && !obj.contains_key("kind") {
                obj.insert("event_type".into(), serde_json::Value::from(name));
            }
        }
        match serde_json::from_value::<TimelineEvent>(value) {
            Ok(mut event) => {
                if event.run_id.is_empty() {
                    event.run_id = self.run_id.clone();
                } else if event.run_id != self.run_id {
                    tracing::warn!(
                        run_id = %self.run_id,
                        foreign = %event.run_id,
                        event = name,
                        "dropping stream event for another run"
                    );
                    return None;
                }
                Some(event)
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    event = name,
                    error = %e,
                    "dropping malformed timeline event"
                );
                None
            }
        }
    }
}

/// Drive a live channel to completion, handing each signal to `sink`.
///
/// Returns when the channel closes, the frames run out, or `sink` refuses a signal. Dropping
/// `frames` on return tears the subscription down.
pub(crate) async fn run_live_channel<S, F>(frames: S, run_id: String, mut sink: F)
where
    S: Stream<Item = SseFrame> + Unpin,
    F: FnMut(LiveSignal) -> bool,
{
    let mut frames = frames;
    let mut channel = LiveChannel::new(run_id);
    while let Some(frame) = frames.next().await {
        for signal in channel.on_frame(frame) {
            if !sink(signal) {
                return;
            }
        }
        if channel.state() == ChannelState::Closed {
            return;
        }
    }
    if let Some(signal) = channel.on_end() {
        let _ = sink(signal);
    }
}

/// Open an SSE subscription; the event source retries with exponential backoff on its own.
pub(crate) fn sse_frames(
    http: &reqwest::Client,
    url: Url,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
) -> BoxStream<'static, SseFrame> {
    let mut source = match EventSource::new(http.get(url)) {
        Ok(source) => source,
        Err(e) => return failed_stream(e.to_string()),
    };
    source.set_retry_policy(Box::new(ExponentialBackoff::new(
        reconnect_delay,
        2.0,
        Some(max_reconnect_delay),
        None,
    )));
    source
        .map(|item| match item {
            Ok(Event::Open) => SseFrame::Open,
            Ok(Event::Message(msg)) => SseFrame::Message {
                name: msg.event,
                data: msg.data,
            },
            Err(e) => SseFrame::Error(e.to_string()),
        })
        .boxed()
}

/// A stream that reports a single transport error and ends.
pub(crate) fn failed_stream(message: String) -> BoxStream<'static, SseFrame> {
    stream::once(async move { SseFrame::Error(message) }).boxed()
}
