use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub base_url: String,
    /// How long the live channel may stay unopened before polling starts.
    #[serde(with = "humantime_serde")]
    pub grace_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            grace_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            user_agent: format!("run-timeline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Semantic category of a timeline event as published by the job backend.
///
/// Unknown wire values are kept verbatim in `Other` so they can still be shown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    MissionStart,
    MissionEnd,
    Cloning,
    Scouting,
    ReadingCode,
    Thinking,
    Analyzing,
    Diagnosing,
    ApplyingFix,
    Verifying,
    CreatingPr,
    Success,
    Failure,
    Retry,
    CodeDiff,
    ErrorLog,
    ThoughtStream,
    Screenshot,
    VisualAnalysis,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Lifecycle,
    Perception,
    Cognition,
    Action,
    Success,
    Failure,
    Retry,
    Data,
    Generic,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::MissionStart => "mission_start",
            EventKind::MissionEnd => "mission_end",
            EventKind::Cloning => "cloning",
            EventKind::Scouting => "scouting",
            EventKind::ReadingCode => "reading_code",
            EventKind::Thinking => "thinking",
            EventKind::Analyzing => "analyzing",
            EventKind::Diagnosing => "diagnosing",
            EventKind::ApplyingFix => "applying_fix",
            EventKind::Verifying => "verifying",
            EventKind::CreatingPr => "creating_pr",
            EventKind::Success => "success",
            EventKind::Failure => "failure",
            EventKind::Retry => "retry",
            EventKind::CodeDiff => "code_diff",
            EventKind::ErrorLog => "error_log",
            EventKind::ThoughtStream => "thought_stream",
            EventKind::Screenshot => "screenshot",
            EventKind::VisualAnalysis => "visual_analysis",
            EventKind::Other(raw) => raw,
        }
    }

    /// `success`, `failure` and `mission_end` end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Success | EventKind::Failure | EventKind::MissionEnd
        )
    }

    pub fn category(&self) -> Category {
        match self {
            EventKind::MissionStart | EventKind::MissionEnd => Category::Lifecycle,
            EventKind::Cloning | EventKind::Scouting | EventKind::ReadingCode => {
                Category::Perception
            }
            EventKind::Thinking
            | EventKind::Analyzing
            | EventKind::Diagnosing
            | EventKind::ThoughtStream => Category::Cognition,
            EventKind::ApplyingFix | EventKind::Verifying | EventKind::CreatingPr => {
                Category::Action
            }
            EventKind::Success => Category::Success,
            EventKind::Failure => Category::Failure,
            EventKind::Retry => Category::Retry,
            EventKind::CodeDiff
            | EventKind::ErrorLog
            | EventKind::Screenshot
            | EventKind::VisualAnalysis => Category::Data,
            EventKind::Other(_) => Category::Generic,
        }
    }
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "mission_start" => EventKind::MissionStart,
            "mission_end" => EventKind::MissionEnd,
            "cloning" => EventKind::Cloning,
            "scouting" => EventKind::Scouting,
            "reading_code" => EventKind::ReadingCode,
            "thinking" => EventKind::Thinking,
            "analyzing" => EventKind::Analyzing,
            "diagnosing" => EventKind::Diagnosing,
            "applying_fix" => EventKind::ApplyingFix,
            "verifying" => EventKind::Verifying,
            "creating_pr" => EventKind::CreatingPr,
            "success" => EventKind::Success,
            "failure" => EventKind::Failure,
            "retry" => EventKind::Retry,
            "code_diff" => EventKind::CodeDiff,
            "error_log" => EventKind::ErrorLog,
            "thought_stream" => EventKind::ThoughtStream,
            "screenshot" => EventKind::Screenshot,
            "visual_analysis" => EventKind::VisualAnalysis,
            _ => EventKind::Other(raw),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    // History responses omit the run id; callers fill it in.
    #[serde(default)]
    pub run_id: String,
    #[serde(rename = "event_type", alias = "kind")]
    pub kind: EventKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Opaque identity and ordering key. Never parsed.
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Failure,
}

impl TerminalStatus {
    /// `Success` if any event is of kind `success`, otherwise `Failure`.
    pub fn resolve(events: &[TimelineEvent]) -> Self {
        if events.iter().any(|e| e.kind == EventKind::Success) {
            TerminalStatus::Success
        } else {
            TerminalStatus::Failure
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Success => f.write_str("success"),
            TerminalStatus::Failure => f.write_str("failure"),
        }
    }
}

/// Which data source is currently feeding the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourcePhase {
    #[default]
    Idle,
    LoadingHistory,
    Live,
    LiveWithPolling,
    Finished,
}

/// Observable state of the viewed run, safe to hand to renderers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Option<String>,
    pub events: Vec<TimelineEvent>,
    pub connected: bool,
    pub complete: bool,
    pub terminal_status: Option<TerminalStatus>,
    pub last_error: Option<String>,
    pub source: SourcePhase,
}

/// Final `--json` output: the settings the view ran with plus its last snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub config: SyncConfig,
    #[serde(flatten)]
    pub snapshot: RunSnapshot,
}

/// Change feed emitted by the coordinator and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum TimelineUpdate {
    Viewing {
        run_id: Option<String>,
    },
    Appended {
        index: usize,
        event: TimelineEvent,
    },
    Connectivity {
        connected: bool,
    },
    Status(String),
    Completed {
        run_id: String,
        status: TerminalStatus,
    },
}

#[cfg(test)]
pub(crate) fn event(kind: &str, timestamp: &str) -> TimelineEvent {
    TimelineEvent {
        run_id: String::new(),
        kind: EventKind::from(kind.to_string()),
        title: format!("{kind} at {timestamp}"),
        description: String::new(),
        timestamp: timestamp.to_string(),
        metadata: None,
    }
}
