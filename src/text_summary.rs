//! Text rendering for CLI output.
//!
//! Formats timeline events as they arrive and a per-run summary once the view ends.

use crate::model::{Category, EventKind, RunSnapshot, TerminalStatus, TimelineEvent};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn category_label(category: Category) -> &'static str {
    match category {
        Category::Lifecycle => "lifecycle",
        Category::Perception => "perceive",
        Category::Cognition => "think",
        Category::Action => "act",
        Category::Success => "success",
        Category::Failure => "failure",
        Category::Retry => "retry",
        Category::Data => "data",
        Category::Generic => "event",
    }
}

fn metadata_str<'a>(event: &'a TimelineEvent, key: &str) -> Option<&'a str> {
    event.metadata.as_ref()?.get(key)?.as_str()
}

/// Kind-specific detail pulled from metadata, when the keys happen to be present.
fn metadata_hint(event: &TimelineEvent) -> Option<String> {
    let meta = event.metadata.as_ref()?;
    match event.kind {
        EventKind::CodeDiff => metadata_str(event, "filepath").map(|p| format!("file {p}")),
        EventKind::VisualAnalysis => {
            let confidence = meta.get("confidence").and_then(|v| v.as_f64());
            let issues = meta
                .get("issues")
                .and_then(|v| v.as_array())
                .map(|a| a.len());
            match (confidence, issues) {
                (Some(c), Some(n)) => {
                    Some(format!("confidence {:.0}%, {n} issue(s)", c * 100.0))
                }
                (Some(c), None) => Some(format!("confidence {:.0}%", c * 100.0)),
                (None, Some(n)) => Some(format!("{n} issue(s)")),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

/// One line per accepted event, numbered from 1.
pub(crate) fn format_event(index: usize, event: &TimelineEvent) -> String {
    let label = category_label(event.kind.category());
    let mut line = format!("{:>3}  [{label:<9}] {}", index + 1, event.title);
    if let EventKind::Other(raw) = &event.kind {
        line.push_str(&format!(" ({raw})"));
    }
    let description = event.description.trim();
    if !description.is_empty() {
        let first = description.lines().next().unwrap_or(description);
        line.push_str(" - ");
        line.push_str(first);
    }
    if let Some(hint) = metadata_hint(event) {
        line.push_str(&format!(" [{hint}]"));
    }
    line
}

pub(crate) fn completion_line(run_id: &str, status: TerminalStatus) -> String {
    match status {
        TerminalStatus::Success => format!("Run {run_id} finished: success"),
        TerminalStatus::Failure => format!("Run {run_id} finished: failure"),
    }
}

/// Build a summary of the final state of a view.
pub(crate) fn build_text_summary(snapshot: &RunSnapshot) -> TextSummary {
    let mut lines = Vec::new();
    let Some(run_id) = snapshot.run_id.as_deref() else {
        lines.push("No run selected".to_string());
        return TextSummary { lines };
    };

    lines.push(format!("Run: {run_id}"));

    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    for event in &snapshot.events {
        let label = category_label(event.kind.category());
        match counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, n)) => *n += 1,
            None => counts.push((label, 1)),
        }
    }
    let breakdown = counts
        .iter()
        .map(|(label, n)| format!("{label} {n}"))
        .collect::<Vec<_>>()
        .join(", ");
    if breakdown.is_empty() {
        lines.push("Events: 0".to_string());
    } else {
        lines.push(format!("Events: {} ({breakdown})", snapshot.events.len()));
    }

    match (snapshot.complete, snapshot.terminal_status) {
        (true, Some(status)) => lines.push(format!("Status: {status}")),
        _ => lines.push(format!("Status: in progress ({:?})", snapshot.source)),
    }
    if let Some(err) = snapshot.last_error.as_deref() {
        lines.push(format!("Last error: {err}"));
    }

    TextSummary { lines }
}
