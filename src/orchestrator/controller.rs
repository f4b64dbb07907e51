//! View lifecycle controller.
//!
//! Drives the coordinator from presentation-layer commands and merges source results as they
//! arrive.

use super::coordinator::TimelineCoordinator;
use crate::engine::TimelineBackend;
use crate::model::RunSnapshot;
use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;

/// Commands emitted by UI layers to change what is being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ViewCommand {
    View(Option<String>),
    Quit,
}

/// Run until quit (or, with `exit_on_complete`, until the viewed run finishes) and return the
/// final snapshot. The coordinator is torn down on return.
pub(crate) async fn run_controller<B: TimelineBackend>(
    mut coordinator: TimelineCoordinator<B>,
    mut cmd_rx: UnboundedReceiver<ViewCommand>,
    exit_on_complete: bool,
) -> Result<RunSnapshot> {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ViewCommand::View(run_id)) => coordinator.set_viewed_run(run_id),
                    Some(ViewCommand::Quit) | None => break,
                }
            }
            Some(envelope) = coordinator.next_message() => {
                coordinator.apply(envelope);
                if exit_on_complete && coordinator.is_complete() {
                    break;
                }
            }
        }
    }

    tracing::debug!(
        run_id = ?coordinator.viewed_run(),
        generation = coordinator.generation(),
        "controller stopping"
    );
    let snapshot = coordinator.snapshot();
    coordinator.shutdown();
    Ok(snapshot)
}
