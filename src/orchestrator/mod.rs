//! Application-level orchestration.
//!
//! The coordinator owns the viewed run's session and merges its sources; the controller drives
//! it from UI/CLI commands. Presentation layers only see snapshots and the update feed.

mod controller;
mod coordinator;

pub(crate) use controller::{run_controller, ViewCommand};
pub(crate) use coordinator::TimelineCoordinator;
