//! Idempotent insertion for timeline events.
//!
//! The `timestamp` is the only field unique per logical event in the backend, so it is the
//! identity key. One `SeenSet` lives for the whole viewed run and is shared by every source.

use crate::model::TimelineEvent;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct SeenSet {
    keys: HashSet<String>,
}

impl SeenSet {
    /// Accept `candidate` iff its timestamp has not been seen; records the key on acceptance.
    pub fn accept(&mut self, candidate: &TimelineEvent) -> bool {
        if self.keys.contains(&candidate.timestamp) {
            return false;
        }
        self.keys.insert(candidate.timestamp.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
