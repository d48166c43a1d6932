//! Stock observers.

use std::sync::Arc;

use crate::broadcast::{ObserverError, PresenceObserver};
use crate::presence::Snapshot;

/// Logs every membership transition as it is published.
///
/// Keeps the previously seen snapshot so each line can name what joined,
/// what left and what changed kind.
pub struct TransitionLogger {
    previous: Arc<Snapshot>,
    transitions: u64,
}

impl TransitionLogger {
    pub fn new() -> Self {
        Self {
            previous: Arc::new(Snapshot::empty()),
            transitions: 0,
        }
    }

    /// Number of transitions logged so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}

impl Default for TransitionLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceObserver for TransitionLogger {
    fn on_snapshot(&mut self, snapshot: &Arc<Snapshot>) -> Result<(), ObserverError> {
        let diff = snapshot.diff(&self.previous);
        log::info!(
            "Presence v{} -> v{}: {} active (+{} -{} ~{})",
            self.previous.version(),
            snapshot.version(),
            snapshot.len(),
            diff.joined.len(),
            diff.left.len(),
            diff.rekinded.len()
        );
        for id in &diff.joined {
            log::debug!("  joined: {id}");
        }
        for id in &diff.left {
            log::debug!("  left: {id}");
        }
        for id in &diff.rekinded {
            log::debug!("  kind changed: {id}");
        }

        self.previous = Arc::clone(snapshot);
        self.transitions += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "transition-logger"
    }
}
