//! Plain-text node list.
//!
//! Redraws the whole list on every published snapshot:
//!
//! ```text
//! Active Nodes (v3)
//!   Node: n1
//!   Type: worker
//!
//!   Node: n2
//!   Type: gateway
//! ```

use std::io::Write;
use std::sync::Arc;

use nodewatch_core::broadcast::{ObserverError, PresenceObserver, Subscription};
use nodewatch_core::presence::{PresenceStore, Snapshot};

/// Renders each snapshot to a writer (stdout in the binary).
pub struct NodeListView<W: Write> {
    out: W,
    renders: u64,
}

impl<W: Write> NodeListView<W> {
    pub fn new(out: W) -> Self {
        Self { out, renders: 0 }
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, snapshot: &Snapshot) -> std::io::Result<()> {
        writeln!(self.out, "Active Nodes (v{})", snapshot.version())?;
        if snapshot.is_empty() {
            writeln!(self.out, "  (none)")?;
        }
        for (i, node) in snapshot.active_nodes().iter().enumerate() {
            if i > 0 {
                writeln!(self.out)?;
            }
            writeln!(self.out, "  Node: {}", node.id)?;
            writeln!(self.out, "  Type: {}", node.kind)?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}

impl<W: Write + 'static> NodeListView<W> {
    /// Draw the store's current snapshot, then follow every change.
    pub fn attach(mut self, store: &PresenceStore) -> Result<Subscription, ObserverError> {
        self.on_snapshot(&store.snapshot())?;
        Ok(store.subscribe(self))
    }
}

impl<W: Write> PresenceObserver for NodeListView<W> {
    fn on_snapshot(&mut self, snapshot: &Arc<Snapshot>) -> Result<(), ObserverError> {
        self.render(snapshot)?;
        self.renders += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "node-list-view"
    }
}
