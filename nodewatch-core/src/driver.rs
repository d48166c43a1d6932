//! Feed → store driver.
//!
//! Runs on the task that owns the [`PresenceStore`]: every frame is
//! normalized and dispatched before the next one is read, so snapshots are
//! applied in exactly the order the feed delivered them.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::FeedEvent;
use crate::normalize::normalize_frame;
use crate::presence::{DispatchOutcome, PresenceStore};

/// Counters for one `pump` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Frames received from the feed
    pub frames: u64,
    /// Frames that published a new snapshot
    pub applied: u64,
    /// Frames whose event left membership unchanged
    pub unchanged: u64,
    /// Housekeeping frames with no membership content
    pub ignored: u64,
    /// Frames rejected by the normalizer
    pub rejected: u64,
}

/// Feed events until the current epoch disconnects or the channel closes.
///
/// `Disconnected` from an epoch that a later `Connected` has superseded is
/// skipped, so reconnecting does not end the pump.
pub async fn pump(store: &PresenceStore, events: &mut mpsc::Receiver<FeedEvent>) -> PumpStats {
    let mut stats = PumpStats::default();
    let mut current: Option<Uuid> = None;

    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Connected { epoch } => {
                match current.replace(epoch) {
                    Some(previous) => log::debug!("Pump moved from epoch {previous} to {epoch}"),
                    None => log::debug!("Pump attached to feed epoch {epoch}"),
                }
            }
            FeedEvent::Frame(frame) => {
                stats.frames += 1;
                match normalize_frame(&frame) {
                    Ok(Some(event)) => match store.dispatch(event) {
                        DispatchOutcome::Changed { .. } => stats.applied += 1,
                        DispatchOutcome::Unchanged => stats.unchanged += 1,
                        // `pump` is async; observers are sync and cannot poll it.
                        DispatchOutcome::Queued => {
                            unreachable!("pump dispatched from inside a notification pass")
                        }
                    },
                    Ok(None) => stats.ignored += 1,
                    Err(e) => {
                        stats.rejected += 1;
                        log::warn!(
                            "Rejected `{}` frame on {}: {e}; keeping snapshot v{}",
                            frame.event,
                            frame.topic,
                            store.snapshot().version()
                        );
                    }
                }
            }
            FeedEvent::Disconnected { epoch } => {
                if current.is_some_and(|c| c != epoch) {
                    log::debug!("Ignoring end of superseded epoch {epoch}");
                    continue;
                }
                log::info!("Feed epoch {epoch} ended");
                break;
            }
        }
    }

    stats
}
