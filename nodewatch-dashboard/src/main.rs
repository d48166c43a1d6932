//! Nodewatch dashboard: live list of active cluster nodes.
//!
//! Connects to the membership feed, keeps a `PresenceStore` current and
//! redraws the node list on stdout whenever membership changes.
//! `RUST_LOG` controls logging (default `info`).

mod config;
mod view;

use log::{error, info};
use nodewatch_core::client::FeedClient;
use nodewatch_core::driver::pump;
use nodewatch_core::observers::TransitionLogger;
use nodewatch_core::presence::PresenceStore;

use config::DashboardConfig;
use view::NodeListView;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = DashboardConfig::from_env();
    info!("Starting Nodewatch dashboard (feed {}, topic {})", config.feed.url, config.feed.topic);

    let store = PresenceStore::new();
    let _logger = store.subscribe(TransitionLogger::new());
    let _view = match NodeListView::new(std::io::stdout()).attach(&store) {
        Ok(sub) => sub,
        Err(e) => {
            error!("Cannot draw node list: {e}");
            std::process::exit(1);
        }
    };

    let mut client = FeedClient::new(config.feed);
    let Some(mut events) = client.take_event_rx() else {
        error!("Feed event channel unavailable");
        std::process::exit(1);
    };

    if let Err(e) = client.connect().await {
        error!("{e}");
        std::process::exit(1);
    }

    tokio::select! {
        stats = pump(&store, &mut events) => {
            info!(
                "Feed ended: {} frames, {} applied, {} unchanged, {} ignored, {} rejected",
                stats.frames, stats.applied, stats.unchanged, stats.ignored, stats.rejected
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, leaving feed");
            if let Err(e) = client.disconnect().await {
                error!("Disconnect failed: {e}");
            }
        }
    }

    let stats = store.hub_stats();
    info!(
        "Shut down at snapshot v{} ({} notifications, {} observer failures)",
        store.snapshot().version(),
        stats.notifications_sent,
        stats.observer_failures
    );
}
