//! # nodewatch-core — Node presence synchronization
//!
//! Turns a live membership feed into one authoritative snapshot of active
//! cluster nodes and fans every change out to observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  FeedEvent   ┌─────────────┐  PresenceEvent  ┌───────────────┐
//! │ FeedClient  │ ───────────► │ normalize   │ ──────────────► │ PresenceStore │
//! │ (WebSocket) │   (mpsc)     │ (validate)  │    dispatch()   │ reduce()      │
//! └─────────────┘              └─────────────┘                 └───────┬───────┘
//!                                                                      │ Arc<Snapshot>
//!                                                              ┌───────┴─────────┐
//!                                                              │ SubscriptionHub │
//!                                                              │ (fan-out)       │
//!                                                              └───────┬─────────┘
//!                                                                      ▼
//!                                                                  observers
//! ```
//!
//! Data flows one way. Observers never mutate a snapshot; they may only
//! dispatch new events, which are queued until the current notification
//! pass completes.
//!
//! ## Modules
//!
//! - [`protocol`] — Feed frames (JSON text or bincode binary)
//! - [`normalize`] — Frame validation into typed events
//! - [`presence`] — Snapshot model, pure reducer and the store
//! - [`broadcast`] — Observer registry and synchronous fan-out
//! - [`client`] — WebSocket feed client
//! - [`driver`] — Feed → store pump
//! - [`observers`] — Stock observers

pub mod protocol;
pub mod normalize;
pub mod presence;
pub mod broadcast;
pub mod client;
pub mod driver;
pub mod observers;

// Re-exports for convenience
pub use protocol::{FeedFrame, FieldTypeError, FramePayload, ProtocolError, RawNode};
pub use normalize::{normalize_frame, normalize_nodes, normalize_text, NormalizeError};
pub use presence::{
    reduce, DispatchOutcome, Node, NodeId, PresenceEvent, PresenceStore, Snapshot, SnapshotDiff,
    WeakPresenceStore,
};
pub use broadcast::{
    HubStats, NotifyReport, ObserverError, ObserverFailure, ObserverId, PresenceObserver,
    Subscription, SubscriptionHub,
};
pub use client::{ConnectionState, FeedClient, FeedConfig, FeedError, FeedEvent};
pub use driver::{pump, PumpStats};
pub use observers::TransitionLogger;
