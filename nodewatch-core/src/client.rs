//! WebSocket feed client: the boundary between the membership feed and the
//! presence core.
//!
//! Provides:
//! - One connection epoch per [`FeedClient::connect`] (no reconnect loop).
//!   Connecting again supersedes the previous epoch: its reader is stopped
//!   and its socket closed, so it emits nothing further.
//! - Channel join for the configured topic, plus periodic heartbeats
//! - Ordered delivery of decoded frames as [`FeedEvent`]s
//!
//! Frames are forwarded in the order the socket delivered them. The client
//! never touches presence state; a driver on the store's task consumes the
//! event receiver (see [`crate::driver::pump`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{FeedFrame, ProtocolError};

/// Feed client configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket URL of the feed socket
    pub url: String,
    /// Channel topic carrying membership events
    pub topic: String,
    /// Capacity of the event channel handed to the driver
    pub event_buffer: usize,
    /// Heartbeat interval in seconds (0 disables heartbeats)
    pub heartbeat_interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/socket/websocket?vsn=1.0.0".to_string(),
            topic: "nodes:lobby".to_string(),
            event_buffer: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the feed client, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Socket open and channel join sent
    Connected { epoch: Uuid },
    /// A decoded frame from the feed
    Frame(FeedFrame),
    /// Socket closed or failed; no more frames for this epoch
    Disconnected { epoch: Uuid },
}

/// Feed client errors.
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    /// The socket could not be opened
    #[error("Connect failed: {0}")]
    Connect(String),
    /// A frame could not be encoded
    #[error("Send failed: {0}")]
    Send(#[from] ProtocolError),
    /// Operation requires an open connection
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Decode one socket message into a frame.
///
/// `Ok(None)` for messages that carry no frame (ping/pong, raw frames).
fn decode_message(msg: &Message) -> Result<Option<FeedFrame>, ProtocolError> {
    match msg {
        Message::Text(text) => FeedFrame::from_json(text.as_str()).map(Some),
        Message::Binary(data) => FeedFrame::decode(data).map(Some),
        _ => Ok(None),
    }
}

/// The feed client.
pub struct FeedClient {
    config: FeedConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Current connection epoch
    epoch: Option<Uuid>,

    /// Monotonic frame reference counter
    next_ref: Arc<AtomicU64>,

    /// Channel to the socket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the driver
    event_rx: Option<mpsc::Receiver<FeedEvent>>,

    /// Event sender (cloned into the reader task)
    event_tx: mpsc::Sender<FeedEvent>,

    /// Reader task of the current epoch
    reader: Option<JoinHandle<()>>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            epoch: None,
            next_ref: Arc::new(AtomicU64::new(1)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reader: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<FeedEvent>> {
        self.event_rx.take()
    }

    /// Open the socket, join the topic and start the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<Uuid, FeedError> {
        self.supersede();
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(FeedError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let epoch = Uuid::new_v4();
        self.epoch = Some(epoch);

        // Writer task: outgoing channel + heartbeats → socket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        self.outgoing_tx = Some(out_tx);
        let heartbeat_secs = self.config.heartbeat_interval_secs;
        let next_ref = self.next_ref.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(heartbeat_secs.max(1));
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                let msg = tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                        let reference = next_ref.fetch_add(1, Ordering::Relaxed);
                        match FeedFrame::heartbeat(reference).to_json() {
                            Ok(json) => Message::Text(json.into()),
                            Err(e) => {
                                log::warn!("Failed to encode heartbeat: {e}");
                                continue;
                            }
                        }
                    }
                };
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        self.send_frame(FeedFrame::join(self.config.topic.clone(), self.next_reference()))
            .await?;

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Feed connected to {} (epoch {epoch})", self.config.url);
        let _ = self.event_tx.send(FeedEvent::Connected { epoch }).await;

        // Reader task: socket → ordered event channel
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Close(_)) => break,
                    Ok(msg) => match decode_message(&msg) {
                        Ok(Some(frame)) => {
                            if event_tx.send(FeedEvent::Frame(frame)).await.is_err() {
                                // Driver is gone; nobody left to deliver to.
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Skipping undecodable feed frame: {e}"),
                    },
                    Err(e) => {
                        log::error!("Feed socket error (epoch {epoch}): {e}");
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            log::info!("Feed disconnected (epoch {epoch})");
            let _ = event_tx.send(FeedEvent::Disconnected { epoch }).await;
        }));

        Ok(epoch)
    }

    /// Stop the previous epoch's reader and close its socket.
    fn supersede(&mut self) {
        if let Some(reader) = self.reader.take() {
            if !reader.is_finished() {
                if let Some(epoch) = self.epoch {
                    log::info!("Superseding feed epoch {epoch}");
                }
            }
            reader.abort();
        }
        // Dropping the sender ends the old writer, which closes the socket.
        self.outgoing_tx = None;
    }

    /// Queue a frame for the socket writer.
    pub async fn send_frame(&self, frame: FeedFrame) -> Result<(), FeedError> {
        let json = frame.to_json()?;
        let tx = self.outgoing_tx.as_ref().ok_or(FeedError::ConnectionClosed)?;
        tx.send(Message::Text(json.into()))
            .await
            .map_err(|_| FeedError::ConnectionClosed)
    }

    /// Leave the topic and close the socket.
    pub async fn disconnect(&mut self) -> Result<(), FeedError> {
        let leave = FeedFrame::leave(self.config.topic.clone(), self.next_reference());
        self.send_frame(leave).await?;
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        Ok(())
    }

    fn next_reference(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Epoch of the most recent connection.
    pub fn epoch(&self) -> Option<Uuid> {
        self.epoch
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }
}
