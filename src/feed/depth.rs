//! Diff-depth WebSocket client
//!
//! Connects to `<symbol>@depth@100ms` and forwards parsed events over an
//! mpsc channel. Reconnects with exponential backoff (1s, 2s, 4s, ...,
//! capped); the order-book resync protocol upstream handles whatever ids
//! were missed while disconnected.

use crate::feed::types::DiffDepthEvent;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Maximum reconnection delay
const MAX_RECONNECT_DELAY_SECS: u64 = 30;

pub struct DepthStreamClient {
    symbol: String,
    url: String,
    sender: mpsc::Sender<DiffDepthEvent>,
}

impl DepthStreamClient {
    /// Returns the client handle and the receiving end of the event channel.
    /// The channel is bounded; if the pipeline falls behind, sends block the
    /// reader task (back-pressure), never the engine loop.
    pub fn new(
        ws_base_url: &str,
        symbol: &str,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<DiffDepthEvent>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let url = format!("{}/{}@depth@100ms", ws_base_url, symbol.to_lowercase());
        (
            Self {
                symbol: symbol.to_uppercase(),
                url,
                sender,
            },
            receiver,
        )
    }

    /// Spawn the connection loop with exponential-backoff reconnect
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut retry_count = 0u32;
            loop {
                match self.connect_and_pump().await {
                    Ok(()) => {
                        info!(symbol = %self.symbol, "Depth stream receiver dropped, stopping");
                        break;
                    }
                    Err(e) => {
                        let delay_secs =
                            std::cmp::min(2_u64.saturating_pow(retry_count), MAX_RECONNECT_DELAY_SECS);
                        warn!(
                            symbol = %self.symbol,
                            error = %e,
                            retry_count,
                            delay_secs,
                            "Depth stream disconnected, reconnecting with backoff"
                        );
                        sleep(Duration::from_secs(delay_secs)).await;
                        retry_count = (retry_count + 1).min(10);
                    }
                }
            }
        })
    }

    async fn connect_and_pump(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(symbol = %self.symbol, url = %self.url, "Connecting to depth stream");
        let (ws_stream, _) = connect_async(&self.url).await?;
        info!(symbol = %self.symbol, "Depth stream connected");

        let (mut write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<DiffDepthEvent>(&text) {
                    Ok(update) => {
                        debug!(
                            symbol = %self.symbol,
                            first_update_id = update.first_update_id,
                            final_update_id = update.final_update_id,
                            "Received depth diff"
                        );
                        if self.sender.send(update).await.is_err() {
                            // Receiver gone: engine is shutting down.
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        error!(symbol = %self.symbol, error = %e, "Failed to parse depth diff");
                    }
                },
                Ok(Message::Ping(data)) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        warn!(symbol = %self.symbol, "Failed to send pong");
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(symbol = %self.symbol, frame = ?frame, "Depth stream closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "Depth stream error");
                    break;
                }
            }
        }

        Err("depth stream disconnected".into())
    }
}
