//! Aggregated-trade WebSocket client
//!
//! Connects to `<symbol>@aggTrade` and forwards parsed events over an mpsc
//! channel, with the same reconnect policy as the depth stream.

use crate::feed::types::AggTradeEvent;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const MAX_RECONNECT_DELAY_SECS: u64 = 60;

pub struct TradeStreamClient {
    symbol: String,
    url: String,
    sender: mpsc::Sender<AggTradeEvent>,
}

impl TradeStreamClient {
    pub fn new(
        ws_base_url: &str,
        symbol: &str,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<AggTradeEvent>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let url = format!("{}/{}@aggTrade", ws_base_url, symbol.to_lowercase());
        (
            Self {
                symbol: symbol.to_uppercase(),
                url,
                sender,
            },
            receiver,
        )
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut retry_delay = Duration::from_secs(1);
            loop {
                match self.connect_and_pump().await {
                    Ok(()) => {
                        info!(symbol = %self.symbol, "Trade stream receiver dropped, stopping");
                        break;
                    }
                    Err(e) => {
                        error!(
                            symbol = %self.symbol,
                            error = %e,
                            retry_delay_secs = retry_delay.as_secs(),
                            "Trade stream disconnected, retrying"
                        );
                    }
                }
                sleep(retry_delay).await;
                retry_delay =
                    std::cmp::min(retry_delay * 2, Duration::from_secs(MAX_RECONNECT_DELAY_SECS));
            }
        })
    }

    async fn connect_and_pump(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(symbol = %self.symbol, url = %self.url, "Connecting to aggTrade stream");
        let (ws_stream, _) = connect_async(&self.url).await?;
        info!(symbol = %self.symbol, "Trade stream connected");

        let (mut write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<AggTradeEvent>(&text) {
                    Ok(trade) => {
                        debug!(
                            symbol = %trade.symbol,
                            price = %trade.price,
                            quantity = %trade.quantity,
                            "Received aggTrade"
                        );
                        if self.sender.send(trade).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(symbol = %self.symbol, error = %e, "Failed to parse aggTrade");
                    }
                },
                Ok(Message::Ping(data)) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        warn!(symbol = %self.symbol, "Failed to send pong");
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(symbol = %self.symbol, frame = ?frame, "Trade stream closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "Trade stream error");
                    break;
                }
            }
        }

        Err("trade stream disconnected".into())
    }
}
