//! Streaming market-data feed.
//!
//! A [`TickSource`] opens one connection for a fixed instrument set. Keeping
//! the connection alive across failures and subscription changes is the
//! caller's job; a stream that ends or yields an error means the connection
//! is gone.

use std::pin::Pin;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::types::Tick;
use crate::{Error, Result};

/// Ticks from one connection.
pub type TickStream = Pin<Box<dyn Stream<Item = Result<Tick>> + Send>>;

#[async_trait]
pub trait TickSource: Send + Sync {
    /// Connect and subscribe to `instruments`.
    async fn open(&self, instruments: &[String]) -> Result<TickStream>;
}

#[derive(Serialize)]
struct SubscribeMessage<'a> {
    action: &'static str,
    instruments: &'a [String],
}

/// JSON-over-WebSocket feed.
///
/// Frames carry either one tick object or an array of them.
pub struct WsTickSource {
    ws_url: String,
    ping_interval: StdDuration,
    read_timeout: StdDuration,
}

impl WsTickSource {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ping_interval: StdDuration::from_secs(15),
            read_timeout: StdDuration::from_secs(45),
        }
    }

    pub fn with_keepalive(mut self, ping_interval: StdDuration, read_timeout: StdDuration) -> Self {
        self.ping_interval = ping_interval;
        self.read_timeout = read_timeout;
        self
    }

    async fn ws_loop(
        ws_url: String,
        instruments: Vec<String>,
        ping_interval: StdDuration,
        read_timeout: StdDuration,
        tx: mpsc::Sender<Result<Tick>>,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::to_string(&SubscribeMessage {
            action: "subscribe",
            instruments: &instruments,
        })?;
        write.send(Message::Text(subscribe)).await?;
        info!(instruments = instruments.len(), "Subscribed to market feed");

        let mut ping_tick = tokio::time::interval(ping_interval);
        ping_tick.tick().await;

        // Only reset when a frame arrives, so pings never extend the timeout.
        let read_deadline = tokio::time::sleep(read_timeout);
        tokio::pin!(read_deadline);

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Tick receiver dropped, closing feed connection");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_tick.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                _ = &mut read_deadline => {
                    warn!(timeout_secs = read_timeout.as_secs(), "Feed read timed out without messages");
                    return Err(Error::transient(
                        "feed",
                        format!("no frames for {}s", read_timeout.as_secs()),
                    ));
                }
                msg = read.next() => {
                    read_deadline.as_mut().reset(tokio::time::Instant::now() + read_timeout);

                    let Some(msg) = msg else {
                        warn!("Feed stream ended");
                        return Err(Error::transient("feed", "stream ended"));
                    };

                    match msg {
                        Ok(Message::Text(text)) => {
                            for tick in parse_ticks(&text) {
                                if tx.send(Ok(tick)).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Ok(Message::Close(_)) => {
                            info!("Feed closed by server");
                            return Err(Error::transient("feed", "closed by server"));
                        }
                        Err(e) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TickSource for WsTickSource {
    async fn open(&self, instruments: &[String]) -> Result<TickStream> {
        let (tx, rx) = mpsc::channel(1024);
        let ws_url = self.ws_url.clone();
        let instruments = instruments.to_vec();
        let ping_interval = self.ping_interval;
        let read_timeout = self.read_timeout;

        tokio::spawn(async move {
            if let Err(e) =
                Self::ws_loop(ws_url, instruments, ping_interval, read_timeout, tx.clone()).await
            {
                let _ = tx.send(Err(e)).await;
            }
        });

        let ticks = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(ticks))
    }
}

/// Parse one text frame. Malformed frames and control messages yield nothing.
pub fn parse_ticks(text: &str) -> Vec<Tick> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Ignoring non-JSON feed frame");
            return Vec::new();
        }
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<Tick>(item).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_parse_single_and_batched_frames() {
        let single = r#"{"segment":"NFO","instrument_id":"43512","price":"96.5"}"#;
        let ticks = parse_ticks(single);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, Decimal::new(965, 1));

        let batch = r#"[
            {"segment":"NFO","instrument_id":"1","price":10},
            {"status":"subscribed"},
            {"segment":"NFO","instrument_id":"2","price":20}
        ]"#;
        let ticks = parse_ticks(batch);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].instrument_id, "2");
    }

    #[test]
    fn test_parse_ignores_garbage() {
        assert!(parse_ticks("PONG").is_empty());
        assert!(parse_ticks(r#"{"type":"heartbeat"}"#).is_empty());
    }

    #[test]
    fn test_subscribe_message_shape() {
        let instruments = vec!["43512".to_string(), "43513".to_string()];
        let msg = serde_json::to_value(SubscribeMessage {
            action: "subscribe",
            instruments: &instruments,
        })
        .unwrap();
        assert_eq!(
            msg,
            serde_json::json!({"action": "subscribe", "instruments": ["43512", "43513"]})
        );
    }
}
