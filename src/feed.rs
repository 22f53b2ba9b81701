// Connection supervisor: one multiplexed websocket for the whole universe

use crate::decoder::{decode_frame, DecodedFrame};
use crate::types::MarketEvent;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Close code used when the watchdog forces a reconnect.
const STALE_CLOSE_CODE: u16 = 4000;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// e.g. `wss://fstream.binance.com`
    pub ws_base_url: String,
    /// Lowercase market symbols to subscribe.
    pub market_symbols: Vec<String>,
    pub kline_interval: String,
    pub ping_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

/// Shared handle between the supervisor task and the tick loop.
pub struct FeedHandle {
    last_message_at: AtomicI64,
    reconnect: Notify,
    stopped: AtomicBool,
}

impl FeedHandle {
    fn new(now: i64) -> Self {
        Self {
            last_message_at: AtomicI64::new(now),
            reconnect: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn last_message_at(&self) -> i64 {
        self.last_message_at.load(Ordering::Relaxed)
    }

    fn stamp(&self, now: i64) {
        self.last_message_at.store(now, Ordering::Relaxed);
    }

    /// Watchdog entry point: close the socket (code 4000) and reconnect.
    pub fn force_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// Graceful shutdown: close the socket (code 1000) and end the task.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.reconnect.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Build the combined-stream URL:
/// `{base}/stream?streams=btcusdt@aggTrade/btcusdt@markPrice@1s/btcusdt@kline_5m/...`
pub fn combined_stream_url(base: &str, symbols: &[String], interval: &str) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .flat_map(|s| {
            let sym = s.to_lowercase();
            [
                format!("{sym}@aggTrade"),
                format!("{sym}@markPrice@1s"),
                format!("{sym}@kline_{interval}"),
            ]
        })
        .collect();
    format!("{}/stream?streams={}", base.trim_end_matches('/'), streams.join("/"))
}

/// Spawn the supervisor task. Decoded events flow out over `event_tx`; the
/// returned handle exposes staleness stamping and forced reconnect.
pub fn spawn_feed(settings: FeedSettings, event_tx: mpsc::Sender<MarketEvent>) -> Arc<FeedHandle> {
    let handle = Arc::new(FeedHandle::new(chrono::Utc::now().timestamp_millis()));
    let task_handle = handle.clone();
    tokio::spawn(async move {
        run_feed_loop(settings, event_tx, task_handle).await;
    });
    handle
}

async fn run_feed_loop(
    settings: FeedSettings,
    event_tx: mpsc::Sender<MarketEvent>,
    handle: Arc<FeedHandle>,
) {
    let url = combined_stream_url(
        &settings.ws_base_url,
        &settings.market_symbols,
        &settings.kline_interval,
    );
    info!("feed: connecting {} streams", settings.market_symbols.len() * 3);

    let mut attempt: u32 = 0;
    loop {
        if handle.is_stopped() {
            return;
        }

        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!("feed: connected");
                attempt = 0;
                handle.stamp(chrono::Utc::now().timestamp_millis());

                let (mut write, mut read) = ws_stream.split();
                let mut ping_timer =
                    interval(Duration::from_millis(settings.ping_interval_ms.max(1_000)));
                ping_timer.tick().await; // first tick fires immediately

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(frame)) => {
                                    handle.stamp(chrono::Utc::now().timestamp_millis());
                                    if !handle_frame(frame, &event_tx).await {
                                        break;
                                    }
                                }
                                Some(Err(err)) => {
                                    warn!("feed: stream error: {err}");
                                    break;
                                }
                                None => {
                                    warn!("feed: stream ended");
                                    break;
                                }
                            }
                        }
                        _ = ping_timer.tick() => {
                            if write.send(Message::Ping(Vec::new())).await.is_err() {
                                debug!("feed: ping failed, connection likely dead");
                                break;
                            }
                        }
                        _ = handle.reconnect.notified() => {
                            let (code, reason) = if handle.is_stopped() {
                                (CloseCode::Normal, "shutdown")
                            } else {
                                (CloseCode::Library(STALE_CLOSE_CODE), "stale feed")
                            };
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }

                if handle.is_stopped() {
                    info!("feed: closed for shutdown");
                    return;
                }
                warn!("feed: disconnected, will reconnect");
            }
            Err(err) => {
                error!("feed: connect error: {err}");
            }
        }

        let delay = settings
            .reconnect_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(settings.reconnect_max_ms);
        attempt = attempt.saturating_add(1);
        debug!("feed: reconnecting in {delay}ms (attempt {attempt})");
        sleep(Duration::from_millis(delay)).await;
    }
}

/// Returns false when the connection should be dropped.
async fn handle_frame(frame: Message, event_tx: &mpsc::Sender<MarketEvent>) -> bool {
    let text = match frame {
        Message::Text(txt) => txt.to_string(),
        Message::Binary(bin) => match String::from_utf8(bin) {
            Ok(txt) => txt,
            Err(_) => {
                debug!("feed: dropping non-utf8 binary frame");
                return true;
            }
        },
        Message::Close(frame) => {
            warn!("feed: server closed: {frame:?}");
            return false;
        }
        // tungstenite answers pings on its own
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return true,
    };

    match decode_frame(&text) {
        Ok(DecodedFrame::Event(event)) => {
            if event_tx.send(event).await.is_err() {
                warn!("feed: event receiver dropped, closing");
                return false;
            }
        }
        Ok(DecodedFrame::VenueError { code, msg }) => {
            warn!("feed: venue error {code}: {msg}");
        }
        Ok(DecodedFrame::Ignored) => {}
        Err(err) => {
            debug!("feed: {err}");
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_url_multiplexes_all_streams() {
        let url = combined_stream_url(
            "wss://fstream.binance.com/",
            &["btcusdt".to_string(), "ethusdt".to_string()],
            "5m",
        );
        assert!(url.starts_with("wss://fstream.binance.com/stream?streams="));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("btcusdt@markPrice@1s"));
        assert!(url.contains("btcusdt@kline_5m"));
        assert!(url.contains("ethusdt@kline_5m"));
        // 2 symbols x 3 streams, '/'-separated
        let streams = url.split_once("streams=").unwrap().1;
        assert_eq!(streams.split('/').count(), 6);
    }

    #[test]
    fn backoff_delay_is_capped() {
        let base: u64 = 1_000;
        let max: u64 = 15_000;
        let delays: Vec<u64> = (0u32..6)
            .map(|attempt| base.saturating_mul(1u64 << attempt.min(16)).min(max))
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 15_000, 15_000]);
    }

    #[test]
    fn handle_stamps_and_flags() {
        let handle = FeedHandle::new(100);
        assert_eq!(handle.last_message_at(), 100);
        handle.stamp(250);
        assert_eq!(handle.last_message_at(), 250);
        assert!(!handle.is_stopped());
        handle.shutdown();
        assert!(handle.is_stopped());
    }
}
