//! Upstream tick ingestor: one multiplexed connection, reconnect with backoff

use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::backoff::Backoff;
use super::binance::{decode_frame, Decoded};
use crate::config::IngestConfig;
use crate::error::{EngineError, EngineResult};
use crate::hub::PriceHub;
use crate::shutdown::Shutdown;
use crate::types::PriceTick;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ingest counters, readable from any thread
#[derive(Debug, Default)]
pub struct IngestStats {
    frames: AtomicU64,
    ticks: AtomicU64,
    invalid: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub frames: u64,
    pub ticks: u64,
    pub invalid: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Sole producer of price ticks. Owns the only upstream connection; `run`
/// consumes the ingestor so a second loop cannot share it.
pub struct TickIngestor {
    config: IngestConfig,
    url: Url,
    publish_tx: mpsc::Sender<PriceTick>,
    stats: Arc<IngestStats>,
    shutdown: Shutdown,
}

impl TickIngestor {
    pub fn new(
        config: IngestConfig,
        publish_tx: mpsc::Sender<PriceTick>,
        stats: Arc<IngestStats>,
        shutdown: Shutdown,
    ) -> EngineResult<Self> {
        if config.symbols.is_empty() {
            return Err(EngineError::config("upstream symbol list is empty"));
        }
        let url = Url::parse(&config.stream_url())
            .map_err(|e| EngineError::config(format!("invalid upstream URL: {e}")))?;

        Ok(Self {
            config,
            url,
            publish_tx,
            stats,
            shutdown,
        })
    }

    pub fn stream_url(&self) -> &Url {
        &self.url
    }

    /// Open the upstream connection; the handshake must finish within the connect timeout.
    pub async fn connect(&self) -> EngineResult<UpstreamStream> {
        info!("Connecting to upstream feed: {}", self.url);
        let (ws, _) = timeout(self.config.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                EngineError::connect(format!(
                    "handshake did not complete within {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| EngineError::connect(format!("websocket connection failed: {e}")))?;

        info!("Connected to upstream for {} symbols", self.config.symbols.len());
        Ok(ws)
    }

    /// Connect, stream, and reconnect until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let mut backoff = Backoff::from_config(&self.config);
        let mut rng = StdRng::from_entropy();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            match self.connect().await {
                Ok(ws) => match self.stream(ws, &mut backoff).await {
                    Ok(()) => break,
                    Err(e) => warn!("Upstream stream ended: {}", e),
                },
                Err(e) => warn!("Upstream connect failed: {}", e),
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            let delay = backoff.next_delay(&mut rng);
            warn!(
                "Reconnecting to upstream in {:?} (attempt {})",
                delay,
                backoff.attempt()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("Tick ingestor stopped");
        Ok(())
    }

    /// Read frames until an error, a close frame, or shutdown (which returns Ok).
    async fn stream<S>(&self, ws: WebSocketStream<S>, backoff: &mut Backoff) -> EngineResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();
        let connected_at = Instant::now();
        let mut backoff_reset = false;

        let result = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                frame = timeout(self.config.read_timeout, read.next()) => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(_) => {
                    break Err(EngineError::connect(format!(
                        "no frame within {:?}",
                        self.config.read_timeout
                    )))
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    self.handle_text(text.as_str()).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        break Err(EngineError::connect(format!("failed to send pong: {e}")));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break Err(EngineError::connect(format!("upstream closed: {frame:?}")));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(EngineError::connect(format!("read error: {e}"))),
                None => break Err(EngineError::connect("upstream stream ended")),
            }

            if !backoff_reset && connected_at.elapsed() >= self.config.backoff_reset_after {
                debug!("Upstream stable, resetting reconnect backoff");
                backoff.reset();
                backoff_reset = true;
            }
        };

        // Close cleanly; the peer may already be gone.
        let _ = timeout(Duration::from_secs(1), write.close()).await;
        result
    }

    async fn handle_text(&self, text: &str) {
        match decode_frame(text) {
            Decoded::Tick(tick) => self.forward(tick).await,
            Decoded::Ignored => {}
            Decoded::Invalid(reason) => {
                let count = self.stats.invalid.fetch_add(1, Ordering::Relaxed) + 1;
                let every = self.config.invalid_log_every.max(1);
                if count % every == 1 || every == 1 {
                    warn!("Dropping invalid upstream frame ({} so far): {}", count, reason);
                }
            }
        }
    }

    /// Hand a tick to the hub dispatcher without stalling ingestion
    async fn forward(&self, tick: PriceTick) {
        match self
            .publish_tx
            .send_timeout(tick, self.config.publish_timeout)
            .await
        {
            Ok(()) => {
                self.stats.ticks.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Hub did not accept tick ({}), {} dropped so far", e, dropped);
            }
        }
    }
}

/// Hub dispatcher: the single task that calls `PriceHub::publish`
pub fn spawn_dispatcher(hub: Arc<PriceHub>, mut rx: mpsc::Receiver<PriceTick>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            hub.publish(tick);
        }
        debug!("Hub dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const FRAME: &str = r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"30100.00","v":"10.0"}}"#;

    fn ingestor(
        config: IngestConfig,
        capacity: usize,
    ) -> (TickIngestor, mpsc::Receiver<PriceTick>, Arc<IngestStats>, Shutdown) {
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(IngestStats::default());
        let shutdown = Shutdown::new();
        let ingestor = TickIngestor::new(config, tx, stats.clone(), shutdown.clone()).unwrap();
        (ingestor, rx, stats, shutdown)
    }

    #[test]
    fn test_empty_symbols_is_fatal() {
        let (tx, _rx) = mpsc::channel(1);
        let config = IngestConfig {
            symbols: vec![],
            ..Default::default()
        };
        let result = TickIngestor::new(config, tx, Arc::default(), Shutdown::new());
        assert!(matches!(result, Err(EngineError::Config { .. })));
    }

    #[tokio::test]
    async fn test_invalid_frames_counted() {
        let (ingestor, mut rx, stats, _shutdown) = ingestor(IngestConfig::default(), 8);
        ingestor.handle_text("garbage").await;
        ingestor.handle_text(r#"{"stream":"x","data":{"e":"trade","s":"BTCUSDT"}}"#).await;
        ingestor.handle_text(FRAME).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.invalid, 1);
        assert_eq!(snapshot.ticks, 1);
        assert_eq!(rx.recv().await.unwrap().price, dec!(30100.00));
    }

    #[tokio::test]
    async fn test_full_accept_slot_drops_tick() {
        let config = IngestConfig {
            publish_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (ingestor, _rx, stats, _shutdown) = ingestor(config, 1);
        ingestor.handle_text(FRAME).await;
        ingestor.handle_text(FRAME).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ticks, 1);
        assert_eq!(snapshot.dropped, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_reports_connect_error() {
        // Accept TCP but never complete the websocket handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = IngestConfig {
            upstream_url: format!("ws://{addr}"),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (ingestor, _rx, _stats, _shutdown) = ingestor(config, 8);
        assert!(matches!(ingestor.connect().await, Err(EngineError::Connect { .. })));
        server.abort();
    }

    #[tokio::test]
    async fn test_streams_ticks_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Each connection gets one ticker frame and is then closed by the server.
        let server = tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                ws.send(Message::Text(FRAME.into())).await.unwrap();
                let _ = ws.close(None).await;
            }
        });

        let config = IngestConfig {
            upstream_url: format!("ws://{addr}"),
            symbols: vec!["BTCUSDT".to_string()],
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            ..Default::default()
        };
        let (ingestor, mut rx, stats, shutdown) = ingestor(config, 8);
        assert!(ingestor.stream_url().as_str().ends_with("/stream?streams=btcusdt@ticker"));
        let handle = tokio::spawn(ingestor.run());

        for _ in 0..2 {
            let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("tick should arrive")
                .unwrap();
            assert_eq!(tick.symbol, "BTCUSDT");
        }
        assert!(stats.snapshot().reconnects >= 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("ingestor should stop")
            .unwrap()
            .unwrap();
        server.abort();
    }

    /// In-memory upstream: the server side sends `frames` ticker frames,
    /// `gap` apart, then closes the connection.
    async fn scripted_upstream(frames: usize, gap: Duration) -> (WebSocketStream<DuplexStream>, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let task = tokio::spawn(async move {
            for i in 0..frames {
                if i > 0 {
                    tokio::time::sleep(gap).await;
                }
                server.send(Message::Text(FRAME.into())).await.unwrap();
            }
            let _ = server.close(None).await;
        });
        (client, task)
    }

    fn worn_backoff(config: &IngestConfig) -> Backoff {
        let mut backoff = Backoff::from_config(config);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..3 {
            backoff.next_delay(&mut rng);
        }
        backoff
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_stable_minute() {
        let config = IngestConfig::default();
        let mut backoff = worn_backoff(&config);
        let (ingestor, _rx, stats, _shutdown) = ingestor(config, 64);

        // 13 frames, 5s apart: the last one lands 60s after connecting.
        let (upstream, server) = scripted_upstream(13, Duration::from_secs(5)).await;
        let result = ingestor.stream(upstream, &mut backoff).await;

        assert!(matches!(result, Err(EngineError::Connect { .. })));
        assert_eq!(stats.snapshot().ticks, 13);
        assert_eq!(backoff.attempt(), 0);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_connection_keeps_backoff() {
        let config = IngestConfig::default();
        let mut backoff = worn_backoff(&config);
        let (ingestor, _rx, _stats, _shutdown) = ingestor(config, 64);

        let (upstream, server) = scripted_upstream(3, Duration::from_secs(5)).await;
        let result = ingestor.stream(upstream, &mut backoff).await;

        assert!(matches!(result, Err(EngineError::Connect { .. })));
        assert_eq!(backoff.attempt(), 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_publishes_to_hub() {
        let hub = Arc::new(PriceHub::new());
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_dispatcher(hub.clone(), rx);

        let tick = PriceTick::new("ETHUSDT", dec!(2000), dec!(1), chrono::Utc::now()).unwrap();
        tx.send(tick).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(hub.snapshot("ETHUSDT").unwrap().price, dec!(2000));
    }
}
