//! WebSocket stream source with reconnect and keep-alive
//!
//! [`StreamSource`] owns one logical feed: it connects through a
//! [`Transport`], sends the subscription on every (re)connect, stamps each
//! received frame with wall-clock and monotonic receipt times, decodes it, and
//! hands back [`RawFrame`]s until the stop token is cancelled.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::backoff::{Backoff, BackoffConfig};
use super::errors::{FeedError, FeedResult};
use super::okx;
use crate::clock::Clock;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stream source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    pub symbols: Vec<String>,
    pub channels: Vec<String>,
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub inbound_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: okx::DEFAULT_PUBLIC_URL.to_string(),
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            channels: vec![okx::CHANNEL_BOOKS5.to_string()],
            keepalive_interval_ms: 20_000,
            keepalive_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
            inbound_queue_depth: 1024,
        }
    }
}

/// Application-level frame delivered by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// A decoded frame with its receipt timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Wall-clock receipt time, epoch ms
    pub recv_epoch_ms: i64,
    /// Monotonic receipt time
    pub recv_mono_ns: u64,
    /// Monotonic time right after JSON decode
    pub decoded_mono_ns: u64,
    pub message: Map<String, Value>,
}

/// Establishes connections to the feed endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> FeedResult<Box<dyn Connection>>;
}

/// One live connection.
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: &str) -> FeedResult<()>;

    /// Next application frame, `Ok(None)` once the peer has closed.
    async fn recv(&mut self) -> FeedResult<Option<WireFrame>>;

    async fn close(&mut self) -> FeedResult<()>;
}

/// Stream health counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub connects: u64,
    pub frames_received: u64,
    pub frames_skipped: u64,
    pub transport_errors: u64,
    pub unexpected_errors: u64,
}

/// Reconnecting producer of [`RawFrame`]s.
pub struct StreamSource {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    subscription: String,
    backoff: Backoff,
    stop: CancellationToken,
    connection: Option<Box<dyn Connection>>,
    stats: StreamStats,
}

impl StreamSource {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        symbols: &[String],
        channels: &[String],
        backoff: Backoff,
        stop: CancellationToken,
    ) -> FeedResult<Self> {
        Ok(Self {
            transport,
            clock,
            subscription: okx::subscription_message(symbols, channels)?,
            backoff,
            stop,
            connection: None,
            stats: StreamStats::default(),
        })
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Next decoded frame. Returns `None` only once stop has been requested.
    pub async fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            if self.stop.is_cancelled() {
                self.disconnect().await;
                return None;
            }

            match self.poll_once().await {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => continue,
                Err(err) => {
                    self.connection = None;
                    if self.stop.is_cancelled() {
                        continue;
                    }
                    let delay = if err.should_backoff() {
                        self.stats.transport_errors += 1;
                        let delay = self.backoff.next_delay();
                        warn!(
                            error = %err,
                            attempt = self.backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Stream disconnected, reconnecting"
                        );
                        delay
                    } else {
                        self.stats.unexpected_errors += 1;
                        error!(error = %err, "Unexpected stream error, retrying");
                        self.backoff.unexpected_retry_delay()
                    };
                    tokio::select! {
                        _ = self.stop.cancelled() => {}
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One step: connect if needed, then read one frame. `Ok(None)` means the
    /// frame was skipped or stop interrupted the wait.
    async fn poll_once(&mut self) -> FeedResult<Option<RawFrame>> {
        if self.connection.is_none() {
            let connected = tokio::select! {
                _ = self.stop.cancelled() => return Ok(None),
                result = self.transport.connect() => result?,
            };
            let mut connection = connected;
            connection.send_text(&self.subscription).await?;
            self.backoff.reset();
            self.stats.connects += 1;
            info!(connects = self.stats.connects, "Stream connected and subscribed");
            self.connection = Some(connection);
        }

        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => {
                return Err(FeedError::Internal {
                    message: "no active connection".to_string(),
                })
            }
        };

        let wire = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(None),
            received = connection.recv() => received?,
        };

        let Some(wire) = wire else {
            return Err(FeedError::Closed);
        };

        let recv_epoch_ms = self.clock.now_epoch_ms();
        let recv_mono_ns = self.clock.now_mono_ns();
        self.stats.frames_received += 1;

        let decoded: Result<Value, serde_json::Error> = match &wire {
            WireFrame::Text(text) => serde_json::from_str(text),
            WireFrame::Binary(bytes) => serde_json::from_slice(bytes),
        };
        let message = match decoded {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                self.stats.frames_skipped += 1;
                trace!("Skipping non-object frame");
                return Ok(None);
            }
            Err(e) => {
                self.stats.frames_skipped += 1;
                trace!(error = %e, "Skipping undecodable frame");
                return Ok(None);
            }
        };
        let decoded_mono_ns = self.clock.now_mono_ns();

        // Frames already buffered when stop arrives are dropped.
        if self.stop.is_cancelled() {
            return Ok(None);
        }

        Ok(Some(RawFrame {
            recv_epoch_ms,
            recv_mono_ns,
            decoded_mono_ns,
            message,
        }))
    }

    async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error closing stream connection");
            }
        }
    }
}

/// Messages forwarded from the socket reader task.
enum Inbound {
    Frame(WireFrame),
    Ping(Vec<u8>),
    Pong,
    Error(FeedError),
}

/// WebSocket transport backed by tokio-tungstenite
pub struct TungsteniteTransport {
    config: StreamConfig,
}

impl TungsteniteTransport {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self) -> FeedResult<Box<dyn Connection>> {
        let url = Url::parse(&self.config.url).map_err(|e| FeedError::InvalidEndpoint {
            details: format!("Invalid WebSocket URL {}: {}", self.config.url, e),
        })?;

        debug!(url = %url, "Connecting");
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws_stream, _) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| FeedError::Timeout {
                operation: "connect",
                millis: self.config.connect_timeout_ms,
            })?
            .map_err(|e| FeedError::Connection {
                message: format!("WebSocket connection failed: {}", e),
            })?;

        let (writer, reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.config.inbound_queue_depth.max(1));
        let reader_task = tokio::spawn(read_socket(reader, tx));

        Ok(Box::new(TungsteniteConnection {
            writer,
            inbound: rx,
            reader_task,
            keepalive: KeepAlive::new(
                Duration::from_millis(self.config.keepalive_interval_ms.max(1)),
                Duration::from_millis(self.config.keepalive_timeout_ms),
            ),
            close_timeout: Duration::from_millis(self.config.close_timeout_ms),
        }))
    }
}

/// Forward socket messages into the bounded inbound queue until the socket
/// ends or the connection is dropped.
async fn read_socket(mut reader: SplitStream<WsStream>, tx: mpsc::Sender<Inbound>) {
    while let Some(message) = reader.next().await {
        let inbound = match message {
            Ok(Message::Text(text)) => Inbound::Frame(WireFrame::Text(text)),
            Ok(Message::Binary(bytes)) => Inbound::Frame(WireFrame::Binary(bytes)),
            Ok(Message::Ping(payload)) => Inbound::Ping(payload),
            Ok(Message::Pong(_)) => Inbound::Pong,
            Ok(Message::Close(frame)) => {
                info!(?frame, "WebSocket close frame");
                break;
            }
            Ok(Message::Frame(_)) => continue,
            Err(e) => {
                let _ = tx.send(Inbound::Error(e.into())).await;
                break;
            }
        };
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum KeepAliveEvent {
    SendPing,
    PongOverdue,
}

/// Ping schedule and pong deadline for one connection. The deadline is armed
/// by the first unanswered ping and cleared by any pong.
struct KeepAlive {
    ping_interval: Interval,
    pong_deadline: Option<Instant>,
    timeout: Duration,
}

impl KeepAlive {
    fn new(interval: Duration, timeout: Duration) -> Self {
        let mut ping_interval = interval_at(Instant::now() + interval, interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ping_interval,
            pong_deadline: None,
            timeout,
        }
    }

    /// Wait for the next keep-alive action. Cancel safe.
    async fn next_event(&mut self) -> KeepAliveEvent {
        let deadline = self.pong_deadline;
        tokio::select! {
            _ = self.ping_interval.tick() => {
                if self.pong_deadline.is_none() {
                    self.pong_deadline = Some(Instant::now() + self.timeout);
                }
                KeepAliveEvent::SendPing
            }
            _ = wait_deadline(deadline) => KeepAliveEvent::PongOverdue,
        }
    }

    fn pong_received(&mut self) {
        self.pong_deadline = None;
    }

    fn overdue_error(&self) -> FeedError {
        FeedError::Timeout {
            operation: "keepalive pong",
            millis: self.timeout.as_millis() as u64,
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct TungsteniteConnection {
    writer: SplitSink<WsStream, Message>,
    inbound: mpsc::Receiver<Inbound>,
    reader_task: JoinHandle<()>,
    keepalive: KeepAlive,
    close_timeout: Duration,
}

#[async_trait]
impl Connection for TungsteniteConnection {
    async fn send_text(&mut self, text: &str) -> FeedResult<()> {
        self.writer.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> FeedResult<Option<WireFrame>> {
        loop {
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Frame(frame)) => return Ok(Some(frame)),
                    Some(Inbound::Ping(payload)) => {
                        self.writer.send(Message::Pong(payload)).await?;
                    }
                    Some(Inbound::Pong) => self.keepalive.pong_received(),
                    Some(Inbound::Error(e)) => return Err(e),
                    None => return Ok(None),
                },
                event = self.keepalive.next_event() => match event {
                    KeepAliveEvent::SendPing => {
                        self.writer.send(Message::Ping(Vec::new())).await?;
                    }
                    KeepAliveEvent::PongOverdue => return Err(self.keepalive.overdue_error()),
                },
            }
        }
    }

    async fn close(&mut self) -> FeedResult<()> {
        let result = timeout(self.close_timeout, self.writer.close()).await;
        self.reader_task.abort();
        match result {
            Ok(closed) => Ok(closed?),
            Err(_) => Err(FeedError::Timeout {
                operation: "close",
                millis: self.close_timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for TungsteniteConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// One scripted connection outcome.
    enum Script {
        Refuse,
        Serve(Vec<FeedResult<Option<WireFrame>>>),
    }

    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct ScriptedConnection {
        frames: VecDeque<FeedResult<Option<WireFrame>>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> FeedResult<Box<dyn Connection>> {
            let next = self.scripts.lock().pop_front();
            match next {
                Some(Script::Serve(frames)) => Ok(Box::new(ScriptedConnection {
                    frames: frames.into(),
                    sent: self.sent.clone(),
                })),
                Some(Script::Refuse) => Err(FeedError::Connection {
                    message: "refused".to_string(),
                }),
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send_text(&mut self, text: &str) -> FeedResult<()> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> FeedResult<Option<WireFrame>> {
            match self.frames.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> FeedResult<()> {
            Ok(())
        }
    }

    fn text(s: &str) -> FeedResult<Option<WireFrame>> {
        Ok(Some(WireFrame::Text(s.to_string())))
    }

    fn source(transport: Arc<ScriptedTransport>, stop: CancellationToken) -> StreamSource {
        let clock = Arc::new(ManualClock::new(1_000, 5_000));
        StreamSource::new(
            transport,
            clock,
            &["BTC-USDT".to_string()],
            &["books5".to_string()],
            Backoff::with_seed(BackoffConfig::default(), 3),
            stop,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_malformed_and_non_object_frames() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::Serve(vec![
            text("pong"),
            text("[1,2,3]"),
            Ok(Some(WireFrame::Binary(br#"{"arg":{"channel":"books5"}}"#.to_vec()))),
        ])]));
        let stop = CancellationToken::new();
        let mut source = source(transport.clone(), stop);

        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame.recv_epoch_ms, 1_000);
        assert_eq!(frame.recv_mono_ns, 5_000);
        assert!(frame.decoded_mono_ns >= frame.recv_mono_ns);
        assert!(frame.message.contains_key("arg"));
        assert_eq!(source.stats().frames_skipped, 2);

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"op\":\"subscribe\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_resubscribes_after_close() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Script::Serve(vec![text(r#"{"n":1}"#), Ok(None)]),
            Script::Refuse,
            Script::Serve(vec![text(r#"{"n":2}"#)]),
        ]));
        let stop = CancellationToken::new();
        let mut source = source(transport.clone(), stop);

        let first = source.next_frame().await.unwrap();
        assert_eq!(first.message["n"], 1);

        let second = source.next_frame().await.unwrap();
        assert_eq!(second.message["n"], 2);

        assert_eq!(transport.sent.lock().len(), 2);
        assert_eq!(source.stats().connects, 2);
        assert_eq!(source.stats().transport_errors, 2);
        // Reset on the successful resubscribe.
        assert_eq!(source.backoff().attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_error_retries_after_fixed_delay() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Script::Serve(vec![Err(FeedError::Internal {
                message: "bug".to_string(),
            })]),
            Script::Serve(vec![text(r#"{"ok":true}"#)]),
        ]));
        let stop = CancellationToken::new();
        let mut source = source(transport, stop);

        let started = Instant::now();
        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame.message["ok"], true);
        assert_eq!(source.stats().unexpected_errors, 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::Serve(vec![])]));
        let stop = CancellationToken::new();
        let mut source = source(transport, stop.clone());

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });
        assert!(source.next_frame().await.is_none());
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_frames_after_stop() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::Serve(vec![
            text(r#"{"n":1}"#),
            text(r#"{"n":2}"#),
        ])]));
        let stop = CancellationToken::new();
        let mut source = source(transport, stop.clone());

        stop.cancel();
        assert!(source.next_frame().await.is_none());
        assert!(source.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_times_out() {
        let mut keepalive = KeepAlive::new(Duration::from_secs(20), Duration::from_secs(10));
        let started = Instant::now();

        assert_eq!(keepalive.next_event().await, KeepAliveEvent::SendPing);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(keepalive.next_event().await, KeepAliveEvent::PongOverdue);
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        let err = keepalive.overdue_error();
        assert!(matches!(err, FeedError::Timeout { millis: 10_000, .. }));
        assert!(err.should_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_clears_deadline() {
        let mut keepalive = KeepAlive::new(Duration::from_secs(20), Duration::from_secs(10));
        let started = Instant::now();

        assert_eq!(keepalive.next_event().await, KeepAliveEvent::SendPing);
        keepalive.pong_received();
        assert_eq!(keepalive.next_event().await, KeepAliveEvent::SendPing);
        assert_eq!(started.elapsed(), Duration::from_secs(40));
        assert_eq!(keepalive.next_event().await, KeepAliveEvent::PongOverdue);
        assert_eq!(started.elapsed(), Duration::from_secs(50));
    }
}
