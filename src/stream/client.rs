//! Upstream AIS stream client.
//!
//! Owns the WebSocket connection, the auth/subscribe handshake, frame decode
//! and the reconnect state machine. All connection state lives on a single
//! worker task; callers talk to it through commands and consume its output
//! through a broadcast event channel, so nothing here is shared mutable state.
//!
//! Reconnect policy: exponential backoff, `base * 2^(attempt-1)` per attempt,
//! capped at a fixed attempt budget. Exhausting the budget is terminal until
//! an explicit `connect` call, which resets the counter.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::{ConnectionStatistics, PositionUpdate, StaticData, SubscriptionFilter};
use crate::stream::protocol::{decode_frame, DecodedFrame, SubscribeMessage};

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none wanted.
    Idle,
    /// TCP + TLS + WebSocket upgrade in progress.
    Connecting,
    /// Socket open, subscription sent, waiting for the first upstream payload.
    AwaitingAuthAck,
    /// Actively receiving vessel data.
    Streaming,
    /// Connection lost, reconnect not yet scheduled.
    Disconnected,
    /// Backoff timer armed for the next attempt.
    Reconnecting,
    /// Reconnect budget exhausted; waiting for an explicit connect.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::AwaitingAuthAck => write!(f, "AWAITING_AUTH_ACK"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Events emitted to downstream consumers. Fire-and-forget: lagging or absent
/// receivers never block the stream loop.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Position(PositionUpdate),
    StaticData(StaticData),
    Warning { message_type: String, reason: String, raw: String },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub url: String,
    pub api_key: String,
    /// First reconnect delay; doubles per consecutive failure.
    pub backoff_base_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
    /// The upstream drops sockets that have not authenticated within a few
    /// seconds, so the subscription send is bounded by this budget.
    pub auth_send_budget_ms: u64,
    pub event_capacity: usize,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: "wss://stream.aisstream.io/v0/stream".to_string(),
            api_key: String::new(),
            backoff_base_ms: 1_000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
            auth_send_budget_ms: 3_000,
            event_capacity: 1024,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn reconnect_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(32))
}

#[derive(Debug, Default)]
struct StatsInner {
    connected: AtomicBool,
    messages_received: AtomicU64,
    messages_processed: AtomicU64,
    error_count: AtomicU64,
    /// Epoch millis of the last inbound data frame; 0 = never.
    last_message_at_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
}

#[derive(Debug)]
enum Command {
    Connect(SubscriptionFilter),
    UpdateSubscription(SubscriptionFilter),
    Disconnect,
}

/// How a session ended, driving the outer reconnect loop.
enum SessionEnd {
    /// Deliberate disconnect; no automatic reconnect.
    Deliberate,
    /// Voluntary reconnect with a new filter (subscription change).
    Resubscribe(SubscriptionFilter),
    /// Transport failure; enters the backoff path.
    Lost { code: u16, reason: String },
}

/// Handle to the stream worker. Cheap to clone; all clones drive the same
/// connection.
#[derive(Clone)]
pub struct StreamConnectionClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<StreamEvent>,
    stats: Arc<StatsInner>,
    state: Arc<Mutex<ConnectionState>>,
}

impl StreamConnectionClient {
    /// Create the client and spawn its worker task. The client starts idle;
    /// nothing happens until `connect` is called.
    pub fn new(config: StreamClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let stats = Arc::new(StatsInner::default());
        let state = Arc::new(Mutex::new(ConnectionState::Idle));

        let worker = Worker {
            config,
            event_tx: event_tx.clone(),
            stats: stats.clone(),
            state: state.clone(),
        };
        tokio::spawn(worker.run(cmd_rx));

        Self {
            cmd_tx,
            event_tx,
            stats,
            state,
        }
    }

    /// Open (or reopen) the connection with the given filter. Resets the
    /// reconnect-attempt counter, so this is also the manual recovery path
    /// out of `Failed`.
    pub fn connect(&self, filter: SubscriptionFilter) {
        let _ = self.cmd_tx.send(Command::Connect(filter));
    }

    /// Replace the subscription filter. The upstream only accepts a filter at
    /// connect time, so this forces a disconnect/reconnect cycle. Voluntary,
    /// so the reconnect-attempt counter is left alone.
    pub fn update_subscription(&self, filter: SubscriptionFilter) {
        let _ = self.cmd_tx.send(Command::UpdateSubscription(filter));
    }

    /// Deliberate shutdown: cancels any pending reconnect and suppresses the
    /// automatic-reconnect path for the resulting close.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Immutable snapshot of the connection counters. No side effects.
    pub fn statistics(&self) -> ConnectionStatistics {
        let last_ms = self.stats.last_message_at_ms.load(Ordering::Relaxed);
        ConnectionStatistics {
            connected: self.stats.connected.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            messages_processed: self.stats.messages_processed.load(Ordering::Relaxed),
            error_count: self.stats.error_count.load(Ordering::Relaxed),
            last_message_at: if last_ms == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last_ms).single()
            },
            reconnect_attempts: self.stats.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    config: StreamClientConfig,
    event_tx: broadcast::Sender<StreamEvent>,
    stats: Arc<StatsInner>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Worker {
    fn set_state(&self, next: ConnectionState) {
        let mut current = self.state.lock();
        if *current != next {
            debug!(from = %*current, to = %next, "connection state");
            *current = next;
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn emit(&self, event: StreamEvent) {
        // No receivers is fine; downstream consumers are optional.
        let _ = self.event_tx.send(event);
    }

    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut filter: Option<SubscriptionFilter> = None;
        // Consecutive transport failures since the last successful stream.
        let mut attempt: u32 = 0;
        let mut connect_now = false;

        loop {
            if !connect_now {
                // Idle (or Failed): only an explicit command moves us.
                let cmd = match cmd_rx.recv().await {
                    Some(cmd) => cmd,
                    None => return,
                };
                match cmd {
                    Command::Connect(f) => {
                        filter = Some(f);
                        attempt = 0;
                        self.stats.reconnect_attempts.store(0, Ordering::Relaxed);
                    }
                    Command::UpdateSubscription(f) => {
                        filter = Some(f);
                    }
                    Command::Disconnect => {
                        self.set_state(ConnectionState::Idle);
                        continue;
                    }
                }
            }
            connect_now = false;

            let active = match filter.clone() {
                Some(f) => f,
                None => continue,
            };

            match self.run_session(&mut cmd_rx, &active, &mut attempt).await {
                SessionEnd::Deliberate => {
                    self.stats.connected.store(false, Ordering::Relaxed);
                    self.set_state(ConnectionState::Idle);
                    // Normal closure; consumers still see the close, only the
                    // automatic-reconnect path is suppressed.
                    self.emit(StreamEvent::Disconnected {
                        code: 1000,
                        reason: "client disconnect".to_string(),
                    });
                }
                SessionEnd::Resubscribe(f) => {
                    self.stats.connected.store(false, Ordering::Relaxed);
                    filter = Some(f);
                    connect_now = true;
                }
                SessionEnd::Lost { code, reason } => {
                    self.stats.connected.store(false, Ordering::Relaxed);
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(StreamEvent::Disconnected {
                        code,
                        reason: reason.clone(),
                    });

                    attempt += 1;
                    if attempt > self.config.max_reconnect_attempts {
                        self.set_state(ConnectionState::Failed);
                        error!(
                            attempts = self.config.max_reconnect_attempts,
                            "reconnect attempts exhausted, giving up until an explicit connect"
                        );
                        self.emit(StreamEvent::Error(format!(
                            "upstream connection lost; gave up after {} reconnect attempts",
                            self.config.max_reconnect_attempts
                        )));
                        continue;
                    }

                    let delay_ms = reconnect_delay_ms(self.config.backoff_base_ms, attempt);
                    self.stats.reconnect_attempts.store(attempt, Ordering::Relaxed);
                    self.set_state(ConnectionState::Reconnecting);
                    info!(attempt, delay_ms, reason = %reason, "scheduling reconnect");
                    self.emit(StreamEvent::Reconnecting { attempt, delay_ms });

                    // Backoff wait; commands preempt the timer so a manual
                    // override never races a stale reconnect.
                    tokio::select! {
                        _ = sleep(Duration::from_millis(delay_ms)) => {
                            connect_now = true;
                        }
                        cmd = cmd_rx.recv() => match cmd {
                            Some(Command::Connect(f)) => {
                                filter = Some(f);
                                attempt = 0;
                                self.stats.reconnect_attempts.store(0, Ordering::Relaxed);
                                connect_now = true;
                            }
                            Some(Command::UpdateSubscription(f)) => {
                                filter = Some(f);
                                connect_now = true;
                            }
                            Some(Command::Disconnect) => {
                                self.set_state(ConnectionState::Idle);
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }

    /// One connection lifetime: connect, authenticate, stream until something
    /// ends the session. Transport failures are returned, never propagated.
    async fn run_session(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        filter: &SubscriptionFilter,
        attempt: &mut u32,
    ) -> SessionEnd {
        self.set_state(ConnectionState::Connecting);
        info!(url = %self.config.url, boxes = filter.boxes.len(), "🔌 connecting to upstream feed");

        let connect = timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connect_async(self.config.url.as_str()),
        );
        let ws_stream = match connect.await {
            Ok(Ok((stream, response))) => {
                debug!(status = %response.status(), "websocket established");
                stream
            }
            Ok(Err(e)) => {
                warn!(error = %e, "websocket connect failed");
                return SessionEnd::Lost {
                    code: 1006,
                    reason: format!("connect failed: {e}"),
                };
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.connect_timeout_ms,
                    "websocket connect timed out"
                );
                return SessionEnd::Lost {
                    code: 1006,
                    reason: "connect timed out".to_string(),
                };
            }
        };

        let (mut write, mut read) = ws_stream.split();

        // The upstream only accepts the subscription during the handshake
        // window, so the auth frame goes out immediately on open - no
        // deferred queueing.
        self.set_state(ConnectionState::AwaitingAuthAck);
        let subscribe = SubscribeMessage::new(&self.config.api_key, filter);
        let payload = match serde_json::to_string(&subscribe) {
            Ok(p) => p,
            Err(e) => {
                return SessionEnd::Lost {
                    code: 1006,
                    reason: format!("failed to serialize subscription: {e}"),
                };
            }
        };
        let send = timeout(
            Duration::from_millis(self.config.auth_send_budget_ms),
            write.send(Message::Text(payload)),
        );
        match send.await {
            Ok(Ok(())) => debug!("subscription frame sent"),
            Ok(Err(e)) => {
                return SessionEnd::Lost {
                    code: 1006,
                    reason: format!("subscription send failed: {e}"),
                };
            }
            Err(_) => {
                return SessionEnd::Lost {
                    code: 1006,
                    reason: "subscription send exceeded auth budget".to_string(),
                };
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Disconnect) => {
                        info!("disconnect requested, closing stream");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Deliberate;
                    }
                    Some(Command::UpdateSubscription(f)) => {
                        info!("subscription changed, reconnecting with new filter");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Resubscribe(f);
                    }
                    Some(Command::Connect(f)) => {
                        *attempt = 0;
                        self.stats.reconnect_attempts.store(0, Ordering::Relaxed);
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Resubscribe(f);
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Deliberate;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .last_message_at_ms
                            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

                        match decode_frame(&text) {
                            Ok(DecodedFrame::UpstreamError { reason }) => {
                                warn!(reason = %reason, "upstream rejected the subscription");
                                return SessionEnd::Lost { code: 1008, reason };
                            }
                            Ok(decoded) => {
                                // First valid payload after auth completes the
                                // handshake and clears the failure streak.
                                if self.current_state() == ConnectionState::AwaitingAuthAck {
                                    self.set_state(ConnectionState::Streaming);
                                    *attempt = 0;
                                    self.stats.reconnect_attempts.store(0, Ordering::Relaxed);
                                    self.stats.connected.store(true, Ordering::Relaxed);
                                    info!("✅ upstream stream live");
                                    self.emit(StreamEvent::Connected);
                                }
                                match decoded {
                                    DecodedFrame::Position(update) => {
                                        self.stats
                                            .messages_processed
                                            .fetch_add(1, Ordering::Relaxed);
                                        self.emit(StreamEvent::Position(update));
                                    }
                                    DecodedFrame::Static(data) => {
                                        self.stats
                                            .messages_processed
                                            .fetch_add(1, Ordering::Relaxed);
                                        self.emit(StreamEvent::StaticData(data));
                                    }
                                    DecodedFrame::Unrecognized { message_type } => {
                                        // Counted as received, not an error.
                                        debug!(%message_type, "ignoring unrecognized message type");
                                    }
                                    DecodedFrame::UpstreamError { .. } => {}
                                }
                            }
                            Err(e) => {
                                self.stats.error_count.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    message_type = %e.message_type,
                                    reason = %e.reason,
                                    "failed to decode frame"
                                );
                                self.emit(StreamEvent::Warning {
                                    message_type: e.message_type,
                                    reason: e.reason,
                                    raw: text,
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        debug!(bytes = data.len(), "ignoring unexpected binary frame");
                    }
                    Some(Ok(Message::Ping(ping))) => {
                        if let Err(e) = write.send(Message::Pong(ping)).await {
                            warn!(error = %e, "failed to send pong");
                            return SessionEnd::Lost {
                                code: 1006,
                                reason: format!("pong send failed: {e}"),
                            };
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("received pong");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        info!(code, reason = %reason, "server closed the stream");
                        return SessionEnd::Lost { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        return SessionEnd::Lost {
                            code: 1006,
                            reason: format!("transport error: {e}"),
                        };
                    }
                    None => {
                        return SessionEnd::Lost {
                            code: 1006,
                            reason: "connection closed abnormally".to_string(),
                        };
                    }
                }
            }
        }
    }
}
