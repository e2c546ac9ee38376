//! Connection layer: one logical channel to the voice backend.
//!
//! The channel is WebSocket-primary with an HTTP-polling fallback, both
//! behind the [`ConnectionChannel`] trait so the rest of the pipeline never
//! special-cases the transport. A single background task owns the live
//! channel and the reconnect policy: exponential backoff
//! (`base * 2^attempt`, capped) with a fixed attempt budget, after which a
//! terminal [`ChannelEvent::Exhausted`] is surfaced instead of retrying
//! forever.

pub mod messages;
pub mod polling;
pub mod socket;

use crate::config::ConnectionConfig;
use crate::error::{CallError, Result};
use async_trait::async_trait;
use self::messages::WireMessage;
use self::polling::PollingChannel;
use self::socket::SocketChannel;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outbound queue depth between callers and the channel task.
const OUTBOUND_CHANNEL_SIZE: usize = 32;
/// Broadcast capacity for inbound channel events.
const EVENT_CHANNEL_SIZE: usize = 32;

/// How the logical channel is currently realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Push messages over a live WebSocket.
    Streaming,
    /// Fixed-interval HTTP status polling.
    Polling,
    /// No transport; reconnecting or given up.
    Disconnected,
}

/// Connection state, owned and mutated only by the manager task.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Current transport mode.
    pub mode: ConnectionMode,
    /// Reconnect attempt counter. Reset to 0 only by a successful
    /// (re)connection, never by in-session traffic.
    pub attempt: u32,
    /// Most recent transport error, if any.
    pub last_error: Option<String>,
}

/// Events surfaced to subscribers (services, orchestrator).
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A well-formed inbound wire message.
    Message(WireMessage),
    /// Polling mode: the backend finished the turn; payload is `aiResponse`.
    ReplyReady(String),
    /// The reconnect budget is spent. Terminal for this connection.
    Exhausted,
}

/// One transport realization of the logical channel.
///
/// Capability: deliver a message, produce inbound events, detect closure
/// (`next_event` returning `Ok(None)` or `Err`).
#[async_trait]
pub trait ConnectionChannel: Send {
    /// The mode this channel realizes.
    fn mode(&self) -> ConnectionMode;

    /// Send one message to the backend.
    async fn deliver(&mut self, msg: &WireMessage) -> Result<()>;

    /// Wait for the next inbound event. `Ok(None)` means clean closure;
    /// `Err` means the transport failed.
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>>;

    /// Close the transport.
    async fn close(&mut self);
}

/// Handle to the logical channel. Cloneable; the channel itself lives in a
/// background task.
#[derive(Clone)]
pub struct ConnectionManager {
    outbound_tx: mpsc::Sender<WireMessage>,
    events_tx: broadcast::Sender<ChannelEvent>,
    state: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
    http: reqwest::Client,
    config: ConnectionConfig,
}

impl ConnectionManager {
    /// Establish the channel: streaming first, polling fallback.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Network`] when neither transport is reachable.
    pub async fn connect(config: &ConnectionConfig, http: reqwest::Client) -> Result<Self> {
        let channel = open_channel(config, &http).await?;
        let mode = channel.mode();
        info!("connected to voice service ({mode:?})");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let state = Arc::new(Mutex::new(ConnectionState {
            mode,
            attempt: 0,
            last_error: None,
        }));
        let cancel = CancellationToken::new();

        tokio::spawn(connection_loop(
            channel,
            config.clone(),
            http.clone(),
            Arc::clone(&state),
            events_tx.clone(),
            outbound_rx,
            cancel.clone(),
        ));

        Ok(Self {
            outbound_tx,
            events_tx,
            state,
            cancel,
            http,
            config: config.clone(),
        })
    }

    /// Snapshot of the connection state (read-only to callers).
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Current transport mode.
    #[must_use]
    pub fn mode(&self) -> ConnectionMode {
        self.state().mode
    }

    /// Queue a message for delivery on the active channel.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Channel`] if the channel task has shut down.
    pub async fn send(&self, msg: WireMessage) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| CallError::Channel("connection task stopped".into()))
    }

    /// Subscribe to inbound channel events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Tear the channel down. When `stop` is given, the accumulated call
    /// text is posted to the backend's `/stop` endpoint best-effort.
    pub async fn shutdown(&self, stop: Option<polling::StopBody>) {
        self.cancel.cancel();
        if let Some(body) = stop {
            if let Err(e) = polling::post_stop(&self.http, &self.config.polling_url, &body).await {
                warn!("best-effort stop post failed: {e}");
            }
        }
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.mode = ConnectionMode::Disconnected;
    }
}

/// Backoff delay before reconnect attempt `attempt` (1-based).
#[must_use]
pub fn reconnect_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = config
        .reconnect_base_ms
        .saturating_mul(2u64.saturating_pow(exp))
        .min(config.reconnect_max_ms);
    Duration::from_millis(ms)
}

/// Try the streaming socket, then the polling fallback.
async fn open_channel(
    config: &ConnectionConfig,
    http: &reqwest::Client,
) -> Result<Box<dyn ConnectionChannel>> {
    let socket_attempt = tokio::time::timeout(
        config.request_timeout(),
        SocketChannel::connect(&config.socket_url),
    )
    .await
    .unwrap_or_else(|_| Err(CallError::Network("websocket connect timed out".into())));

    match socket_attempt {
        Ok(channel) => Ok(Box::new(channel)),
        Err(e) => {
            warn!("streaming unavailable ({e}), falling back to polling");
            let channel =
                PollingChannel::connect(http.clone(), &config.polling_url, config.poll_interval())
                    .await?;
            Ok(Box::new(channel))
        }
    }
}

/// Why the inner channel loop returned.
enum LoopExit {
    /// Shutdown requested; do not reconnect.
    Cancelled,
    /// The transport closed or failed.
    Closed(Option<CallError>),
}

/// Own the live channel; on closure run the backoff schedule.
async fn connection_loop(
    mut channel: Box<dyn ConnectionChannel>,
    config: ConnectionConfig,
    http: reqwest::Client,
    state: Arc<Mutex<ConnectionState>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    mut outbound_rx: mpsc::Receiver<WireMessage>,
    cancel: CancellationToken,
) {
    loop {
        let exit = run_channel(channel.as_mut(), &events_tx, &mut outbound_rx, &cancel).await;

        match exit {
            LoopExit::Cancelled => {
                channel.close().await;
                return;
            }
            LoopExit::Closed(err) => {
                let detail = err.map(|e| e.to_string());
                warn!(
                    "channel closed{}",
                    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
                );
                set_state(&state, ConnectionMode::Disconnected, 0, detail);
            }
        }

        // Sequential backoff: this task is the only place a reconnect is
        // ever scheduled, so at most one attempt is outstanding.
        match reconnect(&config, &http, &state, &cancel).await {
            Some(next) => {
                info!("reconnected to voice service ({:?})", next.mode());
                channel = next;
            }
            None => {
                if !cancel.is_cancelled() {
                    let _ = events_tx.send(ChannelEvent::Exhausted);
                }
                return;
            }
        }
    }
}

/// Pump one live channel until closure or shutdown.
async fn run_channel(
    channel: &mut dyn ConnectionChannel,
    events_tx: &broadcast::Sender<ChannelEvent>,
    outbound_rx: &mut mpsc::Receiver<WireMessage>,
    cancel: &CancellationToken,
) -> LoopExit {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return LoopExit::Cancelled,
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = channel.deliver(&msg).await {
                            return LoopExit::Closed(Some(e));
                        }
                    }
                    // All handles dropped; nothing left to serve.
                    None => return LoopExit::Cancelled,
                }
            }
            inbound = channel.next_event() => {
                match inbound {
                    Ok(Some(event)) => {
                        // Send fails only when nobody is subscribed.
                        let _ = events_tx.send(event);
                    }
                    Ok(None) => return LoopExit::Closed(None),
                    Err(e) => return LoopExit::Closed(Some(e)),
                }
            }
        }
    }
}

/// Run the backoff schedule until a transport comes back or the budget is
/// spent. Returns `None` when exhausted or cancelled.
async fn reconnect(
    config: &ConnectionConfig,
    http: &reqwest::Client,
    state: &Arc<Mutex<ConnectionState>>,
    cancel: &CancellationToken,
) -> Option<Box<dyn ConnectionChannel>> {
    for attempt in 1..=config.max_reconnect_attempts {
        let delay = reconnect_delay(config, attempt);
        set_attempt(state, attempt);
        info!("scheduling reconnect attempt {attempt} in {}ms", delay.as_millis());

        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        match open_channel(config, http).await {
            Ok(channel) => {
                set_state(state, channel.mode(), 0, None);
                return Some(channel);
            }
            Err(e) => {
                warn!("reconnect attempt {attempt} failed: {e}");
                set_state(state, ConnectionMode::Disconnected, attempt, Some(e.to_string()));
            }
        }
    }

    warn!("reconnect attempts exhausted, giving up");
    set_state(
        state,
        ConnectionMode::Disconnected,
        config.max_reconnect_attempts,
        Some(CallError::ConnectivityExhausted.to_string()),
    );
    None
}

fn set_state(
    state: &Arc<Mutex<ConnectionState>>,
    mode: ConnectionMode,
    attempt: u32,
    last_error: Option<String>,
) {
    let mut s = state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    s.mode = mode;
    s.attempt = attempt;
    if last_error.is_some() {
        s.last_error = last_error;
    }
}

fn set_attempt(state: &Arc<Mutex<ConnectionState>>, attempt: u32) {
    let mut s = state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    s.attempt = attempt;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_to_cap() {
        let config = ConnectionConfig::default();
        let delays: Vec<u64> = (1..=5)
            .map(|a| reconnect_delay(&config, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 32_000]);
    }

    #[test]
    fn backoff_is_non_decreasing_and_bounded() {
        let config = ConnectionConfig::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = reconnect_delay(&config, attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(config.reconnect_max_ms));
            previous = delay;
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let config = ConnectionConfig::default();
        let delay = reconnect_delay(&config, u32::MAX);
        assert_eq!(delay, Duration::from_millis(config.reconnect_max_ms));
    }
}
