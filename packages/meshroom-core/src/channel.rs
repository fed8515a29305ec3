//! # Session Channel
//!
//! Client side of the ordered, reliable message channel to the relay.
//!
//! ```text
//!   SessionChannel::send ──► outbound mpsc ──┐
//!                                            ▼
//!                                ┌──────────────────────┐   ws   ┌───────┐
//!                                │  supervisor task     │ ◄────► │ relay │
//!                                │  connect / welcome   │        └───────┘
//!                                │  pump / keepalive    │
//!                                │  backoff + retry     │
//!                                └──────────┬───────────┘
//!                                           ▼
//!                                 ChannelEvent mpsc ──► event loop
//! ```
//!
//! The supervisor owns the socket. On transport loss it retries with
//! exponential backoff and jitter; every successful (re)connect yields a new
//! session id. Messages queued while no socket is up are dropped: the event
//! loop rebuilds its signaling state from scratch on `Connected`.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage, SessionId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events produced by the channel supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A socket is up and the relay assigned this session id.
    Connected { session_id: SessionId },
    /// A relay message (never `welcome` or `pong`).
    Message(ServerMessage),
    /// The socket went away; reconnection follows unless the channel closes.
    Disconnected { reason: String },
    /// Waiting `delay` before reconnect attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The supervisor exited. `error` is `None` after a local shutdown.
    Closed { error: Option<Error> },
}

/// Reconnect policy, copied out of [`ClientConfig`].
#[derive(Debug, Clone)]
struct Policy {
    url: String,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    keepalive: Duration,
    connect_timeout: Duration,
}

impl From<&ClientConfig> for Policy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.relay_url.clone(),
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            keepalive: config.keepalive_interval,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Handle for queueing messages to the relay.
///
/// Cloning is cheap; the supervisor exits once every handle is dropped or
/// [`SessionChannel::close`] is called.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug)]
enum Outbound {
    Message(ClientMessage),
    Close,
}

impl SessionChannel {
    /// Spawn the supervisor and return the handle plus its event stream.
    ///
    /// The first connection attempt is not retried: if it fails, the stream
    /// yields `Closed` with the error.
    pub fn spawn(config: &ClientConfig) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let policy = Policy::from(config);

        tokio::spawn(supervise(policy, outbound_rx, event_tx));

        (Self { outbound: outbound_tx }, event_rx)
    }

    /// Queue a message. Fails only once the supervisor has exited.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Ask the supervisor to close the socket and exit.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// A channel with no socket behind it; messages land in the [`Loopback`].
    #[cfg(test)]
    pub(crate) fn loopback() -> (Self, Loopback) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, Loopback(rx))
    }
}

#[cfg(test)]
pub(crate) struct Loopback(mpsc::UnboundedReceiver<Outbound>);

#[cfg(test)]
impl Loopback {
    /// Every message queued so far, in order.
    pub(crate) fn drain(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(next) = self.0.try_recv() {
            if let Outbound::Message(msg) = next {
                out.push(msg);
            }
        }
        out
    }

    pub(crate) fn close_requested(&mut self) -> bool {
        let mut closed = false;
        while let Ok(next) = self.0.try_recv() {
            closed |= matches!(next, Outbound::Close);
        }
        closed
    }
}

/// Backoff before reconnect attempt `attempt` (1-based).
///
/// `base * 2^(attempt-1)`, capped at `max`, plus up to 20% jitter.
/// `jitter` is a sample in `[0, 1)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exp).min(max);
    let extra = raw.mul_f64(0.2 * jitter.clamp(0.0, 1.0));
    raw + extra
}

enum SessionEnd {
    /// Transport lost; reconnect.
    Lost(String),
    /// Local shutdown.
    Shutdown,
}

async fn supervise(
    policy: Policy,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        match connect_once(&policy).await {
            Ok((ws, session_id)) => {
                attempt = 0;
                ever_connected = true;

                // Anything queued while we were down belongs to the old session.
                let mut stale = 0usize;
                loop {
                    match outbound_rx.try_recv() {
                        Ok(Outbound::Message(_)) => stale += 1,
                        Ok(Outbound::Close) => {
                            let _ = event_tx.send(ChannelEvent::Closed { error: None });
                            return;
                        }
                        Err(_) => break,
                    }
                }
                if stale > 0 {
                    tracing::debug!(dropped = stale, "Dropped messages queued while disconnected");
                }

                tracing::info!(session_id = session_id.as_str(), "Session channel connected");
                if event_tx
                    .send(ChannelEvent::Connected {
                        session_id: session_id.clone(),
                    })
                    .is_err()
                {
                    return;
                }

                match pump(ws, &policy, &mut outbound_rx, &event_tx).await {
                    SessionEnd::Shutdown => {
                        tracing::info!(session_id = session_id.as_str(), "Session channel closed");
                        let _ = event_tx.send(ChannelEvent::Closed { error: None });
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(
                            session_id = session_id.as_str(),
                            reason = reason.as_str(),
                            "Session channel lost"
                        );
                        if event_tx.send(ChannelEvent::Disconnected { reason }).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                if !ever_connected {
                    tracing::warn!(url = policy.url.as_str(), error = %e, "Initial relay connection failed");
                    let _ = event_tx.send(ChannelEvent::Closed { error: Some(e) });
                    return;
                }
                tracing::warn!(attempt = attempt, error = %e, "Reconnect attempt failed");
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            tracing::warn!(attempts = policy.max_attempts, "Giving up on relay");
            let _ = event_tx.send(ChannelEvent::Closed {
                error: Some(Error::ReconnectExhausted {
                    attempts: policy.max_attempts,
                }),
            });
            return;
        }

        let delay = backoff_delay(
            attempt,
            policy.base_delay,
            policy.max_delay,
            rand::thread_rng().gen::<f64>(),
        );
        tracing::info!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
        if event_tx
            .send(ChannelEvent::Reconnecting { attempt, delay })
            .is_err()
        {
            return;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                next = outbound_rx.recv() => match next {
                    Some(Outbound::Message(_)) => {} // stale, see above
                    Some(Outbound::Close) | None => {
                        let _ = event_tx.send(ChannelEvent::Closed { error: None });
                        return;
                    }
                },
            }
        }
    }
}

/// Open a socket and wait for the relay's `welcome`.
async fn connect_once(policy: &Policy) -> Result<(WsStream, SessionId)> {
    match tokio::time::timeout(policy.connect_timeout, handshake(&policy.url)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout("waiting for relay welcome".into())),
    }
}

async fn handshake(url: &str) -> Result<(WsStream, SessionId)> {
    let (mut ws, _) = connect_async(url).await?;
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::Welcome { session_id } => return Ok((ws, session_id)),
                other => {
                    tracing::debug!(?other, "Ignoring frame before welcome");
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(Error::ChannelClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Shuttle frames until the socket dies or the handle asks to close.
async fn pump(
    ws: WsStream,
    policy: &Policy,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut keepalive = tokio::time::interval(policy.keepalive);
    keepalive.tick().await;
    let mut last_inbound = Instant::now();
    // Three missed keepalives and the socket is considered dead.
    let silence_limit = policy.keepalive * 3;

    loop {
        tokio::select! {
            next = outbound_rx.recv() => match next {
                Some(Outbound::Message(msg)) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to serialize client message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },

            frame = stream.next() => {
                last_inbound = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Pong) => {}
                        Ok(ServerMessage::Welcome { session_id }) => {
                            tracing::warn!(session_id = session_id.as_str(), "Unexpected second welcome");
                        }
                        Ok(msg) => {
                            if event_tx.send(ChannelEvent::Message(msg)).is_err() {
                                let _ = sink.send(Message::Close(None)).await;
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Unparseable relay frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("closed by relay".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                }
            },

            _ = keepalive.tick() => {
                if last_inbound.elapsed() > silence_limit {
                    return SessionEnd::Lost("keepalive timeout".into());
                }
                let ping = serde_json::to_string(&ClientMessage::Ping).unwrap_or_default();
                if let Err(e) = sink.send(Message::Text(ping)).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
        }
    }
}
