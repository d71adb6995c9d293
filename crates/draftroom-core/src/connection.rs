// Per-connection edge: pumps frames between one WebSocket and the hub.
//
// Each connection runs a receive loop (socket -> hub) and a send loop
// (outbound queue -> socket). Whichever ends first, the connection is
// unregistered exactly once.

use std::time::Duration;

use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::hub::{HubClosed, HubHandle, Subscription, SubscriptionKey};
use crate::protocol::{decode_client_message, ClientMessage, LeagueId, UserId};
use crate::room::ConnectionId;

/// Timing and size limits applied to every client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Frames the hub may queue for one connection before shedding it.
    pub outbound_capacity: usize,
    /// How long the receive loop waits for any inbound frame before giving
    /// up. Pings keep an idle but healthy peer answering within it.
    pub pong_wait: Duration,
    /// Interval between pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Upper bound on a single socket write.
    pub write_wait: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            outbound_capacity: 256,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
        }
    }
}

impl ConnectionSettings {
    /// Handshake configuration enforcing the inbound size limit.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// Register an upgraded connection with the hub and serve it until either
/// side goes away.
///
/// Fails only if the hub has already shut down, in which case nothing was
/// registered.
pub async fn join_room<S>(
    ws: WebSocketStream<S>,
    league: LeagueId,
    user: UserId,
    hub: HubHandle,
    settings: ConnectionSettings,
) -> Result<(), HubClosed>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = SubscriptionKey {
        conn: hub.next_connection_id(),
        room: league,
        user,
    };
    let (outbound, queue) = mpsc::channel(settings.outbound_capacity);

    hub.register(Subscription { key, outbound }).await?;
    let mut guard = UnregisterGuard::new(hub.clone(), key);

    let (sink, stream) = ws.split();
    let reader = read_loop(stream, key, &hub, settings.pong_wait);
    let writer = write_loop(sink, queue, &settings, key.conn);
    tokio::pin!(reader, writer);

    tokio::select! {
        end = &mut reader => {
            debug!("Receive loop for {} ended: {:?}", key.conn, end);
            guard.release().await;
            // The hub closes the queue once it handles the unregister; give
            // the send loop a chance to flush and send its close frame.
            if let Ok(end) = timeout(settings.write_wait, &mut writer).await {
                debug!("Send loop for {} ended: {:?}", key.conn, end);
            }
        }
        end = &mut writer => {
            debug!("Send loop for {} ended: {:?}", key.conn, end);
            guard.release().await;
        }
    }

    info!("User {} disconnected from league {} ({})", user, league, key.conn);
    Ok(())
}

/// Makes sure a registered connection is unregistered exactly once, even if
/// the task serving it is cancelled.
struct UnregisterGuard {
    hub: Option<HubHandle>,
    key: SubscriptionKey,
}

impl UnregisterGuard {
    fn new(hub: HubHandle, key: SubscriptionKey) -> Self {
        Self {
            hub: Some(hub),
            key,
        }
    }

    async fn release(&mut self) {
        if let Some(hub) = &self.hub {
            if hub.unregister(self.key).await.is_err() {
                debug!("Hub already stopped while unregistering {}", self.key.conn);
            }
        }
        self.hub = None;
    }
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        let Some(hub) = self.hub.take() else {
            return;
        };
        let key = self.key;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = hub.unregister(key).await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Why a receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// Close frame or end of stream.
    Closed,
    /// Nothing arrived within the pong wait.
    TimedOut,
    /// Transport or protocol error, including oversized messages.
    Failed,
    HubClosed,
}

/// Forward inbound frames to the hub until the peer goes away.
///
/// Every inbound frame, pongs included, pushes the read deadline out by
/// `pong_wait`.
pub async fn read_loop<St>(
    mut stream: St,
    key: SubscriptionKey,
    hub: &HubHandle,
    pong_wait: Duration,
) -> ReadEnd
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = match timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!("Nothing heard from {} within {:?}", key.conn, pong_wait);
                return ReadEnd::TimedOut;
            }
        };

        if let Some(Ok(_)) = next {
            deadline = Instant::now() + pong_wait;
        }

        match next {
            Some(Ok(Message::Text(text))) => {
                if dispatch(text.as_str(), key, hub).await.is_err() {
                    return ReadEnd::HubClosed;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("{} closed the connection", key.conn);
                return ReadEnd::Closed;
            }
            Some(Ok(_)) => {
                // Binary, ping and pong frames carry nothing for the hub.
            }
            Some(Err(e)) => {
                warn!("WebSocket error from {}: {}", key.conn, e);
                return ReadEnd::Failed;
            }
        }
    }
}

/// Decode one text frame and hand it to the hub. Undecodable frames are
/// logged and skipped; only a stopped hub is an error.
async fn dispatch(text: &str, key: SubscriptionKey, hub: &HubHandle) -> Result<(), HubClosed> {
    match decode_client_message(text) {
        Ok(ClientMessage::Chat(text)) => hub.chat(key, text).await,
        Ok(ClientMessage::Pick(payload)) => hub.pick(key, payload).await,
        Ok(ClientMessage::History) => hub.history(key).await,
        Ok(ClientMessage::Unknown(kind)) => {
            debug!("Ignoring message of unknown kind '{}' from {}", kind, key.conn);
            Ok(())
        }
        Err(e) => {
            warn!("Ignoring undecodable frame from {}: {}", key.conn, e);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Send loop
// ---------------------------------------------------------------------------

/// Why a send loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEnd {
    /// The hub closed the outbound queue. A close frame was attempted.
    QueueClosed,
    Failed,
    /// A single write took longer than the write wait.
    TimedOut,
}

/// Drain the outbound queue into the socket, pinging every `ping_period`.
pub async fn write_loop<Si>(
    mut sink: Si,
    mut queue: mpsc::Receiver<String>,
    settings: &ConnectionSettings,
    conn: ConnectionId,
) -> WriteEnd
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            frame = queue.recv() => match frame {
                Some(text) => Message::Text(text.into()),
                None => {
                    match timeout(settings.write_wait, sink.send(Message::Close(None))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Close frame to {} failed: {}", conn, e),
                        Err(_) => debug!("Close frame to {} timed out", conn),
                    }
                    return WriteEnd::QueueClosed;
                }
            },
            _ = ticker.tick() => Message::Ping(Default::default()),
        };

        match timeout(settings.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to {} failed: {}", conn, e);
                return WriteEnd::Failed;
            }
            Err(_) => {
                warn!("Write to {} exceeded {:?}", conn, settings.write_wait);
                return WriteEnd::TimedOut;
            }
        }
    }
}
