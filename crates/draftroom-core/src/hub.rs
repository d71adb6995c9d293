// The hub: single serialized coordinator for every draft room.
//
// Connection edges talk to the hub only through the channels behind
// `HubHandle`. The hub owns the room registry outright and is the only
// component that issues pick writes, so every room mutation and every pick
// commit happens one event at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::PickStore;
use crate::pick::{commit_pick, DraftPick, PickOutcome};
use crate::protocol::{LeagueId, PickPayload, RejectReason, ServerMessage, UserId};
use crate::room::{ConnectionId, Delivery, RoomRegistry};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Identifies which connection, in which room, on behalf of which user, an
/// event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionKey {
    pub conn: ConnectionId,
    pub room: LeagueId,
    pub user: UserId,
}

/// Register request. `outbound` is the producer side of the connection's
/// bounded queue; once registered, the hub is its only holder.
#[derive(Debug)]
pub struct Subscription {
    pub key: SubscriptionKey,
    pub outbound: mpsc::Sender<String>,
}

#[derive(Debug)]
pub struct ChatEvent {
    pub key: SubscriptionKey,
    pub text: String,
}

#[derive(Debug)]
pub struct PickEvent {
    pub key: SubscriptionKey,
    pub payload: PickPayload,
}

#[derive(Debug, Error)]
#[error("hub is no longer running")]
pub struct HubClosed;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable sending side of the hub, one channel per event kind.
#[derive(Debug, Clone)]
pub struct HubHandle {
    register: mpsc::Sender<Subscription>,
    unregister: mpsc::Sender<SubscriptionKey>,
    chat: mpsc::Sender<ChatEvent>,
    pick: mpsc::Sender<PickEvent>,
    history: mpsc::Sender<SubscriptionKey>,
    next_conn: Arc<AtomicU64>,
}

/// Receiving side of the hub channels, consumed by [`Hub::run`].
#[derive(Debug)]
pub struct HubReceivers {
    pub(crate) register: mpsc::Receiver<Subscription>,
    pub(crate) unregister: mpsc::Receiver<SubscriptionKey>,
    pub(crate) chat: mpsc::Receiver<ChatEvent>,
    pub(crate) pick: mpsc::Receiver<PickEvent>,
    pub(crate) history: mpsc::Receiver<SubscriptionKey>,
}

/// Create the hub's event channels, each bounded at `capacity`.
pub fn channel(capacity: usize) -> (HubHandle, HubReceivers) {
    let (register_tx, register_rx) = mpsc::channel(capacity);
    let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
    let (chat_tx, chat_rx) = mpsc::channel(capacity);
    let (pick_tx, pick_rx) = mpsc::channel(capacity);
    let (history_tx, history_rx) = mpsc::channel(capacity);

    let handle = HubHandle {
        register: register_tx,
        unregister: unregister_tx,
        chat: chat_tx,
        pick: pick_tx,
        history: history_tx,
        next_conn: Arc::new(AtomicU64::new(1)),
    };
    let receivers = HubReceivers {
        register: register_rx,
        unregister: unregister_rx,
        chat: chat_rx,
        pick: pick_rx,
        history: history_rx,
    };
    (handle, receivers)
}

impl HubHandle {
    /// Mint a connection handle that is unique for the life of the process.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn register(&self, subscription: Subscription) -> Result<(), HubClosed> {
        self.register.send(subscription).await.map_err(|_| HubClosed)
    }

    pub async fn unregister(&self, key: SubscriptionKey) -> Result<(), HubClosed> {
        self.unregister.send(key).await.map_err(|_| HubClosed)
    }

    pub async fn chat(&self, key: SubscriptionKey, text: String) -> Result<(), HubClosed> {
        self.chat
            .send(ChatEvent { key, text })
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn pick(&self, key: SubscriptionKey, payload: PickPayload) -> Result<(), HubClosed> {
        self.pick
            .send(PickEvent { key, payload })
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn history(&self, key: SubscriptionKey) -> Result<(), HubClosed> {
        self.history.send(key).await.map_err(|_| HubClosed)
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    store: Arc<dyn PickStore>,
    registry: RoomRegistry,
}

impl Hub {
    pub fn new(store: Arc<dyn PickStore>) -> Self {
        Self {
            store,
            registry: RoomRegistry::new(),
        }
    }

    /// Create the channels and spawn the event loop on the current runtime.
    pub fn spawn(store: Arc<dyn PickStore>, capacity: usize) -> (HubHandle, JoinHandle<()>) {
        let (handle, receivers) = channel(capacity);
        let task = tokio::spawn(Hub::new(store).run(receivers));
        (handle, task)
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Run the event loop until every [`HubHandle`] has been dropped.
    ///
    /// Branches are polled in a fixed order with `register` first. An edge
    /// always enqueues its register before anything else, so this keeps a
    /// connection's own unregister from overtaking its register.
    pub async fn run(mut self, mut rx: HubReceivers) {
        info!("Hub event loop started");

        loop {
            tokio::select! {
                biased;

                Some(subscription) = rx.register.recv() => self.register(subscription),
                Some(key) = rx.unregister.recv() => self.unregister(key),
                Some(event) = rx.pick.recv() => self.pick(event),
                Some(event) = rx.chat.recv() => self.chat(event),
                Some(key) = rx.history.recv() => self.history(key),
                else => {
                    info!("All hub handles dropped, shutting down");
                    break;
                }
            }
        }

        info!("Hub event loop exiting");
    }

    /// Add a connection to its room. Every other member hears that the user
    /// is active; the newcomer alone receives the full member list.
    pub fn register(&mut self, subscription: Subscription) {
        let Subscription { key, outbound } = subscription;

        if self.registry.join(key.room, key.conn, key.user, outbound) {
            debug!("Opened room for league {}", key.room);
        }
        info!(
            "User {} joined league {} on {} ({} connected)",
            key.user,
            key.room,
            key.conn,
            self.registry.member_count(key.room)
        );

        let mut stalled = Vec::new();

        let status = ServerMessage::Status {
            user: key.user,
            active: true,
        };
        if let Some(frame) = encode(&status) {
            stalled.extend(self.registry.fan_out(key.room, &frame, Some(key.conn)).stalled);
        }

        let users = ServerMessage::Users {
            users: self.registry.users(key.room),
        };
        if let Some(frame) = encode(&users) {
            if self.registry.send_to(key.room, key.conn, &frame) == Delivery::Stalled {
                stalled.push(key.conn);
            }
        }

        self.shed(key.room, stalled);
    }

    /// Remove a connection from its room and close its outbound queue.
    /// Unknown or already-removed connections are ignored.
    pub fn unregister(&mut self, key: SubscriptionKey) {
        let Some(member) = self.registry.leave(key.room, key.conn) else {
            debug!("Ignoring unregister for {}: not in league {}", key.conn, key.room);
            return;
        };
        info!("User {} left league {} ({})", member.user, key.room, key.conn);

        let stalled = self.announce_departure(key.room, member.user);
        // Dropping the member closes its queue, which tells the send loop to
        // write a close frame and exit.
        drop(member);
        self.shed(key.room, stalled);
    }

    /// Relay a chat line to every member of the sender's room.
    pub fn chat(&mut self, event: ChatEvent) {
        let ChatEvent { key, text } = event;
        if !self.registry.contains(key.room, key.conn) {
            debug!("Dropping chat from {}: not in league {}", key.conn, key.room);
            return;
        }

        let chat = ServerMessage::Chat {
            user: key.user,
            payload: text,
        };
        if let Some(frame) = encode(&chat) {
            let stalled = self.registry.fan_out(key.room, &frame, None).stalled;
            self.shed(key.room, stalled);
        }
    }

    /// Persist a pick if it claims the next sequence number, then broadcast
    /// it. Anything else is rolled back and reported to the submitter only.
    pub fn pick(&mut self, event: PickEvent) {
        let PickEvent { key, payload } = event;
        if !self.registry.contains(key.room, key.conn) {
            debug!("Dropping pick from {}: not in league {}", key.conn, key.room);
            return;
        }

        let pick = DraftPick {
            pick: payload.pick,
            player: payload.player,
            team: payload.team,
            league: key.room,
        };

        if payload.league != key.room.get() {
            warn!(
                "{} submitted a pick for league {} from the league {} room",
                key.conn, payload.league, key.room
            );
            self.reject(key, &pick, RejectReason::WrongLeague, None);
            return;
        }

        match commit_pick(self.store.as_ref(), &pick) {
            Ok(PickOutcome::Committed) => {
                info!(
                    "League {} pick {}: team {} took player {}",
                    key.room, pick.pick, pick.team, pick.player
                );
                let draft = ServerMessage::Draft {
                    pick: pick.pick,
                    player: pick.player,
                    team: pick.team,
                };
                if let Some(frame) = encode(&draft) {
                    let stalled = self.registry.fan_out(key.room, &frame, None).stalled;
                    self.shed(key.room, stalled);
                }
            }
            Ok(PickOutcome::OutOfOrder { claimed, assigned }) => {
                warn!(
                    "Draft desync in league {}: {} claimed pick {} but next open pick is {}",
                    key.room, key.conn, claimed, assigned
                );
                self.reject(key, &pick, RejectReason::OutOfOrder, Some(assigned));
            }
            Ok(PickOutcome::PlayerTaken) => {
                warn!(
                    "League {}: player {} already drafted, rejecting pick {} from {}",
                    key.room, pick.player, pick.pick, key.conn
                );
                self.reject(key, &pick, RejectReason::PlayerTaken, None);
            }
            Err(e) => {
                error!("Failed to persist pick for league {}: {}", key.room, e);
                self.reject(key, &pick, RejectReason::StoreUnavailable, None);
            }
        }
    }

    /// Answer a catch-up request with the league's committed picks.
    pub fn history(&mut self, key: SubscriptionKey) {
        if !self.registry.contains(key.room, key.conn) {
            return;
        }

        let picks = match self.store.pick_history(key.room) {
            Ok(picks) => picks,
            Err(e) => {
                error!("Failed to load pick history for league {}: {}", key.room, e);
                return;
            }
        };
        debug!(
            "Sending {} historical picks to {} in league {}",
            picks.len(),
            key.conn,
            key.room
        );

        if let Some(frame) = encode(&ServerMessage::History { picks }) {
            if self.registry.send_to(key.room, key.conn, &frame) == Delivery::Stalled {
                self.shed(key.room, vec![key.conn]);
            }
        }
    }

    fn reject(
        &mut self,
        key: SubscriptionKey,
        pick: &DraftPick,
        reason: RejectReason,
        expected: Option<i64>,
    ) {
        let rejected = ServerMessage::Rejected {
            pick: pick.pick,
            player: pick.player,
            team: pick.team,
            reason,
            expected,
        };
        if let Some(frame) = encode(&rejected) {
            if self.registry.send_to(key.room, key.conn, &frame) == Delivery::Stalled {
                self.shed(key.room, vec![key.conn]);
            }
        }
    }

    /// Tell the rest of the room that `user` is gone, unless the user still
    /// has another connection here. Returns members that stalled.
    fn announce_departure(&self, room: LeagueId, user: UserId) -> Vec<ConnectionId> {
        if !self.registry.has_room(room) {
            debug!("Closed room for league {}", room);
            return Vec::new();
        }
        if self.registry.has_user(room, user) {
            return Vec::new();
        }

        let status = ServerMessage::Status {
            user,
            active: false,
        };
        match encode(&status) {
            Some(frame) => self.registry.fan_out(room, &frame, None).stalled,
            None => Vec::new(),
        }
    }

    /// Forcibly unregister members whose queues refused a frame. Departure
    /// notices can stall further members, so keep going until none remain.
    fn shed(&mut self, room: LeagueId, stalled: Vec<ConnectionId>) {
        let mut pending: VecDeque<ConnectionId> = stalled.into();

        while let Some(conn) = pending.pop_front() {
            let Some(member) = self.registry.leave(room, conn) else {
                continue;
            };
            warn!(
                "Dropping slow connection {} (user {}) from league {}",
                conn, member.user, room
            );
            pending.extend(self.announce_departure(room, member.user));
        }
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match message.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to serialize outbound message: {}", e);
            None
        }
    }
}
