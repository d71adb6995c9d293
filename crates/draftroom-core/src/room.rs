// Room registry: which connections are watching which league's draft.
//
// Owned and mutated exclusively by the hub. A room exists only while it has
// at least one member.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::{LeagueId, UserId};

/// Opaque handle for one client connection, minted by the hub handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection's membership in a room. Owns the producer side of the
/// connection's outbound queue; dropping the member closes the queue.
#[derive(Debug)]
pub struct Member {
    pub user: UserId,
    outbound: mpsc::Sender<String>,
}

/// Result of a non-blocking push into one member's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The queue is full or its consumer is gone. The member should be shed.
    Stalled,
    NotMember,
}

/// Outcome of pushing one frame to every member of a room.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    /// Members whose queues refused the frame, in no particular order.
    pub stalled: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<LeagueId, HashMap<ConnectionId, Member>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`, creating the room if needed. Returns `true` when
    /// the room was created by this call.
    pub fn join(
        &mut self,
        room: LeagueId,
        conn: ConnectionId,
        user: UserId,
        outbound: mpsc::Sender<String>,
    ) -> bool {
        let created = !self.rooms.contains_key(&room);
        self.rooms
            .entry(room)
            .or_default()
            .insert(conn, Member { user, outbound });
        created
    }

    /// Remove `conn` from `room`. Returns the removed member, or `None` if it
    /// was not a member (removal is idempotent). The room is deleted as soon
    /// as its last member leaves.
    pub fn leave(&mut self, room: LeagueId, conn: ConnectionId) -> Option<Member> {
        let members = self.rooms.get_mut(&room)?;
        let member = members.remove(&conn)?;
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        Some(member)
    }

    pub fn has_room(&self, room: LeagueId) -> bool {
        self.rooms.contains_key(&room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, room: LeagueId) -> usize {
        self.rooms.get(&room).map_or(0, HashMap::len)
    }

    pub fn contains(&self, room: LeagueId, conn: ConnectionId) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.contains_key(&conn))
    }

    /// Whether any connection in `room` belongs to `user`.
    pub fn has_user(&self, room: LeagueId, user: UserId) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.values().any(|m| m.user == user))
    }

    /// Distinct users present in `room`, ascending.
    pub fn users(&self, room: LeagueId) -> Vec<UserId> {
        self.rooms
            .get(&room)
            .map(|members| {
                members
                    .values()
                    .map(|m| m.user)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push `frame` to a single member without waiting.
    pub fn send_to(&self, room: LeagueId, conn: ConnectionId, frame: &str) -> Delivery {
        match self.rooms.get(&room).and_then(|members| members.get(&conn)) {
            Some(member) => try_push(member, frame),
            None => Delivery::NotMember,
        }
    }

    /// Push `frame` to every member of `room` except `exclude`, never
    /// waiting on a slow consumer. Stalled members are reported, not
    /// removed; the caller decides how to shed them.
    pub fn fan_out(&self, room: LeagueId, frame: &str, exclude: Option<ConnectionId>) -> FanOut {
        let mut result = FanOut::default();
        let Some(members) = self.rooms.get(&room) else {
            return result;
        };

        for (conn, member) in members {
            if Some(*conn) == exclude {
                continue;
            }
            match try_push(member, frame) {
                Delivery::Sent => result.delivered += 1,
                _ => result.stalled.push(*conn),
            }
        }
        result
    }
}

fn try_push(member: &Member, frame: &str) -> Delivery {
    match member.outbound.try_send(frame.to_string()) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => Delivery::Stalled,
    }
}
