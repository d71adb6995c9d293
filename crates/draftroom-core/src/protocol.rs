// Wire protocol between draft-room clients and the hub.
//
// Every frame is a JSON object carrying a `kind` discriminator. Inbound
// frames nest their data under `payload`; outbound frames are flat.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pick::PickRecord;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// External league identifier. Doubles as the room key and as the partition
/// key for the league's pick table, so it must be strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeagueId(i64);

impl LeagueId {
    /// Returns `None` for zero or negative ids.
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeagueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable external account id of the user behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Body of a `pick` frame. Older clients send PascalCase keys (`Player`,
/// `Pick`, ...), which are accepted alongside the lowercase ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickPayload {
    #[serde(alias = "Player")]
    pub player: i64,
    #[serde(alias = "Pick")]
    pub pick: i64,
    #[serde(alias = "Team")]
    pub team: i64,
    #[serde(alias = "League")]
    pub league: i64,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `message`: chat text to relay to the room.
    Chat(String),
    /// `pick`: a draft selection claiming a sequence position.
    Pick(PickPayload),
    /// `history`: request for the league's persisted picks.
    History,
    /// Any other `kind`. Logged and discarded by the edge.
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object with a `kind`: {0}")]
    Frame(#[source] serde_json::Error),

    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(alias = "Kind")]
    kind: String,
    #[serde(default, alias = "Payload")]
    payload: serde_json::Value,
}

/// Decode one inbound text frame.
///
/// Unknown kinds are not an error: they come back as
/// [`ClientMessage::Unknown`] so the caller can log and move on. A frame
/// that is not JSON, or a known kind whose payload has the wrong shape, is a
/// [`DecodeError`].
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(DecodeError::Frame)?;

    match raw.kind.as_str() {
        "message" => serde_json::from_value::<String>(raw.payload)
            .map(ClientMessage::Chat)
            .map_err(|source| DecodeError::Payload {
                kind: "message",
                source,
            }),
        "pick" => serde_json::from_value::<PickPayload>(raw.payload)
            .map(ClientMessage::Pick)
            .map_err(|source| DecodeError::Payload {
                kind: "pick",
                source,
            }),
        "history" => Ok(ClientMessage::History),
        _ => Ok(ClientMessage::Unknown(raw.kind)),
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Why a pick submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The claimed sequence number is not the next one the store would
    /// assign. The client's view of the draft is stale.
    OutOfOrder,
    /// The player has already been drafted in this league.
    PlayerTaken,
    /// The payload names a league other than the room it was sent from.
    WrongLeague,
    /// The pick could not be persisted.
    StoreUnavailable,
}

/// Messages pushed from the hub to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Presence change of one user in the room.
    Status { user: UserId, active: bool },
    /// Full member list, sent only to a connection that just joined.
    Users { users: Vec<UserId> },
    Chat { user: UserId, payload: String },
    /// A pick that has been committed and is now canonical.
    Draft { pick: i64, player: i64, team: i64 },
    History { picks: Vec<PickRecord> },
    /// Sent only to the submitter of a refused pick. `expected` is set for
    /// out-of-order picks and holds the next open sequence number.
    Rejected {
        pick: i64,
        player: i64,
        team: i64,
        reason: RejectReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<i64>,
    },
}

impl ServerMessage {
    /// Serialize into the text frame handed to outbound queues.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn league_id_rejects_non_positive() {
        assert!(LeagueId::new(0).is_none());
        assert!(LeagueId::new(-3).is_none());
        assert_eq!(LeagueId::new(7).map(LeagueId::get), Some(7));
    }

    #[test]
    fn decodes_chat_message() {
        let msg = decode_client_message(r#"{"kind":"message","payload":"good luck all"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Chat("good luck all".into()));
    }

    #[test]
    fn decodes_legacy_pascal_case_pick() {
        let text = r#"{"Kind":"pick","Payload":{"Player":4021,"Pick":3,"Team":12,"League":9}}"#;
        let msg = decode_client_message(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Pick(PickPayload {
                player: 4021,
                pick: 3,
                team: 12,
                league: 9,
            })
        );
    }

    #[test]
    fn history_needs_no_payload() {
        let msg = decode_client_message(r#"{"kind":"history"}"#).unwrap();
        assert_eq!(msg, ClientMessage::History);
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let msg = decode_client_message(r#"{"kind":"trade","payload":{"x":1}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown("trade".into()));
    }

    #[test]
    fn malformed_pick_payload_is_an_error() {
        let err = decode_client_message(r#"{"kind":"pick","payload":{"player":"abc"}}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Payload { kind: "pick", .. }));
    }

    #[test]
    fn non_string_chat_payload_is_an_error() {
        let err = decode_client_message(r#"{"kind":"message","payload":42}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { kind: "message", .. }));
    }

    #[test]
    fn garbage_is_a_frame_error() {
        assert!(matches!(
            decode_client_message("not json at all"),
            Err(DecodeError::Frame(_))
        ));
        assert!(matches!(
            decode_client_message(r#"{"payload":"no kind"}"#),
            Err(DecodeError::Frame(_))
        ));
    }

    #[test]
    fn outbound_frames_use_kind_discriminator() {
        let status = ServerMessage::Status {
            user: UserId(5),
            active: true,
        };
        let value: serde_json::Value = serde_json::from_str(&status.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"kind": "status", "user": 5, "active": true}));

        let draft = ServerMessage::Draft {
            pick: 1,
            player: 99,
            team: 3,
        };
        let value: serde_json::Value = serde_json::from_str(&draft.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"kind": "draft", "pick": 1, "player": 99, "team": 3}));
    }

    #[test]
    fn rejection_omits_expected_when_absent() {
        let rejected = ServerMessage::Rejected {
            pick: 4,
            player: 10,
            team: 2,
            reason: RejectReason::PlayerTaken,
            expected: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&rejected.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"kind": "rejected", "pick": 4, "player": 10, "team": 2, "reason": "player_taken"})
        );
    }
}
