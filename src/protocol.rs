//! Wire types for the Quiz Clash trivia battle protocol.
//!
//! Every message is a JSON object `{"type": "<event-name>", "data": ...}`
//! with kebab-case event names matching the server's named-event bus
//! (`join-waiting`, `question`, `invite-room`, ...). Unit variants omit the
//! `data` field entirely.
//!
//! Social-graph mutations ([`ClientMessage::FriendRequest`] and friends)
//! carry a client-assigned `seq` that the server echoes back in
//! [`ServerMessage::Ack`], replacing the per-emit acknowledgement callback
//! of the original transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for players.
pub type PlayerId = Uuid;

/// Unique identifier for multiplayer rooms.
pub type RoomId = Uuid;

/// Unique identifier for battles (one timed question sequence).
pub type BattleId = Uuid;

/// Unique identifier for questions.
pub type QuestionId = Uuid;

// ── Enums ───────────────────────────────────────────────────────────

/// A friend's online status as known to the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    #[default]
    Offline,
    /// Connected but currently in a battle.
    Busy,
    Online,
}

/// Battle mode: random 1v1 matchmaking or a private multiplayer room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BattleMode {
    #[serde(rename = "1v1")]
    OneVsOne,
    #[serde(rename = "multi")]
    Multiplayer,
}

/// Outcome of an acknowledged social mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Error,
}

// ── Structs ─────────────────────────────────────────────────────────

/// A player's public identity, owned by the server.
///
/// The client holds read-only cached copies; `presence` is merged with
/// locally-known overrides from `user-update` pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    /// Server-relative avatar path.
    pub avatar: String,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

/// One selectable answer for a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerOption {
    /// Short option key (e.g. `"A"`).
    pub id: String,
    pub text: String,
}

/// A quiz question. Immutable once received; one in flight at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    pub options: Vec<AnswerOption>,
}

/// One row of the final scoreboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleResult {
    pub player: Player,
    pub score: u32,
    /// Coin delta for this battle; negative when the entry cost exceeds
    /// the winnings.
    pub coins: i64,
}

/// Payload for the recurring `question` server event.
/// Boxed in [`ServerMessage`] to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionPayload {
    /// Zero-based position within the battle. Monotonically increasing.
    pub pos: u32,
    pub question: Question,
    /// Absolute server deadline for this question, in Unix epoch
    /// milliseconds. The visible countdown is derived at apply time.
    pub next: i64,
    /// Correct answer of the *previous* question. Absent when `pos == 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_ans: Option<String>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types emitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Authenticate with a session token (MUST be first message).
    Authenticate { token: String },
    /// Join the 1v1 random matchmaking pool.
    JoinWaiting,
    /// Leave the matchmaking pool before a match was found.
    LeaveWaiting,
    /// Signal readiness for a specific multiplayer battle.
    Ready { battle_id: BattleId },
    /// Submit an answer. Fire-and-forget; no acknowledgement.
    Answer {
        battle_id: BattleId,
        question_id: QuestionId,
        answer: String,
    },
    /// Leave the current battle.
    LeaveBattle,
    /// Create a new multiplayer room owned by this client.
    CreateRoom,
    /// Request the membership snapshot of an existing room.
    RoomInfo { room_id: RoomId },
    /// Invite a friend to the current room.
    InviteRoom { room_id: RoomId, friend_id: PlayerId },
    /// Start the battle for the current room (owner only).
    StartRoom { room_id: RoomId },
    /// Leave the current room.
    LeaveRoom,
    /// Send a friend request. Acknowledged via [`ServerMessage::Ack`].
    FriendRequest { friend_id: PlayerId, seq: u64 },
    /// Accept a pending friend request.
    FriendRequestAccept { friend_id: PlayerId, seq: u64 },
    /// Reject a pending friend request.
    FriendRequestReject { friend_id: PlayerId, seq: u64 },
    /// Remove an existing friend.
    Unfriend { friend_id: PlayerId, seq: u64 },
}

/// Message types pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Session token accepted.
    Authenticated,
    /// Session token rejected; no session will start.
    AuthError { message: String },
    /// Battle assembled: the one-shot answer to `join-waiting` / `ready`.
    Start {
        battle_id: BattleId,
        players: Vec<Player>,
    },
    /// Next question in the sequence (boxed to reduce enum size).
    Question(Box<QuestionPayload>),
    /// Terminal scoreboard, with the last question's correct answer.
    Results {
        results: Vec<BattleResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prev_ans: Option<String>,
    },
    /// An opponent left mid-battle. Informational only.
    LeaveBattle { player: Player },
    /// Response to `create-room` with the generated room id.
    CreateRoom { room_id: RoomId },
    /// Response to `room-info` with the current membership snapshot.
    RoomInfo {
        owner_id: PlayerId,
        members: Vec<Player>,
    },
    /// Another player joined the room.
    JoinRoomAlert { player: Player },
    /// Another player left the room.
    LeaveRoomAlert { player: Player },
    /// The server reassigned room ownership.
    OwnerUpdate { owner_id: PlayerId },
    /// The room's battle is starting; clients must signal `ready`.
    Starting { battle_id: BattleId },
    /// Another player invited this client to their room.
    InviteRoom { room_id: RoomId, player: Player },
    /// Incoming friend request.
    FriendRequest { player: Player, time: String },
    /// A previously sent friend request was accepted.
    FriendRequestAccept { friend_id: PlayerId },
    /// A previously sent friend request was rejected.
    FriendRequestReject { friend_id: PlayerId },
    /// A friend removed this client.
    Unfriend { friend_id: PlayerId },
    /// Presence change for a friend.
    UserUpdate { uid: PlayerId, status: Presence },
    /// Acknowledgement for a seq-carrying social mutation.
    Ack {
        seq: u64,
        status: AckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Generic server error.
    Error { message: String },
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn client_message_event_names_are_kebab_case() {
        let json = serde_json::to_value(ClientMessage::JoinWaiting).unwrap();
        assert_eq!(json["type"], "join-waiting");

        let json = serde_json::to_value(ClientMessage::FriendRequestAccept {
            friend_id: Uuid::nil(),
            seq: 7,
        })
        .unwrap();
        assert_eq!(json["type"], "friend-request-accept");
        assert_eq!(json["data"]["seq"], 7);
    }

    #[test]
    fn unit_variants_omit_data() {
        let json = serde_json::to_string(&ClientMessage::LeaveBattle).unwrap();
        assert_eq!(json, r#"{"type":"leave-battle"}"#);
    }

    #[test]
    fn question_payload_round_trips() {
        let payload = QuestionPayload {
            pos: 3,
            question: Question {
                id: Uuid::from_u128(9),
                text: "Largest planet?".into(),
                options: vec![
                    AnswerOption {
                        id: "A".into(),
                        text: "Jupiter".into(),
                    },
                    AnswerOption {
                        id: "B".into(),
                        text: "Saturn".into(),
                    },
                ],
            },
            next: 1_700_000_015_000,
            prev_ans: Some("B".into()),
        };
        let json =
            serde_json::to_string(&ServerMessage::Question(Box::new(payload.clone()))).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ServerMessage::Question(Box::new(payload)));
    }

    #[test]
    fn prev_ans_is_optional() {
        let json = r#"{"type":"question","data":{"pos":0,"question":{"id":"00000000-0000-0000-0000-000000000001","text":"q","options":[]},"next":0}}"#;
        let parsed: ServerMessage = serde_json::from_str(json).unwrap();
        if let ServerMessage::Question(payload) = parsed {
            assert_eq!(payload.pos, 0);
            assert!(payload.prev_ans.is_none());
        } else {
            panic!("expected Question message");
        }
    }

    #[test]
    fn presence_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&Presence::Online).unwrap(),
            r#""online""#
        );
        assert_eq!(serde_json::to_string(&Presence::Busy).unwrap(), r#""busy""#);
    }

    #[test]
    fn battle_mode_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&BattleMode::OneVsOne).unwrap(),
            r#""1v1""#
        );
        assert_eq!(
            serde_json::to_string(&BattleMode::Multiplayer).unwrap(),
            r#""multi""#
        );
    }

    #[test]
    fn ack_round_trips() {
        let msg = ServerMessage::Ack {
            seq: 42,
            status: AckStatus::Error,
            message: Some("already friends".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        let result = serde_json::from_str::<ServerMessage>(r#"{"type":"mystery"}"#);
        assert!(result.is_err());
    }
}
