#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Quiz Clash client integration tests.
//!
//! Provides a channel-based [`MockTransport`] plus helpers for constructing
//! common server message JSON strings. The [`ServerHandle`] returned by
//! [`MockTransport::new`] lets a test push server messages at controlled
//! points, which matters here because battle and room responses are only
//! accepted by the state machines after the matching client command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use quiz_clash_client::protocol::{
    AckStatus, BattleResult, Player, PlayerId, Presence, Question, ServerMessage,
};
use quiz_clash_client::{QuizClashError, Transport};
use tokio::sync::mpsc;

// ── MockTransport ───────────────────────────────────────────────────

type Incoming = Option<Result<String, QuizClashError>>;

/// A channel-based mock transport for integration testing.
///
/// Scripted server responses are consumed in order by `recv()`; more can be
/// pushed at any time through the [`ServerHandle`]. All messages sent by the
/// client are recorded in `sent`.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    pub sent: Arc<StdMutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

/// The test's side of the mock connection.
#[derive(Clone)]
pub struct ServerHandle(mpsc::UnboundedSender<Incoming>);

impl ServerHandle {
    /// Deliver one server message to the client.
    pub fn push(&self, json: String) {
        self.0.send(Some(Ok(json))).expect("transport dropped");
    }

    /// Deliver a transport-level receive error.
    pub fn fail(&self, message: &str) {
        self.0
            .send(Some(Err(QuizClashError::TransportReceive(message.into()))))
            .expect("transport dropped");
    }

    /// Close the connection cleanly from the server side.
    pub fn close(&self) {
        self.0.send(None).expect("transport dropped");
    }
}

impl MockTransport {
    /// Create a mock transport with the given scripted incoming messages.
    ///
    /// Returns the transport, a handle for pushing further messages, and
    /// shared handles for inspecting sent messages and the close flag.
    pub fn new(
        scripted: Vec<Incoming>,
    ) -> (
        Self,
        ServerHandle,
        Arc<StdMutex<Vec<String>>>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        for item in scripted {
            tx.send(item).expect("receiver alive");
        }
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming: rx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (transport, ServerHandle(tx), sent, closed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), QuizClashError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, QuizClashError>> {
        match self.incoming.recv().await {
            Some(item) => item,
            // The test dropped its handle — hang forever so the session
            // loop stays alive until shutdown is called.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), QuizClashError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── Fixture constructors ────────────────────────────────────────────

/// A deterministic test player with id `Uuid::from_u128(n)`.
pub fn player(n: u128) -> Player {
    Player {
        id: uuid::Uuid::from_u128(n),
        username: format!("player{n}"),
        avatar: format!("/avatars/{n}.png"),
        level: "Rookie".into(),
        presence: None,
    }
}

/// A deterministic two-option question with id `Uuid::from_u128(n)`.
pub fn question(n: u128) -> Question {
    Question {
        id: uuid::Uuid::from_u128(n),
        text: format!("question {n}"),
        options: vec![
            quiz_clash_client::protocol::AnswerOption {
                id: "A".into(),
                text: "first".into(),
            },
            quiz_clash_client::protocol::AnswerOption {
                id: "B".into(),
                text: "second".into(),
            },
        ],
    }
}

/// Current Unix time in milliseconds, for absolute question deadlines.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
}

// ── JSON helper functions ───────────────────────────────────────────

pub fn authenticated_json() -> String {
    serde_json::to_string(&ServerMessage::Authenticated).expect("serialize")
}

pub fn start_json(battle_id: uuid::Uuid, players: Vec<Player>) -> String {
    serde_json::to_string(&ServerMessage::Start { battle_id, players }).expect("serialize")
}

pub fn question_json(pos: u32, q: Question, next: i64, prev_ans: Option<&str>) -> String {
    serde_json::to_string(&ServerMessage::Question(Box::new(
        quiz_clash_client::protocol::QuestionPayload {
            pos,
            question: q,
            next,
            prev_ans: prev_ans.map(Into::into),
        },
    )))
    .expect("serialize")
}

pub fn results_json(results: Vec<BattleResult>, prev_ans: Option<&str>) -> String {
    serde_json::to_string(&ServerMessage::Results {
        results,
        prev_ans: prev_ans.map(Into::into),
    })
    .expect("serialize")
}

pub fn create_room_json(room_id: uuid::Uuid) -> String {
    serde_json::to_string(&ServerMessage::CreateRoom { room_id }).expect("serialize")
}

pub fn room_info_json(owner_id: PlayerId, members: Vec<Player>) -> String {
    serde_json::to_string(&ServerMessage::RoomInfo { owner_id, members }).expect("serialize")
}

pub fn join_room_alert_json(p: Player) -> String {
    serde_json::to_string(&ServerMessage::JoinRoomAlert { player: p }).expect("serialize")
}

pub fn starting_json(battle_id: uuid::Uuid) -> String {
    serde_json::to_string(&ServerMessage::Starting { battle_id }).expect("serialize")
}

pub fn friend_request_json(p: Player, time: &str) -> String {
    serde_json::to_string(&ServerMessage::FriendRequest {
        player: p,
        time: time.into(),
    })
    .expect("serialize")
}

pub fn friend_request_accept_json(friend_id: PlayerId) -> String {
    serde_json::to_string(&ServerMessage::FriendRequestAccept { friend_id }).expect("serialize")
}

pub fn unfriend_json(friend_id: PlayerId) -> String {
    serde_json::to_string(&ServerMessage::Unfriend { friend_id }).expect("serialize")
}

pub fn user_update_json(uid: PlayerId, status: Presence) -> String {
    serde_json::to_string(&ServerMessage::UserUpdate { uid, status }).expect("serialize")
}

pub fn ack_json(seq: u64, status: AckStatus, message: Option<&str>) -> String {
    serde_json::to_string(&ServerMessage::Ack {
        seq,
        status,
        message: message.map(Into::into),
    })
    .expect("serialize")
}
