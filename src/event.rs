//! Events emitted by the client to the application.
//!
//! Events are delivered through the bounded channel returned by
//! `QuizClashClient::start`. They describe state transitions the UI should
//! render; full snapshots are available from the handle's accessor methods.

use crate::protocol::{BattleId, BattleResult, Player, PlayerId, Presence, Question, RoomId};
use crate::social::SocialAction;

/// A cached collection the application should refetch after a server-side
/// change invalidated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedCollection {
    /// The friends list.
    Friends,
    /// Incoming friend requests.
    Invites,
    /// Battle history.
    Battles,
    /// The user's own profile (level, coins).
    Profile,
}

/// An event emitted by the client session.
#[derive(Debug, Clone, PartialEq)]
pub enum QuizClashEvent {
    // ── Connection lifecycle ────────────────────────────────────────
    /// The session loop is running on a live transport.
    Connected,
    /// The server accepted the auth token.
    Authenticated,
    /// The server rejected the auth token. The session keeps running but
    /// gameplay messages will be refused server-side.
    AuthFailed {
        message: String,
    },
    /// The session ended. Always the final event; delivery is guaranteed
    /// even when the event channel is full.
    Disconnected {
        /// `None` for a requested shutdown, `Some` for a transport failure.
        reason: Option<String>,
    },

    // ── Battle session ──────────────────────────────────────────────
    /// Matchmaking ended without a battle.
    MatchingAborted {
        reason: String,
    },
    /// A battle began against the given opponents.
    BattleStarted {
        battle_id: BattleId,
        opponents: Vec<Player>,
    },
    /// A new question is live; the answer countdown starts now.
    QuestionPosted {
        position: u32,
        question: Question,
        duration_secs: u32,
    },
    /// The correct answer to the question at `position` is being revealed.
    /// The next question (or the results) follows after the reveal window.
    AnswerReveal {
        position: u32,
        correct_answer: String,
    },
    /// Final standings, sorted by score descending.
    BattleResults {
        results: Vec<BattleResult>,
    },
    /// An opponent left the battle before it finished.
    OpponentLeft {
        player: Player,
    },

    // ── Room lifecycle ──────────────────────────────────────────────
    /// The server created a room owned by this user.
    RoomCreated {
        room_id: RoomId,
    },
    /// Joined an existing room; `members` lists the other players.
    RoomJoined {
        room_id: RoomId,
        owner_id: PlayerId,
        members: Vec<Player>,
    },
    /// Another player entered the room.
    MemberJoined {
        player: Player,
    },
    /// A player left the room.
    MemberLeft {
        player: Player,
    },
    /// Room ownership transferred.
    OwnerChanged {
        owner_id: PlayerId,
    },
    /// An invite went unanswered past the invite timeout.
    InviteExpired {
        friend_id: PlayerId,
    },
    /// The owner started the room; a multiplayer battle is being set up.
    RoomStarting {
        battle_id: BattleId,
    },
    /// A friend invited this user to their room.
    RoomInviteReceived {
        room_id: RoomId,
        player: Player,
    },

    // ── Social graph ────────────────────────────────────────────────
    /// Another player sent a friend request.
    FriendRequestReceived {
        player: Player,
        /// Server-formatted timestamp of the request.
        time: String,
    },
    /// A player accepted this user's friend request.
    FriendRequestAccepted {
        friend_id: PlayerId,
    },
    /// A player rejected this user's friend request.
    FriendRequestRejected {
        friend_id: PlayerId,
    },
    /// A friend removed this user.
    Unfriended {
        friend_id: PlayerId,
    },
    /// A friend's presence changed.
    PresenceChanged {
        uid: PlayerId,
        presence: Presence,
    },
    /// The server rejected an optimistic social action; the local graph has
    /// been rolled back.
    SocialActionFailed {
        action: SocialAction,
        reason: String,
    },

    // ── Cache hints ─────────────────────────────────────────────────
    /// A cached collection is stale and should be refetched.
    RefreshNeeded {
        collection: CachedCollection,
    },

    // ── Errors ──────────────────────────────────────────────────────
    /// The server reported an error that does not map to a state machine.
    ServerError {
        message: String,
    },
}
