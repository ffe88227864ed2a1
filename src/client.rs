//! Async client for the Quiz Clash battle protocol.
//!
//! [`QuizClashClient`] is a thin handle that communicates with a background
//! session loop task via an unbounded MPSC channel. Events are emitted on a
//! bounded channel ([`tokio::sync::mpsc::Receiver<QuizClashEvent>`]) returned
//! from [`QuizClashClient::start`].
//!
//! The session loop owns every piece of mutable session state: the battle
//! state machine, the room lifecycle, the social graph and its in-flight
//! optimistic mutations, plus the reveal-delay and invite-expiry deadlines.
//! Because all of it lives inside one task, teardown is exhaustive by
//! construction — when the loop exits, no timer or pending advance survives.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = connect_somehow().await;
//! let config = QuizClashConfig::new(my_player_id, "session-token");
//! let (client, mut events) = QuizClashClient::start(transport, config);
//!
//! client.find_match()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         QuizClashEvent::QuestionPosted { question, .. } => { /* … */ }
//!         QuizClashEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::battle::{Advance, BattlePhase, BattleSession, BattleState, PendingAdvance};
use crate::error::{QuizClashError, Result};
use crate::event::{CachedCollection, QuizClashEvent};
use crate::protocol::{AckStatus, ClientMessage, PlayerId, RoomId, ServerMessage};
use crate::room::{RoomLifecycle, RoomPhase, RoomState};
use crate::social::{MutationEngine, SocialAction, SocialGraph};
use crate::timer::ExpiryTimer;
use crate::transport::Transport;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default reveal window between an answer reveal and the next prompt.
const DEFAULT_REVEAL_DELAY: Duration = Duration::from_secs(1);

/// Default lifetime of an unanswered room invite.
const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`QuizClashClient`] session.
///
/// Must be supplied to [`QuizClashClient::start`]. The required fields are
/// the local player's id and the session token; all others have sensible
/// defaults.
///
/// # Tuning
///
/// ```
/// use quiz_clash_client::client::QuizClashConfig;
/// use std::time::Duration;
///
/// let config = QuizClashConfig::new(uuid::Uuid::new_v4(), "token")
///     .with_reveal_delay(Duration::from_millis(1500))
///     .with_event_channel_capacity(512);
/// ```
#[derive(Debug, Clone)]
pub struct QuizClashConfig {
    /// The local player's id, used to split `players` into self and
    /// opponents and to decide room ownership.
    pub player_id: PlayerId,
    /// Session token sent in the initial `authenticate` message.
    pub auth_token: String,
    /// How long the previous question's correct answer stays on screen
    /// before the next question (or the results) is applied.
    ///
    /// Defaults to **1 second**.
    pub reveal_delay: Duration,
    /// How long a room invite stays pending before it expires locally.
    ///
    /// Defaults to **10 seconds**.
    pub invite_timeout: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up with incoming server messages,
    /// events are dropped (with a warning logged) to avoid blocking the
    /// session loop. The `Disconnected` event is always delivered
    /// regardless of capacity.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// When [`QuizClashClient::shutdown`] is called, the background session
    /// loop is given this much time to close the transport and emit a final
    /// `Disconnected` event. If the timeout expires the task is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl QuizClashConfig {
    /// Create a new configuration with the given identity and defaults.
    pub fn new(player_id: PlayerId, auth_token: impl Into<String>) -> Self {
        Self {
            player_id,
            auth_token: auth_token.into(),
            reveal_delay: DEFAULT_REVEAL_DELAY,
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the reveal window duration.
    #[must_use]
    pub fn with_reveal_delay(mut self, delay: Duration) -> Self {
        self.reveal_delay = delay;
        self
    }

    /// Set the local lifetime of unanswered room invites.
    #[must_use]
    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// Requests from the client handle to the session loop.
#[derive(Debug)]
enum Command {
    FindMatch,
    CreateRoom,
    JoinRoom(RoomId),
    InviteFriend(PlayerId),
    StartRoom,
    SelectOption(String),
    LeaveBattle,
    LeaveRoom,
    Social(SocialAction),
    ResetInvitesBadge,
    ResetFriendsBadge,
}

// ── Shared state ────────────────────────────────────────────────────

/// Internal shared state between the client handle and the session loop.
///
/// The loop owns the live state machines; after every mutation it publishes
/// cloned snapshots here for the handle's accessors.
struct SharedState {
    connected: AtomicBool,
    authenticated: AtomicBool,
    battle: Mutex<BattleState>,
    room: Mutex<RoomState>,
    social: Mutex<SocialGraph>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            battle: Mutex::new(BattleState::default()),
            room: Mutex::new(RoomState::default()),
            social: Mutex::new(SocialGraph::default()),
        }
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Async client handle for the Quiz Clash battle protocol.
///
/// Created via [`QuizClashClient::start`], which spawns a background session
/// loop and returns this handle together with an event receiver.
///
/// All public methods queue a command to the session loop over an unbounded
/// channel and return immediately once the command is queued (no round-trip
/// await).
pub struct QuizClashClient {
    /// Sender half of the command channel to the session loop.
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// The local player id, for room ownership prechecks.
    player_id: PlayerId,
    /// Shared state updated by the session loop.
    state: Arc<SharedState>,
    /// Handle to the background session loop task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to signal the session loop to shut down gracefully.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Timeout for the graceful shutdown.
    shutdown_timeout: Duration,
}

impl QuizClashClient {
    /// Start the session loop and return a handle plus event receiver.
    ///
    /// The loop immediately sends an [`Authenticate`](ClientMessage::Authenticate)
    /// message with the configured token, before any queued command.
    ///
    /// # Returns
    ///
    /// A tuple of `(client_handle, event_receiver)`. The event receiver
    /// yields [`QuizClashEvent`]s until the transport closes or the client
    /// shuts down; `Disconnected` is always the final event.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        transport: impl Transport,
        config: QuizClashConfig,
    ) -> (Self, mpsc::Receiver<QuizClashEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<QuizClashEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let state = Arc::new(SharedState::new());
        let shutdown_timeout = config.shutdown_timeout;
        let player_id = config.player_id;
        let auth_token = config.auth_token.clone();

        let core = SessionCore::new(config, Arc::clone(&state), event_tx);
        let task = tokio::spawn(session_loop(
            transport,
            cmd_rx,
            core,
            shutdown_rx,
            auth_token,
        ));

        let client = Self {
            cmd_tx,
            player_id,
            state,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };

        (client, event_rx)
    }

    // ── Battle API ──────────────────────────────────────────────────

    /// Enter the 1v1 random matchmaking pool.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn find_match(&self) -> Result<()> {
        self.send(Command::FindMatch)
    }

    /// Lock in an answer option for the current question.
    ///
    /// Selection is first-write-wins per question: once an option is locked,
    /// further calls are silently ignored until the next question.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn select_option(&self, option_id: impl Into<String>) -> Result<()> {
        self.send(Command::SelectOption(option_id.into()))
    }

    /// Leave the current battle (or the matchmaking pool).
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn leave_battle(&self) -> Result<()> {
        self.send(Command::LeaveBattle)
    }

    // ── Room API ────────────────────────────────────────────────────

    /// Create a new multiplayer room owned by this client.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn create_room(&self) -> Result<()> {
        self.send(Command::CreateRoom)
    }

    /// Join an existing room by id.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn join_room(&self, room_id: RoomId) -> Result<()> {
        self.send(Command::JoinRoom(room_id))
    }

    /// Invite a friend to the current room. The invite expires locally after
    /// the configured invite timeout unless the friend joins first.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn invite_friend(&self, friend_id: PlayerId) -> Result<()> {
        self.send(Command::InviteFriend(friend_id))
    }

    /// Start the battle for the current room.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotInRoom`] outside a ready room,
    /// [`QuizClashError::NotRoomOwner`] if someone else owns the room, and
    /// [`QuizClashError::NotConnected`] if the session has ended.
    pub async fn start_room(&self) -> Result<()> {
        // Precheck against the latest snapshot so the caller gets a typed
        // error instead of a silently dropped command.
        {
            let room = self.state.room.lock().await;
            if room.phase != RoomPhase::Ready {
                return Err(QuizClashError::NotInRoom);
            }
            if room.owner_id != Some(self.player_id) {
                return Err(QuizClashError::NotRoomOwner);
            }
        }
        self.send(Command::StartRoom)
    }

    /// Leave the current room.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn leave_room(&self) -> Result<()> {
        self.send(Command::LeaveRoom)
    }

    // ── Social API ──────────────────────────────────────────────────

    /// Send a friend request. Applied optimistically; a server rejection
    /// rolls the graph back and emits
    /// [`SocialActionFailed`](QuizClashEvent::SocialActionFailed).
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn send_friend_request(&self, friend_id: PlayerId) -> Result<()> {
        self.send(Command::Social(SocialAction::SendRequest(friend_id)))
    }

    /// Accept a pending incoming friend request (optimistic).
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn accept_friend_request(&self, friend_id: PlayerId) -> Result<()> {
        self.send(Command::Social(SocialAction::AcceptInvite(friend_id)))
    }

    /// Reject a pending incoming friend request (optimistic).
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn reject_friend_request(&self, friend_id: PlayerId) -> Result<()> {
        self.send(Command::Social(SocialAction::RejectInvite(friend_id)))
    }

    /// Remove an existing friend (optimistic).
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn unfriend(&self, friend_id: PlayerId) -> Result<()> {
        self.send(Command::Social(SocialAction::Unfriend(friend_id)))
    }

    /// Mark incoming friend requests as seen, resetting the badge counter.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn mark_invites_seen(&self) -> Result<()> {
        self.send(Command::ResetInvitesBadge)
    }

    /// Mark accepted requests as seen, resetting the badge counter.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotConnected`] if the session has ended.
    pub fn mark_friends_seen(&self) -> Result<()> {
        self.send(Command::ResetFriendsBadge)
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Returns `true` if the transport is believed to be connected.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    /// Returns `true` if the server has confirmed authentication.
    pub fn is_authenticated(&self) -> bool {
        self.state.authenticated.load(Ordering::Acquire)
    }

    /// Snapshot of the battle session state.
    pub async fn battle_state(&self) -> BattleState {
        self.state.battle.lock().await.clone()
    }

    /// Snapshot of the room lifecycle state.
    pub async fn room_state(&self) -> RoomState {
        self.state.room.lock().await.clone()
    }

    /// Snapshot of the social graph.
    pub async fn social_graph(&self) -> SocialGraph {
        self.state.social.lock().await.clone()
    }

    /// Shut down the client, closing the transport and stopping the
    /// background task.
    ///
    /// After calling this method, the event receiver will yield `None` once
    /// the session loop exits.
    pub async fn shutdown(&mut self) {
        debug!("QuizClashClient: shutdown requested");

        // Signal the session loop to shut down gracefully.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the session loop with a timeout. If it doesn't exit in time,
        // abort it so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.state.connected.store(false, Ordering::Release);
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Queue a command to the session loop.
    fn send(&self, cmd: Command) -> Result<()> {
        if !self.state.connected.load(Ordering::Acquire) {
            return Err(QuizClashError::NotConnected);
        }
        self.cmd_tx
            .send(cmd)
            .map_err(|_| QuizClashError::NotConnected)
    }
}

impl std::fmt::Debug for QuizClashClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuizClashClient")
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for QuizClashClient {
    fn drop(&mut self) {
        // `Drop` is synchronous so we cannot await a graceful shutdown.
        // The only safe action is to abort the spawned task, which causes
        // the session loop future to be dropped immediately. The
        // `shutdown_tx` oneshot is intentionally *not* sent here: sending
        // it would trigger a graceful path that calls async `transport.close()`,
        // but there is no executor context to drive it inside `Drop`.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session core ────────────────────────────────────────────────────

/// A deferred battle advance behind its reveal deadline.
struct ScheduledAdvance {
    deadline: Instant,
    advance: PendingAdvance,
}

/// The session loop's owned state: every machine, timer, and counter.
struct SessionCore {
    reveal_delay: Duration,
    invite_timeout: Duration,
    battle: BattleSession,
    room: RoomLifecycle,
    social: SocialGraph,
    engine: MutationEngine,
    invites: ExpiryTimer<PlayerId>,
    pending: Option<ScheduledAdvance>,
    shared: Arc<SharedState>,
    event_tx: mpsc::Sender<QuizClashEvent>,
}

impl SessionCore {
    fn new(
        config: QuizClashConfig,
        shared: Arc<SharedState>,
        event_tx: mpsc::Sender<QuizClashEvent>,
    ) -> Self {
        Self {
            reveal_delay: config.reveal_delay,
            invite_timeout: config.invite_timeout,
            battle: BattleSession::new(config.player_id),
            room: RoomLifecycle::new(config.player_id),
            social: SocialGraph::default(),
            engine: MutationEngine::new(),
            invites: ExpiryTimer::new(),
            pending: None,
            shared,
            event_tx,
        }
    }

    /// Emit an event. If the channel is full, log a warning and drop the
    /// event to avoid blocking the session loop.
    fn emit(&self, event: QuizClashEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Publish cloned snapshots of every machine for the handle accessors.
    async fn sync_shared(&self) {
        *self.shared.battle.lock().await = self.battle.state().clone();
        *self.shared.room.lock().await = self.room.state().clone();
        *self.shared.social.lock().await = self.social.clone();
    }

    /// Handle a command from the client handle, returning outgoing messages.
    fn on_command(&mut self, cmd: Command) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        match cmd {
            Command::FindMatch => {
                out.extend(self.battle.enter_one_vs_one());
            }
            Command::CreateRoom => {
                out.extend(self.room.create());
            }
            Command::JoinRoom(room_id) => {
                out.extend(self.room.join(room_id));
            }
            Command::InviteFriend(friend_id) => {
                if let Some(msg) = self.room.send_invite(friend_id) {
                    self.invites.arm(friend_id, self.invite_timeout);
                    out.push(msg);
                }
            }
            Command::StartRoom => match self.room.start() {
                Ok(msg) => out.push(msg),
                Err(e) => debug!("dropping start-room command: {e}"),
            },
            Command::SelectOption(option_id) => {
                out.extend(self.battle.select_option(option_id));
            }
            Command::LeaveBattle => {
                // Leaving cancels any scheduled advance with it. The machine
                // is recycled so the next matchmaking request starts clean.
                self.pending = None;
                out.extend(self.battle.leave());
                self.battle.reset();
            }
            Command::LeaveRoom => {
                self.invites.clear();
                out.extend(self.room.leave());
                self.room.reset();
            }
            Command::Social(action) => {
                out.push(self.engine.dispatch(action, &mut self.social));
            }
            Command::ResetInvitesBadge => self.social.reset_invites_badge(),
            Command::ResetFriendsBadge => self.social.reset_friends_badge(),
        }
        out
    }

    /// Route a server message through the state machines, returning outgoing
    /// messages (the `starting` handoff replies with `leave-room`/`ready`).
    fn on_message(&mut self, msg: ServerMessage) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        match msg {
            ServerMessage::Authenticated => {
                self.shared.authenticated.store(true, Ordering::Release);
                self.emit(QuizClashEvent::Authenticated);
            }
            ServerMessage::AuthError { message } => {
                self.emit(QuizClashEvent::AuthFailed { message });
            }
            ServerMessage::Start { battle_id, players } => {
                if self.battle.handle_start(battle_id, players) {
                    self.emit(QuizClashEvent::BattleStarted {
                        battle_id,
                        opponents: self.battle.state().opponents.clone(),
                    });
                }
            }
            ServerMessage::Question(payload) => {
                match self.battle.handle_question(*payload, unix_millis_now()) {
                    Advance::Applied => self.emit_question_posted(),
                    Advance::Deferred(advance) => self.schedule_advance(advance),
                    Advance::Ignored => {}
                }
            }
            ServerMessage::Results { results, prev_ans } => {
                match self.battle.handle_results(results, prev_ans) {
                    Advance::Deferred(advance) => self.schedule_advance(advance),
                    Advance::Applied | Advance::Ignored => {}
                }
            }
            ServerMessage::LeaveBattle { player } => {
                // Informational once the scoreboard is up or the session
                // ended; the original UI unhooks this listener at results.
                if matches!(
                    self.battle.state().phase,
                    BattlePhase::Active | BattlePhase::Revealing
                ) {
                    self.emit(QuizClashEvent::OpponentLeft { player });
                }
            }
            ServerMessage::CreateRoom { room_id } => {
                if self.room.handle_created(room_id) {
                    self.emit(QuizClashEvent::RoomCreated { room_id });
                }
            }
            ServerMessage::RoomInfo { owner_id, members } => {
                if self.room.handle_info(owner_id, members) {
                    if let Some(room_id) = self.room.state().room_id {
                        self.emit(QuizClashEvent::RoomJoined {
                            room_id,
                            owner_id,
                            members: self.room.state().members.clone(),
                        });
                    }
                }
            }
            ServerMessage::JoinRoomAlert { player } => {
                self.invites.cancel(&player.id);
                if self.room.handle_member_joined(player.clone()) {
                    self.emit(QuizClashEvent::MemberJoined { player });
                }
            }
            ServerMessage::LeaveRoomAlert { player } => {
                self.invites.cancel(&player.id);
                if let Some(player) = self.room.handle_member_left(player.id) {
                    self.emit(QuizClashEvent::MemberLeft { player });
                }
            }
            ServerMessage::OwnerUpdate { owner_id } => {
                if self.room.handle_owner_update(owner_id) {
                    self.emit(QuizClashEvent::OwnerChanged { owner_id });
                }
            }
            ServerMessage::Starting { battle_id } => {
                // Room-to-battle handoff: leave the lobby (voiding pending
                // invites) and signal readiness for the new battle. The room
                // machine is recycled so another lobby can open later.
                self.invites.clear();
                out.extend(self.room.leave());
                self.room.reset();
                self.emit(QuizClashEvent::RoomStarting { battle_id });
                out.extend(self.battle.enter_multiplayer(battle_id));
            }
            ServerMessage::InviteRoom { room_id, player } => {
                self.emit(QuizClashEvent::RoomInviteReceived { room_id, player });
            }
            ServerMessage::FriendRequest { player, time } => {
                if self.social.apply_friend_request(player.id) {
                    self.emit(QuizClashEvent::FriendRequestReceived { player, time });
                    self.emit(QuizClashEvent::RefreshNeeded {
                        collection: CachedCollection::Invites,
                    });
                }
            }
            ServerMessage::FriendRequestAccept { friend_id } => {
                self.social.apply_request_accepted(friend_id);
                self.emit(QuizClashEvent::FriendRequestAccepted { friend_id });
                self.emit(QuizClashEvent::RefreshNeeded {
                    collection: CachedCollection::Friends,
                });
            }
            ServerMessage::FriendRequestReject { friend_id } => {
                if self.social.apply_request_rejected(friend_id) {
                    self.emit(QuizClashEvent::FriendRequestRejected { friend_id });
                }
            }
            ServerMessage::Unfriend { friend_id } => {
                if self.social.apply_unfriended(friend_id) {
                    self.emit(QuizClashEvent::Unfriended { friend_id });
                    self.emit(QuizClashEvent::RefreshNeeded {
                        collection: CachedCollection::Friends,
                    });
                }
            }
            ServerMessage::UserUpdate { uid, status } => {
                if self.social.apply_presence(uid, status) {
                    self.emit(QuizClashEvent::PresenceChanged {
                        uid,
                        presence: status,
                    });
                }
            }
            ServerMessage::Ack {
                seq,
                status,
                message,
            } => match status {
                AckStatus::Success => {
                    if let Some(action) = self.engine.resolve_success(seq) {
                        for collection in refresh_after(action) {
                            self.emit(QuizClashEvent::RefreshNeeded { collection });
                        }
                    }
                }
                AckStatus::Error => {
                    if let Some(action) = self.engine.resolve_failure(seq, &mut self.social) {
                        self.emit(QuizClashEvent::SocialActionFailed {
                            action,
                            reason: message.unwrap_or_default(),
                        });
                    }
                }
            },
            ServerMessage::Error { message } => {
                self.emit(QuizClashEvent::ServerError { message });
            }
        }
        out
    }

    /// Stamp the reveal and arm the deadline for the deferred advance.
    fn schedule_advance(&mut self, advance: PendingAdvance) {
        let state = self.battle.state();
        if let Some(correct_answer) = state.correct_answer.clone() {
            self.emit(QuizClashEvent::AnswerReveal {
                position: state.position,
                correct_answer,
            });
        }
        self.pending = Some(ScheduledAdvance {
            deadline: Instant::now() + self.reveal_delay,
            advance,
        });
    }

    /// The reveal window elapsed: apply the deferred advance.
    fn on_reveal_elapsed(&mut self) {
        let Some(scheduled) = self.pending.take() else {
            return;
        };
        match scheduled.advance {
            PendingAdvance::Question {
                pos,
                question,
                next,
            } => {
                self.battle
                    .apply_question(pos, question, next, unix_millis_now());
                self.emit_question_posted();
            }
            PendingAdvance::Results { results } => {
                self.battle.apply_results(results);
                if self.battle.state().phase == BattlePhase::Results {
                    self.emit(QuizClashEvent::BattleResults {
                        results: self.battle.state().results.clone(),
                    });
                    // Scores and coin deltas invalidate the cached history
                    // and profile.
                    self.emit(QuizClashEvent::RefreshNeeded {
                        collection: CachedCollection::Battles,
                    });
                    self.emit(QuizClashEvent::RefreshNeeded {
                        collection: CachedCollection::Profile,
                    });
                }
            }
        }
    }

    /// Invite deadlines passed: expire each one that is still pending.
    fn on_invites_elapsed(&mut self) {
        for friend_id in self.invites.drain_expired(Instant::now()) {
            if self.room.expire_invite(friend_id) {
                self.emit(QuizClashEvent::InviteExpired { friend_id });
            }
        }
    }

    /// Emit the live question after it was applied, if the session survived.
    fn emit_question_posted(&mut self) {
        let state = self.battle.state();
        if state.phase != BattlePhase::Active {
            return;
        }
        if let Some(question) = state.question.clone() {
            self.emit(QuizClashEvent::QuestionPosted {
                position: state.position,
                question,
                duration_secs: state.duration_secs,
            });
        }
    }

    /// Exit messages for a graceful teardown: leave any live battle and room.
    fn teardown(&mut self) -> Vec<ClientMessage> {
        self.pending = None;
        self.invites.clear();
        let mut out = Vec::new();
        out.extend(self.battle.leave());
        out.extend(self.room.leave());
        out
    }

    /// The transport failed or closed: abort matchmaking so the user is
    /// never stuck on the searching screen.
    fn on_transport_lost(&mut self, reason: &str) {
        if self.battle.abort_matching() {
            self.emit(QuizClashEvent::MatchingAborted {
                reason: reason.to_string(),
            });
        }
    }
}

/// The cached collections a confirmed social action invalidates.
fn refresh_after(action: SocialAction) -> Vec<CachedCollection> {
    match action {
        SocialAction::SendRequest(_) => Vec::new(),
        SocialAction::AcceptInvite(_) => {
            vec![CachedCollection::Friends, CachedCollection::Invites]
        }
        SocialAction::RejectInvite(_) => vec![CachedCollection::Invites],
        SocialAction::Unfriend(_) => vec![CachedCollection::Friends],
    }
}

/// Current Unix time in milliseconds.
fn unix_millis_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sleep until `deadline`, or forever when there is none.
///
/// Used as a `tokio::select!` branch guarded by `deadline.is_some()`, so the
/// pending future is never actually awaited to completion.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Session loop ────────────────────────────────────────────────────

/// Background session loop that multiplexes commands, server messages, and
/// internal deadlines via `tokio::select!`.
///
/// Exits when:
/// - The command channel closes (client handle dropped or shutdown called)
/// - The transport returns `None` (server closed connection)
/// - A transport error occurs
async fn session_loop(
    mut transport: impl Transport,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut core: SessionCore,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    auth_token: String,
) {
    debug!("session loop started");

    // Emit the synthetic Connected event before entering the select loop.
    core.emit(QuizClashEvent::Connected);

    // The session token must be the first message on the wire.
    let auth = ClientMessage::Authenticate { token: auth_token };
    if send_message(&mut transport, &auth).await.is_err() {
        emit_disconnected(&core, Some("transport send error during authentication".into())).await;
        return;
    }

    loop {
        let reveal_deadline = core.pending.as_ref().map(|p| p.deadline);
        let invite_deadline = core.invites.next_deadline();

        tokio::select! {
            // Branch 1: command from the client handle
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        let outgoing = core.on_command(cmd);
                        core.sync_shared().await;
                        if send_all(&mut transport, outgoing).await.is_err() {
                            core.on_transport_lost("transport send error");
                            core.sync_shared().await;
                            emit_disconnected(&core, Some("transport send error".into())).await;
                            break;
                        }
                    }
                    // Command channel closed — client handle dropped.
                    None => {
                        debug!("command channel closed, shutting down session loop");
                        graceful_close(&mut transport, &mut core).await;
                        break;
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                graceful_close(&mut transport, &mut core).await;
                break;
            }

            // Branch 3: incoming message from the server
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(server_msg) => {
                                let outgoing = core.on_message(server_msg);
                                core.sync_shared().await;
                                if send_all(&mut transport, outgoing).await.is_err() {
                                    core.on_transport_lost("transport send error");
                                    core.sync_shared().await;
                                    emit_disconnected(
                                        &core,
                                        Some("transport send error".into()),
                                    ).await;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("failed to deserialize server message: {e} — raw: {text}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        let reason = format!("transport receive error: {e}");
                        core.on_transport_lost(&reason);
                        core.sync_shared().await;
                        emit_disconnected(&core, Some(reason)).await;
                        break;
                    }
                    // Transport closed cleanly.
                    None => {
                        debug!("transport closed by server");
                        core.on_transport_lost("connection closed");
                        core.sync_shared().await;
                        emit_disconnected(&core, None).await;
                        break;
                    }
                }
            }

            // Branch 4: the reveal window for a deferred advance elapsed
            _ = sleep_until_opt(reveal_deadline), if reveal_deadline.is_some() => {
                core.on_reveal_elapsed();
                core.sync_shared().await;
            }

            // Branch 5: the earliest pending room invite expired
            _ = sleep_until_opt(invite_deadline), if invite_deadline.is_some() => {
                core.on_invites_elapsed();
                core.sync_shared().await;
            }
        }
    }

    debug!("session loop exited");
}

/// Graceful exit: emit leave messages for live sessions, close the transport,
/// and deliver the final `Disconnected` event.
async fn graceful_close(transport: &mut impl Transport, core: &mut SessionCore) {
    let outgoing = core.teardown();
    // Best effort: the connection may already be half-dead.
    let _ = send_all(transport, outgoing).await;
    core.sync_shared().await;
    let _ = transport.close().await;
    emit_disconnected(core, Some("client shut down".into())).await;
}

/// Serialize and send one message. Serialization failures are logged and
/// swallowed (they indicate a bug, not a dead connection).
async fn send_message(transport: &mut impl Transport, msg: &ClientMessage) -> Result<()> {
    debug!("sending client message: {:?}", std::mem::discriminant(msg));
    match serde_json::to_string(msg) {
        Ok(json) => {
            if let Err(e) = transport.send(json).await {
                error!("transport send error: {e}");
                return Err(e);
            }
            Ok(())
        }
        Err(e) => {
            error!("failed to serialize ClientMessage: {e}");
            Ok(())
        }
    }
}

/// Send a batch of messages, stopping at the first transport failure.
async fn send_all(transport: &mut impl Transport, messages: Vec<ClientMessage>) -> Result<()> {
    for msg in &messages {
        send_message(transport, msg).await?;
    }
    Ok(())
}

/// Emit a [`Disconnected`](QuizClashEvent::Disconnected) event and mark the
/// session as over.
///
/// Uses `send().await` (blocking) instead of `try_send` because
/// `Disconnected` is always the last event on the channel and must never be
/// silently dropped.
async fn emit_disconnected(core: &SessionCore, reason: Option<String>) {
    core.shared.connected.store(false, Ordering::Release);
    core.shared.authenticated.store(false, Ordering::Release);
    let event = QuizClashEvent::Disconnected { reason };
    if core.event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    // ── Mock transport ──────────────────────────────────────────────

    /// A mock transport that records sent messages and replays scripted
    /// responses.
    struct MockTransport {
        /// Messages that `recv()` will yield in order.
        incoming: VecDeque<Option<std::result::Result<String, QuizClashError>>>,
        /// Recorded outgoing messages.
        sent: Arc<StdMutex<Vec<String>>>,
        /// Whether `close()` was called.
        closed: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn new(
            incoming: Vec<Option<std::result::Result<String, QuizClashError>>>,
        ) -> (Self, Arc<StdMutex<Vec<String>>>, Arc<AtomicBool>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let transport = Self {
                incoming: VecDeque::from(incoming),
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            };
            (transport, sent, closed)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), QuizClashError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, QuizClashError>> {
            if let Some(item) = self.incoming.pop_front() {
                // An explicit `None` entry signals a clean transport close;
                // `Some(result)` delivers the scripted message or error.
                item
            } else {
                // All scripted messages have been delivered — hang forever
                // so the session loop stays alive until shutdown.
                std::future::pending().await
            }
        }

        async fn close(&mut self) -> std::result::Result<(), QuizClashError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// A transport whose `send` starts failing after `ok_sends` successes.
    struct FailingSendTransport {
        ok_sends: usize,
        incoming: VecDeque<Option<std::result::Result<String, QuizClashError>>>,
    }

    #[async_trait]
    impl Transport for FailingSendTransport {
        async fn send(&mut self, _message: String) -> std::result::Result<(), QuizClashError> {
            if self.ok_sends > 0 {
                self.ok_sends -= 1;
                Ok(())
            } else {
                Err(QuizClashError::TransportSend("wire down".into()))
            }
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, QuizClashError>> {
            if let Some(item) = self.incoming.pop_front() {
                item
            } else {
                std::future::pending().await
            }
        }

        async fn close(&mut self) -> std::result::Result<(), QuizClashError> {
            Ok(())
        }
    }

    fn authenticated_json() -> String {
        serde_json::to_string(&ServerMessage::Authenticated).unwrap()
    }

    fn test_config() -> QuizClashConfig {
        QuizClashConfig::new(Uuid::from_u128(1), "tok123")
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_sends_authenticate_first() {
        let (transport, sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let event = events.recv().await.unwrap();
        assert!(matches!(event, QuizClashEvent::Connected));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, QuizClashEvent::Authenticated));

        {
            let messages = sent.lock().unwrap();
            assert!(!messages.is_empty());
            let first: ClientMessage = serde_json::from_str(&messages[0]).unwrap();
            assert_eq!(
                first,
                ClientMessage::Authenticate {
                    token: "tok123".into()
                }
            );
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn state_updates_on_authenticated() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        assert!(client.is_authenticated());
        assert!(client.is_connected());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn auth_error_is_surfaced() {
        let auth_err = serde_json::to_string(&ServerMessage::AuthError {
            message: "bad token".into(),
        })
        .unwrap();
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(auth_err))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            QuizClashEvent::AuthFailed {
                message: "bad token".into()
            }
        );
        assert!(!client.is_authenticated());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_on_transport_close() {
        let (transport, _sent, _closed) =
            MockTransport::new(vec![Some(Ok(authenticated_json())), None]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated
        let event = events.recv().await.unwrap();
        assert_eq!(event, QuizClashEvent::Disconnected { reason: None });
        assert!(!client.is_connected());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn transport_recv_error_emits_disconnected_with_reason() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Err(
            QuizClashError::TransportReceive("boom".into()),
        ))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let event = events.recv().await.unwrap();
        let QuizClashEvent::Disconnected { reason } = event else {
            panic!("expected Disconnected, got {event:?}");
        };
        assert!(reason.unwrap().contains("boom"));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn send_error_while_matching_aborts_matchmaking() {
        // The authenticate send succeeds; the join-waiting send fails.
        let transport = FailingSendTransport {
            ok_sends: 1,
            incoming: VecDeque::from(vec![Some(Ok(authenticated_json()))]),
        };
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated
        client.find_match().unwrap();

        let event = events.recv().await.unwrap();
        assert!(
            matches!(event, QuizClashEvent::MatchingAborted { .. }),
            "expected MatchingAborted, got {event:?}"
        );
        let event = events.recv().await.unwrap();
        let QuizClashEvent::Disconnected { reason } = event else {
            panic!("expected Disconnected, got {event:?}");
        };
        assert!(reason.unwrap().contains("send"));
        // The published snapshot left Matching behind with the session.
        assert_eq!(client.battle_state().await.phase, BattlePhase::Idle);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn not_connected_error_after_shutdown() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        client.shutdown().await;

        let result = client.find_match();
        assert!(matches!(result, Err(QuizClashError::NotConnected)));
    }

    #[tokio::test]
    async fn shutdown_emits_disconnected_and_closes_transport() {
        let (transport, _sent, closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        client.shutdown().await;

        let event = events.recv().await.unwrap();
        let QuizClashEvent::Disconnected { reason } = event else {
            panic!("expected Disconnected, got {event:?}");
        };
        assert_eq!(reason.as_deref(), Some("client shut down"));
        assert!(closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn double_shutdown_does_not_panic() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        client.shutdown().await;
        client.shutdown().await; // should not panic
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        // Drop the client without calling shutdown; the session loop task
        // is aborted and the event channel closes.
        drop(client);
        while let Some(_event) = events.recv().await {}
    }

    #[tokio::test]
    async fn find_match_sends_join_waiting() {
        let (transport, sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated
        client.find_match().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let messages = sent.lock().unwrap();
            let last: ClientMessage = serde_json::from_str(messages.last().unwrap()).unwrap();
            assert_eq!(last, ClientMessage::JoinWaiting);
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn config_defaults() {
        let config = test_config();
        assert_eq!(config.reveal_delay, Duration::from_secs(1));
        assert_eq!(config.invite_timeout, Duration::from_secs(10));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn config_builder_methods() {
        let config = test_config()
            .with_reveal_delay(Duration::from_millis(1500))
            .with_invite_timeout(Duration::from_secs(5))
            .with_event_channel_capacity(512)
            .with_shutdown_timeout(Duration::from_secs(5));
        assert_eq!(config.reveal_delay, Duration::from_millis(1500));
        assert_eq!(config.invite_timeout, Duration::from_secs(5));
        assert_eq!(config.event_channel_capacity, 512);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn event_channel_capacity_is_clamped_to_one() {
        let config = test_config().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);

        // Should not panic despite capacity 0 — clamped to 1.
        let (transport, _sent, _closed) = MockTransport::new(vec![]);
        let (mut client, mut events) = QuizClashClient::start(
            transport,
            test_config().with_event_channel_capacity(0),
        );
        let event = events.recv().await.unwrap();
        assert!(matches!(event, QuizClashEvent::Connected));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn start_room_outside_a_room_fails_fast() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        let result = client.start_room().await;
        assert!(matches!(result, Err(QuizClashError::NotInRoom)));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let (transport, _sent, _closed) = MockTransport::new(vec![Some(Ok(authenticated_json()))]);
        let (mut client, mut events) = QuizClashClient::start(transport, test_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // Authenticated

        let debug_str = format!("{client:?}");
        assert!(debug_str.contains("QuizClashClient"));
        assert!(debug_str.contains("connected"));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn event_channel_backpressure_does_not_block() {
        // More messages than the event channel can hold; the loop must keep
        // draining the transport and still deliver the final Disconnected.
        let mut incoming: Vec<Option<std::result::Result<String, QuizClashError>>> = Vec::new();
        incoming.push(Some(Ok(authenticated_json())));
        let error_json = serde_json::to_string(&ServerMessage::Error {
            message: "noise".into(),
        })
        .unwrap();
        for _ in 0..20 {
            incoming.push(Some(Ok(error_json.clone())));
        }
        incoming.push(None);

        let (transport, _sent, _closed) = MockTransport::new(incoming);
        let (mut client, mut events) =
            QuizClashClient::start(transport, test_config().with_event_channel_capacity(1));

        // Let the channel fill up and events get dropped.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut count = 0;
        let mut saw_disconnected = false;
        while let Some(event) = events.recv().await {
            if matches!(event, QuizClashEvent::Disconnected { .. }) {
                saw_disconnected = true;
            }
            count += 1;
        }
        // With capacity 1 some events are dropped, but never Disconnected.
        assert!(count < 23, "expected backpressure to drop events, got {count}");
        assert!(saw_disconnected);

        client.shutdown().await;
    }
}
