//! Multiplayer room lifecycle state machine.
//!
//! Manages creation or joining of a shared pre-battle lobby, its membership,
//! ownership, and pending invites. Like [`BattleSession`](crate::battle), it
//! is a pure reducer; invite expiry countdowns live in the session loop's
//! [`ExpiryTimer`](crate::timer::ExpiryTimer).
//!
//! Invariants maintained here:
//! - members are deduplicated by player id
//! - `pending_invites` never contains the id of a current member
//! - `owner_id` is only ever overwritten by server `owner-update` events
//!   (the server guarantees it names a current member)

use std::collections::HashSet;

use tracing::debug;

use crate::error::{QuizClashError, Result};
use crate::protocol::{ClientMessage, Player, PlayerId, RoomId};

/// Lifecycle phase of a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoomPhase {
    /// No room yet.
    #[default]
    Idle,
    /// `create-room` emitted, waiting for the generated room id.
    Creating,
    /// `room-info` requested for an externally provided room id.
    Joining,
    /// In the lobby; steady-state membership events apply.
    Ready,
    /// Room left (explicitly or via battle handoff).
    Left,
}

/// Read-only snapshot of the room session.
#[derive(Debug, Clone, Default)]
pub struct RoomState {
    pub phase: RoomPhase,
    pub room_id: Option<RoomId>,
    pub owner_id: Option<PlayerId>,
    /// Other players in the room (the local user is not listed).
    pub members: Vec<Player>,
    /// Friends with an outstanding invite offer.
    pub pending_invites: HashSet<PlayerId>,
}

/// The room lifecycle reducer. See module docs.
#[derive(Debug)]
pub struct RoomLifecycle {
    self_id: PlayerId,
    state: RoomState,
    left: bool,
}

impl RoomLifecycle {
    pub fn new(self_id: PlayerId) -> Self {
        Self {
            self_id,
            state: RoomState::default(),
            left: false,
        }
    }

    /// Current state, for snapshot publication.
    pub fn state(&self) -> &RoomState {
        &self.state
    }

    /// Create a new room owned by this client. Emits `create-room`; the
    /// generated id arrives via [`handle_created`](Self::handle_created).
    pub fn create(&mut self) -> Option<ClientMessage> {
        if self.state.phase != RoomPhase::Idle {
            debug!(phase = ?self.state.phase, "ignoring create-room mid-session");
            return None;
        }
        self.state.phase = RoomPhase::Creating;
        Some(ClientMessage::CreateRoom)
    }

    /// Join an existing room via a navigation-provided id. Emits `room-info`;
    /// the snapshot arrives via [`handle_info`](Self::handle_info).
    pub fn join(&mut self, room_id: RoomId) -> Option<ClientMessage> {
        if self.state.phase != RoomPhase::Idle {
            debug!(phase = ?self.state.phase, "ignoring join-room mid-session");
            return None;
        }
        self.state.phase = RoomPhase::Joining;
        self.state.room_id = Some(room_id);
        Some(ClientMessage::RoomInfo { room_id })
    }

    /// One-shot response to `create-room`: the local user owns a fresh,
    /// empty room.
    pub fn handle_created(&mut self, room_id: RoomId) -> bool {
        if self.state.phase != RoomPhase::Creating {
            debug!(%room_id, phase = ?self.state.phase, "dropping create-room response");
            return false;
        }
        self.state.room_id = Some(room_id);
        self.state.owner_id = Some(self.self_id);
        self.state.members.clear();
        self.state.phase = RoomPhase::Ready;
        true
    }

    /// Response to `room-info`: apply the server's membership snapshot.
    pub fn handle_info(&mut self, owner_id: PlayerId, members: Vec<Player>) -> bool {
        if self.state.phase != RoomPhase::Joining {
            debug!(%owner_id, phase = ?self.state.phase, "dropping room-info response");
            return false;
        }
        self.state.owner_id = Some(owner_id);
        self.state.members.clear();
        for member in members {
            if !self.state.members.iter().any(|m| m.id == member.id) {
                self.state.members.push(member);
            }
        }
        self.state.phase = RoomPhase::Ready;
        true
    }

    /// A player joined the room. Deduplicated by id; any pending invite for
    /// that player is resolved.
    pub fn handle_member_joined(&mut self, player: Player) -> bool {
        if self.state.phase != RoomPhase::Ready {
            return false;
        }
        self.state.pending_invites.remove(&player.id);
        if player.id == self.self_id || self.state.members.iter().any(|m| m.id == player.id) {
            return false;
        }
        self.state.members.push(player);
        true
    }

    /// A player left the room. Also purges their pending invite, if any.
    pub fn handle_member_left(&mut self, player_id: PlayerId) -> Option<Player> {
        if self.state.phase != RoomPhase::Ready {
            return None;
        }
        self.state.pending_invites.remove(&player_id);
        let index = self.state.members.iter().position(|m| m.id == player_id)?;
        Some(self.state.members.remove(index))
    }

    /// The server reassigned ownership (e.g. the owner left).
    pub fn handle_owner_update(&mut self, owner_id: PlayerId) -> bool {
        if self.state.phase != RoomPhase::Ready {
            return false;
        }
        self.state.owner_id = Some(owner_id);
        true
    }

    /// Invite a friend to the room. Set semantics: re-inviting before expiry
    /// re-emits and resets the countdown; inviting a current member is a
    /// no-op (keeps `pending_invites` disjoint from `members`).
    pub fn send_invite(&mut self, friend_id: PlayerId) -> Option<ClientMessage> {
        if self.state.phase != RoomPhase::Ready {
            return None;
        }
        let room_id = self.state.room_id?;
        if self.state.members.iter().any(|m| m.id == friend_id) {
            debug!(%friend_id, "skipping invite for current member");
            return None;
        }
        self.state.pending_invites.insert(friend_id);
        Some(ClientMessage::InviteRoom { room_id, friend_id })
    }

    /// The invite offer timed out without a response.
    pub fn expire_invite(&mut self, friend_id: PlayerId) -> bool {
        self.state.pending_invites.remove(&friend_id)
    }

    /// Start the room's battle. Only the current owner may emit `start-room`.
    ///
    /// # Errors
    ///
    /// Returns [`QuizClashError::NotInRoom`] outside a ready room and
    /// [`QuizClashError::NotRoomOwner`] when someone else owns it.
    pub fn start(&mut self) -> Result<ClientMessage> {
        if self.state.phase != RoomPhase::Ready {
            return Err(QuizClashError::NotInRoom);
        }
        let room_id = self.state.room_id.ok_or(QuizClashError::NotInRoom)?;
        if self.state.owner_id != Some(self.self_id) {
            return Err(QuizClashError::NotRoomOwner);
        }
        Ok(ClientMessage::StartRoom { room_id })
    }

    /// Leave the room. Idempotent: `leave-room` is emitted exactly once.
    /// Also used for the battle handoff: once the server says the battle is
    /// starting, membership alerts no longer apply and pending invites are
    /// void.
    pub fn leave(&mut self) -> Option<ClientMessage> {
        if self.left || self.state.phase == RoomPhase::Idle {
            return None;
        }
        self.left = true;
        self.state.pending_invites.clear();
        self.state.phase = RoomPhase::Left;
        Some(ClientMessage::LeaveRoom)
    }

    /// Discard a finished room so the machine can host a new one. Alerts for
    /// the old room stay harmless: a fresh [`RoomPhase::Idle`] machine drops
    /// them all.
    pub fn reset(&mut self) {
        self.state = RoomState::default();
        self.left = false;
    }
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
    use uuid::Uuid;

    fn player(n: u128) -> Player {
        Player {
            id: Uuid::from_u128(n),
            username: format!("player{n}"),
            avatar: format!("/avatars/{n}.png"),
            level: "Rookie".into(),
            presence: None,
        }
    }

    fn ready_room() -> RoomLifecycle {
        let mut room = RoomLifecycle::new(Uuid::from_u128(1));
        assert_eq!(room.create(), Some(ClientMessage::CreateRoom));
        assert!(room.handle_created(Uuid::from_u128(500)));
        room
    }

    #[test]
    fn created_room_is_owned_by_self_with_no_members() {
        let room = ready_room();
        assert_eq!(room.state().phase, RoomPhase::Ready);
        assert_eq!(room.state().owner_id, Some(Uuid::from_u128(1)));
        assert!(room.state().members.is_empty());
        assert_eq!(room.state().room_id, Some(Uuid::from_u128(500)));
    }

    #[test]
    fn joining_applies_server_snapshot() {
        let mut room = RoomLifecycle::new(Uuid::from_u128(1));
        let room_id = Uuid::from_u128(600);
        assert_eq!(room.join(room_id), Some(ClientMessage::RoomInfo { room_id }));
        assert!(room.handle_info(Uuid::from_u128(2), vec![player(2), player(3), player(3)]));

        assert_eq!(room.state().phase, RoomPhase::Ready);
        assert_eq!(room.state().owner_id, Some(Uuid::from_u128(2)));
        // Snapshot deduplicated by id.
        assert_eq!(room.state().members.len(), 2);
    }

    #[test]
    fn member_join_is_deduplicated() {
        let mut room = ready_room();
        assert!(room.handle_member_joined(player(2)));
        assert!(!room.handle_member_joined(player(2)));
        assert_eq!(room.state().members.len(), 1);
    }

    #[test]
    fn member_join_resolves_pending_invite() {
        let mut room = ready_room();
        room.send_invite(Uuid::from_u128(2));
        assert!(room.state().pending_invites.contains(&Uuid::from_u128(2)));

        room.handle_member_joined(player(2));
        // Invariant: pending_invites never contains a member id.
        assert!(room.state().pending_invites.is_empty());
        assert_eq!(room.state().members.len(), 1);
    }

    #[test]
    fn member_left_purges_invite() {
        let mut room = ready_room();
        room.handle_member_joined(player(2));
        room.send_invite(Uuid::from_u128(3));

        let removed = room.handle_member_left(Uuid::from_u128(2));
        assert_eq!(removed.map(|p| p.id), Some(Uuid::from_u128(2)));
        assert!(room.state().members.is_empty());

        // Unknown member: nothing removed, but a stale invite is purged.
        assert!(room.handle_member_left(Uuid::from_u128(3)).is_none());
        assert!(room.state().pending_invites.is_empty());
    }

    #[test]
    fn invite_for_current_member_is_noop() {
        let mut room = ready_room();
        room.handle_member_joined(player(2));
        assert!(room.send_invite(Uuid::from_u128(2)).is_none());
        assert!(room.state().pending_invites.is_empty());
    }

    #[test]
    fn reinvite_is_idempotent() {
        let mut room = ready_room();
        assert!(room.send_invite(Uuid::from_u128(2)).is_some());
        assert!(room.send_invite(Uuid::from_u128(2)).is_some());
        assert_eq!(room.state().pending_invites.len(), 1);
    }

    #[test]
    fn expire_invite_removes_it() {
        let mut room = ready_room();
        room.send_invite(Uuid::from_u128(2));
        assert!(room.expire_invite(Uuid::from_u128(2)));
        assert!(!room.expire_invite(Uuid::from_u128(2)));
        assert!(room.state().pending_invites.is_empty());
    }

    #[test]
    fn only_the_owner_may_start() {
        let mut room = ready_room();
        assert!(matches!(
            room.start(),
            Ok(ClientMessage::StartRoom { room_id }) if room_id == Uuid::from_u128(500)
        ));

        room.handle_owner_update(Uuid::from_u128(2));
        assert!(matches!(room.start(), Err(QuizClashError::NotRoomOwner)));
    }

    #[test]
    fn start_outside_a_room_fails() {
        let mut room = RoomLifecycle::new(Uuid::from_u128(1));
        assert!(matches!(room.start(), Err(QuizClashError::NotInRoom)));
    }

    #[test]
    fn owner_update_overwrites() {
        let mut room = ready_room();
        assert!(room.handle_owner_update(Uuid::from_u128(7)));
        assert_eq!(room.state().owner_id, Some(Uuid::from_u128(7)));
    }

    #[test]
    fn leave_emits_exactly_once() {
        let mut room = ready_room();
        assert_eq!(room.leave(), Some(ClientMessage::LeaveRoom));
        assert_eq!(room.leave(), None);
        assert_eq!(room.state().phase, RoomPhase::Left);
    }

    #[test]
    fn leave_before_entering_emits_nothing() {
        let mut room = RoomLifecycle::new(Uuid::from_u128(1));
        assert_eq!(room.leave(), None);
    }

    #[test]
    fn leaving_detaches_membership_events() {
        let mut room = ready_room();
        room.handle_member_joined(player(2));
        room.send_invite(Uuid::from_u128(3));
        room.leave();

        assert!(room.state().pending_invites.is_empty());
        assert!(!room.handle_member_joined(player(4)));
        assert!(room.handle_member_left(Uuid::from_u128(2)).is_none());
        assert!(!room.handle_owner_update(Uuid::from_u128(4)));
    }

    #[test]
    fn reset_allows_a_second_room() {
        let mut room = ready_room();
        assert_eq!(room.leave(), Some(ClientMessage::LeaveRoom));
        room.reset();

        assert_eq!(room.state().phase, RoomPhase::Idle);
        assert_eq!(room.create(), Some(ClientMessage::CreateRoom));
        assert!(room.handle_created(Uuid::from_u128(501)));
        assert_eq!(room.state().room_id, Some(Uuid::from_u128(501)));
        assert_eq!(room.leave(), Some(ClientMessage::LeaveRoom));
    }

    #[test]
    fn alerts_before_ready_are_dropped() {
        let mut room = RoomLifecycle::new(Uuid::from_u128(1));
        room.create();
        assert!(!room.handle_member_joined(player(2)));
        assert!(!room.handle_owner_update(Uuid::from_u128(2)));
    }
}
