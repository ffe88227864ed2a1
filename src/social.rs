//! Social graph state and the optimistic mutation engine.
//!
//! Friend-graph actions (send request, accept, reject, unfriend) all follow
//! the same protocol: apply the local transition synchronously, dispatch the
//! acknowledged emit, and on rejection apply the exact inverse. The
//! apply/inverse pairing is encoded once, in [`SocialAction::apply`]
//! returning a [`SocialUndo`] that captures the pre-mutation membership
//! bits — so a rollback restores the graph bit-for-bit and can never be
//! mismatched with its action.
//!
//! Inbound pushes (`friend-request`, `friend-request-accept`, `unfriend`,
//! `user-update`) mirror the same graph without optimism.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::protocol::{ClientMessage, PlayerId, Presence};

// ── Graph state ─────────────────────────────────────────────────────

/// The client's view of its social graph.
///
/// Invariant: a player id is never simultaneously in more than one of
/// `friends` / `invites` / `outgoing_requests`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocialGraph {
    /// Accepted friends, with locally-known presence overrides.
    pub friends: HashMap<PlayerId, Option<Presence>>,
    /// Players who sent this user a friend request.
    pub invites: HashSet<PlayerId>,
    /// Players this user sent a friend request to.
    pub outgoing_requests: HashSet<PlayerId>,
    /// Unseen incoming friend requests (badge counter).
    pub invites_badge: u32,
    /// Unseen accepted requests (badge counter).
    pub friends_badge: u32,
}

impl SocialGraph {
    /// Inbound `friend-request` push: record the invite (deduplicated by
    /// sender id) and bump the badge. Never disturbs an existing relation.
    pub fn apply_friend_request(&mut self, sender: PlayerId) -> bool {
        if self.friends.contains_key(&sender) || self.outgoing_requests.contains(&sender) {
            debug!(%sender, "dropping friend request from an already-related player");
            return false;
        }
        if !self.invites.insert(sender) {
            return false;
        }
        self.invites_badge += 1;
        true
    }

    /// Inbound `friend-request-accept` push: the recipient accepted, so the
    /// outgoing request becomes a friendship. They just acted, so presence
    /// starts as online.
    pub fn apply_request_accepted(&mut self, friend_id: PlayerId) {
        self.outgoing_requests.remove(&friend_id);
        self.friends.insert(friend_id, Some(Presence::Online));
        self.friends_badge += 1;
    }

    /// Inbound `friend-request-reject` push: the outgoing request is void.
    pub fn apply_request_rejected(&mut self, friend_id: PlayerId) -> bool {
        self.outgoing_requests.remove(&friend_id)
    }

    /// Inbound `unfriend` push.
    pub fn apply_unfriended(&mut self, friend_id: PlayerId) -> bool {
        self.friends.remove(&friend_id).is_some()
    }

    /// Inbound `user-update` push: patch presence for an existing friend
    /// only — presence never creates relations.
    pub fn apply_presence(&mut self, uid: PlayerId, status: Presence) -> bool {
        match self.friends.get_mut(&uid) {
            Some(presence) => {
                *presence = Some(status);
                true
            }
            None => false,
        }
    }

    /// Mark incoming friend requests as seen.
    pub fn reset_invites_badge(&mut self) {
        self.invites_badge = 0;
    }

    /// Mark accepted requests as seen.
    pub fn reset_friends_badge(&mut self) {
        self.friends_badge = 0;
    }
}

// ── Optimistic actions ──────────────────────────────────────────────

/// A friend-graph action applied optimistically before the server confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialAction {
    /// Send a friend request to a player.
    SendRequest(PlayerId),
    /// Accept a pending incoming request.
    AcceptInvite(PlayerId),
    /// Reject a pending incoming request.
    RejectInvite(PlayerId),
    /// Remove an existing friend.
    Unfriend(PlayerId),
}

impl SocialAction {
    /// The player this action targets.
    pub fn target(&self) -> PlayerId {
        match *self {
            Self::SendRequest(id)
            | Self::AcceptInvite(id)
            | Self::RejectInvite(id)
            | Self::Unfriend(id) => id,
        }
    }

    /// The acknowledged wire message for this action.
    pub fn message(&self, seq: u64) -> ClientMessage {
        match *self {
            Self::SendRequest(friend_id) => ClientMessage::FriendRequest { friend_id, seq },
            Self::AcceptInvite(friend_id) => ClientMessage::FriendRequestAccept { friend_id, seq },
            Self::RejectInvite(friend_id) => ClientMessage::FriendRequestReject { friend_id, seq },
            Self::Unfriend(friend_id) => ClientMessage::Unfriend { friend_id, seq },
        }
    }

    /// Apply the optimistic transition, returning the exact inverse.
    pub fn apply(&self, graph: &mut SocialGraph) -> SocialUndo {
        match *self {
            Self::SendRequest(friend_id) => {
                // Never disturb an existing relation, mirroring the inbound
                // guard: an id already in friends or invites stays there.
                let related = graph.friends.contains_key(&friend_id)
                    || graph.invites.contains(&friend_id);
                let was_present = related || !graph.outgoing_requests.insert(friend_id);
                SocialUndo::SendRequest {
                    friend_id,
                    was_present,
                }
            }
            Self::AcceptInvite(friend_id) => {
                let was_invited = graph.invites.remove(&friend_id);
                let prior_friend = graph.friends.insert(friend_id, None);
                SocialUndo::AcceptInvite {
                    friend_id,
                    was_invited,
                    prior_friend,
                }
            }
            Self::RejectInvite(friend_id) => {
                let was_invited = graph.invites.remove(&friend_id);
                SocialUndo::RejectInvite {
                    friend_id,
                    was_invited,
                }
            }
            Self::Unfriend(friend_id) => {
                let prior = graph.friends.remove(&friend_id);
                SocialUndo::Unfriend { friend_id, prior }
            }
        }
    }
}

/// The exact inverse of an applied [`SocialAction`], capturing the
/// pre-mutation membership bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocialUndo {
    SendRequest {
        friend_id: PlayerId,
        was_present: bool,
    },
    AcceptInvite {
        friend_id: PlayerId,
        was_invited: bool,
        /// `Some(prior_presence)` if the id was already a friend.
        prior_friend: Option<Option<Presence>>,
    },
    RejectInvite {
        friend_id: PlayerId,
        was_invited: bool,
    },
    Unfriend {
        friend_id: PlayerId,
        /// `Some(prior_presence)` if the id was a friend before.
        prior: Option<Option<Presence>>,
    },
}

impl SocialUndo {
    /// Restore the pre-mutation state. Consumes the undo so it can never be
    /// applied twice.
    pub fn rollback(self, graph: &mut SocialGraph) {
        match self {
            Self::SendRequest {
                friend_id,
                was_present,
            } => {
                if !was_present {
                    graph.outgoing_requests.remove(&friend_id);
                }
            }
            Self::AcceptInvite {
                friend_id,
                was_invited,
                prior_friend,
            } => {
                if was_invited {
                    graph.invites.insert(friend_id);
                }
                match prior_friend {
                    Some(presence) => {
                        graph.friends.insert(friend_id, presence);
                    }
                    None => {
                        graph.friends.remove(&friend_id);
                    }
                }
            }
            Self::RejectInvite {
                friend_id,
                was_invited,
            } => {
                if was_invited {
                    graph.invites.insert(friend_id);
                }
            }
            Self::Unfriend { friend_id, prior } => {
                if let Some(presence) = prior {
                    graph.friends.insert(friend_id, presence);
                }
            }
        }
    }
}

// ── Mutation engine ─────────────────────────────────────────────────

/// Tracks in-flight optimistic mutations by acknowledgement sequence.
///
/// Concurrent actions on different targets are independent; the engine does
/// not deduplicate concurrent actions on the same target (UI disabling is
/// expected to prevent double-submission).
#[derive(Debug, Default)]
pub struct MutationEngine {
    next_seq: u64,
    pending: HashMap<u64, (SocialAction, SocialUndo)>,
}

impl MutationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Optimistically apply `action` and produce the wire message to emit.
    pub fn dispatch(&mut self, action: SocialAction, graph: &mut SocialGraph) -> ClientMessage {
        let seq = self.next_seq;
        self.next_seq += 1;
        let undo = action.apply(graph);
        self.pending.insert(seq, (action, undo));
        action.message(seq)
    }

    /// The server confirmed `seq`: the optimistic state is now truth and the
    /// inverse is discarded (it must never run after success).
    pub fn resolve_success(&mut self, seq: u64) -> Option<SocialAction> {
        let (action, _undo) = self.pending.remove(&seq)?;
        Some(action)
    }

    /// The server rejected `seq`: apply the exact inverse, exactly once.
    pub fn resolve_failure(&mut self, seq: u64, graph: &mut SocialGraph) -> Option<SocialAction> {
        let (action, undo) = self.pending.remove(&seq)?;
        undo.rollback(graph);
        Some(action)
    }

    /// Number of unacknowledged mutations.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(n: u128) -> PlayerId {
        Uuid::from_u128(n)
    }

    fn graph_with_invite(friend: PlayerId) -> SocialGraph {
        let mut graph = SocialGraph::default();
        graph.invites.insert(friend);
        graph
    }

    #[test]
    fn every_action_rolls_back_bit_for_bit() {
        let friend = id(2);
        let mut base = SocialGraph::default();
        base.friends.insert(id(3), Some(Presence::Busy));
        base.invites.insert(friend);
        base.outgoing_requests.insert(id(4));

        for action in [
            SocialAction::SendRequest(id(5)),
            SocialAction::AcceptInvite(friend),
            SocialAction::RejectInvite(friend),
            SocialAction::Unfriend(id(3)),
        ] {
            let mut graph = base.clone();
            let undo = action.apply(&mut graph);
            undo.rollback(&mut graph);
            assert_eq!(graph, base, "rollback of {action:?} must restore the graph");
        }
    }

    #[test]
    fn send_request_optimistically_adds_then_rolls_back() {
        // Scenario: sendRequest adds to outgoing_requests; rejection removes
        // it and leaves friends/invites untouched.
        let friend = id(2);
        let mut graph = SocialGraph::default();
        graph.friends.insert(id(9), Some(Presence::Online));
        graph.invites.insert(id(8));
        let before = graph.clone();

        let mut engine = MutationEngine::new();
        let msg = engine.dispatch(SocialAction::SendRequest(friend), &mut graph);
        assert!(matches!(
            msg,
            ClientMessage::FriendRequest { friend_id, seq: 0 } if friend_id == friend
        ));
        assert!(graph.outgoing_requests.contains(&friend));

        let action = engine.resolve_failure(0, &mut graph);
        assert_eq!(action, Some(SocialAction::SendRequest(friend)));
        assert_eq!(graph, before);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn send_request_never_disturbs_an_existing_relation() {
        let inviter = id(2);
        let friend = id(3);
        let mut graph = SocialGraph::default();
        graph.invites.insert(inviter);
        graph.friends.insert(friend, Some(Presence::Online));
        let before = graph.clone();
        let mut engine = MutationEngine::new();

        // Requesting a player who already invited us must not place the id
        // in two sets at once.
        engine.dispatch(SocialAction::SendRequest(inviter), &mut graph);
        assert!(!graph.outgoing_requests.contains(&inviter));
        assert!(graph.invites.contains(&inviter));

        engine.dispatch(SocialAction::SendRequest(friend), &mut graph);
        assert!(!graph.outgoing_requests.contains(&friend));
        assert!(graph.friends.contains_key(&friend));

        // Rollbacks of the no-op applies leave the graph untouched.
        engine.resolve_failure(0, &mut graph);
        engine.resolve_failure(1, &mut graph);
        assert_eq!(graph, before);
    }

    #[test]
    fn accept_moves_invite_to_friends() {
        let friend = id(2);
        let mut graph = graph_with_invite(friend);
        let mut engine = MutationEngine::new();

        engine.dispatch(SocialAction::AcceptInvite(friend), &mut graph);
        assert!(!graph.invites.contains(&friend));
        assert!(graph.friends.contains_key(&friend));

        assert_eq!(
            engine.resolve_success(0),
            Some(SocialAction::AcceptInvite(friend))
        );
        // Success discards the inverse: state remains transitioned.
        assert!(graph.friends.contains_key(&friend));
    }

    #[test]
    fn accept_rollback_restores_the_invite() {
        let friend = id(2);
        let mut graph = graph_with_invite(friend);
        let before = graph.clone();
        let mut engine = MutationEngine::new();

        engine.dispatch(SocialAction::AcceptInvite(friend), &mut graph);
        engine.resolve_failure(0, &mut graph);
        assert_eq!(graph, before);
    }

    #[test]
    fn rollback_is_never_applied_twice() {
        let friend = id(2);
        let mut graph = graph_with_invite(friend);
        let mut engine = MutationEngine::new();

        engine.dispatch(SocialAction::RejectInvite(friend), &mut graph);
        assert!(engine.resolve_failure(0, &mut graph).is_some());
        assert!(engine.resolve_failure(0, &mut graph).is_none());
        assert!(graph.invites.contains(&friend));
    }

    #[test]
    fn success_never_rolls_back() {
        let friend = id(2);
        let mut graph = SocialGraph::default();
        graph.friends.insert(friend, Some(Presence::Online));
        let mut engine = MutationEngine::new();

        engine.dispatch(SocialAction::Unfriend(friend), &mut graph);
        engine.resolve_success(0);
        // A late failure resolution for the same seq is a no-op.
        assert!(engine.resolve_failure(0, &mut graph).is_none());
        assert!(!graph.friends.contains_key(&friend));
    }

    #[test]
    fn concurrent_actions_on_different_targets_are_independent() {
        let mut graph = SocialGraph::default();
        graph.invites.insert(id(2));
        let mut engine = MutationEngine::new();

        let msg_a = engine.dispatch(SocialAction::SendRequest(id(5)), &mut graph);
        let msg_b = engine.dispatch(SocialAction::AcceptInvite(id(2)), &mut graph);
        assert!(matches!(msg_a, ClientMessage::FriendRequest { seq: 0, .. }));
        assert!(matches!(
            msg_b,
            ClientMessage::FriendRequestAccept { seq: 1, .. }
        ));
        assert_eq!(engine.in_flight(), 2);

        // Failing one leaves the other's optimistic state intact.
        engine.resolve_failure(0, &mut graph);
        assert!(!graph.outgoing_requests.contains(&id(5)));
        assert!(graph.friends.contains_key(&id(2)));
    }

    #[test]
    fn inbound_accept_moves_outgoing_to_friends_online() {
        // Scenario: accept push arrives while outgoing_requests holds the id.
        let friend = id(2);
        let mut graph = SocialGraph::default();
        graph.outgoing_requests.insert(friend);

        graph.apply_request_accepted(friend);
        assert!(!graph.outgoing_requests.contains(&friend));
        assert_eq!(graph.friends.get(&friend), Some(&Some(Presence::Online)));
        assert_eq!(graph.friends_badge, 1);
    }

    #[test]
    fn inbound_request_dedups_and_bumps_badge() {
        let sender = id(2);
        let mut graph = SocialGraph::default();
        assert!(graph.apply_friend_request(sender));
        assert!(!graph.apply_friend_request(sender));
        assert_eq!(graph.invites_badge, 1);
        assert_eq!(graph.invites.len(), 1);
    }

    #[test]
    fn inbound_request_never_disturbs_existing_relations() {
        let friend = id(2);
        let mut graph = SocialGraph::default();
        graph.friends.insert(friend, Some(Presence::Online));
        assert!(!graph.apply_friend_request(friend));
        assert!(graph.invites.is_empty());
        assert!(graph.friends.contains_key(&friend));
    }

    #[test]
    fn presence_patches_existing_friends_only() {
        let friend = id(2);
        let stranger = id(3);
        let mut graph = SocialGraph::default();
        graph.friends.insert(friend, None);

        assert!(graph.apply_presence(friend, Presence::Busy));
        assert_eq!(graph.friends.get(&friend), Some(&Some(Presence::Busy)));

        // Presence never creates relations.
        assert!(!graph.apply_presence(stranger, Presence::Online));
        assert!(!graph.friends.contains_key(&stranger));
    }

    #[test]
    fn inbound_reject_clears_outgoing_request() {
        let friend = id(2);
        let mut graph = SocialGraph::default();
        graph.outgoing_requests.insert(friend);
        assert!(graph.apply_request_rejected(friend));
        assert!(graph.outgoing_requests.is_empty());
    }

    #[test]
    fn badges_reset_independently() {
        let mut graph = SocialGraph::default();
        graph.apply_friend_request(id(2));
        graph.apply_request_accepted(id(3));
        graph.reset_invites_badge();
        assert_eq!(graph.invites_badge, 0);
        assert_eq!(graph.friends_badge, 1);
        graph.reset_friends_badge();
        assert_eq!(graph.friends_badge, 0);
    }
}
