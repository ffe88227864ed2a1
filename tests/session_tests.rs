//! Integration-style session tests for the Quiz Clash client.
//!
//! Uses the channel-based `MockTransport` from `tests/common` to drive the
//! full session loop: client commands go out as wire messages, pushed server
//! messages come back as events, and the reveal-delay and invite-expiry
//! deadlines run on a shortened clock.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use quiz_clash_client::battle::BattlePhase;
use quiz_clash_client::event::CachedCollection;
use quiz_clash_client::protocol::{AckStatus, BattleResult, ClientMessage, Presence};
use quiz_clash_client::{QuizClashClient, QuizClashConfig, QuizClashError, QuizClashEvent};

use common::{
    ack_json, authenticated_json, create_room_json, friend_request_accept_json,
    friend_request_json, join_room_alert_json, now_ms, player, question, question_json,
    results_json, room_info_json, start_json, starting_json, unfriend_json, user_update_json,
    MockTransport, ServerHandle,
};

/// The local player in every test.
const SELF: u128 = 1;

fn self_id() -> uuid::Uuid {
    uuid::Uuid::from_u128(SELF)
}

/// Test config with short deadlines so timer-driven paths run quickly.
fn test_config() -> QuizClashConfig {
    QuizClashConfig::new(self_id(), "session-token")
        .with_reveal_delay(Duration::from_millis(25))
        .with_invite_timeout(Duration::from_millis(60))
}

/// Start an authenticated client session over a mock transport.
#[allow(clippy::type_complexity)]
fn start_client(
    config: QuizClashConfig,
) -> (
    QuizClashClient,
    tokio::sync::mpsc::Receiver<QuizClashEvent>,
    ServerHandle,
    Arc<StdMutex<Vec<String>>>,
    Arc<AtomicBool>,
) {
    let (transport, server, sent, closed) =
        MockTransport::new(vec![Some(Ok(authenticated_json()))]);
    let (client, events) = QuizClashClient::start(transport, config);
    (client, events, server, sent, closed)
}

/// Consume events up to and including the first `Authenticated` event.
async fn drain_until_authenticated(rx: &mut tokio::sync::mpsc::Receiver<QuizClashEvent>) {
    let ev = rx.recv().await.expect("expected Connected event");
    assert!(
        matches!(ev, QuizClashEvent::Connected),
        "first event should be Connected, got {ev:?}"
    );
    let ev = rx.recv().await.expect("expected Authenticated event");
    assert!(
        matches!(ev, QuizClashEvent::Authenticated),
        "second event should be Authenticated, got {ev:?}"
    );
}

/// Give the session loop a moment to process queued commands.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Parse every recorded outgoing message.
fn sent_messages(sent: &Arc<StdMutex<Vec<String>>>) -> Vec<ClientMessage> {
    sent.lock()
        .unwrap()
        .iter()
        .map(|json| serde_json::from_str(json).expect("parse sent message"))
        .collect()
}

// ════════════════════════════════════════════════════════════════════
// Auth flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn authenticate_is_the_first_message_on_the_wire() {
    let (mut client, mut events, _server, sent, _closed) = start_client(test_config());

    drain_until_authenticated(&mut events).await;
    assert!(client.is_connected());
    assert!(client.is_authenticated());

    let messages = sent_messages(&sent);
    assert_eq!(
        messages.first(),
        Some(&ClientMessage::Authenticate {
            token: "session-token".into()
        })
    );

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// 1v1 battle flow: match → questions → reveal → results
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn one_vs_one_battle_runs_to_results() {
    let (mut client, mut events, server, sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let battle_id = uuid::Uuid::from_u128(100);

    // Enter matchmaking, then let the server assemble the match.
    client.find_match().unwrap();
    settle().await;
    server.push(start_json(battle_id, vec![player(SELF), player(2)]));

    let ev = events.recv().await.unwrap();
    let QuizClashEvent::BattleStarted {
        battle_id: started_id,
        opponents,
    } = ev
    else {
        panic!("expected BattleStarted, got {ev:?}");
    };
    assert_eq!(started_id, battle_id);
    assert_eq!(opponents.len(), 1);
    assert_eq!(opponents[0].id, uuid::Uuid::from_u128(2));

    // First question applies immediately with a ~15s countdown.
    server.push(question_json(0, question(10), now_ms() + 15_000, None));
    let ev = events.recv().await.unwrap();
    let QuizClashEvent::QuestionPosted {
        position,
        duration_secs,
        ..
    } = ev
    else {
        panic!("expected QuestionPosted, got {ev:?}");
    };
    assert_eq!(position, 0);
    assert!((14..=15).contains(&duration_secs), "got {duration_secs}");

    // Lock in an answer; a second pick must not emit.
    client.select_option("A").unwrap();
    client.select_option("B").unwrap();
    settle().await;
    let answers: Vec<_> = sent_messages(&sent)
        .into_iter()
        .filter(|m| matches!(m, ClientMessage::Answer { .. }))
        .collect();
    assert_eq!(answers.len(), 1);
    assert!(matches!(
        &answers[0],
        ClientMessage::Answer { answer, .. } if answer == "A"
    ));

    // The next question stamps the reveal, then applies after the delay.
    server.push(question_json(
        1,
        question(11),
        now_ms() + 15_000,
        Some("B"),
    ));
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::AnswerReveal {
            position: 0,
            correct_answer: "B".into()
        }
    );
    let ev = events.recv().await.unwrap();
    let QuizClashEvent::QuestionPosted { position, .. } = ev else {
        panic!("expected QuestionPosted, got {ev:?}");
    };
    assert_eq!(position, 1);

    // Results follow the same reveal-then-surface pattern, sorted by score.
    let results = vec![
        BattleResult {
            player: player(SELF),
            score: 40,
            coins: -20,
        },
        BattleResult {
            player: player(2),
            score: 80,
            coins: 100,
        },
    ];
    server.push(results_json(results, Some("A")));
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::AnswerReveal {
            position: 1,
            correct_answer: "A".into()
        }
    );
    let ev = events.recv().await.unwrap();
    let QuizClashEvent::BattleResults { results } = ev else {
        panic!("expected BattleResults, got {ev:?}");
    };
    assert_eq!(results[0].score, 80);
    assert_eq!(results[1].score, 40);

    // Scores and coins invalidate cached history and profile.
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Battles
        }
    );
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Profile
        }
    );

    assert_eq!(client.battle_state().await.phase, BattlePhase::Results);

    // Leaving from the scoreboard emits leave-battle exactly once.
    client.leave_battle().unwrap();
    client.leave_battle().unwrap();
    settle().await;
    let leaves = sent_messages(&sent)
        .into_iter()
        .filter(|m| matches!(m, ClientMessage::LeaveBattle))
        .count();
    assert_eq!(leaves, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn a_second_match_can_start_after_leaving_a_battle() {
    let (mut client, mut events, server, sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    // First battle: match, one question, results, leave.
    client.find_match().unwrap();
    settle().await;
    server.push(start_json(
        uuid::Uuid::from_u128(100),
        vec![player(SELF), player(2)],
    ));
    let _ = events.recv().await; // BattleStarted
    server.push(question_json(0, question(10), now_ms() + 15_000, None));
    let _ = events.recv().await; // QuestionPosted
    server.push(results_json(
        vec![BattleResult {
            player: player(SELF),
            score: 50,
            coins: 25,
        }],
        Some("A"),
    ));
    let _ = events.recv().await; // AnswerReveal
    let _ = events.recv().await; // BattleResults
    let _ = events.recv().await; // RefreshNeeded (battles)
    let _ = events.recv().await; // RefreshNeeded (profile)

    client.leave_battle().unwrap();
    settle().await;

    // Second matchmaking request hits the wire like the first one.
    client.find_match().unwrap();
    settle().await;
    let joins = sent_messages(&sent)
        .into_iter()
        .filter(|m| matches!(m, ClientMessage::JoinWaiting))
        .count();
    assert_eq!(joins, 2, "each find_match must emit join-waiting");
    assert_eq!(client.battle_state().await.phase, BattlePhase::Matching);

    // And the second battle starts normally.
    server.push(start_json(
        uuid::Uuid::from_u128(101),
        vec![player(SELF), player(3)],
    ));
    let ev = events.recv().await.unwrap();
    let QuizClashEvent::BattleStarted { opponents, .. } = ev else {
        panic!("expected BattleStarted, got {ev:?}");
    };
    assert_eq!(opponents[0].id, uuid::Uuid::from_u128(3));

    client.shutdown().await;
}

#[tokio::test]
async fn transport_error_while_matching_aborts_to_idle() {
    let (mut client, mut events, server, _sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    client.find_match().unwrap();
    settle().await;
    server.fail("socket reset");

    let ev = events.recv().await.unwrap();
    let QuizClashEvent::MatchingAborted { reason } = ev else {
        panic!("expected MatchingAborted, got {ev:?}");
    };
    assert!(reason.contains("socket reset"));

    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, QuizClashEvent::Disconnected { reason: Some(_) }));

    assert_eq!(client.battle_state().await.phase, BattlePhase::Idle);
    assert!(!client.is_connected());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Room lifecycle: create, invite, expiry, handoff
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unanswered_invite_expires_after_the_timeout() {
    let (mut client, mut events, server, sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let room_id = uuid::Uuid::from_u128(500);
    let friend = uuid::Uuid::from_u128(7);

    client.create_room().unwrap();
    settle().await;
    server.push(create_room_json(room_id));
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, QuizClashEvent::RoomCreated { room_id });

    client.invite_friend(friend).unwrap();
    settle().await;
    assert!(sent_messages(&sent)
        .iter()
        .any(|m| matches!(m, ClientMessage::InviteRoom { friend_id, .. } if *friend_id == friend)));
    assert!(client.room_state().await.pending_invites.contains(&friend));

    // No response within the invite timeout: the offer expires locally.
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, QuizClashEvent::InviteExpired { friend_id: friend });
    assert!(client.room_state().await.pending_invites.is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn invite_resolved_by_join_never_expires() {
    let (mut client, mut events, server, _sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let room_id = uuid::Uuid::from_u128(500);
    let friend = player(7);

    client.create_room().unwrap();
    settle().await;
    server.push(create_room_json(room_id));
    let _ = events.recv().await; // RoomCreated

    client.invite_friend(friend.id).unwrap();
    settle().await;
    server.push(join_room_alert_json(friend.clone()));

    let ev = events.recv().await.unwrap();
    assert_eq!(ev, QuizClashEvent::MemberJoined { player: friend });

    // Wait past the invite timeout: no expiry event may arrive.
    let outcome = tokio::time::timeout(Duration::from_millis(120), events.recv()).await;
    assert!(outcome.is_err(), "unexpected event: {outcome:?}");

    let room = client.room_state().await;
    assert!(room.pending_invites.is_empty());
    assert_eq!(room.members.len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn starting_hands_the_room_off_to_a_battle() {
    let (mut client, mut events, server, sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let room_id = uuid::Uuid::from_u128(600);
    let battle_id = uuid::Uuid::from_u128(700);
    let owner = player(2);

    // Join an existing room owned by someone else.
    client.join_room(room_id).unwrap();
    settle().await;
    server.push(room_info_json(owner.id, vec![owner.clone()]));
    let ev = events.recv().await.unwrap();
    let QuizClashEvent::RoomJoined {
        room_id: joined_id,
        owner_id,
        members,
    } = ev
    else {
        panic!("expected RoomJoined, got {ev:?}");
    };
    assert_eq!(joined_id, room_id);
    assert_eq!(owner_id, owner.id);
    assert_eq!(members.len(), 1);

    // A non-owner cannot start the room.
    assert!(matches!(
        client.start_room().await,
        Err(QuizClashError::NotRoomOwner)
    ));

    // The owner starts the battle: the client leaves the lobby and signals
    // readiness for the new battle in one step.
    server.push(starting_json(battle_id));
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, QuizClashEvent::RoomStarting { battle_id });

    settle().await;
    let messages = sent_messages(&sent);
    let leave_pos = messages
        .iter()
        .position(|m| matches!(m, ClientMessage::LeaveRoom))
        .expect("leave-room sent");
    let ready_pos = messages
        .iter()
        .position(|m| matches!(m, ClientMessage::Ready { battle_id: b } if *b == battle_id))
        .expect("ready sent");
    assert!(leave_pos < ready_pos, "leave-room must precede ready");

    // The multiplayer start completes like any other battle.
    server.push(start_json(battle_id, vec![player(SELF), owner]));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, QuizClashEvent::BattleStarted { .. }));

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Social graph: optimistic mutations and pushes
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rejected_friend_request_rolls_the_graph_back() {
    let (mut client, mut events, server, sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let friend = uuid::Uuid::from_u128(9);

    client.send_friend_request(friend).unwrap();
    settle().await;
    assert!(client.social_graph().await.outgoing_requests.contains(&friend));
    let messages = sent_messages(&sent);
    assert!(messages
        .iter()
        .any(|m| matches!(m, ClientMessage::FriendRequest { friend_id, seq: 0 } if *friend_id == friend)));

    server.push(ack_json(0, AckStatus::Error, Some("already friends")));
    let ev = events.recv().await.unwrap();
    let QuizClashEvent::SocialActionFailed { reason, .. } = ev else {
        panic!("expected SocialActionFailed, got {ev:?}");
    };
    assert_eq!(reason, "already friends");
    assert!(client.social_graph().await.outgoing_requests.is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn accepting_a_request_confirms_and_hints_refreshes() {
    let (mut client, mut events, server, _sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let requester = player(9);

    // Incoming request: invite recorded, badge bumped, cache hint emitted.
    server.push(friend_request_json(requester.clone(), "2026-08-30T12:00:00Z"));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, QuizClashEvent::FriendRequestReceived { .. }));
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Invites
        }
    );
    assert_eq!(client.social_graph().await.invites_badge, 1);

    // Accept optimistically; the server confirms.
    client.accept_friend_request(requester.id).unwrap();
    settle().await;
    let graph = client.social_graph().await;
    assert!(graph.invites.is_empty());
    assert!(graph.friends.contains_key(&requester.id));

    server.push(ack_json(0, AckStatus::Success, None));
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Friends
        }
    );
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Invites
        }
    );
    assert!(client.social_graph().await.friends.contains_key(&requester.id));

    client.shutdown().await;
}

#[tokio::test]
async fn pushes_patch_presence_and_remove_friends() {
    let (mut client, mut events, server, _sent, _closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    let friend = uuid::Uuid::from_u128(9);

    // The other side accepts our earlier request: they become a friend.
    client.send_friend_request(friend).unwrap();
    settle().await;
    server.push(ack_json(0, AckStatus::Success, None));
    server.push(friend_request_accept_json(friend));
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, QuizClashEvent::FriendRequestAccepted { friend_id: friend });
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Friends
        }
    );
    assert_eq!(client.social_graph().await.friends_badge, 1);

    // Presence patch applies to the existing friend.
    server.push(user_update_json(friend, Presence::Busy));
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::PresenceChanged {
            uid: friend,
            presence: Presence::Busy
        }
    );

    // Presence for a stranger is dropped without an event.
    server.push(user_update_json(uuid::Uuid::from_u128(77), Presence::Online));

    // Unfriend push removes the relation.
    server.push(unfriend_json(friend));
    let ev = events.recv().await.unwrap();
    assert_eq!(ev, QuizClashEvent::Unfriended { friend_id: friend });
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        QuizClashEvent::RefreshNeeded {
            collection: CachedCollection::Friends
        }
    );
    assert!(client.social_graph().await.friends.is_empty());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Teardown
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shutdown_leaves_live_sessions_before_closing() {
    let (mut client, mut events, server, sent, closed) = start_client(test_config());
    drain_until_authenticated(&mut events).await;

    // Get into a live battle.
    client.find_match().unwrap();
    settle().await;
    server.push(start_json(
        uuid::Uuid::from_u128(100),
        vec![player(SELF), player(2)],
    ));
    let _ = events.recv().await; // BattleStarted

    client.shutdown().await;

    let ev = events.recv().await.unwrap();
    let QuizClashEvent::Disconnected { reason } = ev else {
        panic!("expected Disconnected, got {ev:?}");
    };
    assert_eq!(reason.as_deref(), Some("client shut down"));
    assert!(closed.load(Ordering::Relaxed));

    // The battle was left on the way out.
    assert!(sent_messages(&sent)
        .iter()
        .any(|m| matches!(m, ClientMessage::LeaveBattle)));

    // Further commands fail fast.
    assert!(matches!(
        client.find_match(),
        Err(QuizClashError::NotConnected)
    ));
}
