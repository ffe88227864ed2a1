//! Battle session state machine.
//!
//! Drives one timed question sequence (1v1 or multiplayer) from matchmaking
//! to results. The machine is a pure synchronous reducer: server messages go
//! in, outbound [`ClientMessage`]s and [`Advance`] decisions come out. The
//! reveal delay itself is owned by the session loop — when a question for
//! `pos > 0` arrives, the machine stamps the previous question's correct
//! answer and hands back a [`PendingAdvance`] that the loop applies after the
//! configured delay, so the wrong/right flash is always shown before the next
//! prompt.
//!
//! The visible countdown is derived from the server's absolute deadline at
//! *apply* time, not at receipt time, to absorb event-processing jitter.

use tracing::debug;

use crate::protocol::{
    BattleId, BattleMode, BattleResult, ClientMessage, Player, PlayerId, Question, QuestionPayload,
};

/// Lifecycle phase of a battle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BattlePhase {
    /// No session; nothing emitted yet.
    #[default]
    Idle,
    /// Waiting for the server's one-shot `start`.
    Matching,
    /// A question is live (or about to arrive).
    Active,
    /// Previous question's correct answer is being shown.
    Revealing,
    /// Terminal scoreboard received.
    Results,
    /// Session left; no further events apply.
    Terminated,
}

/// Read-only snapshot of the battle session.
#[derive(Debug, Clone, Default)]
pub struct BattleState {
    pub phase: BattlePhase,
    pub mode: Option<BattleMode>,
    pub battle_id: Option<BattleId>,
    /// Every matched player except the local user.
    pub opponents: Vec<Player>,
    pub question: Option<Question>,
    /// Set only during the reveal window; always the answer of the
    /// *previous* position.
    pub correct_answer: Option<String>,
    /// Monotonically non-decreasing for the life of the session.
    pub position: u32,
    /// Countdown for the current question, derived at apply time.
    pub duration_secs: u32,
    /// Option locked in for the current question, if any.
    pub selected_option: Option<String>,
    /// Terminal scoreboard, descending by score (ties keep server order).
    pub results: Vec<BattleResult>,
}

/// What the session loop should do with a `question`/`results` message.
#[derive(Debug)]
pub enum Advance {
    /// Message did not apply to the current session; dropped.
    Ignored,
    /// Applied immediately (first question of the battle).
    Applied,
    /// Reveal stamped; apply `pending` after the reveal delay.
    Deferred(PendingAdvance),
}

/// A deferred state advance scheduled behind the reveal window.
#[derive(Debug)]
pub enum PendingAdvance {
    Question {
        pos: u32,
        question: Question,
        next: i64,
    },
    Results {
        results: Vec<BattleResult>,
    },
}

/// Derive the visible countdown from an absolute epoch-millisecond deadline.
pub(crate) fn countdown_secs(next: i64, now_ms: i64) -> u32 {
    let remaining = (next - now_ms).max(0) as f64;
    (remaining / 1000.0).round() as u32
}

/// The battle session reducer. See module docs.
#[derive(Debug)]
pub struct BattleSession {
    self_id: PlayerId,
    state: BattleState,
    left: bool,
}

impl BattleSession {
    pub fn new(self_id: PlayerId) -> Self {
        Self {
            self_id,
            state: BattleState::default(),
            left: false,
        }
    }

    /// Current state, for snapshot publication.
    pub fn state(&self) -> &BattleState {
        &self.state
    }

    /// Join the 1v1 waiting pool. Emits `join-waiting` and arms the
    /// one-shot `start` expectation.
    pub fn enter_one_vs_one(&mut self) -> Option<ClientMessage> {
        if self.state.phase != BattlePhase::Idle {
            debug!(phase = ?self.state.phase, "ignoring matchmaking request mid-session");
            return None;
        }
        self.state.phase = BattlePhase::Matching;
        self.state.mode = Some(BattleMode::OneVsOne);
        Some(ClientMessage::JoinWaiting)
    }

    /// Signal readiness for a multiplayer battle handed off by a room.
    pub fn enter_multiplayer(&mut self, battle_id: BattleId) -> Option<ClientMessage> {
        if self.state.phase != BattlePhase::Idle {
            debug!(phase = ?self.state.phase, "ignoring multiplayer entry mid-session");
            return None;
        }
        self.state.phase = BattlePhase::Matching;
        self.state.mode = Some(BattleMode::Multiplayer);
        self.state.battle_id = Some(battle_id);
        Some(ClientMessage::Ready { battle_id })
    }

    /// Server matched/assembled the battle. Computes `opponents = players \ self`.
    ///
    /// Returns `false` if the session is not waiting for a start.
    pub fn handle_start(&mut self, battle_id: BattleId, players: Vec<Player>) -> bool {
        if self.state.phase != BattlePhase::Matching {
            debug!(%battle_id, phase = ?self.state.phase, "dropping start for inactive session");
            return false;
        }
        self.state.battle_id = Some(battle_id);
        self.state.opponents = players.into_iter().filter(|p| p.id != self.self_id).collect();
        self.state.phase = BattlePhase::Active;
        self.state.position = 0;
        true
    }

    /// A `question` event arrived. `now_ms` is the current Unix time in
    /// milliseconds, used only when the question applies immediately.
    pub fn handle_question(&mut self, payload: QuestionPayload, now_ms: i64) -> Advance {
        match self.state.phase {
            BattlePhase::Active | BattlePhase::Revealing => {}
            _ => {
                debug!(pos = payload.pos, phase = ?self.state.phase, "dropping question for inactive session");
                return Advance::Ignored;
            }
        }

        if payload.pos == 0 {
            if self.state.question.is_some() {
                debug!("dropping duplicate first question");
                return Advance::Ignored;
            }
            self.apply_question(0, payload.question, payload.next, now_ms);
            return Advance::Applied;
        }

        // Position is monotonically non-decreasing; a stale pos is a
        // protocol anomaly, not a case to recover from.
        if payload.pos <= self.state.position {
            debug!(
                pos = payload.pos,
                current = self.state.position,
                "dropping stale question position"
            );
            return Advance::Ignored;
        }

        self.state.correct_answer = payload.prev_ans;
        self.state.phase = BattlePhase::Revealing;
        Advance::Deferred(PendingAdvance::Question {
            pos: payload.pos,
            question: payload.question,
            next: payload.next,
        })
    }

    /// Apply a deferred (or immediate) question, ending any reveal window.
    pub fn apply_question(&mut self, pos: u32, question: Question, next: i64, now_ms: i64) {
        if self.state.phase == BattlePhase::Terminated {
            return;
        }
        self.state.position = pos;
        self.state.question = Some(question);
        self.state.correct_answer = None;
        self.state.selected_option = None;
        self.state.duration_secs = countdown_secs(next, now_ms);
        self.state.phase = BattlePhase::Active;
    }

    /// A `results` event arrived. Stamps the final reveal exactly like the
    /// per-question case so the last question's correctness is never skipped.
    pub fn handle_results(
        &mut self,
        mut results: Vec<BattleResult>,
        prev_ans: Option<String>,
    ) -> Advance {
        match self.state.phase {
            BattlePhase::Active | BattlePhase::Revealing => {}
            _ => {
                debug!(phase = ?self.state.phase, "dropping results for inactive session");
                return Advance::Ignored;
            }
        }
        self.state.correct_answer = prev_ans;
        self.state.phase = BattlePhase::Revealing;
        // Stable sort: ties keep the server's order.
        results.sort_by(|a, b| b.score.cmp(&a.score));
        Advance::Deferred(PendingAdvance::Results { results })
    }

    /// Apply deferred results, surfacing the scoreboard.
    pub fn apply_results(&mut self, results: Vec<BattleResult>) {
        if self.state.phase == BattlePhase::Terminated {
            return;
        }
        self.state.results = results;
        self.state.correct_answer = None;
        self.state.phase = BattlePhase::Results;
    }

    /// Lock in an answer for the current question.
    ///
    /// Returns the `answer` emit, or `None` when no question is live or an
    /// option is already locked for this cycle.
    pub fn select_option(&mut self, option_id: String) -> Option<ClientMessage> {
        if self.state.phase != BattlePhase::Active || self.state.selected_option.is_some() {
            return None;
        }
        let battle_id = self.state.battle_id?;
        let question_id = self.state.question.as_ref()?.id;
        self.state.selected_option = Some(option_id.clone());
        Some(ClientMessage::Answer {
            battle_id,
            question_id,
            answer: option_id,
        })
    }

    /// A channel-level error arrived while waiting for a match. Aborts back
    /// to [`BattlePhase::Idle`] so the user is never stuck in matchmaking.
    pub fn abort_matching(&mut self) -> bool {
        if self.state.phase != BattlePhase::Matching {
            return false;
        }
        self.state = BattleState::default();
        true
    }

    /// Leave the battle. Idempotent: the leave event is emitted exactly once
    /// no matter how many exit paths run.
    ///
    /// While still in the 1v1 waiting pool this emits `leave-waiting`;
    /// anywhere else in a live session it emits `leave-battle`.
    pub fn leave(&mut self) -> Option<ClientMessage> {
        if self.left || self.state.phase == BattlePhase::Idle {
            return None;
        }
        self.left = true;
        let msg = if self.state.phase == BattlePhase::Matching
            && self.state.mode == Some(BattleMode::OneVsOne)
        {
            ClientMessage::LeaveWaiting
        } else {
            ClientMessage::LeaveBattle
        };
        self.state.phase = BattlePhase::Terminated;
        Some(msg)
    }

    /// Discard a finished session so the machine can host a new one.
    ///
    /// Late events for the old session stay harmless afterwards: a fresh
    /// [`BattlePhase::Idle`] machine ignores everything except an explicit
    /// entry call.
    pub fn reset(&mut self) {
        self.state = BattleState::default();
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

    fn question(n: u128) -> Question {
        Question {
            id: Uuid::from_u128(n),
            text: format!("question {n}"),
            options: vec![
                crate::protocol::AnswerOption {
                    id: "A".into(),
                    text: "first".into(),
                },
                crate::protocol::AnswerOption {
                    id: "B".into(),
                    text: "second".into(),
                },
            ],
        }
    }

    fn started_session() -> BattleSession {
        let mut session = BattleSession::new(Uuid::from_u128(1));
        assert_eq!(session.enter_one_vs_one(), Some(ClientMessage::JoinWaiting));
        assert!(session.handle_start(Uuid::from_u128(100), vec![player(1), player(2)]));
        session
    }

    #[test]
    fn start_filters_self_from_opponents() {
        let session = started_session();
        assert_eq!(session.state().phase, BattlePhase::Active);
        assert_eq!(session.state().position, 0);
        assert_eq!(session.state().opponents.len(), 1);
        assert_eq!(session.state().opponents[0].id, Uuid::from_u128(2));
        assert!(session.state().question.is_none());
    }

    #[test]
    fn first_question_applies_immediately() {
        let mut session = started_session();
        let advance = session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );
        assert!(matches!(advance, Advance::Applied));
        assert_eq!(session.state().duration_secs, 15);
        assert!(session.state().correct_answer.is_none());
        assert_eq!(session.state().position, 0);
    }

    #[test]
    fn later_question_stamps_reveal_then_defers() {
        // Scenario: question {pos:0}, then question {pos:1, prevAns:"B"}.
        let mut session = started_session();
        session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );

        let advance = session.handle_question(
            QuestionPayload {
                pos: 1,
                question: question(11),
                next: 32_000,
                prev_ans: Some("B".into()),
            },
            16_000,
        );

        // Reveal window: previous position still visible, answer stamped.
        assert_eq!(session.state().phase, BattlePhase::Revealing);
        assert_eq!(session.state().correct_answer.as_deref(), Some("B"));
        assert_eq!(session.state().position, 0);

        let Advance::Deferred(PendingAdvance::Question { pos, question: q, next }) = advance else {
            panic!("expected deferred question");
        };
        session.apply_question(pos, q, next, 17_000);

        assert_eq!(session.state().phase, BattlePhase::Active);
        assert_eq!(session.state().position, 1);
        assert!(session.state().correct_answer.is_none());
        assert_eq!(session.state().duration_secs, 15);
    }

    #[test]
    fn countdown_is_derived_at_apply_time() {
        // 2s of reveal+jitter eat into the visible countdown.
        assert_eq!(countdown_secs(30_000, 15_000), 15);
        assert_eq!(countdown_secs(30_000, 17_000), 13);
        assert_eq!(countdown_secs(30_000, 29_600), 0);
        assert_eq!(countdown_secs(30_000, 31_000), 0);
    }

    #[test]
    fn stale_position_is_ignored() {
        let mut session = started_session();
        session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );
        let advance = session.handle_question(
            QuestionPayload {
                pos: 2,
                question: question(12),
                next: 45_000,
                prev_ans: Some("A".into()),
            },
            16_000,
        );
        let Advance::Deferred(PendingAdvance::Question { pos, question: q, next }) = advance else {
            panic!("expected deferred question");
        };
        session.apply_question(pos, q, next, 17_000);

        // Replayed earlier position must not regress state.
        let advance = session.handle_question(
            QuestionPayload {
                pos: 1,
                question: question(11),
                next: 30_000,
                prev_ans: Some("B".into()),
            },
            18_000,
        );
        assert!(matches!(advance, Advance::Ignored));
        assert_eq!(session.state().position, 2);
        assert!(session.state().correct_answer.is_none());
    }

    #[test]
    fn select_option_locks_until_next_question() {
        let mut session = started_session();
        session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );

        let msg = session.select_option("A".into());
        assert!(matches!(
            msg,
            Some(ClientMessage::Answer { ref answer, .. }) if answer == "A"
        ));
        // Locked: a second selection emits nothing.
        assert!(session.select_option("B".into()).is_none());

        // Next question unlocks selection.
        let advance = session.handle_question(
            QuestionPayload {
                pos: 1,
                question: question(11),
                next: 32_000,
                prev_ans: Some("A".into()),
            },
            16_000,
        );
        let Advance::Deferred(PendingAdvance::Question { pos, question: q, next }) = advance else {
            panic!("expected deferred question");
        };
        session.apply_question(pos, q, next, 17_000);
        assert!(session.select_option("B".into()).is_some());
    }

    #[test]
    fn select_option_requires_live_question() {
        let mut session = started_session();
        assert!(session.select_option("A".into()).is_none());
    }

    #[test]
    fn results_stamp_final_reveal_then_surface() {
        let mut session = started_session();
        session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );

        let results = vec![
            BattleResult {
                player: player(2),
                score: 30,
                coins: -20,
            },
            BattleResult {
                player: player(1),
                score: 80,
                coins: 100,
            },
        ];
        let advance = session.handle_results(results, Some("B".into()));

        assert_eq!(session.state().phase, BattlePhase::Revealing);
        assert_eq!(session.state().correct_answer.as_deref(), Some("B"));

        let Advance::Deferred(PendingAdvance::Results { results }) = advance else {
            panic!("expected deferred results");
        };
        session.apply_results(results);

        assert_eq!(session.state().phase, BattlePhase::Results);
        assert!(session.state().correct_answer.is_none());
        // Sorted descending by score.
        assert_eq!(session.state().results[0].score, 80);
        assert_eq!(session.state().results[1].score, 30);
    }

    #[test]
    fn result_ties_keep_server_order() {
        let mut session = started_session();
        session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );
        let results = vec![
            BattleResult {
                player: player(3),
                score: 50,
                coins: 0,
            },
            BattleResult {
                player: player(2),
                score: 50,
                coins: 0,
            },
        ];
        let advance = session.handle_results(results, Some("A".into()));
        let Advance::Deferred(PendingAdvance::Results { results }) = advance else {
            panic!("expected deferred results");
        };
        session.apply_results(results);
        assert_eq!(session.state().results[0].player.id, Uuid::from_u128(3));
        assert_eq!(session.state().results[1].player.id, Uuid::from_u128(2));
    }

    #[test]
    fn leave_emits_exactly_once() {
        let mut session = started_session();
        assert_eq!(session.leave(), Some(ClientMessage::LeaveBattle));
        assert_eq!(session.leave(), None);
        assert_eq!(session.leave(), None);
        assert_eq!(session.state().phase, BattlePhase::Terminated);
    }

    #[test]
    fn leave_while_matching_1v1_leaves_the_waiting_pool() {
        let mut session = BattleSession::new(Uuid::from_u128(1));
        session.enter_one_vs_one();
        assert_eq!(session.leave(), Some(ClientMessage::LeaveWaiting));
        assert_eq!(session.leave(), None);
    }

    #[test]
    fn leave_before_entering_emits_nothing() {
        let mut session = BattleSession::new(Uuid::from_u128(1));
        assert_eq!(session.leave(), None);
    }

    #[test]
    fn abort_matching_returns_to_idle() {
        let mut session = BattleSession::new(Uuid::from_u128(1));
        session.enter_one_vs_one();
        assert!(session.abort_matching());
        assert_eq!(session.state().phase, BattlePhase::Idle);
        // Not matching anymore: no-op.
        assert!(!session.abort_matching());
    }

    #[test]
    fn events_after_terminate_are_ignored() {
        let mut session = started_session();
        session.leave();
        let advance = session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );
        assert!(matches!(advance, Advance::Ignored));
        assert!(!session.handle_start(Uuid::from_u128(100), vec![]));
        assert!(matches!(
            session.handle_results(vec![], Some("A".into())),
            Advance::Ignored
        ));
    }

    #[test]
    fn reset_allows_a_second_session() {
        let mut session = started_session();
        assert_eq!(session.leave(), Some(ClientMessage::LeaveBattle));
        session.reset();

        assert_eq!(session.state().phase, BattlePhase::Idle);
        assert_eq!(session.enter_one_vs_one(), Some(ClientMessage::JoinWaiting));
        assert!(session.handle_start(Uuid::from_u128(101), vec![player(1), player(3)]));
        assert_eq!(session.state().opponents[0].id, Uuid::from_u128(3));
        // The second session's leave emits again.
        assert_eq!(session.leave(), Some(ClientMessage::LeaveBattle));
    }

    #[test]
    fn multiplayer_entry_signals_ready() {
        let mut session = BattleSession::new(Uuid::from_u128(1));
        let battle_id = Uuid::from_u128(200);
        assert_eq!(
            session.enter_multiplayer(battle_id),
            Some(ClientMessage::Ready { battle_id })
        );
        assert_eq!(session.state().mode, Some(BattleMode::Multiplayer));
        assert_eq!(session.state().phase, BattlePhase::Matching);
    }

    #[test]
    fn reveal_window_always_shows_previous_answer() {
        // Property: correct_answer is set only while Revealing, and is the
        // prev_ans of the incoming (next) position, never the current one.
        let mut session = started_session();
        session.handle_question(
            QuestionPayload {
                pos: 0,
                question: question(10),
                next: 15_000,
                prev_ans: None,
            },
            0,
        );
        for pos in 1..5u32 {
            assert!(session.state().correct_answer.is_none());
            let advance = session.handle_question(
                QuestionPayload {
                    pos,
                    question: question(10 + u128::from(pos)),
                    next: i64::from(pos) * 17_000,
                    prev_ans: Some(format!("ans{}", pos - 1)),
                },
                i64::from(pos) * 16_000,
            );
            assert_eq!(session.state().phase, BattlePhase::Revealing);
            assert_eq!(
                session.state().correct_answer.as_deref(),
                Some(format!("ans{}", pos - 1).as_str())
            );
            // Still displaying the previous position during the reveal.
            assert_eq!(session.state().position, pos - 1);
            let Advance::Deferred(PendingAdvance::Question { pos, question: q, next }) = advance
            else {
                panic!("expected deferred question");
            };
            session.apply_question(pos, q, next, i64::from(pos) * 16_500);
            assert!(session.state().correct_answer.is_none());
            assert_eq!(session.state().position, pos);
        }
    }
}
