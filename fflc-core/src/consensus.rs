//! Weighted-vote agreement on the next chat log entry.
//!
//! One round at a time per chat. A round opens with [`ConsensusRound::propose`], collects
//! fingerprints from participants, and decides as soon as one fingerprint holds a strict
//! majority of the total weight. The decision commits the candidate only if the winning
//! fingerprint equals the local log's fingerprint after the candidate; either way the round
//! returns to `Free`. A round that never decides is closed by [`ConsensusRound::timeout`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::chatlog::ChatLog;
use crate::protocol::{ChatEvent, EventBody, Fingerprint, PeerId};

pub const DEFAULT_ROUND_DEADLINE: Duration = Duration::from_millis(1000);

/// Identifies one round. Ids grow monotonically per chat, so a stale deadline can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(u64);

impl RoundId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Free,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeOutcome {
    Accepted(RoundId),
    /// Another round is in progress; the proposal is dropped.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// No round open, unknown voter, or a repeat vote.
    Ignored,
    /// Counted; no decision yet.
    Recorded,
    Committed { round: RoundId, event: ChatEvent },
    /// Decided on a fingerprint other than ours; nothing appended.
    HashMismatch {
        round: RoundId,
        leader: Fingerprint,
        expected: Fingerprint,
    },
}

#[derive(Debug)]
struct ActiveRound {
    id: RoundId,
    candidate: ChatEvent,
    deadline: Duration,
    voted: HashSet<PeerId>,
    tally: HashMap<Fingerprint, u64>,
    leader: Option<Fingerprint>,
}

impl ActiveRound {
    fn tally_of(&self, fingerprint: &Fingerprint) -> u64 {
        self.tally.get(fingerprint).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct ConsensusRound {
    weights: BTreeMap<PeerId, u32>,
    total_weight: u64,
    next_round: u64,
    active: Option<ActiveRound>,
}

impl ConsensusRound {
    /// Participants and weights are fixed for the life of the chat. A repeated id keeps the last
    /// weight.
    pub fn new(participants: impl IntoIterator<Item = (PeerId, u32)>) -> Self {
        let weights: BTreeMap<PeerId, u32> = participants.into_iter().collect();
        let total_weight = weights.values().map(|&w| u64::from(w)).sum();
        Self {
            weights,
            total_weight,
            next_round: 0,
            active: None,
        }
    }

    pub fn state(&self) -> RoundState {
        if self.active.is_some() {
            RoundState::Busy
        } else {
            RoundState::Free
        }
    }

    pub fn is_free(&self) -> bool {
        self.active.is_none()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn weight_of(&self, id: &PeerId) -> Option<u32> {
        self.weights.get(id).copied()
    }

    pub fn is_participant(&self, id: &PeerId) -> bool {
        self.weights.contains_key(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = (&PeerId, u32)> {
        self.weights.iter().map(|(id, &w)| (id, w))
    }

    pub fn current_round(&self) -> Option<RoundId> {
        self.active.as_ref().map(|r| r.id)
    }

    pub fn candidate(&self) -> Option<&ChatEvent> {
        self.active.as_ref().map(|r| &r.candidate)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.active.as_ref().map(|r| r.deadline)
    }

    pub fn leader(&self) -> Option<&Fingerprint> {
        self.active.as_ref().and_then(|r| r.leader.as_ref())
    }

    /// Accumulated weight behind `fingerprint` in the open round.
    pub fn tally(&self, fingerprint: &Fingerprint) -> u64 {
        self.active.as_ref().map_or(0, |r| r.tally_of(fingerprint))
    }

    /// Open a round for `event`. The caller arms a timer for `deadline` and calls
    /// [`timeout`](Self::timeout) with the returned id when it fires.
    pub fn propose(&mut self, event: ChatEvent, deadline: Duration) -> ProposeOutcome {
        if self.active.is_some() {
            return ProposeOutcome::Busy;
        }
        let id = RoundId(self.next_round);
        self.next_round += 1;
        self.active = Some(ActiveRound {
            id,
            candidate: event,
            deadline,
            voted: HashSet::new(),
            tally: HashMap::new(),
            leader: None,
        });
        ProposeOutcome::Accepted(id)
    }

    pub fn vote(
        &mut self,
        voter: &PeerId,
        fingerprint: Fingerprint,
        log: &mut ChatLog,
    ) -> VoteOutcome {
        let Some(weight) = self.weights.get(voter).copied() else {
            return VoteOutcome::Ignored;
        };
        let total_weight = self.total_weight;
        let Some(round) = self.active.as_mut() else {
            return VoteOutcome::Ignored;
        };
        if !round.voted.insert(voter.clone()) {
            return VoteOutcome::Ignored;
        }

        let leading = round.leader.as_ref().map_or(0, |l| round.tally_of(l));
        let tally = round.tally.entry(fingerprint.clone()).or_insert(0);
        *tally += u64::from(weight);
        if *tally > leading {
            round.leader = Some(fingerprint);
        }

        let decided = match &round.leader {
            Some(leader) => 2 * round.tally_of(leader) > total_weight,
            None => false,
        };
        if !decided {
            return VoteOutcome::Recorded;
        }
        let Some(ActiveRound {
            id,
            candidate,
            leader: Some(leader),
            ..
        }) = self.active.take()
        else {
            return VoteOutcome::Recorded;
        };

        let expected = log.fingerprint_after(&candidate);
        if leader == expected {
            log.append(candidate.clone());
            VoteOutcome::Committed {
                round: id,
                event: candidate,
            }
        } else {
            VoteOutcome::HashMismatch {
                round: id,
                leader,
                expected,
            }
        }
    }

    /// Force the round back to `Free` if `round` is still the open one. Stale ids are ignored.
    pub fn timeout(&mut self, round: RoundId) -> bool {
        if self.current_round() == Some(round) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Whether a proposal may enter a round here: the initiator must be a participant and only
    /// text events are voted on.
    pub fn validate(&self, event: &ChatEvent) -> bool {
        self.is_participant(&event.initiator) && matches!(event.body, EventBody::Text { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatId;

    fn id(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn fp(n: usize) -> Fingerprint {
        Fingerprint::from_len(n)
    }

    fn abc() -> ConsensusRound {
        ConsensusRound::new([(id("A"), 1), (id("B"), 1), (id("C"), 1)])
    }

    fn log_with(n: usize) -> ChatLog {
        let mut log = ChatLog::new(ChatId::new("room").unwrap(), id("A"));
        for i in 0..n {
            log.append(ChatEvent::text(id("B"), i as u64, "old"));
        }
        log
    }

    fn candidate() -> ChatEvent {
        ChatEvent::text(id("A"), 100, "hi")
    }

    #[test]
    fn majority_commits() {
        let mut round = abc();
        let mut log = log_with(4);
        let ProposeOutcome::Accepted(rid) = round.propose(candidate(), DEFAULT_ROUND_DEADLINE)
        else {
            panic!("expected Accepted");
        };
        assert_eq!(round.state(), RoundState::Busy);
        assert_eq!(round.vote(&id("A"), fp(5), &mut log), VoteOutcome::Recorded);
        assert_eq!(
            round.vote(&id("B"), fp(5), &mut log),
            VoteOutcome::Committed {
                round: rid,
                event: candidate()
            }
        );
        assert_eq!(log.len(), 5);
        assert_eq!(log.get(4), Some(&candidate()));
        assert_eq!(round.state(), RoundState::Free);
        assert_eq!(round.vote(&id("C"), fp(5), &mut log), VoteOutcome::Ignored);
    }

    #[test]
    fn majority_on_other_fingerprint_is_mismatch() {
        let mut round = abc();
        let mut log = log_with(4);
        round.propose(candidate(), DEFAULT_ROUND_DEADLINE);
        assert_eq!(round.vote(&id("A"), fp(7), &mut log), VoteOutcome::Recorded);
        assert!(matches!(
            round.vote(&id("B"), fp(7), &mut log),
            VoteOutcome::HashMismatch { ref leader, ref expected, .. }
                if *leader == fp(7) && *expected == fp(5)
        ));
        assert_eq!(log.len(), 4);
        assert!(round.is_free());
    }

    #[test]
    fn tie_keeps_first_leader_until_exceeded() {
        let mut round = abc();
        let mut log = log_with(4);
        let ProposeOutcome::Accepted(rid) = round.propose(candidate(), DEFAULT_ROUND_DEADLINE)
        else {
            panic!("expected Accepted");
        };
        assert_eq!(round.vote(&id("A"), fp(5), &mut log), VoteOutcome::Recorded);
        assert_eq!(round.vote(&id("B"), fp(6), &mut log), VoteOutcome::Recorded);
        assert_eq!(round.leader(), Some(&fp(5)));
        assert_eq!(
            round.vote(&id("C"), fp(6), &mut log),
            VoteOutcome::HashMismatch {
                round: rid,
                leader: fp(6),
                expected: fp(5),
            }
        );
        assert_eq!(log.len(), 4);
        assert!(round.is_free());
    }

    #[test]
    fn split_votes_then_timeout() {
        let mut round = abc();
        let mut log = log_with(0);
        let ProposeOutcome::Accepted(rid) = round.propose(candidate(), DEFAULT_ROUND_DEADLINE)
        else {
            panic!("expected Accepted");
        };
        assert_eq!(round.vote(&id("A"), fp(1), &mut log), VoteOutcome::Recorded);
        assert_eq!(round.vote(&id("B"), fp(2), &mut log), VoteOutcome::Recorded);
        assert_eq!(round.vote(&id("C"), fp(3), &mut log), VoteOutcome::Recorded);
        // tie never replaces the first leader
        assert_eq!(round.leader(), Some(&fp(1)));
        assert!(round.timeout(rid));
        assert!(round.is_free());
        assert!(log.is_empty());
        assert!(!round.timeout(rid));
    }

    #[test]
    fn propose_while_busy_is_rejected() {
        let mut round = abc();
        round.propose(candidate(), DEFAULT_ROUND_DEADLINE);
        let other = ChatEvent::text(id("B"), 200, "later");
        assert_eq!(
            round.propose(other, DEFAULT_ROUND_DEADLINE),
            ProposeOutcome::Busy
        );
        assert_eq!(round.candidate(), Some(&candidate()));
    }

    #[test]
    fn stale_timeout_does_not_close_new_round() {
        let mut round = abc();
        let mut log = log_with(0);
        let ProposeOutcome::Accepted(first) = round.propose(candidate(), DEFAULT_ROUND_DEADLINE)
        else {
            panic!("expected Accepted");
        };
        round.vote(&id("A"), fp(1), &mut log);
        round.vote(&id("B"), fp(1), &mut log);
        let ProposeOutcome::Accepted(second) =
            round.propose(candidate(), Duration::from_millis(50))
        else {
            panic!("expected Accepted");
        };
        assert!(second > first);
        assert!(!round.timeout(first));
        assert_eq!(round.state(), RoundState::Busy);
        assert_eq!(round.deadline(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn duplicate_and_unknown_votes_ignored() {
        let mut round = abc();
        let mut log = log_with(0);
        round.propose(candidate(), DEFAULT_ROUND_DEADLINE);
        assert_eq!(round.vote(&id("A"), fp(1), &mut log), VoteOutcome::Recorded);
        assert_eq!(round.vote(&id("A"), fp(1), &mut log), VoteOutcome::Ignored);
        assert_eq!(round.vote(&id("Z"), fp(1), &mut log), VoteOutcome::Ignored);
        assert_eq!(round.tally(&fp(1)), 1);
        assert_eq!(round.state(), RoundState::Busy);
    }

    #[test]
    fn vote_without_round_ignored() {
        let mut round = abc();
        let mut log = log_with(0);
        assert_eq!(round.vote(&id("A"), fp(1), &mut log), VoteOutcome::Ignored);
    }

    #[test]
    fn heavy_participant_decides_alone() {
        let mut round = ConsensusRound::new([(id("A"), 3), (id("B"), 1), (id("C"), 1)]);
        let mut log = log_with(0);
        round.propose(candidate(), DEFAULT_ROUND_DEADLINE);
        assert!(matches!(
            round.vote(&id("A"), fp(1), &mut log),
            VoteOutcome::Committed { .. }
        ));
    }

    #[test]
    fn exact_half_does_not_decide() {
        let mut round = ConsensusRound::new([(id("A"), 1), (id("B"), 1)]);
        let mut log = log_with(0);
        round.propose(candidate(), DEFAULT_ROUND_DEADLINE);
        assert_eq!(round.vote(&id("A"), fp(1), &mut log), VoteOutcome::Recorded);
        assert!(matches!(
            round.vote(&id("B"), fp(1), &mut log),
            VoteOutcome::Committed { .. }
        ));
    }

    #[test]
    fn validate_rules() {
        let round = abc();
        assert!(round.validate(&candidate()));
        assert!(!round.validate(&ChatEvent::text(id("Z"), 1, "x")));
        let transfer = ChatEvent {
            initiator: id("A"),
            timestamp: 1,
            body: EventBody::Transfer {
                amount: 5,
                recipient: id("B"),
            },
        };
        assert!(!round.validate(&transfer));
    }
}
