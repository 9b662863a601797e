use std::collections::HashMap;
use std::time::Duration;

use fflc_core::{
    ChatEvent, ChatId, ChatLog, ConsensusRound, Fingerprint, PeerId, ProposeOutcome, RoundState,
    VoteOutcome,
};
use proptest::prelude::*;

fn peer(i: usize) -> PeerId {
    PeerId::new(format!("p{i}")).unwrap()
}

proptest! {
    /// The round decides on the first vote that gives one fingerprint a strict weight majority,
    /// and commits only when that fingerprint is the log length after the candidate.
    #[test]
    fn quorum_law(
        weights in prop::collection::vec(1u32..5, 1..7),
        votes in prop::collection::vec((0usize..8, 0usize..3), 0..20),
    ) {
        let mut round = ConsensusRound::new(weights.iter().enumerate().map(|(i, &w)| (peer(i), w)));
        let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
        let mut log = ChatLog::new(ChatId::new("room").unwrap(), peer(0));
        let candidate = ChatEvent::text(peer(0), 1, "x");
        let accepted = round.propose(candidate.clone(), Duration::from_millis(1000));
        prop_assert!(matches!(accepted, ProposeOutcome::Accepted(_)));

        let mut tally: HashMap<usize, u64> = HashMap::new();
        let mut voted = Vec::new();
        let mut decided = false;
        for (who, fp) in votes {
            let outcome = round.vote(&peer(who), Fingerprint::from_len(fp), &mut log);
            let known = who < weights.len();
            if decided || !known || voted.contains(&who) {
                prop_assert_eq!(outcome, VoteOutcome::Ignored);
                continue;
            }
            voted.push(who);
            let t = tally.entry(fp).or_insert(0);
            *t += u64::from(weights[who]);
            if 2 * *t > total {
                decided = true;
                if fp == 1 {
                    prop_assert!(
                        matches!(outcome, VoteOutcome::Committed { .. }),
                        "unexpected outcome {:?}",
                        outcome
                    );
                    prop_assert_eq!(log.len(), 1);
                } else {
                    prop_assert!(
                        matches!(outcome, VoteOutcome::HashMismatch { .. }),
                        "unexpected outcome {:?}",
                        outcome
                    );
                    prop_assert_eq!(log.len(), 0);
                }
                prop_assert_eq!(round.state(), RoundState::Free);
            } else {
                prop_assert_eq!(outcome, VoteOutcome::Recorded);
                prop_assert_eq!(round.state(), RoundState::Busy);
            }
        }
        if !decided {
            prop_assert!(log.is_empty());
        }
    }
}
