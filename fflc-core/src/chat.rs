//! Host-driven chat instance: one chat's log and consensus round behind a single owner.
//! Host passes chat packets, due proposals and deadline expiries; the instance returns actions.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chatlog::ChatLog;
use crate::consensus::{
    ConsensusRound, ProposeOutcome, RoundId, VoteOutcome, DEFAULT_ROUND_DEADLINE,
};
use crate::protocol::{ChatEvent, ChatId, Fingerprint, Packet, PeerId};

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    Send(PeerId, Packet),
    /// Call [`ChatInstance::on_push_due`] with `event` after `delay`.
    ScheduleProposal { event: ChatEvent, delay: Duration },
    /// Call [`ChatInstance::on_deadline`] with `round` after `after`, unless disarmed first.
    ArmDeadline { round: RoundId, after: Duration },
    Disarm(RoundId),
    Committed(ChatEvent),
}

pub struct ChatInstance {
    log: ChatLog,
    round: ConsensusRound,
    round_deadline: Duration,
    pending_proposals: usize,
}

impl ChatInstance {
    pub fn new(
        chat_id: ChatId,
        local_id: PeerId,
        participants: impl IntoIterator<Item = (PeerId, u32)>,
    ) -> Self {
        Self {
            log: ChatLog::new(chat_id, local_id),
            round: ConsensusRound::new(participants),
            round_deadline: DEFAULT_ROUND_DEADLINE,
            pending_proposals: 0,
        }
    }

    pub fn with_round_deadline(mut self, deadline: Duration) -> Self {
        self.round_deadline = deadline;
        self
    }

    pub fn chat_id(&self) -> &ChatId {
        self.log.chat_id()
    }

    pub fn local_id(&self) -> &PeerId {
        self.log.local_id()
    }

    pub fn log(&self) -> &ChatLog {
        &self.log
    }

    pub fn round(&self) -> &ConsensusRound {
        &self.round
    }

    /// Participants other than this node.
    pub fn peers(&self) -> Vec<PeerId> {
        self.round
            .participants()
            .map(|(id, _)| id)
            .filter(|id| *id != self.log.local_id())
            .cloned()
            .collect()
    }

    /// A proposal has been scheduled locally but its round has not opened yet.
    pub fn awaiting_proposal(&self) -> bool {
        self.pending_proposals > 0 && self.round.is_free()
    }

    /// Whether a vote could belong to the scheduled round that has not opened yet. Only a vote for
    /// the next log length qualifies; votes left over from a decided round name a length at or
    /// below the current one.
    pub fn holds_early_vote(&self, fingerprint: &Fingerprint) -> bool {
        self.awaiting_proposal() && *fingerprint == Fingerprint::from_len(self.log.len() + 1)
    }

    pub fn validate(&self, event: &ChatEvent) -> bool {
        self.round.validate(event)
    }

    /// Text event authored by this node, stamped with the instant its round should start.
    pub fn text_event(&self, text: impl Into<String>, start_at_ms: u64) -> ChatEvent {
        ChatEvent::text(self.log.local_id().clone(), start_at_ms, text)
    }

    pub fn push_packet(&self, event: ChatEvent) -> Packet {
        Packet::PaxosPush {
            chat_id: self.chat_id().clone(),
            event,
        }
    }

    /// A proposal arrived (from a peer or from ourselves). Its round starts at `event.timestamp`;
    /// proposals whose start already passed are dropped.
    pub fn on_push_received(&mut self, event: ChatEvent, now_ms: u64) -> Vec<ChatAction> {
        if event.timestamp < now_ms {
            debug!(
                chat = %self.chat_id(),
                initiator = %event.initiator,
                "stale proposal dropped"
            );
            return Vec::new();
        }
        self.pending_proposals += 1;
        let delay = Duration::from_millis(event.timestamp - now_ms);
        vec![ChatAction::ScheduleProposal { event, delay }]
    }

    /// Start of the round for a scheduled proposal: validate, propose, cast our own vote and
    /// announce it to every other participant.
    pub fn on_push_due(&mut self, event: ChatEvent) -> Vec<ChatAction> {
        self.pending_proposals = self.pending_proposals.saturating_sub(1);
        if !self.round.validate(&event) {
            debug!(
                chat = %self.chat_id(),
                initiator = %event.initiator,
                "invalid proposal dropped"
            );
            return Vec::new();
        }
        let expected = self.log.fingerprint_after(&event);
        let round = match self.round.propose(event, self.round_deadline) {
            ProposeOutcome::Accepted(round) => round,
            ProposeOutcome::Busy => {
                debug!(chat = %self.chat_id(), "round busy, proposal dropped");
                return Vec::new();
            }
        };
        debug!(
            chat = %self.chat_id(),
            round = round.get(),
            fingerprint = %expected,
            "round opened"
        );

        let mut actions = vec![ChatAction::ArmDeadline {
            round,
            after: self.round_deadline,
        }];
        let local = self.log.local_id().clone();
        for peer in self.peers() {
            actions.push(ChatAction::Send(
                peer,
                Packet::PaxosNotif {
                    chat_id: self.chat_id().clone(),
                    sender_id: local.clone(),
                    fingerprint: expected.clone(),
                },
            ));
        }
        actions.extend(self.on_vote(&local, expected));
        actions
    }

    pub fn on_vote(&mut self, voter: &PeerId, fingerprint: Fingerprint) -> Vec<ChatAction> {
        match self.round.vote(voter, fingerprint, &mut self.log) {
            VoteOutcome::Ignored => {
                debug!(chat = %self.log.chat_id(), %voter, "vote ignored");
                Vec::new()
            }
            VoteOutcome::Recorded => Vec::new(),
            VoteOutcome::Committed { round, event } => {
                info!(
                    chat = %self.log.chat_id(),
                    len = self.log.len(),
                    initiator = %event.initiator,
                    "event committed"
                );
                vec![ChatAction::Disarm(round), ChatAction::Committed(event)]
            }
            VoteOutcome::HashMismatch {
                round,
                leader,
                expected,
            } => {
                warn!(
                    chat = %self.log.chat_id(),
                    %leader,
                    %expected,
                    "round decided on a different log, nothing appended"
                );
                vec![ChatAction::Disarm(round)]
            }
        }
    }

    /// Deadline elapsed. Returns whether it closed the open round.
    pub fn on_deadline(&mut self, round: RoundId) -> bool {
        let stopped = self.round.timeout(round);
        if stopped {
            warn!(chat = %self.chat_id(), round = round.get(), "round force-stopped at deadline");
        }
        stopped
    }

    /// Route a chat packet addressed to this chat.
    pub fn on_packet(&mut self, packet: Packet, now_ms: u64) -> Vec<ChatAction> {
        match packet {
            Packet::PaxosNotif {
                sender_id,
                fingerprint,
                ..
            } => self.on_vote(&sender_id, fingerprint),
            Packet::PaxosPush { event, .. } => self.on_push_received(event, now_ms),
            Packet::DialogText { .. } | Packet::RequestChatHash { .. } => Vec::new(),
        }
    }

    pub fn sync_request(&self, timestamp: u64) -> Packet {
        Packet::RequestChatHash {
            chat_id: self.chat_id().clone(),
            sender_id: self.log.local_id().clone(),
            timestamp,
        }
    }

    /// Drop local history ahead of a full replay.
    pub fn begin_resync(&mut self) {
        debug!(chat = %self.chat_id(), dropped = self.log.len(), "log cleared for resync");
        self.log.clear();
    }

    pub fn replay(&mut self, event: ChatEvent) {
        self.log.append(event);
    }

    /// History entry `index` as the packet a sharer sends during sync.
    pub fn history_packet(&self, index: usize) -> Option<Packet> {
        self.log.get(index).cloned().map(|event| self.push_packet(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn instance(local: &str) -> ChatInstance {
        ChatInstance::new(
            ChatId::new("room").unwrap(),
            id(local),
            [(id("A"), 1), (id("B"), 1), (id("C"), 1)],
        )
    }

    #[test]
    fn due_push_opens_round_and_announces_vote() {
        let mut chat = instance("A");
        let event = chat.text_event("hello", 1_000);
        let actions = chat.on_push_due(event);
        assert!(matches!(
            actions[0],
            ChatAction::ArmDeadline { after, .. } if after == DEFAULT_ROUND_DEADLINE
        ));
        let sent: Vec<&PeerId> = actions
            .iter()
            .filter_map(|a| match a {
                ChatAction::Send(peer, Packet::PaxosNotif { fingerprint, sender_id, .. }) => {
                    assert_eq!(fingerprint.as_str(), "1");
                    assert_eq!(sender_id.as_str(), "A");
                    Some(peer)
                }
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![&id("B"), &id("C")]);
        assert_eq!(chat.round().tally(&Fingerprint::from_len(1)), 1);
    }

    #[test]
    fn peer_vote_commits_and_disarms() {
        let mut chat = instance("A");
        let event = chat.text_event("hello", 1_000);
        let actions = chat.on_push_due(event.clone());
        let ChatAction::ArmDeadline { round, .. } = actions[0] else {
            panic!("expected ArmDeadline first");
        };
        let notif = Packet::PaxosNotif {
            chat_id: ChatId::new("room").unwrap(),
            sender_id: id("B"),
            fingerprint: Fingerprint::from_len(1),
        };
        let actions = chat.on_packet(notif, 0);
        assert_eq!(
            actions,
            vec![ChatAction::Disarm(round), ChatAction::Committed(event)]
        );
        assert_eq!(chat.log().len(), 1);
    }

    #[test]
    fn single_participant_commits_on_own_vote() {
        let mut chat = ChatInstance::new(ChatId::new("solo").unwrap(), id("A"), [(id("A"), 1)]);
        let actions = chat.on_push_due(chat.text_event("note", 5));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ChatAction::Committed(_))));
        assert!(!actions.iter().any(|a| matches!(a, ChatAction::Send(..))));
    }

    #[test]
    fn stale_push_dropped_and_fresh_push_scheduled() {
        let mut chat = instance("B");
        let event = ChatEvent::text(id("A"), 1_500, "hi");
        assert!(chat.on_push_received(event.clone(), 2_000).is_empty());
        assert!(!chat.awaiting_proposal());
        let actions = chat.on_push_received(event.clone(), 1_000);
        assert_eq!(
            actions,
            vec![ChatAction::ScheduleProposal {
                event: event.clone(),
                delay: Duration::from_millis(500)
            }]
        );
        assert!(chat.awaiting_proposal());
        chat.on_push_due(event);
        assert!(!chat.awaiting_proposal());
    }

    #[test]
    fn invalid_or_busy_proposals_dropped() {
        let mut chat = instance("A");
        assert!(chat
            .on_push_due(ChatEvent::text(id("Z"), 1, "outsider"))
            .is_empty());
        assert!(!chat.on_push_due(chat.text_event("first", 1)).is_empty());
        assert!(chat
            .on_push_due(ChatEvent::text(id("B"), 2, "second"))
            .is_empty());
    }

    #[test]
    fn deadline_closes_only_current_round() {
        let mut chat = instance("A");
        let actions = chat.on_push_due(chat.text_event("x", 1));
        let ChatAction::ArmDeadline { round, .. } = actions[0] else {
            panic!("expected ArmDeadline first");
        };
        assert!(chat.on_deadline(round));
        assert!(!chat.on_deadline(round));
        assert!(chat.round().is_free());
        assert!(chat.log().is_empty());
    }

    #[test]
    fn replay_rebuilds_history() {
        let mut source = instance("A");
        let mut target = instance("B");
        source.replay(ChatEvent::text(id("A"), 1, "one"));
        source.replay(ChatEvent::text(id("C"), 2, "two"));
        target.replay(ChatEvent::text(id("B"), 9, "stale"));

        target.begin_resync();
        let mut index = 0;
        while let Some(Packet::PaxosPush { event, .. }) = source.history_packet(index) {
            target.replay(event);
            index += 1;
        }
        assert_eq!(index, 2);
        let events: Vec<_> = target.log().iter().cloned().collect();
        let expected: Vec<_> = source.log().iter().cloned().collect();
        assert_eq!(events, expected);
    }

    #[test]
    fn early_vote_held_only_for_next_length() {
        let mut chat = instance("A");
        let one = chat.text_event("one", 100);
        let two = ChatEvent::text(id("B"), 600, "two");
        assert!(!chat.holds_early_vote(&Fingerprint::from_len(1)));

        chat.on_push_received(one.clone(), 0);
        assert!(chat.holds_early_vote(&Fingerprint::from_len(1)));
        assert!(!chat.holds_early_vote(&Fingerprint::from_len(0)));
        assert!(!chat.holds_early_vote(&Fingerprint::from_len(2)));

        chat.on_push_due(one);
        assert!(!chat.holds_early_vote(&Fingerprint::from_len(1)));
        chat.on_vote(&id("B"), Fingerprint::from_len(1));
        assert_eq!(chat.log().len(), 1);

        chat.on_push_received(two, 0);
        assert!(!chat.holds_early_vote(&Fingerprint::from_len(1)));
        assert!(chat.holds_early_vote(&Fingerprint::from_len(2)));
    }

    #[test]
    fn late_vote_from_decided_round_does_not_block_next() {
        let mut chat = instance("A");
        let one = chat.text_event("one", 100);
        let two = ChatEvent::text(id("B"), 600, "two");
        chat.on_push_received(one.clone(), 0);
        chat.on_push_received(two.clone(), 0);
        chat.on_push_due(one);
        chat.on_vote(&id("B"), Fingerprint::from_len(1));
        assert_eq!(chat.log().len(), 1);

        // C's vote for the first round arrives after it was decided
        assert!(!chat.holds_early_vote(&Fingerprint::from_len(1)));
        assert!(chat.on_vote(&id("C"), Fingerprint::from_len(1)).is_empty());

        chat.on_push_due(two.clone());
        let actions = chat.on_vote(&id("C"), Fingerprint::from_len(2));
        assert!(actions.contains(&ChatAction::Committed(two)));
        assert_eq!(chat.log().len(), 2);
    }

    #[test]
    fn sync_request_names_chat_and_sender() {
        let chat = instance("B");
        assert_eq!(
            chat.sync_request(77),
            Packet::RequestChatHash {
                chat_id: ChatId::new("room").unwrap(),
                sender_id: id("B"),
                timestamp: 77,
            }
        );
    }
}
