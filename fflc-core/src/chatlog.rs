//! Replicated chat log. Append-only except for the clear that starts a full resync.

use crate::protocol::{ChatEvent, ChatId, Fingerprint, PeerId};

#[derive(Debug, Clone)]
pub struct ChatLog {
    chat_id: ChatId,
    local_id: PeerId,
    entries: Vec<ChatEvent>,
}

impl ChatLog {
    pub fn new(chat_id: ChatId, local_id: PeerId) -> Self {
        Self {
            chat_id,
            local_id,
            entries: Vec::new(),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChatEvent> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatEvent> {
        self.entries.iter()
    }

    /// Only a consensus commit or a sync replay appends.
    pub(crate) fn append(&mut self, event: ChatEvent) {
        self.entries.push(event);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current log fingerprint: the decimal entry count.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_len(self.entries.len())
    }

    /// Fingerprint the log would have once `_candidate` is appended.
    pub fn fingerprint_after(&self, _candidate: &ChatEvent) -> Fingerprint {
        Fingerprint::from_len(self.entries.len() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> ChatLog {
        ChatLog::new(ChatId::new("room").unwrap(), PeerId::new("alice").unwrap())
    }

    #[test]
    fn fingerprint_tracks_length() {
        let mut log = log();
        let ev = ChatEvent::text(PeerId::new("bob").unwrap(), 1, "hi");
        assert_eq!(log.fingerprint().as_str(), "0");
        assert_eq!(log.fingerprint_after(&ev).as_str(), "1");
        for _ in 0..4 {
            log.append(ev.clone());
        }
        assert_eq!(log.fingerprint().as_str(), "4");
        assert_eq!(log.fingerprint_after(&ev).as_str(), "5");
        assert_eq!(log.get(3), Some(&ev));
        assert_eq!(log.get(4), None);
        assert_eq!(log.iter().count(), 4);
    }

    #[test]
    fn clear_empties() {
        let mut log = log();
        log.append(ChatEvent::text(PeerId::new("bob").unwrap(), 1, "hi"));
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.local_id().as_str(), "alice");
        assert_eq!(log.chat_id().as_str(), "room");
    }
}
