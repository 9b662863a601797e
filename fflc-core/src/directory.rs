//! Peer directory: id → address, id → public key, key fingerprint → id.
//! Internally synchronized; safe to share between tasks behind an `Arc`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::identity::PublicKey;
use crate::protocol::PeerId;

/// Where to reach a peer (`host:port`) plus a reserved flags byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub address: String,
    pub flags: u8,
}

#[derive(Default)]
struct Maps {
    addresses: HashMap<PeerId, PeerAddr>,
    keys: HashMap<PeerId, PublicKey>,
    ids_by_key: HashMap<String, PeerId>,
}

#[derive(Default)]
pub struct Directory {
    inner: RwLock<Maps>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    // Every write leaves the three maps consistent, so a poisoned lock still holds valid data.
    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register or replace a contact in all three maps.
    pub fn add_contact(&self, id: PeerId, public_key: PublicKey, address: impl Into<String>) {
        let mut maps = self.write();
        if let Some(old) = maps.keys.insert(id.clone(), public_key) {
            if old != public_key {
                maps.ids_by_key.remove(&old.to_hex());
            }
        }
        if let Some(previous_owner) = maps.ids_by_key.insert(public_key.to_hex(), id.clone()) {
            if previous_owner != id {
                maps.keys.remove(&previous_owner);
                maps.addresses.remove(&previous_owner);
            }
        }
        maps.addresses.insert(
            id,
            PeerAddr {
                address: address.into(),
                flags: 0,
            },
        );
    }

    pub fn entry(&self, id: &PeerId) -> Option<PeerAddr> {
        self.read().addresses.get(id).cloned()
    }

    pub fn address(&self, id: &PeerId) -> Option<String> {
        self.entry(id).map(|e| e.address)
    }

    pub fn public_key(&self, id: &PeerId) -> Option<PublicKey> {
        self.read().keys.get(id).copied()
    }

    pub fn id_for_key(&self, key: &PublicKey) -> Option<PeerId> {
        self.read().ids_by_key.get(&key.to_hex()).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn lookups_in_all_directions() {
        let dir = Directory::new();
        let bob = Identity::generate();
        let id = PeerId::new("bob").unwrap();
        dir.add_contact(id.clone(), *bob.public_key(), "127.0.0.1:4000");
        assert_eq!(dir.address(&id).as_deref(), Some("127.0.0.1:4000"));
        assert_eq!(dir.entry(&id).unwrap().flags, 0);
        assert_eq!(dir.public_key(&id), Some(*bob.public_key()));
        assert_eq!(dir.id_for_key(bob.public_key()), Some(id));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn unknown_entries_are_absent() {
        let dir = Directory::new();
        assert!(dir.is_empty());
        assert_eq!(dir.address(&PeerId::new("nobody").unwrap()), None);
        assert_eq!(dir.id_for_key(Identity::generate().public_key()), None);
    }

    #[test]
    fn rekeying_drops_stale_fingerprint() {
        let dir = Directory::new();
        let id = PeerId::new("bob").unwrap();
        let old = Identity::generate();
        let new = Identity::generate();
        dir.add_contact(id.clone(), *old.public_key(), "a:1");
        dir.add_contact(id.clone(), *new.public_key(), "b:2");
        assert_eq!(dir.id_for_key(old.public_key()), None);
        assert_eq!(dir.id_for_key(new.public_key()), Some(id.clone()));
        assert_eq!(dir.address(&id).as_deref(), Some("b:2"));
    }

    #[test]
    fn renaming_a_key_moves_the_contact() {
        let dir = Directory::new();
        let key = *Identity::generate().public_key();
        let bob = PeerId::new("bob").unwrap();
        let robert = PeerId::new("robert").unwrap();
        dir.add_contact(bob.clone(), key, "a:1");
        dir.add_contact(robert.clone(), key, "a:1");
        assert_eq!(dir.id_for_key(&key), Some(robert));
        assert_eq!(dir.public_key(&bob), None);
        assert_eq!(dir.len(), 1);
    }
}
