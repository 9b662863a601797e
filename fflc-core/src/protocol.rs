//! Protocol types: identifiers, chat events and the four packet kinds.

use std::fmt;
use std::str::FromStr;

use crate::identity::PublicKey;

/// Width of every fixed id field on the wire (null-padded).
pub const ID_LEN: usize = 513;
/// Longest identifier that still leaves room for the terminating NUL.
pub const MAX_ID_BYTES: usize = ID_LEN - 1;

/// Identifier rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier is {0} bytes, at most 512 fit a wire field")]
    TooLong(usize),
    #[error("identifier contains a NUL byte")]
    Nul,
}

fn check_id(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_ID_BYTES {
        return Err(IdError::TooLong(value.len()));
    }
    if value.bytes().any(|b| b == 0) {
        return Err(IdError::Nul);
    }
    Ok(())
}

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                check_id(&value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, IdError> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

fixed_id!(
    /// Node identifier: a display name from the directory or a public key in hex.
    PeerId
);
fixed_id!(
    /// Group chat identifier.
    ChatId
);
fixed_id!(
    /// Log fingerprint carried in votes. Currently the decimal length of the log.
    Fingerprint
);

impl PeerId {
    /// Id derived from a public key (lowercase hex). Used when no name is known.
    pub fn from_key(key: &PublicKey) -> Self {
        Self(key.to_hex())
    }
}

impl Fingerprint {
    pub fn from_len(len: usize) -> Self {
        Self(len.to_string())
    }
}

/// Event kind byte in a `PaxosPush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    Text = 1,
    NewUser = 2,
    Transfer = 3,
}

impl EventKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Text),
            2 => Some(Self::NewUser),
            3 => Some(Self::Transfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    Text { text: String },
    NewUser { new_user_id: PeerId },
    Transfer { amount: u32, recipient: PeerId },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Text { .. } => EventKind::Text,
            EventBody::NewUser { .. } => EventKind::NewUser,
            EventBody::Transfer { .. } => EventKind::Transfer,
        }
    }
}

/// One entry of a chat log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub initiator: PeerId,
    /// Milliseconds since the UNIX epoch; also the instant the round for this event starts.
    pub timestamp: u64,
    pub body: EventBody,
}

impl ChatEvent {
    pub fn text(initiator: PeerId, timestamp: u64, text: impl Into<String>) -> Self {
        Self {
            initiator,
            timestamp,
            body: EventBody::Text { text: text.into() },
        }
    }
}

/// First byte of every packet and of every TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    DialogText = 0,
    PaxosNotif = 1,
    PaxosPush = 2,
    RequestChatHash = 3,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::DialogText),
            1 => Some(Self::PaxosNotif),
            2 => Some(Self::PaxosPush),
            3 => Some(Self::RequestChatHash),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Wire-level packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Direct message; travels only inside an encrypted session.
    DialogText { signer: PublicKey, text: String },
    /// A participant's vote: the fingerprint its log would have after the candidate.
    PaxosNotif {
        chat_id: ChatId,
        sender_id: PeerId,
        fingerprint: Fingerprint,
    },
    /// A proposed event, or one replayed history entry during sync.
    PaxosPush { chat_id: ChatId, event: ChatEvent },
    /// Ask a peer to replay its whole log for a chat.
    RequestChatHash {
        chat_id: ChatId,
        sender_id: PeerId,
        timestamp: u64,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::DialogText { .. } => PacketKind::DialogText,
            Packet::PaxosNotif { .. } => PacketKind::PaxosNotif,
            Packet::PaxosPush { .. } => PacketKind::PaxosPush,
            Packet::RequestChatHash { .. } => PacketKind::RequestChatHash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert_eq!(PeerId::new(""), Err(IdError::Empty));
        assert_eq!(ChatId::new("a\0b"), Err(IdError::Nul));
        assert!(PeerId::new("x".repeat(MAX_ID_BYTES)).is_ok());
        assert_eq!(
            PeerId::new("x".repeat(ID_LEN)),
            Err(IdError::TooLong(ID_LEN))
        );
        let parsed: ChatId = "room".parse().unwrap();
        assert_eq!(parsed.as_str(), "room");
    }

    #[test]
    fn fingerprint_is_decimal_length() {
        assert_eq!(Fingerprint::from_len(0).as_str(), "0");
        assert_eq!(Fingerprint::from_len(42).as_str(), "42");
    }

    #[test]
    fn discriminants_are_stable() {
        for b in 0u8..4 {
            assert_eq!(PacketKind::from_byte(b).unwrap().as_byte(), b);
        }
        assert_eq!(PacketKind::from_byte(4), None);
        assert_eq!(EventKind::from_byte(0), None);
        assert_eq!(EventKind::from_byte(3), Some(EventKind::Transfer));
    }
}
