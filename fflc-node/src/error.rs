//! Node error taxonomy: transport, protocol, security and lookup failures.

use fflc_core::{ChatId, FrameEncodeError, HandshakeError, IdError, KeyParseError, PeerId};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("unknown chat {0}")]
    UnknownChat(ChatId),
    #[error("chat {0} has a round in progress")]
    ChatBusy(ChatId),
    #[error("{0} is not a participant of chat {1}")]
    NotParticipant(PeerId, ChatId),
    #[error("frame: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
    #[error("invalid public key: {0}")]
    InvalidKey(#[from] KeyParseError),
}

impl NodeError {
    /// Handshake failures that point at tampering or impersonation.
    pub fn is_security(&self) -> bool {
        matches!(self, NodeError::Handshake(e) if e.is_security())
    }
}
