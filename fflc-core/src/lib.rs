//! FFLC messenger protocol core.
//! Host-driven: no I/O; host passes bytes, packets and timer expiries and performs the returned
//! actions.

pub mod chat;
pub mod chatlog;
pub mod consensus;
pub mod directory;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use chat::{ChatAction, ChatInstance};
pub use chatlog::ChatLog;
pub use consensus::{ConsensusRound, ProposeOutcome, RoundId, RoundState, VoteOutcome};
pub use directory::{Directory, PeerAddr};
pub use handshake::{DirectMessage, HandshakeError, Initiator, Responder, SignedBlock};
pub use identity::{Identity, KeyParseError, PublicKey, SessionKey, WireCryptoError};
pub use protocol::{
    ChatEvent, ChatId, EventBody, EventKind, Fingerprint, IdError, Packet, PacketKind, PeerId,
};
pub use wire::{decode, decode_frame, encode, encode_frame, FrameDecodeError, FrameEncodeError};
