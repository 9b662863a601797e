//! Direct-message handshake: signed ephemeral key exchange deriving a one-shot session key.
//!
//! ```text
//! initiator                              responder
//!   0x00 · block{id_key, sig, eph_pub}  ->
//!       <-  block{id_key, sig, wrap_pub · sealed(key · nonce)}
//!   8:len · encrypt(DialogText)         ->
//! ```
//!
//! Both state machines consume `self` on completion, so no session exists unless every
//! verification succeeded. I/O is the host's job.

use crate::identity::{
    seal_to, EphemeralKeypair, Identity, PublicKey, SessionKey, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use crate::protocol::Packet;
use crate::wire;

/// Three 8-byte LE lengths: key, signature, data.
pub const BLOCK_HEADER_LEN: usize = 24;
/// Upper bound for any single field of a signed block.
pub const MAX_BLOCK_FIELD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("signature verification failed")]
    BadSignature,
    #[error("peer identity does not match the expected key")]
    IdentityMismatch,
    #[error("invalid public key")]
    InvalidKey,
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),
    #[error("session payload failed to decrypt")]
    Decrypt,
}

impl HandshakeError {
    /// Failures that indicate tampering or impersonation rather than a broken peer.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            HandshakeError::BadSignature
                | HandshakeError::IdentityMismatch
                | HandshakeError::Decrypt
        )
    }
}

/// Field lengths announced by a signed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLengths {
    pub key: usize,
    pub signature: usize,
    pub data: usize,
}

impl BlockLengths {
    pub fn parse(header: &[u8; BLOCK_HEADER_LEN]) -> Result<Self, HandshakeError> {
        let field = |i: usize| -> Result<usize, HandshakeError> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[i * 8..i * 8 + 8]);
            let len = u64::from_le_bytes(raw);
            if len > MAX_BLOCK_FIELD as u64 {
                return Err(HandshakeError::Malformed("block field too large"));
            }
            Ok(len as usize)
        };
        Ok(Self {
            key: field(0)?,
            signature: field(1)?,
            data: field(2)?,
        })
    }

    pub fn body_len(&self) -> usize {
        self.key + self.signature + self.data
    }
}

/// `8:keyLen · 8:sigLen · 8:dataLen · key · sig · data`; `sig` covers `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub signer: PublicKey,
    pub signature: [u8; SIGNATURE_LEN],
    pub data: Vec<u8>,
}

impl SignedBlock {
    pub fn seal(identity: &Identity, data: Vec<u8>) -> Self {
        Self {
            signer: *identity.public_key(),
            signature: identity.sign(&data),
            data,
        }
    }

    pub fn encoded_len(&self) -> usize {
        BLOCK_HEADER_LEN + PUBLIC_KEY_LEN + SIGNATURE_LEN + self.data.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(PUBLIC_KEY_LEN as u64).to_le_bytes());
        out.extend_from_slice(&(SIGNATURE_LEN as u64).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        out.extend_from_slice(self.signer.as_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the body that follows an already-read header.
    pub fn decode_body(lengths: BlockLengths, body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() != lengths.body_len() {
            return Err(HandshakeError::Malformed("block length mismatch"));
        }
        let (key, rest) = body.split_at(lengths.key);
        let (sig, data) = rest.split_at(lengths.signature);
        let signer = PublicKey::from_slice(key).ok_or(HandshakeError::InvalidKey)?;
        let signature: [u8; SIGNATURE_LEN] = sig
            .try_into()
            .map_err(|_| HandshakeError::Malformed("signature length"))?;
        Ok(Self {
            signer,
            signature,
            data: data.to_vec(),
        })
    }

    /// Parse a complete block (header and body) from one buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let header: &[u8; BLOCK_HEADER_LEN] = bytes
            .get(..BLOCK_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(HandshakeError::Malformed("truncated block header"))?;
        let lengths = BlockLengths::parse(header)?;
        Self::decode_body(lengths, &bytes[BLOCK_HEADER_LEN..])
    }

    pub fn verify(&self) -> Result<(), HandshakeError> {
        if self.signer.verify(&self.data, &self.signature) {
            Ok(())
        } else {
            Err(HandshakeError::BadSignature)
        }
    }
}

/// Dialing side. Holds the ephemeral secret until the reply arrives.
pub struct Initiator {
    ephemeral: EphemeralKeypair,
    expected_recipient: PublicKey,
}

impl Initiator {
    /// Opening block: our long-term key signing a fresh ephemeral public key.
    pub fn start(identity: &Identity, expected_recipient: PublicKey) -> (Self, SignedBlock) {
        let ephemeral = EphemeralKeypair::generate();
        let hello = SignedBlock::seal(identity, ephemeral.public_bytes().to_vec());
        (
            Self {
                ephemeral,
                expected_recipient,
            },
            hello,
        )
    }

    pub fn finish(self, reply: &SignedBlock) -> Result<SessionKey, HandshakeError> {
        reply.verify()?;
        if reply.signer != self.expected_recipient {
            return Err(HandshakeError::IdentityMismatch);
        }
        let material = self
            .ephemeral
            .open(&reply.data)
            .map_err(|_| HandshakeError::Decrypt)?;
        SessionKey::from_bytes(&material).ok_or(HandshakeError::Malformed("session material"))
    }
}

/// Encrypt the one payload of a session: an encoded `DialogText` signed by `signer`.
pub fn seal_dialog_text(
    session: &SessionKey,
    signer: &PublicKey,
    text: &str,
) -> Result<Vec<u8>, HandshakeError> {
    let packet = Packet::DialogText {
        signer: *signer,
        text: text.to_owned(),
    };
    session
        .encrypt(&wire::encode(&packet))
        .map_err(|_| HandshakeError::Malformed("payload encryption"))
}

/// A verified direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    pub sender: PublicKey,
    pub text: String,
}

/// Accepting side. Holds the session key and the authenticated sender.
pub struct Responder {
    session: SessionKey,
    sender: PublicKey,
}

impl Responder {
    pub fn accept(
        identity: &Identity,
        hello: &SignedBlock,
    ) -> Result<(Self, SignedBlock), HandshakeError> {
        hello.verify()?;
        let ephemeral: [u8; 32] = hello
            .data
            .as_slice()
            .try_into()
            .map_err(|_| HandshakeError::Malformed("ephemeral key length"))?;
        let session = SessionKey::generate();
        let sealed =
            seal_to(&ephemeral, &session.to_bytes()).map_err(|_| HandshakeError::InvalidKey)?;
        let reply = SignedBlock::seal(identity, sealed);
        Ok((
            Self {
                session,
                sender: hello.signer,
            },
            reply,
        ))
    }

    pub fn sender(&self) -> &PublicKey {
        &self.sender
    }

    /// Decrypt and decode the payload; its signer must be the key that ran the handshake.
    pub fn open_payload(self, ciphertext: &[u8]) -> Result<DirectMessage, HandshakeError> {
        let plain = self
            .session
            .decrypt(ciphertext)
            .map_err(|_| HandshakeError::Decrypt)?;
        match wire::decode(&plain) {
            Some(Packet::DialogText { signer, text }) => {
                if signer != self.sender {
                    return Err(HandshakeError::IdentityMismatch);
                }
                Ok(DirectMessage {
                    sender: signer,
                    text,
                })
            }
            _ => Err(HandshakeError::Malformed("payload is not a dialog text")),
        }
    }
}
