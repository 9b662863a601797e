//! Packet codec (exact byte layouts, little-endian integers, null-padded id fields)
//! and framing: length-prefix (8 bytes LE) + encoded packet.

use crate::identity::{PublicKey, PUBLIC_KEY_LEN};
use crate::protocol::{
    ChatEvent, ChatId, EventBody, EventKind, Fingerprint, Packet, PacketKind, PeerId, ID_LEN,
};

pub const LEN_SIZE: usize = 8;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

const DIALOG_HEADER_LEN: usize = 1 + 8 + 8;
const NOTIF_LEN: usize = 1 + 3 * ID_LEN;
const PUSH_HEADER_LEN: usize = 1 + 1 + 2 * ID_LEN + 8;
const REQUEST_LEN: usize = 1 + 2 * ID_LEN + 8;

/// Exact size of `encode(packet)`.
pub fn encoded_len(packet: &Packet) -> usize {
    match packet {
        Packet::DialogText { text, .. } => DIALOG_HEADER_LEN + PUBLIC_KEY_LEN + text.len(),
        Packet::PaxosNotif { .. } => NOTIF_LEN,
        Packet::PaxosPush { event, .. } => {
            PUSH_HEADER_LEN
                + match &event.body {
                    EventBody::Text { text } => text.len(),
                    EventBody::NewUser { .. } => ID_LEN,
                    EventBody::Transfer { .. } => 4 + ID_LEN,
                }
        }
        Packet::RequestChatHash { .. } => REQUEST_LEN,
    }
}

/// Encode a packet. The buffer is sized once from [`encoded_len`].
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(packet));
    out.push(packet.kind().as_byte());
    match packet {
        Packet::DialogText { signer, text } => {
            out.extend_from_slice(&(PUBLIC_KEY_LEN as u64).to_le_bytes());
            out.extend_from_slice(&(text.len() as u64).to_le_bytes());
            out.extend_from_slice(signer.as_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        Packet::PaxosNotif {
            chat_id,
            sender_id,
            fingerprint,
        } => {
            put_id(&mut out, chat_id.as_str());
            put_id(&mut out, sender_id.as_str());
            put_id(&mut out, fingerprint.as_str());
        }
        Packet::PaxosPush { chat_id, event } => {
            out.push(event.body.kind() as u8);
            put_id(&mut out, chat_id.as_str());
            put_id(&mut out, event.initiator.as_str());
            out.extend_from_slice(&event.timestamp.to_le_bytes());
            match &event.body {
                EventBody::Text { text } => out.extend_from_slice(text.as_bytes()),
                EventBody::NewUser { new_user_id } => put_id(&mut out, new_user_id.as_str()),
                EventBody::Transfer { amount, recipient } => {
                    out.extend_from_slice(&amount.to_le_bytes());
                    put_id(&mut out, recipient.as_str());
                }
            }
        }
        Packet::RequestChatHash {
            chat_id,
            sender_id,
            timestamp,
        } => {
            put_id(&mut out, chat_id.as_str());
            put_id(&mut out, sender_id.as_str());
            out.extend_from_slice(&timestamp.to_le_bytes());
        }
    }
    debug_assert_eq!(out.len(), encoded_len(packet));
    out
}

fn put_id(out: &mut Vec<u8>, id: &str) {
    out.extend_from_slice(id.as_bytes());
    out.resize(out.len() + ID_LEN - id.len(), 0);
}

/// Decode one whole packet. `None` for anything that is not exactly one valid packet.
pub fn decode(bytes: &[u8]) -> Option<Packet> {
    let mut r = Reader::new(bytes);
    let packet = match PacketKind::from_byte(r.u8()?)? {
        PacketKind::DialogText => {
            let key_len = r.u64()?;
            let text_len = r.u64()?;
            if key_len.checked_add(text_len)? != r.remaining() as u64 {
                return None;
            }
            let signer = PublicKey::from_slice(r.take(key_len as usize)?)?;
            let text = r.utf8(text_len as usize)?;
            Packet::DialogText { signer, text }
        }
        PacketKind::PaxosNotif => Packet::PaxosNotif {
            chat_id: ChatId::new(r.id()?).ok()?,
            sender_id: PeerId::new(r.id()?).ok()?,
            fingerprint: Fingerprint::new(r.id()?).ok()?,
        },
        PacketKind::PaxosPush => {
            let kind = EventKind::from_byte(r.u8()?)?;
            let chat_id = ChatId::new(r.id()?).ok()?;
            let initiator = PeerId::new(r.id()?).ok()?;
            let timestamp = r.u64()?;
            let body = match kind {
                EventKind::Text => EventBody::Text {
                    text: r.utf8(r.remaining())?,
                },
                EventKind::NewUser => EventBody::NewUser {
                    new_user_id: PeerId::new(r.id()?).ok()?,
                },
                EventKind::Transfer => EventBody::Transfer {
                    amount: r.u32()?,
                    recipient: PeerId::new(r.id()?).ok()?,
                },
            };
            Packet::PaxosPush {
                chat_id,
                event: ChatEvent {
                    initiator,
                    timestamp,
                    body,
                },
            }
        }
        PacketKind::RequestChatHash => Packet::RequestChatHash {
            chat_id: ChatId::new(r.id()?).ok()?,
            sender_id: PeerId::new(r.id()?).ok()?,
            timestamp: r.u64()?,
        },
    };
    (r.remaining() == 0).then_some(packet)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.bytes.len() {
            return None;
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)?.try_into().ok().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)?.try_into().ok().map(u64::from_le_bytes)
    }

    fn utf8(&mut self, n: usize) -> Option<String> {
        std::str::from_utf8(self.take(n)?).ok().map(str::to_owned)
    }

    /// Fixed id field: content up to the first NUL. A field with no NUL is malformed.
    fn id(&mut self) -> Option<&'a str> {
        let field = self.take(ID_LEN)?;
        let end = field.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&field[..end]).ok()
    }
}

/// Encode a packet into a single frame: 8 bytes LE length + encoded packet.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let len = encoded_len(packet);
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as u64).to_le_bytes());
    out.extend_from_slice(&encode(packet));
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Payload length announced by a frame header; rejects anything above [`MAX_FRAME_LEN`].
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u64::from_le_bytes(header);
    if len > MAX_FRAME_LEN as u64 {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode the frame at the front of `bytes`, returning the packet and the bytes it occupied.
/// `NeedMore` until header and payload are both buffered, `TooLarge` once the header announces
/// more than [`MAX_FRAME_LEN`], `Malformed` when the payload is not a valid packet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut header = [0u8; LEN_SIZE];
    header.copy_from_slice(&bytes[..LEN_SIZE]);
    let len = frame_len(header)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let packet = decode(&bytes[LEN_SIZE..LEN_SIZE + len]).ok_or(FrameDecodeError::Malformed)?;
    Ok((packet, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or not a valid packet).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("malformed packet")]
    Malformed,
}
