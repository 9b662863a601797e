//! Session transport: one TCP connection per exchange, length-prefixed frames, signed-block
//! handshake pipelines and one-shot chat packet delivery.

use std::io;

use fflc_core::handshake::{self, BlockLengths, DirectMessage, BLOCK_HEADER_LEN};
use fflc_core::wire::{self, LEN_SIZE};
use fflc_core::{Directory, Identity, Initiator, Packet, PacketKind, PeerId, Responder, SignedBlock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::NodeError;

/// Resolve `peer` through the directory and dial it.
pub async fn connect(directory: &Directory, peer: &PeerId) -> Result<TcpStream, NodeError> {
    let address = directory
        .address(peer)
        .ok_or_else(|| NodeError::UnknownPeer(peer.clone()))?;
    let stream = TcpStream::connect(address.as_str()).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// `8:len · payload`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > wire::MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    writer
        .write_all(&(payload.len() as u64).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` when the peer closed cleanly at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; LEN_SIZE];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[first..]).await?;
    let len = wire::frame_len(header)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn read_signed_block<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SignedBlock, NodeError> {
    let mut header = [0u8; BLOCK_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let lengths = BlockLengths::parse(&header)?;
    let mut body = vec![0u8; lengths.body_len()];
    reader.read_exact(&mut body).await?;
    Ok(SignedBlock::decode_body(lengths, &body)?)
}

/// Initiator pipeline: dial, handshake against the recipient's directory key, send one encrypted
/// `DialogText`. Nothing is sent if the responder fails verification.
pub async fn send_dialog_text(
    identity: &Identity,
    directory: &Directory,
    recipient: &PeerId,
    text: &str,
) -> Result<(), NodeError> {
    let expected = directory
        .public_key(recipient)
        .ok_or_else(|| NodeError::UnknownPeer(recipient.clone()))?;
    let mut stream = connect(directory, recipient).await?;

    let (initiator, hello) = Initiator::start(identity, expected);
    let mut opening = Vec::with_capacity(1 + hello.encoded_len());
    opening.push(PacketKind::DialogText.as_byte());
    opening.extend_from_slice(&hello.encode());
    stream.write_all(&opening).await?;
    stream.flush().await?;

    let reply = read_signed_block(&mut stream).await?;
    let session = initiator.finish(&reply)?;
    let cipher = handshake::seal_dialog_text(&session, identity.public_key(), text)?;
    write_frame(&mut stream, &cipher).await?;
    stream.shutdown().await?;
    debug!(peer = %recipient, "direct message sent");
    Ok(())
}

/// Responder pipeline, run after the `DialogText` discriminant has been read.
pub async fn accept_dialog_text<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    identity: &Identity,
) -> Result<DirectMessage, NodeError> {
    let hello = read_signed_block(stream).await?;
    let (responder, reply) = Responder::accept(identity, &hello)?;
    stream.write_all(&reply.encode()).await?;
    stream.flush().await?;
    let cipher = read_frame(stream)
        .await?
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    Ok(responder.open_payload(&cipher)?)
}

/// Dial `peer` and write the preamble for a chat packet: discriminant byte then one frame.
/// The stream stays open for exchanges that expect a reply.
pub async fn start_exchange(
    directory: &Directory,
    peer: &PeerId,
    packet: &Packet,
) -> Result<TcpStream, NodeError> {
    let frame = wire::encode_frame(packet)?;
    let mut stream = connect(directory, peer).await?;
    let mut out = Vec::with_capacity(1 + frame.len());
    out.push(packet.kind().as_byte());
    out.extend_from_slice(&frame);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(stream)
}

/// One-shot chat packet delivery.
pub async fn send_packet(
    directory: &Directory,
    peer: &PeerId,
    packet: &Packet,
) -> Result<(), NodeError> {
    let mut stream = start_exchange(directory, peer, packet).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fflc_core::{ChatId, Fingerprint};

    #[tokio::test]
    async fn frame_roundtrip_and_clean_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_inside_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&10u64.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&u64::MAX.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn handshake_over_duplex() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let bob_key = *bob.public_key();
        let server_task = tokio::spawn(async move {
            let mut disc = [0u8; 1];
            server.read_exact(&mut disc).await.unwrap();
            assert_eq!(disc[0], PacketKind::DialogText.as_byte());
            accept_dialog_text(&mut server, &bob).await
        });

        let (initiator, hello) = Initiator::start(&alice, bob_key);
        client.write_all(&[0]).await.unwrap();
        client.write_all(&hello.encode()).await.unwrap();
        let reply = read_signed_block(&mut client).await.unwrap();
        let session = initiator.finish(&reply).unwrap();
        let cipher =
            handshake::seal_dialog_text(&session, alice.public_key(), "over the wire").unwrap();
        write_frame(&mut client, &cipher).await.unwrap();

        let msg = server_task.await.unwrap().unwrap();
        assert_eq!(msg.sender, *alice.public_key());
        assert_eq!(msg.text, "over the wire");
    }

    #[tokio::test]
    async fn unknown_peer_fails_before_dialing() {
        let directory = Directory::new();
        let packet = Packet::PaxosNotif {
            chat_id: ChatId::new("room").unwrap(),
            sender_id: PeerId::new("alice").unwrap(),
            fingerprint: Fingerprint::from_len(1),
        };
        let err = send_packet(&directory, &PeerId::new("ghost").unwrap(), &packet)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::UnknownPeer(_)));
    }
}
