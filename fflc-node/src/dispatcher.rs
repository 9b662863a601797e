//! Listener: accept loop, one task per connection, routing by the leading discriminant byte.

use std::net::SocketAddr;
use std::sync::Arc;

use fflc_core::{wire, Packet, PacketKind};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::node::{self, Inbound, Shared};
use crate::{sync, transport};

pub(crate) async fn run(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(shared, stream, addr).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let mut discriminant = [0u8; 1];
    if stream.read_exact(&mut discriminant).await.is_err() {
        return;
    }
    let Some(kind) = PacketKind::from_byte(discriminant[0]) else {
        debug!(%addr, byte = discriminant[0], "unknown connection kind");
        return;
    };

    if kind == PacketKind::DialogText {
        match transport::accept_dialog_text(&mut stream, &shared.identity).await {
            Ok(message) => {
                let from = shared.peer_for_key(&message.sender);
                info!(%from, "direct message received");
                shared.deliver(Inbound::DirectMessage {
                    from,
                    text: message.text,
                });
            }
            Err(e) if e.is_security() => warn!(%addr, error = %e, "direct message rejected"),
            Err(e) => debug!(%addr, error = %e, "direct message failed"),
        }
        return;
    }

    let frame = match transport::read_frame(&mut stream).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            debug!(%addr, error = %e, "frame read failed");
            return;
        }
    };
    let Some(packet) = wire::decode(&frame) else {
        debug!(%addr, ?kind, "malformed packet dropped");
        return;
    };
    if packet.kind() != kind {
        debug!(%addr, ?kind, got = ?packet.kind(), "packet does not match connection kind");
        return;
    }

    match packet {
        Packet::RequestChatHash {
            chat_id, sender_id, ..
        } => match sync::share_history(&shared, &mut stream, &chat_id).await {
            Ok(sent) => debug!(chat = %chat_id, peer = %sender_id, sent, "history shared"),
            Err(e) => {
                debug!(chat = %chat_id, peer = %sender_id, error = %e, "history sharing stopped")
            }
        },
        packet => node::on_chat_packet(&shared, packet).await,
    }
}
