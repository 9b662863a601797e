//! History sync: a requester replaces its log with a peer's by full replay.
//!
//! Requester sends `RequestChatHash`, clears its log once the request is written and appends
//! every `PaxosPush` frame it reads until the sharer closes the connection. The sharer writes one
//! frame per log entry and waits for each write before copying the next entry.

use std::sync::Arc;

use fflc_core::{wire, ChatId, Packet, PeerId};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::NodeError;
use crate::node::{now_millis, Shared};
use crate::transport;

pub(crate) async fn request_history(
    shared: &Arc<Shared>,
    chat_id: &ChatId,
    peer: &PeerId,
) -> Result<usize, NodeError> {
    let chat = shared
        .chat(chat_id)
        .await
        .ok_or_else(|| NodeError::UnknownChat(chat_id.clone()))?;
    let request = chat.lock().await.instance.sync_request(now_millis());
    let mut stream = transport::start_exchange(&shared.directory, peer, &request).await?;
    chat.lock().await.instance.begin_resync();

    let mut replayed = 0;
    while let Some(frame) = transport::read_frame(&mut stream).await? {
        match wire::decode(&frame) {
            Some(Packet::PaxosPush { chat_id: id, event }) if id == *chat_id => {
                chat.lock().await.instance.replay(event);
                replayed += 1;
            }
            _ => debug!(chat = %chat_id, %peer, "unexpected frame during replay skipped"),
        }
    }
    info!(chat = %chat_id, %peer, replayed, "history replayed");
    Ok(replayed)
}

/// Stream the log of `chat_id` to a requester, then close. Unknown chats close immediately.
pub(crate) async fn share_history<W: AsyncWrite + Unpin>(
    shared: &Arc<Shared>,
    writer: &mut W,
    chat_id: &ChatId,
) -> Result<usize, NodeError> {
    let mut sent = 0;
    if let Some(chat) = shared.chat(chat_id).await {
        loop {
            let packet = chat.lock().await.instance.history_packet(sent);
            let Some(packet) = packet else {
                break;
            };
            let frame = wire::encode_frame(&packet)?;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            sent += 1;
        }
    }
    writer.shutdown().await?;
    Ok(sent)
}
