//! Node facade: owns the identity, directory and chat table, drives chat instances from the
//! network and from local calls, and runs their round timers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fflc_core::{
    ChatAction, ChatEvent, ChatId, ChatInstance, Directory, Fingerprint, Identity, Packet, PeerId,
    PublicKey, RoundId,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::NodeError;
use crate::{dispatcher, sync, transport};

/// Delivered to the collaborator on the inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    DirectMessage { from: PeerId, text: String },
    ChatCommitted { chat_id: ChatId, event: ChatEvent },
}

/// One chat behind one lock: log, round, and the cancellation handle of the open round.
pub(crate) struct ChatState {
    pub(crate) instance: ChatInstance,
    round_timer: Option<(RoundId, CancellationToken)>,
    /// Bumped every time a scheduled proposal reaches its start instant.
    rounds_started: watch::Sender<u64>,
}

impl ChatState {
    fn new(instance: ChatInstance) -> Self {
        Self {
            instance,
            round_timer: None,
            rounds_started: watch::Sender::new(0),
        }
    }

    fn disarm(&mut self, round: RoundId) {
        if matches!(&self.round_timer, Some((armed, _)) if *armed == round) {
            if let Some((_, token)) = self.round_timer.take() {
                token.cancel();
            }
        }
    }
}

pub(crate) type SharedChat = Arc<Mutex<ChatState>>;

pub(crate) struct Shared {
    pub(crate) identity: Identity,
    pub(crate) local_id: PeerId,
    pub(crate) directory: Directory,
    pub(crate) config: Config,
    chats: RwLock<HashMap<ChatId, SharedChat>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Shared {
    /// The table lock is released before the caller takes the chat lock.
    pub(crate) async fn chat(&self, chat_id: &ChatId) -> Option<SharedChat> {
        self.chats.read().await.get(chat_id).cloned()
    }

    pub(crate) fn deliver(&self, message: Inbound) {
        if self.inbound.send(message).is_err() {
            debug!("inbound receiver dropped");
        }
    }

    /// Sender id for an authenticated key: its directory name, else its hex.
    pub(crate) fn peer_for_key(&self, key: &PublicKey) -> PeerId {
        self.directory
            .id_for_key(key)
            .unwrap_or_else(|| PeerId::from_key(key))
    }

    /// Perform the actions a chat instance returned. Called with the chat lock held.
    fn apply(self: &Arc<Self>, chat: &SharedChat, state: &mut ChatState, actions: Vec<ChatAction>) {
        for action in actions {
            match action {
                ChatAction::Send(peer, packet) => {
                    let shared = self.clone();
                    tokio::spawn(async move {
                        let sent = transport::send_packet(&shared.directory, &peer, &packet).await;
                        if let Err(e) = sent {
                            debug!(%peer, error = %e, "chat packet not delivered");
                        }
                    });
                }
                ChatAction::ScheduleProposal { event, delay } => {
                    let shared = self.clone();
                    let chat = chat.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.start_round(&chat, event).await;
                    });
                }
                ChatAction::ArmDeadline { round, after } => {
                    let token = CancellationToken::new();
                    if let Some((_, previous)) = state.round_timer.replace((round, token.clone())) {
                        previous.cancel();
                    }
                    let chat = chat.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(after) => {
                                let mut state = chat.lock().await;
                                state.instance.on_deadline(round);
                                state.disarm(round);
                            }
                        }
                    });
                }
                ChatAction::Disarm(round) => state.disarm(round),
                ChatAction::Committed(event) => self.deliver(Inbound::ChatCommitted {
                    chat_id: state.instance.chat_id().clone(),
                    event,
                }),
            }
        }
    }

    async fn start_round(self: &Arc<Self>, chat: &SharedChat, event: ChatEvent) {
        let mut state = chat.lock().await;
        let actions = state.instance.on_push_due(event);
        state.rounds_started.send_modify(|n| *n += 1);
        self.apply(chat, &mut state, actions);
    }

    /// A proposal for `chat_id` arrived from the network or from a local post.
    pub(crate) async fn on_push(self: &Arc<Self>, chat_id: &ChatId, event: ChatEvent) {
        let Some(chat) = self.chat(chat_id).await else {
            debug!(chat = %chat_id, "push for unknown chat dropped");
            return;
        };
        let mut state = chat.lock().await;
        let actions = state.instance.on_push_received(event, now_millis());
        self.apply(&chat, &mut state, actions);
    }

    /// A participant's vote. A vote for the next log length that overtakes our own scheduled
    /// proposal waits for its round to open, bounded by the round deadline. Any other vote is
    /// applied at once, so leftovers from a decided round fall on a free round and are ignored.
    pub(crate) async fn on_vote(
        self: &Arc<Self>,
        chat_id: &ChatId,
        voter: PeerId,
        fingerprint: Fingerprint,
    ) {
        let Some(chat) = self.chat(chat_id).await else {
            debug!(chat = %chat_id, "vote for unknown chat dropped");
            return;
        };
        let mut state = chat.lock().await;
        if state.instance.holds_early_vote(&fingerprint) {
            let mut started = state.rounds_started.subscribe();
            drop(state);
            let wait = tokio::time::timeout(self.config.round_deadline(), started.changed());
            if wait.await.is_err() {
                debug!(chat = %chat_id, %voter, "no local round opened for early vote");
            }
            state = chat.lock().await;
        }
        let actions = state.instance.on_vote(&voter, fingerprint);
        self.apply(&chat, &mut state, actions);
    }
}

/// A running node: listener task plus the shared state it serves.
pub struct Node {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
}

impl Node {
    /// Bind the listener and start accepting. Inbound messages and commits arrive on the receiver.
    pub async fn bind(
        config: Config,
        identity: Identity,
    ) -> Result<(Node, mpsc::UnboundedReceiver<Inbound>), NodeError> {
        let local_id = match &config.node_name {
            Some(name) => PeerId::new(name.as_str())?,
            None => PeerId::from_key(identity.public_key()),
        };
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (inbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity,
            local_id,
            directory: Directory::new(),
            config,
            chats: RwLock::new(HashMap::new()),
            inbound,
        });
        info!(
            id = %shared.local_id,
            key = %shared.identity.public_key(),
            addr = %local_addr,
            "node listening"
        );
        let listener = tokio::spawn(dispatcher::run(listener, shared.clone()));
        Ok((
            Node {
                shared,
                local_addr,
                listener,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    pub fn public_key(&self) -> &PublicKey {
        self.shared.identity.public_key()
    }

    pub fn directory(&self) -> &Directory {
        &self.shared.directory
    }

    /// Register a contact under `display_name` in every directory map.
    pub fn add_contact(
        &self,
        display_name: &str,
        public_key_hex: &str,
        address: &str,
    ) -> Result<PeerId, NodeError> {
        let id = PeerId::new(display_name)?;
        let key = PublicKey::from_hex(public_key_hex)?;
        self.shared.directory.add_contact(id.clone(), key, address);
        Ok(id)
    }

    pub async fn send_message(&self, recipient: &PeerId, text: &str) -> Result<(), NodeError> {
        let shared = &self.shared;
        let result =
            transport::send_dialog_text(&shared.identity, &shared.directory, recipient, text).await;
        if let Err(e) = &result {
            if e.is_security() {
                warn!(peer = %recipient, error = %e, "direct message aborted");
            }
        }
        result
    }

    /// Create or replace a chat. A chat whose round is open cannot be replaced.
    pub async fn create_chat(
        &self,
        chat_id: ChatId,
        participants: impl IntoIterator<Item = (PeerId, u32)>,
    ) -> Result<(), NodeError> {
        let local_id = self.shared.local_id.clone();
        let instance = ChatInstance::new(chat_id.clone(), local_id, participants)
            .with_round_deadline(self.shared.config.round_deadline());
        let existing = self.shared.chat(&chat_id).await;
        let _guard = match &existing {
            Some(chat) => {
                let state = chat.lock().await;
                if !state.instance.round().is_free() {
                    return Err(NodeError::ChatBusy(chat_id));
                }
                Some(state)
            }
            None => None,
        };
        self.shared
            .chats
            .write()
            .await
            .insert(chat_id.clone(), Arc::new(Mutex::new(ChatState::new(instance))));
        info!(chat = %chat_id, "chat created");
        Ok(())
    }

    /// Propose a text event: stamp it `proposal_lead` ahead, push it to the other participants
    /// and schedule it locally so every replica opens the round at the same instant.
    pub async fn post_text(&self, chat_id: &ChatId, text: &str) -> Result<ChatEvent, NodeError> {
        let chat = self
            .shared
            .chat(chat_id)
            .await
            .ok_or_else(|| NodeError::UnknownChat(chat_id.clone()))?;
        let start_at = now_millis() + self.shared.config.proposal_lead_ms;
        let (event, peers, push) = {
            let state = chat.lock().await;
            let event = state.instance.text_event(text, start_at);
            if !state.instance.validate(&event) {
                return Err(NodeError::NotParticipant(
                    self.shared.local_id.clone(),
                    chat_id.clone(),
                ));
            }
            let push = state.instance.push_packet(event.clone());
            (event, state.instance.peers(), push)
        };
        for peer in peers {
            let shared = self.shared.clone();
            let push = push.clone();
            tokio::spawn(async move {
                if let Err(e) = transport::send_packet(&shared.directory, &peer, &push).await {
                    debug!(%peer, error = %e, "push not delivered");
                }
            });
        }
        self.shared.on_push(chat_id, event.clone()).await;
        Ok(event)
    }

    /// Replace the local log of `chat_id` with `peer`'s. Returns the number of events replayed.
    pub async fn request_sync(&self, chat_id: &ChatId, peer: &PeerId) -> Result<usize, NodeError> {
        sync::request_history(&self.shared, chat_id, peer).await
    }

    /// Snapshot of a chat's log.
    pub async fn chat_log(&self, chat_id: &ChatId) -> Option<Vec<ChatEvent>> {
        let chat = self.shared.chat(chat_id).await?;
        let state = chat.lock().await;
        Some(state.instance.log().iter().cloned().collect())
    }

    /// Stop accepting connections. Tasks already running finish on their own.
    pub fn shutdown(&self) {
        self.listener.abort();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Chat packets routed from the dispatcher.
pub(crate) async fn on_chat_packet(shared: &Arc<Shared>, packet: Packet) {
    match packet {
        Packet::PaxosNotif {
            chat_id,
            sender_id,
            fingerprint,
        } => shared.on_vote(&chat_id, sender_id, fingerprint).await,
        Packet::PaxosPush { chat_id, event } => shared.on_push(&chat_id, event).await,
        Packet::DialogText { .. } | Packet::RequestChatHash { .. } => {
            debug!(kind = ?packet.kind(), "packet not routable here");
        }
    }
}
