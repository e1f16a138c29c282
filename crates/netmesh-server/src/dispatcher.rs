use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use netmesh_crypto::{encrypt_message, ServerIdentity, SessionKey};
use netmesh_proto::{
    now_ms, EncryptedMessageData, Envelope, ErrorCode, Message, NetworkMessageType, User,
    UserListData,
};

use crate::metrics::Metrics;

/// An authenticated connection as the dispatcher sees it. The session key
/// copy held here is used only to re-encrypt fan-out traffic *for* this
/// peer; no other connection's crypto state is ever touched.
pub struct Peer {
    pub connection_id: u64,
    pub user_id: String,
    pub username: String,
    pub public_key_b64: String,
    pub addr: SocketAddr,
    pub connected_at: u64,
    last_activity: AtomicU64,
    session_key: SessionKey,
    outbound: mpsc::Sender<Envelope>,
    kick: CancellationToken,
    kick_reason: OnceLock<ErrorCode>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: u64,
        user_id: String,
        username: String,
        public_key_b64: String,
        addr: SocketAddr,
        session_key: SessionKey,
        outbound: mpsc::Sender<Envelope>,
        kick: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            username,
            public_key_b64,
            addr,
            connected_at: now_ms(),
            last_activity: AtomicU64::new(now_ms()),
            session_key,
            outbound,
            kick,
            kick_reason: OnceLock::new(),
        }
    }

    /// Refresh the activity clock. Called on every successful read.
    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Terminate this connection with a reason. First caller wins.
    pub fn kick(&self, reason: ErrorCode) {
        let _ = self.kick_reason.set(reason);
        self.kick.cancel();
    }

    pub fn kick_token(&self) -> CancellationToken {
        self.kick.clone()
    }

    pub fn kick_reason(&self) -> Option<ErrorCode> {
        self.kick_reason.get().copied()
    }

    fn session_key(&self) -> &SessionKey {
        &self.session_key
    }
}

/// Registry of authenticated connections and the fan-out engine.
pub struct Dispatcher {
    peers: DashMap<u64, Arc<Peer>>,
    identity: Arc<ServerIdentity>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(identity: Arc<ServerIdentity>, metrics: Arc<Metrics>) -> Self {
        Self {
            peers: DashMap::new(),
            identity,
            metrics,
        }
    }

    pub fn register(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.connection_id, peer);
    }

    pub fn unregister(&self, connection_id: u64) -> Option<Arc<Peer>> {
        self.peers.remove(&connection_id).map(|(_, peer)| peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Stable copy of the member set. Fan-out and sweeps iterate this so a
    /// concurrent join or leave never splits one broadcast.
    pub fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Roster snapshot for USER_LIST. Two connections may present the same
    /// user id across a reconnect; the newest connection wins.
    pub fn snapshot(&self) -> UserListData {
        let mut by_user: HashMap<String, Arc<Peer>> = HashMap::new();
        for peer in self.peers_snapshot() {
            match by_user.get(&peer.user_id) {
                Some(existing) if existing.connection_id > peer.connection_id => {}
                _ => {
                    by_user.insert(peer.user_id.clone(), peer);
                }
            }
        }

        let mut users: Vec<User> = by_user
            .into_values()
            .map(|peer| User {
                id: peer.user_id.clone(),
                username: peer.username.clone(),
                public_key: peer.public_key_b64.clone(),
                is_host: false,
                is_online: true,
                last_seen: peer.last_activity_ms(),
                connection_id: Some(peer.connection_id),
                ip_address: Some(peer.addr.ip().to_string()),
            })
            .collect();
        users.sort_by_key(|user| user.connection_id);

        let total = users.len();
        UserListData {
            users,
            total_users: total,
            online_users: total,
        }
    }

    /// Fan a message out to every member except `exclude`. The plaintext is
    /// signed once with the server key, then re-encrypted per recipient
    /// under that recipient's session key. A full outbound queue kicks that
    /// recipient (`SLOW_CONSUMER`) and leaves everyone else untouched.
    pub fn broadcast(&self, message: &Message, exclude: Option<u64>) {
        let signature = self.identity.sign(message.content.as_bytes());

        for peer in self.peers_snapshot() {
            if Some(peer.connection_id) == exclude {
                continue;
            }

            let (encrypted_content, iv) =
                match encrypt_message(peer.session_key(), message.content.as_bytes()) {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(
                            conn = peer.connection_id,
                            err = %e,
                            "skipping recipient: re-encryption failed"
                        );
                        continue;
                    }
                };

            let payload = EncryptedMessageData {
                message_id: message.id.clone(),
                encrypted_content,
                iv,
                signature: signature.clone(),
                sender_public_key: self.identity.public_key_b64.clone(),
                sender_name: message.sender_name.clone(),
                timestamp: message.timestamp,
                message_type: message.message_type,
            };

            let mut envelope = match Envelope::with_payload(
                NetworkMessageType::EncryptedMessage,
                message.sender_id.clone(),
                &payload,
            ) {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(err = %e, "failed to serialize fan-out payload");
                    continue;
                }
            };
            envelope.message_id = Some(message.id.clone());

            match peer.outbound.try_send(envelope) {
                Ok(()) => {
                    self.metrics.frames_fanned_out.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        conn = peer.connection_id,
                        user = %peer.user_id,
                        "outbound queue full, dropping slow consumer"
                    );
                    peer.kick(ErrorCode::SlowConsumer);
                }
                Err(TrySendError::Closed(_)) => {
                    // Peer is already tearing down; unregister will follow.
                }
            }
        }
    }
}
