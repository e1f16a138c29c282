//! Per-connection handling: the handshake state machine, the framed read
//! loop, and the write/heartbeat task.
//!
//! A connection is NEW until its handshake completes, AUTHENTICATED until
//! something fatal happens, then CLOSED. The read task processes frames
//! strictly in order; the write task serializes everything leaving the
//! socket through one bounded queue.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeroize::Zeroizing;

use netmesh_crypto::{
    decrypt_message, new_session_key, parse_public_key_b64, verify_signature, wrap_session_key,
    RsaPublicKey, ServerIdentity, SessionKey,
};
use netmesh_proto::{
    now_ms, EncryptedMessageData, Envelope, ErrorCode, ErrorData, HandshakeData,
    HandshakeResponseData, Message, MessageType, NetworkMessageType, User, MAX_FRAME_BYTES,
    SERVER_SENDER_ID, SERVER_USERNAME, SYSTEM_SENDER_ID, SYSTEM_SENDER_NAME,
};
use netmesh_store::{MessageStore, UserStore};

use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Peer};
use crate::error::ConnectionError;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Everything a connection handler needs from the rest of the server.
pub struct ConnectionContext {
    pub config: ServerConfig,
    pub identity: Arc<ServerIdentity>,
    pub dispatcher: Arc<Dispatcher>,
    pub users: Arc<UserStore>,
    pub messages: Arc<MessageStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

/// Why a read loop ended. Decides whether queued frames are flushed or
/// discarded, and what the close log says.
#[derive(Debug)]
enum CloseReason {
    Eof,
    ClientDisconnect,
    ReadTimeout,
    Protocol(ErrorCode),
    Kicked(ErrorCode),
    Shutdown,
    Io,
}

enum FrameOutcome {
    Continue,
    Close(CloseReason),
}

/// Crypto and identity state of an AUTHENTICATED connection. Dropped (and
/// the session key zeroized) as part of the terminal sequence.
struct AuthState {
    user_id: String,
    username: String,
    session_key: Zeroizing<SessionKey>,
    peer_key: RsaPublicKey,
    peer: Arc<Peer>,
}

struct Session {
    ctx: Arc<ConnectionContext>,
    connection_id: u64,
    addr: SocketAddr,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    auth: Option<AuthState>,
    frames_in: u64,
    bytes_in: u64,
}

/// Drive one client connection from accept to close. The connection slot in
/// the metrics was claimed by the acceptor; it is released here.
pub async fn handle_connection(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    connection_id: u64,
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_FRAME_BYTES - 1),
    );

    let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(ctx.config.buffer_size);
    let cancel = shutdown.child_token();

    let mut writer: JoinHandle<()> = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        cancel.clone(),
        ctx.config.heartbeat_interval,
        ctx.metrics.clone(),
    ));

    let mut session = Session {
        ctx: ctx.clone(),
        connection_id,
        addr,
        outbound: outbound_tx,
        cancel: cancel.clone(),
        auth: None,
        frames_in: 0,
        bytes_in: 0,
    };

    let reason = session.read_loop(&mut reader).await;

    // Kicks and shutdown discard queued frames; everything else gets a
    // bounded chance to flush.
    if matches!(reason, CloseReason::Kicked(_) | CloseReason::Shutdown) {
        cancel.cancel();
    }

    session.finish(&reason).await;
    drop(session);
    drop(reader);

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        cancel.cancel();
        let _ = writer.await;
    }

    ctx.metrics.release_connection();
}

impl Session {
    async fn read_loop(&mut self, reader: &mut FramedRead<OwnedReadHalf, LinesCodec>) -> CloseReason {
        let read_idle = self.ctx.config.reader_idle();

        loop {
            // After authentication the dispatcher can kick this connection;
            // the kick token is a child of the connection token, so server
            // shutdown fires it as well.
            let wait_cancel = match &self.auth {
                Some(auth) => auth.peer.kick_token(),
                None => self.cancel.clone(),
            };

            tokio::select! {
                _ = wait_cancel.cancelled() => {
                    let kicked = self.auth.as_ref().and_then(|a| a.peer.kick_reason());
                    return match kicked {
                        Some(reason) => CloseReason::Kicked(reason),
                        None => CloseReason::Shutdown,
                    };
                }
                frame = tokio::time::timeout(read_idle, reader.next()) => match frame {
                    Err(_) => {
                        self.send_error(ErrorCode::ReadTimeout, "no frames within the idle window")
                            .await;
                        return CloseReason::ReadTimeout;
                    }
                    Ok(None) => return CloseReason::Eof,
                    Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                        self.send_error(
                            ErrorCode::InvalidMessage,
                            "frame exceeds the maximum length",
                        )
                        .await;
                        return CloseReason::Protocol(ErrorCode::InvalidMessage);
                    }
                    Ok(Some(Err(LinesCodecError::Io(e)))) => {
                        tracing::debug!(conn = self.connection_id, err = %e, "read error");
                        return CloseReason::Io;
                    }
                    Ok(Some(Ok(line))) => {
                        self.frames_in += 1;
                        self.bytes_in += line.len() as u64 + 1;
                        self.ctx
                            .metrics
                            .bytes_read
                            .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                        if let Some(auth) = &self.auth {
                            auth.peer.touch();
                        }
                        match self.handle_frame(&line).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Close(reason) => return reason,
                        }
                    }
                },
            }
        }
    }

    async fn handle_frame(&mut self, line: &str) -> FrameOutcome {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(conn = self.connection_id, err = %e, "malformed frame");
                self.send_error(ErrorCode::InvalidMessage, "malformed envelope").await;
                // Fatal during handshake, survivable once authenticated.
                return if self.auth.is_some() {
                    FrameOutcome::Continue
                } else {
                    FrameOutcome::Close(CloseReason::Protocol(ErrorCode::InvalidMessage))
                };
            }
        };

        match (self.auth.is_some(), envelope.msg_type) {
            (false, NetworkMessageType::Handshake) => match self.handle_handshake(&envelope).await {
                Ok(()) => FrameOutcome::Continue,
                Err(e) => {
                    let (code, message) = e.to_wire();
                    tracing::warn!(conn = self.connection_id, err = %e, "handshake rejected");
                    self.send_error(code, &message).await;
                    FrameOutcome::Close(CloseReason::Protocol(code))
                }
            },
            (false, _) => {
                let (code, message) = ConnectionError::NotAuthenticated.to_wire();
                self.send_error(code, &message).await;
                FrameOutcome::Close(CloseReason::Protocol(code))
            }
            (true, NetworkMessageType::Handshake) => {
                let (code, message) = ConnectionError::AlreadyAuthenticated.to_wire();
                self.send_error(code, &message).await;
                FrameOutcome::Continue
            }
            (true, NetworkMessageType::EncryptedMessage) => {
                match self.handle_encrypted_message(&envelope).await {
                    Ok(()) => FrameOutcome::Continue,
                    Err(e) => {
                        self.ctx.metrics.messages_rejected.fetch_add(1, Ordering::Relaxed);
                        let (code, message) = e.to_wire();
                        tracing::debug!(conn = self.connection_id, err = %e, "message rejected");
                        self.send_error(code, &message).await;
                        FrameOutcome::Continue
                    }
                }
            }
            (true, NetworkMessageType::Heartbeat) => {
                self.send(Envelope::new(
                    NetworkMessageType::Heartbeat,
                    SERVER_SENDER_ID,
                    String::new(),
                ))
                .await;
                FrameOutcome::Continue
            }
            (true, NetworkMessageType::Disconnect) => {
                FrameOutcome::Close(CloseReason::ClientDisconnect)
            }
            (true, _) => {
                self.send_error(ErrorCode::Unsupported, "unsupported frame type").await;
                FrameOutcome::Continue
            }
        }
    }

    async fn handle_handshake(&mut self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if !self
            .ctx
            .rate_limiter
            .try_consume(&RateLimiter::ip_key(self.addr.ip()))
        {
            return Err(ConnectionError::RateLimited);
        }

        let handshake: HandshakeData = envelope
            .payload()
            .map_err(|e| ConnectionError::HandshakeFailed(format!("invalid payload: {e}")))?;

        let peer_key = parse_public_key_b64(&handshake.public_key)?;
        let session_key = Zeroizing::new(new_session_key());
        let encrypted_session_key = wrap_session_key(&peer_key, &session_key)?;

        let user = User {
            id: handshake.user_id.clone(),
            username: handshake.username.clone(),
            public_key: handshake.public_key.clone(),
            is_host: false,
            is_online: true,
            last_seen: now_ms(),
            connection_id: Some(self.connection_id),
            ip_address: Some(self.addr.ip().to_string()),
        };
        self.ctx
            .users
            .upsert(&user)
            .map_err(|e| ConnectionError::HandshakeFailed(format!("user store: {e}")))?;

        let response = HandshakeResponseData {
            user_id: SERVER_SENDER_ID.to_string(),
            username: SERVER_USERNAME.to_string(),
            public_key: self.ctx.identity.public_key_b64.clone(),
            encrypted_session_key,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            max_message_size: MAX_FRAME_BYTES,
        };
        self.send_payload(NetworkMessageType::HandshakeResponse, &response).await;

        let peer = Arc::new(Peer::new(
            self.connection_id,
            handshake.user_id.clone(),
            handshake.username.clone(),
            handshake.public_key.clone(),
            self.addr,
            *session_key,
            self.outbound.clone(),
            self.cancel.child_token(),
        ));
        self.ctx.dispatcher.register(peer.clone());
        self.ctx
            .metrics
            .handshakes_completed
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            conn = self.connection_id,
            user = %handshake.user_id,
            addr = %self.addr,
            client_version = handshake.client_version.as_deref().unwrap_or("-"),
            "handshake complete"
        );

        self.system_notice(
            format!("{} joined the chat", handshake.username),
            Some(self.connection_id),
        )
        .await;

        let roster = self.ctx.dispatcher.snapshot();
        self.send_payload(NetworkMessageType::UserList, &roster).await;

        self.auth = Some(AuthState {
            user_id: handshake.user_id,
            username: handshake.username,
            session_key,
            peer_key,
            peer,
        });
        Ok(())
    }

    async fn handle_encrypted_message(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let Some(auth) = &self.auth else {
            return Err(ConnectionError::NotAuthenticated);
        };
        let started = std::time::Instant::now();

        if !self
            .ctx
            .rate_limiter
            .try_consume(&RateLimiter::user_key(&auth.user_id))
        {
            return Err(ConnectionError::RateLimited);
        }

        let payload: EncryptedMessageData = envelope.payload()?;

        let plaintext_bytes =
            decrypt_message(&auth.session_key, &payload.encrypted_content, &payload.iv)?;
        let plaintext =
            String::from_utf8(plaintext_bytes).map_err(|_| ConnectionError::InvalidUtf8)?;

        // Always the key registered at handshake; the key carried on the
        // wire is ignored so a sender cannot substitute a weaker one.
        if !verify_signature(&auth.peer_key, plaintext.as_bytes(), &payload.signature) {
            return Err(ConnectionError::InvalidSignature);
        }

        let message = Message {
            id: payload.message_id.clone(),
            content: plaintext,
            sender_id: auth.user_id.clone(),
            sender_name: auth.username.clone(),
            timestamp: payload.timestamp.min(now_ms()),
            message_type: payload.message_type,
            room_id: None,
            is_encrypted: true,
        };

        // Audit and delivery stay aligned: not persisted means not broadcast.
        self.ctx.messages.append(&message)?;
        self.ctx.dispatcher.broadcast(&message, Some(self.connection_id));

        self.ctx
            .metrics
            .messages_processed
            .fetch_add(1, Ordering::Relaxed);
        self.ctx.metrics.record_latency(started.elapsed());
        Ok(())
    }

    /// Persist and fan out a join/leave notice. System notices ride the
    /// same path as chat traffic and are signed by the server key.
    async fn system_notice(&self, content: String, exclude: Option<u64>) {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            content,
            sender_id: SYSTEM_SENDER_ID.to_string(),
            sender_name: SYSTEM_SENDER_NAME.to_string(),
            timestamp: now_ms(),
            message_type: MessageType::System,
            room_id: None,
            is_encrypted: true,
        };
        if let Err(e) = self.ctx.messages.append(&message) {
            tracing::error!(err = %e, "failed to persist system notice, not broadcasting");
            return;
        }
        self.ctx.dispatcher.broadcast(&message, exclude);
    }

    async fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            tracing::debug!(conn = self.connection_id, "outbound queue closed");
        }
    }

    async fn send_payload<T: serde::Serialize>(&self, msg_type: NetworkMessageType, payload: &T) {
        match Envelope::with_payload(msg_type, SERVER_SENDER_ID, payload) {
            Ok(envelope) => self.send(envelope).await,
            Err(e) => tracing::error!(err = %e, "failed to serialize outbound payload"),
        }
    }

    async fn send_error(&self, code: ErrorCode, message: &str) {
        let payload = ErrorData {
            code,
            message: message.to_string(),
            details: None,
        };
        self.send_payload(NetworkMessageType::Error, &payload).await;
    }

    /// Terminal sequence: unregister, mark offline, drop key material, and
    /// tell the remaining peers.
    async fn finish(&mut self, reason: &CloseReason) {
        let Some(auth) = self.auth.take() else {
            tracing::debug!(
                conn = self.connection_id,
                addr = %self.addr,
                ?reason,
                "connection closed before handshake"
            );
            return;
        };

        self.ctx.dispatcher.unregister(self.connection_id);
        if let Err(e) = self
            .ctx
            .users
            .set_offline(&auth.user_id, self.connection_id, now_ms())
        {
            tracing::warn!(user = %auth.user_id, err = %e, "failed to mark user offline");
        }
        tracing::info!(
            conn = self.connection_id,
            user = %auth.user_id,
            frames_in = self.frames_in,
            bytes_in = self.bytes_in,
            ?reason,
            "connection closed"
        );

        let username = auth.username.clone();
        // AuthState drop zeroizes the session key.
        drop(auth);

        self.system_notice(format!("{username} left the chat"), None).await;
    }
}

/// Drain the outbound queue onto the socket, one frame at a time, and emit
/// a HEARTBEAT whenever the link has been write-idle for a full interval.
async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
    metrics: Arc<Metrics>,
) {
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());
    let mut last_write = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = outbound.recv() => match maybe {
                // All senders gone: the queue is fully drained.
                None => break,
                Some(envelope) => {
                    if write_envelope(&mut writer, &envelope, &metrics).await.is_err() {
                        break;
                    }
                    last_write = tokio::time::Instant::now();
                }
            },
            _ = tokio::time::sleep_until(last_write + heartbeat_interval) => {
                let hb = Envelope::new(
                    NetworkMessageType::Heartbeat,
                    SERVER_SENDER_ID,
                    String::new(),
                );
                if write_envelope(&mut writer, &hb, &metrics).await.is_err() {
                    break;
                }
                last_write = tokio::time::Instant::now();
            }
        }
    }
}

async fn write_envelope(
    writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    envelope: &Envelope,
    metrics: &Metrics,
) -> Result<(), LinesCodecError> {
    let line = serde_json::to_string(envelope)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let frame_len = line.len() as u64 + 1;
    writer.send(line).await?;
    metrics.bytes_written.fetch_add(frame_len, Ordering::Relaxed);
    Ok(())
}
