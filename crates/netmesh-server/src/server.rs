//! Bind, accept loop, background sweeps, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use netmesh_crypto::ServerIdentity;
use netmesh_proto::{now_ms, Envelope, ErrorCode, ErrorData, NetworkMessageType, SERVER_SENDER_ID};
use netmesh_store::{Database, MessageStore, UserStore};

use crate::config::ServerConfig;
use crate::connection::{handle_connection, ConnectionContext};
use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;

/// Connection ids are monotonic, starting here.
const FIRST_CONNECTION_ID: u64 = 1000;

/// Cadence of the idle and rate-limit sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the metrics snapshot log.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for handlers to drain at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

pub struct MeshServer {
    config: ServerConfig,
    ctx: Arc<ConnectionContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_connection_id: AtomicU64,
}

impl MeshServer {
    /// Bind with the key pair from the data directory, generating one on
    /// first start.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let identity = ServerIdentity::load_or_generate(&config.server_key_path())
            .context("load or generate server key")?;
        Self::bind_with_identity(config, identity).await
    }

    /// Bind with an explicit identity. Used by tests and embedders.
    pub async fn bind_with_identity(
        config: ServerConfig,
        identity: ServerIdentity,
    ) -> anyhow::Result<Self> {
        let db = Database::open_at(&config.db_path()).context("open database")?;
        let users = Arc::new(UserStore::new(db.clone()));
        let messages = Arc::new(MessageStore::new(db));

        let recovered = users
            .mark_all_offline()
            .context("reset online flags at startup")?;
        if recovered > 0 {
            tracing::info!(recovered, "cleared stale online flags from previous run");
        }

        let metrics = Arc::new(Metrics::default());
        let identity = Arc::new(identity);
        let dispatcher = Arc::new(Dispatcher::new(identity.clone(), metrics.clone()));
        let rate_limiter = Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute));

        let listener = TcpListener::bind(config.listen_addr())
            .await
            .with_context(|| format!("bind {}", config.listen_addr()))?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(ConnectionContext {
            config: config.clone(),
            identity,
            dispatcher,
            users,
            messages,
            rate_limiter,
            metrics,
        });

        Ok(Self {
            config,
            ctx,
            listener,
            local_addr,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_connection_id: AtomicU64::new(FIRST_CONNECTION_ID),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancelling this token stops the accept loop and every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr,
            max_connections = self.config.max_connections,
            "netmesh server listening"
        );
        self.spawn_background_tasks();

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => {
                        tracing::error!(err = %e, "accept error");
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::info!("shutting down, draining connections");
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_DRAIN, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("drain timed out with handlers still running");
        }
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if !self
            .ctx
            .metrics
            .try_claim_connection(self.config.max_connections)
        {
            self.ctx
                .metrics
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%addr, "rejecting connection: at capacity");
            tokio::spawn(reject_at_capacity(stream));
            return;
        }

        self.ctx
            .metrics
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = connection_id, %addr, "node connected");

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        self.tracker
            .spawn(handle_connection(ctx, stream, connection_id, addr, shutdown));
    }

    fn spawn_background_tasks(&self) {
        let shutdown = self.shutdown.clone();
        let rate_limiter = self.ctx.rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => rate_limiter.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        // Idle sweep: a backstop behind each connection's own read timer.
        let shutdown = self.shutdown.clone();
        let dispatcher = self.ctx.dispatcher.clone();
        let stale_after_ms = self.config.reader_idle().as_millis() as u64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = now_ms();
                        for peer in dispatcher.peers_snapshot() {
                            if now.saturating_sub(peer.last_activity_ms()) > stale_after_ms {
                                tracing::warn!(
                                    conn = peer.connection_id,
                                    user = %peer.user_id,
                                    "closing idle connection"
                                );
                                peer.kick(ErrorCode::ReadTimeout);
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        let shutdown = self.shutdown.clone();
        let metrics = self.ctx.metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot = metrics.snapshot();
                        tracing::info!(
                            active = snapshot.connections_active,
                            accepted = snapshot.connections_accepted,
                            rejected = snapshot.connections_rejected,
                            handshakes = snapshot.handshakes_completed,
                            messages = snapshot.messages_processed,
                            dropped = snapshot.messages_rejected,
                            fanned_out = snapshot.frames_fanned_out,
                            bytes_in = snapshot.bytes_read,
                            bytes_out = snapshot.bytes_written,
                            avg_latency_us = snapshot.avg_message_latency_us,
                            "server stats"
                        );
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

/// Tell an over-capacity client why it is being turned away, then close.
/// No handshake is accepted on this socket.
async fn reject_at_capacity(stream: TcpStream) {
    let mut writer = FramedWrite::new(stream, LinesCodec::new());
    let payload = ErrorData {
        code: ErrorCode::MaxConnections,
        message: "server is at maximum connections".to_string(),
        details: None,
    };
    if let Ok(envelope) =
        Envelope::with_payload(NetworkMessageType::Error, SERVER_SENDER_ID, &payload)
    {
        if let Ok(line) = serde_json::to_string(&envelope) {
            let _ = writer.send(line).await;
        }
    }
}
