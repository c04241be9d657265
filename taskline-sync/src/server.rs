//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!              ├── Channel (account_id) ◄── MutationService ── Store (SQLite)
//! Session B ──┘         ▲                        │
//!                       └── publish ─────────────┘
//!                       │
//!            ┌──────────┼───────────┐
//!            ▼          ▼           ▼
//!        Session A  Session B   Session C      (originator included)
//! ```
//!
//! One spawned task per connection. The first frame must be a `Hello`;
//! a connection whose token fails verification is rejected before it ever
//! joins a channel. After the handshake the task serves request frames and
//! forwards fanout bytes until either side closes.

use std::error::Error;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::{ChannelBinder, ChannelRegistry};
use crate::identity::IdentityProvider;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::service::MutationService;
use crate::storage::Store;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast buffer per channel receiver
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Server counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_requests: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    binder: Arc<ChannelBinder>,
    service: Arc<MutationService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<Store>,
    ) -> Self {
        let registry = Arc::new(ChannelRegistry::new(config.channel_capacity));
        let binder = Arc::new(ChannelBinder::new(identity, registry.clone()));
        let service = Arc::new(MutationService::new(store, registry));
        Self {
            config,
            binder,
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let binder = self.binder.clone();
            let service = self.service.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, binder, service, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one WebSocket connection end to end.
    async fn handle_connection(
        stream: TcpStream,
        binder: Arc<ChannelBinder>,
        service: Arc<MutationService>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let session_id = Uuid::new_v4();

        // Handshake: the first frame must be a Hello with a valid token.
        // Rejection happens before any channel membership exists.
        let handle = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ClientFrame::decode(&bytes) {
                        Ok(ClientFrame::Hello { token }) => {
                            match binder.bind(session_id, &token).await {
                                Ok(handle) => {
                                    let welcome = ServerFrame::Welcome {
                                        account_id: handle.account_id,
                                        session_id,
                                    };
                                    let sent = match welcome.encode() {
                                        Ok(encoded) => ws_sender
                                            .send(Message::Binary(encoded.into()))
                                            .await
                                            .is_ok(),
                                        Err(e) => {
                                            log::error!("failed to encode welcome: {e}");
                                            false
                                        }
                                    };
                                    if !sent {
                                        // Welcome never reached the client;
                                        // undo the binding before giving up
                                        binder
                                            .registry()
                                            .unbind(handle.account_id, session_id)
                                            .await;
                                        let mut s = stats.write().await;
                                        s.active_connections -= 1;
                                        return Ok(());
                                    }
                                    break handle;
                                }
                                Err(e) => {
                                    log::warn!("session {session_id} rejected: {e}");
                                    let rejected = ServerFrame::Rejected {
                                        reason: e.to_string(),
                                    };
                                    if let Ok(encoded) = rejected.encode() {
                                        let _ = ws_sender.send(Message::Binary(encoded.into())).await;
                                    }
                                    let mut s = stats.write().await;
                                    s.active_connections -= 1;
                                    s.rejected_connections += 1;
                                    return Ok(());
                                }
                            }
                        }
                        Ok(_) => {
                            log::warn!("session {session_id} sent a frame before hello");
                            let rejected = ServerFrame::Rejected {
                                reason: "expected hello".to_string(),
                            };
                            if let Ok(encoded) = rejected.encode() {
                                let _ = ws_sender.send(Message::Binary(encoded.into())).await;
                            }
                            let mut s = stats.write().await;
                            s.active_connections -= 1;
                            s.rejected_connections += 1;
                            return Ok(());
                        }
                        Err(e) => {
                            log::warn!("undecodable handshake frame: {e}");
                            let mut s = stats.write().await;
                            s.active_connections -= 1;
                            s.rejected_connections += 1;
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if ws_sender.send(Message::Pong(data)).await.is_err() {
                        let mut s = stats.write().await;
                        s.active_connections -= 1;
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let mut s = stats.write().await;
                    s.active_connections -= 1;
                    return Ok(());
                }
                Some(Err(e)) => {
                    let mut s = stats.write().await;
                    s.active_connections -= 1;
                    return Err(e.into());
                }
                _ => {}
            }
        };

        let account_id = handle.account_id;
        let mut fanout_rx = handle.receiver;
        log::info!("session {session_id} connected for account {account_id}");

        // Serve until either side closes. Errors break out of the loop so
        // the unbind below always runs.
        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match ClientFrame::decode(&bytes) {
                                Ok(ClientFrame::Request { id, request }) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.total_requests += 1;
                                    }
                                    let result = service.dispatch(account_id, request).await;
                                    let response = ServerFrame::Response { id, result };
                                    let encoded = match response.encode() {
                                        Ok(encoded) => encoded,
                                        Err(e) => {
                                            log::error!("failed to encode response: {e}");
                                            continue;
                                        }
                                    };
                                    if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(ClientFrame::Hello { .. }) => {
                                    log::warn!("session {session_id} sent a duplicate hello");
                                }
                                Err(e) => {
                                    log::warn!("undecodable frame from session {session_id}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("session {session_id} closed");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error on session {session_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing fanout bytes (already-encoded event frame)
                fanned = fanout_rx.recv() => {
                    match fanned {
                        Ok(bytes) => {
                            if ws_sender.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("session {session_id} lagged by {n} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        // Binding removal is idempotent; the channel is discarded when the
        // last session of the account goes.
        binder.registry().unbind(account_id, session_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("session {session_id} unbound from account {account_id}");

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<MutationService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        self.binder.registry()
    }
}
