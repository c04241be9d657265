//! WebSocket session client.
//!
//! Owns one connection to the sync server and exposes the two flows the
//! reconciliation engine consumes:
//!
//! - typed request/response calls, correlated by per-session request id
//! - the event stream, delivered through an mpsc receiver
//!
//! The client does not touch any local collection itself; it is transport.
//! There is no automatic reconnect and no replay of missed events: a
//! dropped connection is surfaced as `Disconnected`, and the surrounding
//! application reconnects and refetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::model::{Category, Item, ItemDraft, ItemFilter, ItemPatch, OrderEntry, Tag};
use crate::protocol::{
    ClientFrame, ErrorReply, Event, ProtocolError, Request, Response, ServerFrame,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    Protocol(ProtocolError),
    /// The server refused the handshake.
    Rejected(String),
    /// The request failed with a typed server error.
    Service(ErrorReply),
    /// A response arrived with the wrong variant for the request.
    UnexpectedResponse,
    ConnectionClosed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Rejected(reason) => write!(f, "rejected by server: {reason}"),
            Self::Service(reply) => write!(f, "request failed: {reply}"),
            Self::UnexpectedResponse => write!(f, "unexpected response variant"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response, ErrorReply>>>>>;

/// A connected session.
pub struct SyncClient {
    server_url: String,
    account_id: Uuid,
    session_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    event_rx: Option<mpsc::Receiver<Event>>,
}

impl SyncClient {
    /// Connect and perform the hello/welcome handshake.
    ///
    /// Spawns background tasks for the socket writer and reader; the
    /// returned client is ready for requests and already subscribed to the
    /// account's event stream.
    pub async fn connect(
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let server_url = server_url.into();
        let token = token.into();

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&server_url).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("failed to connect to {server_url}: {e}");
                return Err(ClientError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Handshake before anything else is spawned
        let hello = ClientFrame::Hello { token }.encode()?;
        ws_writer
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        let (account_id, session_id) = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerFrame::decode(&bytes)? {
                        ServerFrame::Welcome {
                            account_id,
                            session_id,
                        } => break (account_id, session_id),
                        ServerFrame::Rejected { reason } => {
                            return Err(ClientError::Rejected(reason));
                        }
                        _ => return Err(ClientError::Protocol(ProtocolError::UnexpectedFrame)),
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(ClientError::ConnectionClosed),
            }
        };

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel::<Event>(256);

        // Writer task: forward the outgoing channel onto the socket
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: route responses to their waiters, events to the
        // engine. When the socket ends, waiters are dropped so every
        // in-flight request resolves to ConnectionClosed.
        let reader_state = state.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(ServerFrame::Response { id, result }) => {
                                let waiter = reader_pending.lock().await.remove(&id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(result);
                                    }
                                    None => log::warn!("response for unknown request {id}"),
                                }
                            }
                            Ok(ServerFrame::Event(event)) => {
                                log::trace!("event received: {}", event.name());
                                if event_tx.send(event).await.is_err() {
                                    // Engine gone; keep draining responses
                                    log::debug!("event receiver dropped");
                                }
                            }
                            Ok(other) => {
                                log::debug!("unexpected frame after handshake: {other:?}");
                            }
                            Err(e) => log::warn!("undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            reader_pending.lock().await.clear();
            log::info!("session disconnected");
        });

        Ok(Self {
            server_url,
            account_id,
            session_id,
            state,
            outgoing_tx,
            pending,
            next_request_id: AtomicU64::new(1),
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx.take()
    }

    /// Send one request and wait for its correlated response.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = ClientFrame::Request { id, request };
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(ClientError::Protocol(e));
            }
        };
        if self
            .outgoing_tx
            .send(Message::Binary(encoded.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reply)) => Err(ClientError::Service(reply)),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    // ── Typed request surface ────────────────────────────────────────────

    pub async fn list_items(&self, filter: ItemFilter) -> Result<Vec<Item>, ClientError> {
        match self.request(Request::ListItems(filter)).await? {
            Response::Items(items) => Ok(items),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn get_item(&self, id: Uuid) -> Result<Item, ClientError> {
        match self.request(Request::GetItem { id }).await? {
            Response::Item(item) => Ok(item),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn create_item(&self, draft: ItemDraft) -> Result<Item, ClientError> {
        match self.request(Request::CreateItem(draft)).await? {
            Response::Item(item) => Ok(item),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn update_item(&self, id: Uuid, patch: ItemPatch) -> Result<Item, ClientError> {
        match self.request(Request::UpdateItem { id, patch }).await? {
            Response::Item(item) => Ok(item),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn delete_item(&self, id: Uuid) -> Result<(), ClientError> {
        match self.request(Request::DeleteItem { id }).await? {
            Response::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn reorder_items(&self, entries: Vec<OrderEntry>) -> Result<(), ClientError> {
        match self.request(Request::ReorderItems { entries }).await? {
            Response::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, ClientError> {
        match self.request(Request::ListCategories).await? {
            Response::Categories(categories) => Ok(categories),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn create_category(
        &self,
        name: impl Into<String>,
        color: Option<String>,
    ) -> Result<Category, ClientError> {
        let request = Request::CreateCategory {
            name: name.into(),
            color,
        };
        match self.request(request).await? {
            Response::Category(category) => Ok(category),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn delete_category(&self, id: Uuid) -> Result<(), ClientError> {
        match self.request(Request::DeleteCategory { id }).await? {
            Response::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>, ClientError> {
        match self.request(Request::ListTags).await? {
            Response::Tags(tags) => Ok(tags),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn create_tag(&self, name: impl Into<String>) -> Result<Tag, ClientError> {
        match self.request(Request::CreateTag { name: name.into() }).await? {
            Response::Tag(tag) => Ok(tag),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn delete_tag(&self, id: Uuid) -> Result<(), ClientError> {
        match self.request(Request::DeleteTag { id }).await? {
            Response::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Close the connection. The server unbinds the session; in-flight
    /// requests resolve to `ConnectionClosed`.
    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
