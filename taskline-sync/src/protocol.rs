//! Binary wire protocol between sessions and the sync server.
//!
//! One duplex WebSocket per session carries two interleaved flows:
//!
//! ```text
//! session ── ClientFrame::Hello ────────► server   (handshake, once)
//! session ◄─ ServerFrame::Welcome/Rejected ─┘
//!
//! session ── ClientFrame::Request{id} ──► server   (mutations + reads)
//! session ◄─ ServerFrame::Response{id} ──┘         (value return only)
//!
//! session ◄─ ServerFrame::Event ───────── server   (fanout, all sessions
//!                                                   of the account, the
//!                                                   originator included)
//! ```
//!
//! Frames are bincode-encoded serde enums. Events are a closed variant set:
//! adding an event kind without handling it everywhere is a compile error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Category, Item, ItemDraft, ItemFilter, ItemPatch, OrderEntry, Tag};

/// A change to canonical state, fanned out to every session of the owning
/// account. Each variant carries the full post-write payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ItemCreated(Item),
    ItemUpdated(Item),
    ItemDeleted { id: Uuid },
    ItemsReordered { entries: Vec<OrderEntry> },
    CategoryCreated(Category),
    CategoryDeleted { id: Uuid },
    TagCreated(Tag),
    TagDeleted { id: Uuid },
}

impl Event {
    /// Dotted event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ItemCreated(_) => "item.created",
            Self::ItemUpdated(_) => "item.updated",
            Self::ItemDeleted { .. } => "item.deleted",
            Self::ItemsReordered { .. } => "items.reordered",
            Self::CategoryCreated(_) => "category.created",
            Self::CategoryDeleted { .. } => "category.deleted",
            Self::TagCreated(_) => "tag.created",
            Self::TagDeleted { .. } => "tag.deleted",
        }
    }
}

/// A mutation or read request. Every variant requires a bound identity;
/// the account id is taken from the binding, never from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ListItems(ItemFilter),
    GetItem { id: Uuid },
    CreateItem(ItemDraft),
    UpdateItem { id: Uuid, patch: ItemPatch },
    DeleteItem { id: Uuid },
    ReorderItems { entries: Vec<OrderEntry> },
    ListCategories,
    CreateCategory { name: String, color: Option<String> },
    DeleteCategory { id: Uuid },
    ListTags,
    CreateTag { name: String },
    DeleteTag { id: Uuid },
}

/// Successful request result. This is a value return only: local replicas
/// are updated through [`Event`]s, never through responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Items(Vec<Item>),
    Item(Item),
    Categories(Vec<Category>),
    Category(Category),
    Tags(Vec<Tag>),
    Tag(Tag),
    Ack,
}

/// Error taxonomy carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unauthenticated,
    NotFound,
    Conflict,
    ValidationFailed,
    Internal,
}

/// A typed request failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorReply {}

/// Frames sent by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on the connection.
    Hello { token: String },
    /// `id` correlates the eventual `Response` frame; unique per session.
    Request { id: u64, request: Request },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Welcome { account_id: Uuid, session_id: Uuid },
    Rejected { reason: String },
    Response {
        id: u64,
        result: Result<Response, ErrorReply>,
    },
    Event(Event),
}

impl ClientFrame {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    /// A frame arrived that is not valid at this point of the exchange.
    UnexpectedFrame,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::UnexpectedFrame => write!(f, "unexpected frame"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
