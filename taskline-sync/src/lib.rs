//! # taskline-sync — multi-session collection sync for Taskline
//!
//! Keeps every connected session of an account (tabs, devices) converged
//! on one shared, ordered collection of work items plus its category and
//! tag sets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncEngine  │ ◄─────────────────► │ SyncServer  │
//! │ (per tab)   │   Binary Frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ReplicaState │                     │MutationSvc  │──► Store (SQLite)
//! │ (cache)     │                     └──────┬──────┘
//! └─────────────┘                            │
//!                                     ┌──────┴──────┐
//!                                     │  Channel    │
//!                                     │ (fan-out)   │
//!                                     └─────────────┘
//! ```
//!
//! Mutations flow session → server → store, and their effects flow back
//! through the per-account channel to every bound session — the
//! originator included. A session's own create shows up locally only when
//! its echo arrives (echo-wait); updates and deletes apply optimistically
//! with snapshot rollback on failure.
//!
//! ## Modules
//!
//! - [`model`] — items, categories, tags, patches, filters
//! - [`protocol`] — binary wire frames and the closed event set
//! - [`identity`] — token → account verification seam
//! - [`channel`] — per-account binding and event fanout
//! - [`storage`] — relational store (SQLite)
//! - [`service`] — the mutation service (sole writer, write-then-publish)
//! - [`server`] — WebSocket serving loop
//! - [`client`] — session transport with request correlation
//! - [`engine`] — per-session reconciliation engine

pub mod channel;
pub mod client;
pub mod engine;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use channel::{Channel, ChannelBinder, ChannelHandle, ChannelRegistry, SessionInfo};
pub use client::{ClientError, ConnectionState, SyncClient};
pub use engine::{ReplicaState, SyncEngine};
pub use identity::{IdentityError, IdentityProvider, TokenRegistry};
pub use model::{
    Category, Item, ItemDraft, ItemFilter, ItemPatch, OrderEntry, Patch, Priority, Tag,
};
pub use protocol::{
    ClientFrame, ErrorKind, ErrorReply, Event, ProtocolError, Request, Response, ServerFrame,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{MutationService, ServiceError};
pub use storage::{Store, StoreError};
