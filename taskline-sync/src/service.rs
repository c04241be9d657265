//! The mutation service: sole writer of canonical state.
//!
//! Every operation follows the same shape: verify ownership, perform the
//! durable write, then hand the canonical result to the fanout. The value
//! returned to the caller is exactly that, a value; sessions update their
//! local replicas from the published event, the originator included.
//!
//! A failed ownership check writes nothing and publishes nothing.

use std::sync::Arc;

use uuid::Uuid;

use crate::channel::ChannelRegistry;
use crate::model::{Category, Item, ItemDraft, ItemFilter, ItemPatch, OrderEntry, Tag};
use crate::protocol::{ErrorKind, ErrorReply, Event, Request, Response};
use crate::storage::{Store, StoreError};

const DEFAULT_CATEGORY_COLOR: &str = "#6C63FF";

/// Typed mutation failure.
#[derive(Debug)]
pub enum ServiceError {
    /// The target id is not owned by the caller's account (or absent).
    NotFound(&'static str),
    /// Uniqueness violation.
    Conflict(String),
    /// Malformed input that survived outer validation.
    Validation(String),
    Store(StoreError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(entity) => write!(f, "{entity} not found"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl ServiceError {
    /// Wire form. Store failures map to `Internal` without leaking detail.
    pub fn to_reply(&self) -> ErrorReply {
        match self {
            Self::NotFound(entity) => {
                ErrorReply::new(ErrorKind::NotFound, format!("{entity} not found"))
            }
            Self::Conflict(msg) => ErrorReply::new(ErrorKind::Conflict, msg.clone()),
            Self::Validation(msg) => ErrorReply::new(ErrorKind::ValidationFailed, msg.clone()),
            Self::Store(_) => ErrorReply::new(ErrorKind::Internal, "internal error"),
        }
    }
}

/// Write-then-publish mutation surface over the store and the fanout.
pub struct MutationService {
    store: Arc<Store>,
    registry: Arc<ChannelRegistry>,
}

impl MutationService {
    pub fn new(store: Arc<Store>, registry: Arc<ChannelRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    async fn publish(&self, account_id: Uuid, event: Event) {
        let delivered = self.registry.publish(account_id, &event).await;
        log::debug!(
            "published {} for account {account_id} to {delivered} session(s)",
            event.name()
        );
    }

    // ── Items ────────────────────────────────────────────────────────────

    pub async fn list_items(
        &self,
        account_id: Uuid,
        filter: &ItemFilter,
    ) -> Result<Vec<Item>, ServiceError> {
        Ok(self.store.list_items(account_id, filter)?)
    }

    pub async fn get_item(&self, account_id: Uuid, item_id: Uuid) -> Result<Item, ServiceError> {
        self.store
            .get_item(account_id, item_id)?
            .ok_or(ServiceError::NotFound("item"))
    }

    pub async fn create_item(
        &self,
        account_id: Uuid,
        draft: ItemDraft,
    ) -> Result<Item, ServiceError> {
        if draft.title.trim().is_empty() {
            return Err(ServiceError::Validation("title is required".to_string()));
        }
        let item = self.store.create_item(account_id, &draft)?;
        self.publish(account_id, Event::ItemCreated(item.clone())).await;
        Ok(item)
    }

    pub async fn update_item(
        &self,
        account_id: Uuid,
        item_id: Uuid,
        patch: ItemPatch,
    ) -> Result<Item, ServiceError> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(ServiceError::Validation("title cannot be empty".to_string()));
            }
        }
        let item = self
            .store
            .update_item(account_id, item_id, &patch)?
            .ok_or(ServiceError::NotFound("item"))?;
        self.publish(account_id, Event::ItemUpdated(item.clone())).await;
        Ok(item)
    }

    pub async fn delete_item(&self, account_id: Uuid, item_id: Uuid) -> Result<(), ServiceError> {
        if !self.store.delete_item(account_id, item_id)? {
            return Err(ServiceError::NotFound("item"));
        }
        self.publish(account_id, Event::ItemDeleted { id: item_id }).await;
        Ok(())
    }

    /// Apply a reorder. Pairs naming ids the account does not own are
    /// silently skipped; the published event carries the applied pairs.
    /// There is no rollback path: once the transaction commits, the new
    /// ordering stands whatever the caller does with the response.
    pub async fn reorder_items(
        &self,
        account_id: Uuid,
        entries: Vec<OrderEntry>,
    ) -> Result<Vec<OrderEntry>, ServiceError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let applied = self.store.reorder_items(account_id, &entries)?;
        self.publish(
            account_id,
            Event::ItemsReordered {
                entries: applied.clone(),
            },
        )
        .await;
        Ok(applied)
    }

    // ── Categories ───────────────────────────────────────────────────────

    pub async fn list_categories(&self, account_id: Uuid) -> Result<Vec<Category>, ServiceError> {
        Ok(self.store.list_categories(account_id)?)
    }

    pub async fn create_category(
        &self,
        account_id: Uuid,
        name: String,
        color: Option<String>,
    ) -> Result<Category, ServiceError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::Validation("name is required".to_string()));
        }
        let color = color.unwrap_or_else(|| DEFAULT_CATEGORY_COLOR.to_string());
        if !is_hex_color(&color) {
            return Err(ServiceError::Validation(format!(
                "color must be a #RRGGBB code, got {color:?}"
            )));
        }
        let category = self.store.create_category(account_id, &name, &color)?;
        self.publish(account_id, Event::CategoryCreated(category.clone())).await;
        Ok(category)
    }

    pub async fn delete_category(
        &self,
        account_id: Uuid,
        category_id: Uuid,
    ) -> Result<(), ServiceError> {
        if !self.store.delete_category(account_id, category_id)? {
            return Err(ServiceError::NotFound("category"));
        }
        self.publish(account_id, Event::CategoryDeleted { id: category_id }).await;
        Ok(())
    }

    // ── Tags ─────────────────────────────────────────────────────────────

    pub async fn list_tags(&self, account_id: Uuid) -> Result<Vec<Tag>, ServiceError> {
        Ok(self.store.list_tags(account_id)?)
    }

    /// Create a tag. Names are case-normalized before the per-account
    /// uniqueness check; a duplicate surfaces as `Conflict`.
    pub async fn create_tag(&self, account_id: Uuid, name: String) -> Result<Tag, ServiceError> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(ServiceError::Validation("name is required".to_string()));
        }
        let tag = match self.store.create_tag(account_id, &name) {
            Ok(tag) => tag,
            Err(StoreError::Duplicate) => {
                return Err(ServiceError::Conflict(format!("tag {name:?} already exists")));
            }
            Err(e) => return Err(e.into()),
        };
        self.publish(account_id, Event::TagCreated(tag.clone())).await;
        Ok(tag)
    }

    pub async fn delete_tag(&self, account_id: Uuid, tag_id: Uuid) -> Result<(), ServiceError> {
        if !self.store.delete_tag(account_id, tag_id)? {
            return Err(ServiceError::NotFound("tag"));
        }
        self.publish(account_id, Event::TagDeleted { id: tag_id }).await;
        Ok(())
    }

    // ── Request dispatch ─────────────────────────────────────────────────

    /// Execute one wire request on behalf of a bound account.
    ///
    /// The match is exhaustive over the closed request set; a new request
    /// kind does not compile until it is handled here.
    pub async fn dispatch(&self, account_id: Uuid, request: Request) -> Result<Response, ErrorReply> {
        let result = match request {
            Request::ListItems(filter) => self
                .list_items(account_id, &filter)
                .await
                .map(Response::Items),
            Request::GetItem { id } => self.get_item(account_id, id).await.map(Response::Item),
            Request::CreateItem(draft) => {
                self.create_item(account_id, draft).await.map(Response::Item)
            }
            Request::UpdateItem { id, patch } => self
                .update_item(account_id, id, patch)
                .await
                .map(Response::Item),
            Request::DeleteItem { id } => {
                self.delete_item(account_id, id).await.map(|_| Response::Ack)
            }
            Request::ReorderItems { entries } => self
                .reorder_items(account_id, entries)
                .await
                .map(|_| Response::Ack),
            Request::ListCategories => self
                .list_categories(account_id)
                .await
                .map(Response::Categories),
            Request::CreateCategory { name, color } => self
                .create_category(account_id, name, color)
                .await
                .map(Response::Category),
            Request::DeleteCategory { id } => self
                .delete_category(account_id, id)
                .await
                .map(|_| Response::Ack),
            Request::ListTags => self.list_tags(account_id).await.map(Response::Tags),
            Request::CreateTag { name } => {
                self.create_tag(account_id, name).await.map(Response::Tag)
            }
            Request::DeleteTag { id } => {
                self.delete_tag(account_id, id).await.map(|_| Response::Ack)
            }
        };

        result.map_err(|e| {
            if let ServiceError::Store(store_err) = &e {
                log::error!("store failure for account {account_id}: {store_err}");
            }
            e.to_reply()
        })
    }
}

fn is_hex_color(s: &str) -> bool {
    let Some(hex) = s.strip_prefix('#') else {
        return false;
    };
    hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())
}
