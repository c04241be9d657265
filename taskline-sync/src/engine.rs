//! Client reconciliation engine.
//!
//! Each session owns one [`ReplicaState`]: an ordered item list plus the
//! category and tag sets, fed by two independent flows. Mutation calls
//! apply optimistic edits and send the request; the event pump merges in
//! everything the server fans out: edits from sibling sessions and the
//! echo of this session's own mutations alike.
//!
//! The replica is a cache, not a source of truth: [`SyncEngine::refresh`]
//! rebuilds it wholesale from the server at any time.
//!
//! Rules of the road:
//! - a create never touches the replica directly; the inserted item
//!   arrives via its `item.created` echo (echo-wait)
//! - update/delete snapshot the full item list and restore it verbatim if
//!   the request fails
//! - reorder applies locally and keeps no snapshot; a failed reorder
//!   request leaves the local ordering in place
//! - merge rules are total and idempotent: any event applies cleanly to
//!   any replica state, and duplicates are no-ops

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::{ClientError, SyncClient};
use crate::model::{Category, Item, ItemDraft, ItemFilter, ItemPatch, OrderEntry, Tag};
use crate::protocol::Event;

/// One session's local view of the collections.
#[derive(Debug, Clone, Default)]
pub struct ReplicaState {
    pub items: Vec<Item>,
    pub categories: Vec<Category>,
    pub tags: Vec<Tag>,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(&self, id: Uuid) -> Option<&Item> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Merge one inbound event.
    ///
    /// Exhaustive over the event set: an unhandled kind is a compile
    /// error, not a silent drop. An event targeting an id the replica has
    /// never seen degrades to a no-op, never an error and never buffered.
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::ItemCreated(item) => {
                if !self.items.iter().any(|i| i.id == item.id) {
                    self.items.push(item.clone());
                }
            }
            Event::ItemUpdated(item) => {
                if let Some(slot) = self.items.iter_mut().find(|i| i.id == item.id) {
                    *slot = item.clone();
                }
            }
            Event::ItemDeleted { id } => {
                self.items.retain(|i| i.id != *id);
            }
            Event::ItemsReordered { entries } => {
                for entry in entries {
                    if let Some(item) = self.items.iter_mut().find(|i| i.id == entry.id) {
                        item.order_index = entry.order_index;
                    }
                }
                self.sort_items();
            }
            Event::CategoryCreated(category) => {
                if !self.categories.iter().any(|c| c.id == category.id) {
                    self.categories.push(category.clone());
                }
            }
            Event::CategoryDeleted { id } => {
                self.categories.retain(|c| c.id != *id);
            }
            Event::TagCreated(tag) => {
                if !self.tags.iter().any(|t| t.id == tag.id) {
                    self.tags.push(tag.clone());
                }
            }
            Event::TagDeleted { id } => {
                self.tags.retain(|t| t.id != *id);
            }
        }
    }

    /// Move `active` to `over`'s position and reindex the whole list
    /// contiguously from zero.
    ///
    /// Returns the full `(id, order_index)` list to persist, or `None`
    /// when either id is unknown or the move would change nothing.
    pub fn move_item(&mut self, active: Uuid, over: Uuid) -> Option<Vec<OrderEntry>> {
        let from = self.items.iter().position(|i| i.id == active)?;
        let to = self.items.iter().position(|i| i.id == over)?;
        if from == to {
            return None;
        }

        let item = self.items.remove(from);
        self.items.insert(to, item);
        for (index, item) in self.items.iter_mut().enumerate() {
            item.order_index = index as i64;
        }

        Some(
            self.items
                .iter()
                .map(|i| OrderEntry {
                    id: i.id,
                    order_index: i.order_index,
                })
                .collect(),
        )
    }

    fn sort_items(&mut self) {
        self.items.sort_by_key(|i| i.order_index);
    }
}

/// Reconciliation engine: optimistic local mutations plus event merging.
pub struct SyncEngine {
    client: Arc<SyncClient>,
    state: Arc<Mutex<ReplicaState>>,
}

impl SyncEngine {
    /// Wrap a connected client and start the event pump.
    ///
    /// The pump task consumes the client's event stream for the life of
    /// the connection, independently of any in-flight request.
    pub fn new(mut client: SyncClient) -> Self {
        let state = Arc::new(Mutex::new(ReplicaState::new()));

        match client.take_event_rx() {
            Some(mut event_rx) => {
                let pump_state = state.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        log::trace!("merging {}", event.name());
                        let mut replica = pump_state.lock().await;
                        replica.apply_event(&event);
                    }
                    log::debug!("event stream ended");
                });
            }
            None => log::warn!("event receiver already taken; replica will not merge events"),
        }

        Self {
            client: Arc::new(client),
            state,
        }
    }

    /// Rebuild the replica wholesale from the server.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let items = self.client.list_items(ItemFilter::default()).await?;
        let categories = self.client.list_categories().await?;
        let tags = self.client.list_tags().await?;

        let mut replica = self.state.lock().await;
        replica.items = items;
        replica.categories = categories;
        replica.tags = tags;
        Ok(())
    }

    // ── Items ────────────────────────────────────────────────────────────

    /// Request an item creation.
    ///
    /// The replica is not touched here: the only path that inserts the new
    /// item locally is the fanned-out `item.created` event, for every
    /// session including this one. The returned record is a value only.
    pub async fn create_item(&self, draft: ItemDraft) -> Result<Item, ClientError> {
        self.client.create_item(draft).await
    }

    /// Optimistically update an item, then reconcile with the server.
    ///
    /// On failure the entire pre-request item list is restored verbatim
    /// (a whole-list rollback, not a field-level one).
    pub async fn update_item(&self, id: Uuid, patch: ItemPatch) -> Result<Item, ClientError> {
        let snapshot = {
            let mut replica = self.state.lock().await;
            let snapshot = replica.items.clone();
            if let Some(item) = replica.items.iter_mut().find(|i| i.id == id) {
                patch.apply_to(item);
            }
            snapshot
        };

        match self.client.update_item(id, patch).await {
            Ok(item) => {
                // Same idempotent merge the event path performs; whichever
                // arrives second finds the canonical record already there.
                let mut replica = self.state.lock().await;
                if let Some(slot) = replica.items.iter_mut().find(|i| i.id == item.id) {
                    *slot = item.clone();
                }
                Ok(item)
            }
            Err(e) => {
                let mut replica = self.state.lock().await;
                replica.items = snapshot;
                Err(e)
            }
        }
    }

    /// Optimistically remove an item; restore the snapshot on failure.
    pub async fn delete_item(&self, id: Uuid) -> Result<(), ClientError> {
        let snapshot = {
            let mut replica = self.state.lock().await;
            let snapshot = replica.items.clone();
            replica.items.retain(|i| i.id != id);
            snapshot
        };

        match self.client.delete_item(id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut replica = self.state.lock().await;
                replica.items = snapshot;
                Err(e)
            }
        }
    }

    /// Move the item `active` to the position of `over`, locally and then
    /// on the server.
    ///
    /// The local move is applied for good before the request goes out; a
    /// server failure does not roll it back.
    pub async fn reorder(&self, active: Uuid, over: Uuid) -> Result<(), ClientError> {
        let entries = {
            let mut replica = self.state.lock().await;
            match replica.move_item(active, over) {
                Some(entries) => entries,
                None => return Ok(()),
            }
        };
        self.client.reorder_items(entries).await
    }

    // ── Categories ───────────────────────────────────────────────────────

    pub async fn create_category(
        &self,
        name: impl Into<String>,
        color: Option<String>,
    ) -> Result<Category, ClientError> {
        let category = self.client.create_category(name, color).await?;
        let mut replica = self.state.lock().await;
        if !replica.categories.iter().any(|c| c.id == category.id) {
            replica.categories.push(category.clone());
        }
        Ok(category)
    }

    pub async fn delete_category(&self, id: Uuid) -> Result<(), ClientError> {
        self.client.delete_category(id).await?;
        let mut replica = self.state.lock().await;
        replica.categories.retain(|c| c.id != id);
        Ok(())
    }

    // ── Tags ─────────────────────────────────────────────────────────────

    pub async fn create_tag(&self, name: impl Into<String>) -> Result<Tag, ClientError> {
        let tag = self.client.create_tag(name).await?;
        let mut replica = self.state.lock().await;
        if !replica.tags.iter().any(|t| t.id == tag.id) {
            replica.tags.push(tag.clone());
        }
        Ok(tag)
    }

    pub async fn delete_tag(&self, id: Uuid) -> Result<(), ClientError> {
        self.client.delete_tag(id).await?;
        let mut replica = self.state.lock().await;
        replica.tags.retain(|t| t.id != id);
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    /// Snapshot of the local item list, in local order.
    pub async fn items(&self) -> Vec<Item> {
        self.state.lock().await.items.clone()
    }

    pub async fn categories(&self) -> Vec<Category> {
        self.state.lock().await.categories.clone()
    }

    pub async fn tags(&self) -> Vec<Tag> {
        self.state.lock().await.tags.clone()
    }

    pub fn client(&self) -> &Arc<SyncClient> {
        &self.client
    }
}
