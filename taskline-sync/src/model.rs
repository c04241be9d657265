//! Domain records shared by the store, the wire protocol, and the replica.
//!
//! Everything here is plain data: canonical rows as the store returns them,
//! plus the draft/patch/filter shapes that travel in mutation requests.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work item priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Storage/wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// A work item, canonical server representation.
///
/// `order_index` defines the total order of one account's items. It is
/// assigned as max+1 on create and rewritten wholesale on reorder; it is
/// not guaranteed unique under concurrent creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub due_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ids of the tags attached to this item.
    pub tags: BTreeSet<Uuid>,
}

/// A category. Deleting one does not delete its items; they go uncategorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    /// `#RRGGBB` color code.
    pub color: String,
}

/// A tag. Names are lowercased and trimmed; unique per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
}

/// Tri-state field patch: leave untouched, clear, or overwrite.
///
/// A partial update must distinguish "field absent" from "field set to
/// null"; `Option<Option<T>>` reads terribly, so optional fields in
/// [`ItemPatch`] use this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Patch<T> {
    Keep,
    Clear,
    Set(T),
}

// Hand-written so `Patch<T>: Default` holds without a `T: Default` bound
impl<T> Default for Patch<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    /// Apply this patch to an optional slot.
    pub fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Clear => *slot = None,
            Self::Set(value) => *slot = Some(value),
        }
    }
}

/// Fields for creating an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub title: String,
    pub description: Option<String>,
    pub category_id: Option<Uuid>,
    pub priority: Option<Priority>,
    pub due_at: Option<DateTime<Utc>>,
    pub tag_ids: Vec<Uuid>,
}

impl ItemDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            category_id: None,
            priority: None,
            due_at: None,
            tag_ids: Vec::new(),
        }
    }
}

/// Partial update for an item. Fields left at their defaults are untouched.
///
/// `title` and `completed` are required on the record so they can only be
/// replaced, never cleared. A present `tags` set replaces the item's tag
/// associations wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub title: Option<String>,
    pub description: Patch<String>,
    pub category_id: Patch<Uuid>,
    pub priority: Patch<Priority>,
    pub due_at: Patch<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub tags: Option<BTreeSet<Uuid>>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_keep()
            && self.category_id.is_keep()
            && self.priority.is_keep()
            && self.due_at.is_keep()
            && self.completed.is_none()
            && self.tags.is_none()
    }

    /// Apply the patched fields to an item in place.
    ///
    /// This is the optimistic local application; the store performs the
    /// same field-by-field merge on the canonical row. `updated_at` is not
    /// touched here, the server stamps it.
    pub fn apply_to(&self, item: &mut Item) {
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        self.description.clone().apply_to(&mut item.description);
        self.category_id.apply_to(&mut item.category_id);
        self.priority.apply_to(&mut item.priority);
        self.due_at.apply_to(&mut item.due_at);
        if let Some(completed) = self.completed {
            item.completed = completed;
        }
        if let Some(tags) = &self.tags {
            item.tags = tags.clone();
        }
    }
}

/// Listing filter. All criteria are conjunctive; `None` means "don't care".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFilter {
    pub category_id: Option<Uuid>,
    pub tag_id: Option<Uuid>,
    pub priority: Option<Priority>,
    pub completed: Option<bool>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
}

/// One `(id, order_index)` pair of a reorder request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub id: Uuid,
    pub order_index: i64,
}
