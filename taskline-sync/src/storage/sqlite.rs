//! SQLite-backed relational store.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use uuid::Uuid;

use crate::model::{
    Category, Item, ItemDraft, ItemFilter, ItemPatch, OrderEntry, Patch, Priority, Tag,
};

/// Store errors.
#[derive(Debug)]
pub enum StoreError {
    Sql(rusqlite::Error),
    /// Unique-constraint violation (duplicate tag name for an account).
    Duplicate,
    /// A persisted row failed to parse back into its domain type.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(e) => write!(f, "sqlite: {e}"),
            Self::Duplicate => write!(f, "unique constraint violated"),
            Self::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

const ITEM_COLUMNS: &str = "id, account_id, category_id, title, description, priority, \
                            due_at_ms, completed, order_index, created_at_ms, updated_at_ms";

/// Raw `items` row before uuid/timestamp parsing.
struct ItemRow {
    id: String,
    account_id: String,
    category_id: Option<String>,
    title: String,
    description: Option<String>,
    priority: Option<String>,
    due_at_ms: Option<i64>,
    completed: bool,
    order_index: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl ItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            category_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            priority: row.get(5)?,
            due_at_ms: row.get(6)?,
            completed: row.get(7)?,
            order_index: row.get(8)?,
            created_at_ms: row.get(9)?,
            updated_at_ms: row.get(10)?,
        })
    }

    fn into_item(self, tags: BTreeSet<Uuid>) -> Result<Item, StoreError> {
        let priority = match self.priority {
            None => None,
            Some(raw) => Some(
                Priority::parse(&raw)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad priority {raw:?}")))?,
            ),
        };
        let due_at = match self.due_at_ms {
            None => None,
            Some(ms) => Some(ts_from_ms(ms)?),
        };
        Ok(Item {
            id: parse_uuid(&self.id)?,
            account_id: parse_uuid(&self.account_id)?,
            category_id: self.category_id.as_deref().map(parse_uuid).transpose()?,
            title: self.title,
            description: self.description,
            priority,
            due_at,
            completed: self.completed,
            order_index: self.order_index,
            created_at: ts_from_ms(self.created_at_ms)?,
            updated_at: ts_from_ms(self.updated_at_ms)?,
            tags,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s:?}: {e}")))
}

fn ts_from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {ms}")))
}

/// The relational store. One connection, serialized behind a mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and migrate) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database (tests, ephemeral setups).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS accounts (
              id            TEXT PRIMARY KEY,
              name          TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
              id         TEXT PRIMARY KEY,
              account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              name       TEXT NOT NULL,
              color      TEXT NOT NULL DEFAULT '#6C63FF'
            );

            CREATE TABLE IF NOT EXISTS items (
              id            TEXT PRIMARY KEY,
              account_id    TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              category_id   TEXT REFERENCES categories(id) ON DELETE SET NULL,
              title         TEXT NOT NULL,
              description   TEXT,
              priority      TEXT CHECK (priority IN ('low', 'medium', 'high')),
              due_at_ms     INTEGER,
              completed     INTEGER NOT NULL DEFAULT 0,
              order_index   INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tags (
              id         TEXT PRIMARY KEY,
              account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              name       TEXT NOT NULL,
              UNIQUE (account_id, name)
            );

            CREATE TABLE IF NOT EXISTS item_tags (
              item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
              tag_id  TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
              PRIMARY KEY (item_id, tag_id)
            );

            CREATE INDEX IF NOT EXISTS idx_items_account_order
              ON items (account_id, order_index);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Accounts ─────────────────────────────────────────────────────────

    pub fn create_account(&self, name: &str) -> Result<Uuid, StoreError> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO accounts (id, name, created_at_ms) VALUES (?1, ?2, ?3)",
            params![id.to_string(), name, Utc::now().timestamp_millis()],
        )?;
        Ok(id)
    }

    /// Delete an account and, via cascade, everything it owns.
    pub fn delete_account(&self, account_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM accounts WHERE id = ?1",
            params![account_id.to_string()],
        )?;
        Ok(n > 0)
    }

    // ── Items ────────────────────────────────────────────────────────────

    pub fn list_items(
        &self,
        account_id: Uuid,
        filter: &ItemFilter,
    ) -> Result<Vec<Item>, StoreError> {
        let conn = self.lock();

        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE account_id = ?");
        let mut args: Vec<Value> = vec![Value::Text(account_id.to_string())];

        if let Some(category_id) = filter.category_id {
            sql.push_str(" AND category_id = ?");
            args.push(Value::Text(category_id.to_string()));
        }
        if let Some(priority) = filter.priority {
            sql.push_str(" AND priority = ?");
            args.push(Value::Text(priority.as_str().to_string()));
        }
        if let Some(completed) = filter.completed {
            sql.push_str(" AND completed = ?");
            args.push(Value::Integer(i64::from(completed)));
        }
        if let Some(search) = &filter.search {
            sql.push_str(" AND LOWER(title) LIKE ?");
            args.push(Value::Text(format!("%{}%", search.to_lowercase())));
        }
        if let Some(tag_id) = filter.tag_id {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM item_tags \
                 WHERE item_tags.item_id = items.id AND item_tags.tag_id = ?)",
            );
            args.push(Value::Text(tag_id.to_string()));
        }
        sql.push_str(" ORDER BY order_index ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), ItemRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // Attach tag sets in one pass over the account's associations
        let mut tag_map: HashMap<String, BTreeSet<Uuid>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT item_tags.item_id, item_tags.tag_id FROM item_tags \
                 JOIN items ON items.id = item_tags.item_id WHERE items.account_id = ?1",
            )?;
            let pairs = stmt
                .query_map(params![account_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (item_id, tag_id) in pairs {
                tag_map.entry(item_id).or_default().insert(parse_uuid(&tag_id)?);
            }
        }

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let tags = tag_map.remove(&row.id).unwrap_or_default();
            items.push(row.into_item(tags)?);
        }
        Ok(items)
    }

    /// Fetch one item with its tag set, scoped to the owning account.
    pub fn get_item(&self, account_id: Uuid, item_id: Uuid) -> Result<Option<Item>, StoreError> {
        let conn = self.lock();
        fetch_item(&conn, account_id, item_id)
    }

    /// Insert an item at the end of the account's ordering.
    ///
    /// The max+1 read and the insert are two statements with no lock
    /// spanning them; two writers racing on the same account can tie on
    /// `order_index`. Kept as observed behavior, see DESIGN.md.
    pub fn create_item(&self, account_id: Uuid, draft: &ItemDraft) -> Result<Item, StoreError> {
        let conn = self.lock();

        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(order_index), -1) FROM items WHERE account_id = ?1",
            params![account_id.to_string()],
            |row| row.get(0),
        )?;

        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO items (id, account_id, category_id, title, description, priority, \
             due_at_ms, completed, order_index, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.to_string(),
                account_id.to_string(),
                draft.category_id.map(|c| c.to_string()),
                draft.title,
                draft.description,
                draft.priority.map(Priority::as_str),
                draft.due_at.map(|t| t.timestamp_millis()),
                false,
                max + 1,
                now,
                now,
            ],
        )?;

        for tag_id in &draft.tag_ids {
            conn.execute(
                "INSERT OR IGNORE INTO item_tags (item_id, tag_id) VALUES (?1, ?2)",
                params![id.to_string(), tag_id.to_string()],
            )?;
        }

        fetch_item(&conn, account_id, id)?
            .ok_or_else(|| StoreError::Corrupt("item missing after insert".to_string()))
    }

    /// Apply a partial update. Returns `None` when the item does not exist
    /// under this account (ownership check and existence are one query).
    pub fn update_item(
        &self,
        account_id: Uuid,
        item_id: Uuid,
        patch: &ItemPatch,
    ) -> Result<Option<Item>, StoreError> {
        let conn = self.lock();

        let owned: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM items WHERE id = ?1 AND account_id = ?2",
                params![item_id.to_string(), account_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Ok(None);
        }

        let mut sets: Vec<&str> = vec!["updated_at_ms = ?"];
        let mut args: Vec<Value> = vec![Value::Integer(Utc::now().timestamp_millis())];

        if let Some(title) = &patch.title {
            sets.push("title = ?");
            args.push(Value::Text(title.clone()));
        }
        match &patch.description {
            Patch::Keep => {}
            Patch::Clear => sets.push("description = NULL"),
            Patch::Set(v) => {
                sets.push("description = ?");
                args.push(Value::Text(v.clone()));
            }
        }
        match patch.category_id {
            Patch::Keep => {}
            Patch::Clear => sets.push("category_id = NULL"),
            Patch::Set(v) => {
                sets.push("category_id = ?");
                args.push(Value::Text(v.to_string()));
            }
        }
        match patch.priority {
            Patch::Keep => {}
            Patch::Clear => sets.push("priority = NULL"),
            Patch::Set(v) => {
                sets.push("priority = ?");
                args.push(Value::Text(v.as_str().to_string()));
            }
        }
        match patch.due_at {
            Patch::Keep => {}
            Patch::Clear => sets.push("due_at_ms = NULL"),
            Patch::Set(v) => {
                sets.push("due_at_ms = ?");
                args.push(Value::Integer(v.timestamp_millis()));
            }
        }
        if let Some(completed) = patch.completed {
            sets.push("completed = ?");
            args.push(Value::Integer(i64::from(completed)));
        }

        let sql = format!(
            "UPDATE items SET {} WHERE id = ? AND account_id = ?",
            sets.join(", ")
        );
        args.push(Value::Text(item_id.to_string()));
        args.push(Value::Text(account_id.to_string()));
        conn.execute(&sql, params_from_iter(args))?;

        // Wholesale tag replacement when the patch carries a set
        if let Some(tags) = &patch.tags {
            conn.execute(
                "DELETE FROM item_tags WHERE item_id = ?1",
                params![item_id.to_string()],
            )?;
            for tag_id in tags {
                conn.execute(
                    "INSERT OR IGNORE INTO item_tags (item_id, tag_id) VALUES (?1, ?2)",
                    params![item_id.to_string(), tag_id.to_string()],
                )?;
            }
        }

        fetch_item(&conn, account_id, item_id)
    }

    /// Delete an item (associations cascade). Returns whether a row went.
    pub fn delete_item(&self, account_id: Uuid, item_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM items WHERE id = ?1 AND account_id = ?2",
            params![item_id.to_string(), account_id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Apply `(id, order_index)` pairs in one account-scoped transaction.
    ///
    /// Pairs whose id is not owned by the account match zero rows and are
    /// skipped; the returned list holds only the applied pairs.
    pub fn reorder_items(
        &self,
        account_id: Uuid,
        entries: &[OrderEntry],
    ) -> Result<Vec<OrderEntry>, StoreError> {
        let mut conn = self.lock();
        let now = Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        let mut applied = Vec::with_capacity(entries.len());
        {
            let mut stmt = tx.prepare(
                "UPDATE items SET order_index = ?1, updated_at_ms = ?2 \
                 WHERE id = ?3 AND account_id = ?4",
            )?;
            for entry in entries {
                let n = stmt.execute(params![
                    entry.order_index,
                    now,
                    entry.id.to_string(),
                    account_id.to_string(),
                ])?;
                if n == 1 {
                    applied.push(*entry);
                }
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    // ── Categories ───────────────────────────────────────────────────────

    pub fn list_categories(&self, account_id: Uuid) -> Result<Vec<Category>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, color FROM categories \
             WHERE account_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![account_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, account, name, color)| {
                Ok(Category {
                    id: parse_uuid(&id)?,
                    account_id: parse_uuid(&account)?,
                    name,
                    color,
                })
            })
            .collect()
    }

    pub fn create_category(
        &self,
        account_id: Uuid,
        name: &str,
        color: &str,
    ) -> Result<Category, StoreError> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO categories (id, account_id, name, color) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), account_id.to_string(), name, color],
        )?;
        Ok(Category {
            id,
            account_id,
            name: name.to_string(),
            color: color.to_string(),
        })
    }

    /// Delete a category. Items referencing it go uncategorized (FK SET NULL).
    pub fn delete_category(&self, account_id: Uuid, category_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM categories WHERE id = ?1 AND account_id = ?2",
            params![category_id.to_string(), account_id.to_string()],
        )?;
        Ok(n > 0)
    }

    // ── Tags ─────────────────────────────────────────────────────────────

    pub fn list_tags(&self, account_id: Uuid) -> Result<Vec<Tag>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name FROM tags WHERE account_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![account_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, account, name)| {
                Ok(Tag {
                    id: parse_uuid(&id)?,
                    account_id: parse_uuid(&account)?,
                    name,
                })
            })
            .collect()
    }

    /// Insert a tag. `(account_id, name)` is unique; a duplicate surfaces
    /// as [`StoreError::Duplicate`], never as a generic SQL failure.
    pub fn create_tag(&self, account_id: Uuid, name: &str) -> Result<Tag, StoreError> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        match conn.execute(
            "INSERT INTO tags (id, account_id, name) VALUES (?1, ?2, ?3)",
            params![id.to_string(), account_id.to_string(), name],
        ) {
            Ok(_) => Ok(Tag {
                id,
                account_id,
                name: name.to_string(),
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a tag (associations cascade). Returns whether a row went.
    pub fn delete_tag(&self, account_id: Uuid, tag_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM tags WHERE id = ?1 AND account_id = ?2",
            params![tag_id.to_string(), account_id.to_string()],
        )?;
        Ok(n > 0)
    }
}

fn fetch_item(
    conn: &Connection,
    account_id: Uuid,
    item_id: Uuid,
) -> Result<Option<Item>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1 AND account_id = ?2"),
            params![item_id.to_string(), account_id.to_string()],
            ItemRow::from_row,
        )
        .optional()?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let mut stmt = conn.prepare("SELECT tag_id FROM item_tags WHERE item_id = ?1")?;
    let tag_ids = stmt
        .query_map(params![item_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tags = BTreeSet::new();
    for tag_id in tag_ids {
        tags.insert(parse_uuid(&tag_id)?);
    }

    Ok(Some(row.into_item(tags)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_account() -> (Store, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let account = store.create_account("alice").unwrap();
        (store, account)
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("taskline.db")).unwrap();
        let account = store.create_account("bob").unwrap();
        assert!(store.list_items(account, &ItemFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_create_assigns_sequential_order() {
        let (store, account) = store_with_account();

        let first = store.create_item(account, &ItemDraft::new("one")).unwrap();
        let second = store.create_item(account, &ItemDraft::new("two")).unwrap();
        let third = store.create_item(account, &ItemDraft::new("three")).unwrap();

        assert_eq!(first.order_index, 0);
        assert_eq!(second.order_index, 1);
        assert_eq!(third.order_index, 2);
        assert!(!first.completed);
    }

    #[test]
    fn test_create_with_tags_and_category() {
        let (store, account) = store_with_account();
        let category = store.create_category(account, "Work", "#AABBCC").unwrap();
        let tag = store.create_tag(account, "urgent").unwrap();

        let mut draft = ItemDraft::new("review budget");
        draft.category_id = Some(category.id);
        draft.tag_ids = vec![tag.id];
        draft.priority = Some(Priority::High);

        let item = store.create_item(account, &draft).unwrap();
        assert_eq!(item.category_id, Some(category.id));
        assert_eq!(item.tags, BTreeSet::from([tag.id]));
        assert_eq!(item.priority, Some(Priority::High));
    }

    #[test]
    fn test_get_item_requires_ownership() {
        let (store, account) = store_with_account();
        let other = store.create_account("mallory").unwrap();

        let item = store.create_item(account, &ItemDraft::new("secret")).unwrap();
        assert!(store.get_item(account, item.id).unwrap().is_some());
        assert!(store.get_item(other, item.id).unwrap().is_none());
    }

    #[test]
    fn test_update_partial_fields() {
        let (store, account) = store_with_account();
        let mut draft = ItemDraft::new("draft");
        draft.description = Some("keep me".to_string());
        draft.priority = Some(Priority::Low);
        let item = store.create_item(account, &draft).unwrap();

        let patch = ItemPatch {
            title: Some("final".to_string()),
            priority: Patch::Clear,
            completed: Some(true),
            ..ItemPatch::default()
        };
        let updated = store.update_item(account, item.id, &patch).unwrap().unwrap();

        assert_eq!(updated.title, "final");
        assert_eq!(updated.description.as_deref(), Some("keep me"));
        assert_eq!(updated.priority, None);
        assert!(updated.completed);
        assert!(updated.updated_at >= item.updated_at);
    }

    #[test]
    fn test_update_replaces_tags_wholesale() {
        let (store, account) = store_with_account();
        let old_tag = store.create_tag(account, "old").unwrap();
        let new_tag = store.create_tag(account, "new").unwrap();

        let mut draft = ItemDraft::new("tagged");
        draft.tag_ids = vec![old_tag.id];
        let item = store.create_item(account, &draft).unwrap();

        let patch = ItemPatch {
            tags: Some(BTreeSet::from([new_tag.id])),
            ..ItemPatch::default()
        };
        let updated = store.update_item(account, item.id, &patch).unwrap().unwrap();
        assert_eq!(updated.tags, BTreeSet::from([new_tag.id]));
    }

    #[test]
    fn test_update_foreign_item_is_none() {
        let (store, account) = store_with_account();
        let other = store.create_account("mallory").unwrap();
        let item = store.create_item(account, &ItemDraft::new("mine")).unwrap();

        let patch = ItemPatch {
            completed: Some(true),
            ..ItemPatch::default()
        };
        assert!(store.update_item(other, item.id, &patch).unwrap().is_none());

        // Untouched
        let reread = store.get_item(account, item.id).unwrap().unwrap();
        assert!(!reread.completed);
    }

    #[test]
    fn test_delete_cascades_associations() {
        let (store, account) = store_with_account();
        let tag = store.create_tag(account, "doomed").unwrap();
        let mut draft = ItemDraft::new("short-lived");
        draft.tag_ids = vec![tag.id];
        let item = store.create_item(account, &draft).unwrap();

        assert!(store.delete_item(account, item.id).unwrap());
        assert!(!store.delete_item(account, item.id).unwrap());

        // Tag survives, association is gone
        assert_eq!(store.list_tags(account).unwrap().len(), 1);
        let filter = ItemFilter {
            tag_id: Some(tag.id),
            ..ItemFilter::default()
        };
        assert!(store.list_items(account, &filter).unwrap().is_empty());
    }

    #[test]
    fn test_reorder_transactional_and_scoped() {
        let (store, account) = store_with_account();
        let other = store.create_account("mallory").unwrap();

        let a = store.create_item(account, &ItemDraft::new("a")).unwrap();
        let b = store.create_item(account, &ItemDraft::new("b")).unwrap();
        let foreign = store.create_item(other, &ItemDraft::new("x")).unwrap();

        let applied = store
            .reorder_items(
                account,
                &[
                    OrderEntry { id: b.id, order_index: 0 },
                    OrderEntry { id: a.id, order_index: 1 },
                    OrderEntry { id: foreign.id, order_index: 2 },
                ],
            )
            .unwrap();

        // Foreign id silently skipped
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().all(|e| e.id != foreign.id));

        let items = store.list_items(account, &ItemFilter::default()).unwrap();
        assert_eq!(items[0].id, b.id);
        assert_eq!(items[1].id, a.id);

        // Other account untouched
        let theirs = store.get_item(other, foreign.id).unwrap().unwrap();
        assert_eq!(theirs.order_index, 0);
    }

    #[test]
    fn test_list_filters() {
        let (store, account) = store_with_account();
        let category = store.create_category(account, "Home", "#112233").unwrap();
        let tag = store.create_tag(account, "errand").unwrap();

        let mut groceries = ItemDraft::new("Buy groceries");
        groceries.category_id = Some(category.id);
        groceries.tag_ids = vec![tag.id];
        groceries.priority = Some(Priority::Medium);
        store.create_item(account, &groceries).unwrap();

        let chores = store.create_item(account, &ItemDraft::new("Laundry")).unwrap();
        store
            .update_item(
                account,
                chores.id,
                &ItemPatch {
                    completed: Some(true),
                    ..ItemPatch::default()
                },
            )
            .unwrap();

        let by_category = ItemFilter {
            category_id: Some(category.id),
            ..ItemFilter::default()
        };
        assert_eq!(store.list_items(account, &by_category).unwrap().len(), 1);

        let by_tag = ItemFilter {
            tag_id: Some(tag.id),
            ..ItemFilter::default()
        };
        assert_eq!(store.list_items(account, &by_tag).unwrap().len(), 1);

        let by_priority = ItemFilter {
            priority: Some(Priority::Medium),
            ..ItemFilter::default()
        };
        assert_eq!(store.list_items(account, &by_priority).unwrap().len(), 1);

        let open_only = ItemFilter {
            completed: Some(false),
            ..ItemFilter::default()
        };
        assert_eq!(store.list_items(account, &open_only).unwrap().len(), 1);

        let by_search = ItemFilter {
            search: Some("GROC".to_string()),
            ..ItemFilter::default()
        };
        let found = store.list_items(account, &by_search).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Buy groceries");
    }

    #[test]
    fn test_category_delete_nullifies_items() {
        let (store, account) = store_with_account();
        let category = store.create_category(account, "Transient", "#445566").unwrap();

        let mut draft = ItemDraft::new("orphan-to-be");
        draft.category_id = Some(category.id);
        let item = store.create_item(account, &draft).unwrap();
        assert_eq!(item.category_id, Some(category.id));

        assert!(store.delete_category(account, category.id).unwrap());

        let reread = store.get_item(account, item.id).unwrap().unwrap();
        assert_eq!(reread.category_id, None);
    }

    #[test]
    fn test_tag_name_unique_per_account() {
        let (store, account) = store_with_account();
        let other = store.create_account("bob").unwrap();

        store.create_tag(account, "chores").unwrap();
        let dup = store.create_tag(account, "chores");
        assert!(matches!(dup, Err(StoreError::Duplicate)));

        // Same name under another account is fine
        assert!(store.create_tag(other, "chores").is_ok());
        assert_eq!(store.list_tags(account).unwrap().len(), 1);
    }

    #[test]
    fn test_tag_delete_cascades_associations() {
        let (store, account) = store_with_account();
        let tag = store.create_tag(account, "fleeting").unwrap();
        let mut draft = ItemDraft::new("still here");
        draft.tag_ids = vec![tag.id];
        let item = store.create_item(account, &draft).unwrap();

        assert!(store.delete_tag(account, tag.id).unwrap());

        let reread = store.get_item(account, item.id).unwrap().unwrap();
        assert!(reread.tags.is_empty());
    }

    #[test]
    fn test_account_delete_cascades_everything() {
        let (store, account) = store_with_account();
        store.create_category(account, "C", "#000000").unwrap();
        store.create_tag(account, "t").unwrap();
        store.create_item(account, &ItemDraft::new("i")).unwrap();

        assert!(store.delete_account(account).unwrap());

        assert!(store.list_items(account, &ItemFilter::default()).unwrap().is_empty());
        assert!(store.list_categories(account).unwrap().is_empty());
        assert!(store.list_tags(account).unwrap().is_empty());
    }
}
