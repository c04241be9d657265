//! Durable canonical state.
//!
//! One SQLite database holds every account's collections:
//!
//! ```text
//! accounts ──┬── categories          (ON DELETE CASCADE)
//!            ├── items ── item_tags  (category FK: ON DELETE SET NULL)
//!            └── tags  ── item_tags  (both FKs: ON DELETE CASCADE)
//! ```
//!
//! The store is the only writer of canonical rows. Single-row writes are
//! atomic on their own; the multi-row reorder runs inside one transaction.
//! Foreign keys enforce the ownership and cascade/nullify rules so the
//! mutation layer never has to clean up associations by hand.

pub mod sqlite;

pub use sqlite::{Store, StoreError};
