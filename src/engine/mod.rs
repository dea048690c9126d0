//! Storage Engine - the row/column store capability interface
//!
//! The address-book layer never talks to a concrete store directly. It consumes:
//! - `StoreFactory`: open/create a store at a path, move a damaged store aside
//! - `RowStore`: tokens, rows, string cells, table cursors, member row-sets, commit
//!
//! Two engines implement it:
//! - `SqliteStore` keeps rows and cells in a SQLite file
//! - `MemoryStore` keeps everything in process, with fault injection for tests

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub use memory::{MemoryFactory, MemoryStore};
pub use sqlite::{SqliteFactory, SqliteStore};

/// Engine-native identifier for a named column, row scope or table kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Token(pub u32);

/// Row identifier, unique within a row scope.
pub type RowId = u32;

/// Object id of a row: the scope it lives in plus its id within that scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    pub scope: Token,
    pub id: RowId,
}

impl Oid {
    pub fn new(scope: Token, id: RowId) -> Self {
        Self { scope, id }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope.0, self.id)
    }
}

/// Failures reported by a storage engine
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no store at {0}")]
    NotFound(PathBuf),

    #[error("store {0} is locked")]
    Locked(PathBuf),

    #[error("store {0} is corrupt: {1}")]
    Corrupt(PathBuf, String),

    #[error("row {0} is unreadable: {1}")]
    RowUnreadable(Oid, String),

    #[error("{0}")]
    Failure(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// An open row/column store.
///
/// Tables are ordered row-sets: `table_row_at` walks them in the order rows
/// were added, which is the native order every enumeration preserves.
/// Positional lookups are expected to be cheap, since enumerators step one
/// position at a time. List
/// rows additionally own a member row-set that refers to other rows by oid;
/// members are not required to still exist.
pub trait RowStore: Send {
    /// Resolve a name to its token, creating the token if it is new.
    fn string_to_token(&mut self, name: &str) -> StoreResult<Token>;

    fn has_row(&self, oid: Oid) -> StoreResult<bool>;

    /// Create a row and append it to `table`. Creating an existing row is a no-op.
    fn new_row(&mut self, table: Token, oid: Oid) -> StoreResult<()>;

    fn cell(&self, oid: Oid, column: Token) -> StoreResult<Option<String>>;

    fn set_cell(&mut self, oid: Oid, column: Token, value: &str) -> StoreResult<()>;

    /// Drop a cell so it reads as absent. Removing a missing cell is a no-op.
    fn remove_cell(&mut self, oid: Oid, column: Token) -> StoreResult<()>;

    fn table_len(&self, table: Token) -> StoreResult<usize>;

    fn table_row_at(&self, table: Token, pos: usize) -> StoreResult<Option<Oid>>;

    fn members_len(&self, list: Oid) -> StoreResult<usize>;

    fn member_at(&self, list: Oid, pos: usize) -> StoreResult<Option<Oid>>;

    fn push_member(&mut self, list: Oid, member: Oid) -> StoreResult<()>;

    /// Flush pending changes to durable storage.
    fn commit(&mut self) -> StoreResult<()>;
}

/// Opens stores by path.
pub trait StoreFactory: Send + Sync {
    /// Open the store at `path`.
    ///
    /// Fails with `NotFound` when nothing exists there and `create` is false,
    /// `Locked` when another holder has the file, `Corrupt` when the file
    /// exists but is structurally unusable.
    fn open(&self, path: &Path, create: bool) -> StoreResult<Box<dyn RowStore>>;

    fn exists(&self, path: &Path) -> bool;

    /// Move a damaged store to `to`. The contents are kept, never deleted.
    fn rename_aside(&self, from: &Path, to: &Path) -> StoreResult<()>;
}
