//! # abstore - Address-book storage layer
//!
//! Database-handle-and-schema abstraction over a legacy row/column store.
//!
//! abstore provides:
//! - A session per physical address-book file, shared through a handle cache
//! - Schema tokens resolved once per session and reused for every row access
//! - Materialization of engine rows into owned `Card` values (contacts and lists)
//! - Corruption and lock recovery at open time, with the decision left to the caller
//! - A SQLite-backed engine and an in-memory engine behind one capability interface

pub mod cache;
pub mod card;
pub mod config;
pub mod engine;
pub mod manager;
pub mod materialize;
pub mod recovery;
pub mod schema;
pub mod session;
pub mod ui;

use std::path::PathBuf;

// Re-exports for convenient access
pub use cache::HandleCache;
pub use card::{Card, Value};
pub use engine::{Oid, RowId, Token};
pub use manager::{OpenOptions, Opened, SessionManager};
pub use recovery::{CorruptionReport, RecoveryDecision, RecoveryHandler, RecoveryPolicy};
pub use schema::{Field, FieldKind, SchemaTokens};
pub use session::{CardScope, RowRef, Session, SessionState, Stats};

/// Result type alias for abstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for abstore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No address book at {0}")]
    NotFound(PathBuf),

    #[error("Address book {0} is locked by another process")]
    Locked(PathBuf),

    #[error("Address book {} is corrupt (it can be moved aside to {})", path.display(), backup_path.display())]
    Corrupt { path: PathBuf, backup_path: PathBuf },

    #[error("Could not resolve schema token {name}: {reason}")]
    SchemaInitFailed { name: String, reason: String },

    #[error("Row {row_id} is unreadable: {reason}")]
    RowCorrupt { row_id: RowId, reason: String },

    #[error("Row {0} not found")]
    RowNotFound(RowId),

    #[error("Row {0} already exists")]
    RowExists(RowId),

    #[error("List {list_row_id} has no member at position {position}")]
    MemberMissing { list_row_id: RowId, position: u32 },

    #[error("Index {index} out of range for list of {total} addresses")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("A session for {0} is already registered")]
    DuplicatePath(PathBuf),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Row-level failures that an enumeration skips over instead of aborting
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            Error::RowCorrupt { .. } | Error::RowNotFound(_) | Error::MemberMissing { .. }
        )
    }
}

impl From<engine::StoreError> for Error {
    fn from(err: engine::StoreError) -> Self {
        use engine::StoreError;

        match err {
            StoreError::NotFound(path) => Error::NotFound(path),
            StoreError::Locked(path) => Error::Locked(path),
            StoreError::Corrupt(path, reason) => {
                Error::Engine(format!("{} is corrupt: {}", path.display(), reason))
            }
            StoreError::RowUnreadable(oid, reason) => Error::RowCorrupt {
                row_id: oid.id,
                reason,
            },
            StoreError::Failure(msg) => Error::Engine(msg),
            StoreError::Sqlite(e) => Error::Storage(e),
            StoreError::Io(e) => Error::Io(e),
        }
    }
}
