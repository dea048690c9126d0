//! Handle Cache - registry of open sessions keyed by canonical path
//!
//! At most one live `Session` exists per physical file. The cache is plain
//! bookkeeping: it never opens, flushes or closes an engine handle. Callers
//! serialize `find` + `register` themselves; the pair is not atomic.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::session::Session;
use crate::{Error, Result};

/// Canonical form of a database path, used as the cache key.
///
/// Existing files resolve through the filesystem (symlinks, `..`). Paths that
/// do not exist yet are made absolute and normalized lexically. Windows paths
/// compare case-insensitively, so they are lower-cased there.
pub fn canonical_path(path: &Path) -> PathBuf {
    let resolved = match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) => normalize_lexically(path),
    };

    if cfg!(windows) {
        PathBuf::from(resolved.to_string_lossy().to_lowercase().replace('/', "\\"))
    } else {
        resolved
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    // A missing file may still live in an existing directory whose
    // canonical form differs (e.g. a symlinked temp dir).
    if let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) {
        if let Ok(parent) = std::fs::canonicalize(parent) {
            return parent.join(name);
        }
    }
    normalized
}

/// Process-wide registry of open sessions, owned by a `SessionManager`.
#[derive(Default)]
pub struct HandleCache {
    entries: Mutex<HashMap<PathBuf, Session>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Session>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the live session for `path`, if any
    pub fn find(&self, path: &Path) -> Option<Session> {
        let key = canonical_path(path);
        let found = self.entries().get(&key).cloned();
        if found.is_some() {
            tracing::debug!("Handle cache hit for {}", key.display());
        }
        found
    }

    /// Register a newly opened session under its canonical path
    pub fn register(&self, session: &Session) -> Result<()> {
        let mut entries = self.entries();
        let key = session.path().to_path_buf();
        if entries.contains_key(&key) {
            return Err(Error::DuplicatePath(key));
        }
        entries.insert(key, session.clone());
        Ok(())
    }

    /// Unregister `session`. Returns false if it was not the registered entry.
    pub fn remove(&self, session: &Session) -> bool {
        let mut entries = self.entries();
        match entries.get(session.path()) {
            Some(registered) if registered.same_session(session) => {
                entries.remove(session.path());
                true
            }
            _ => false,
        }
    }

    /// Unregister everything and hand the sessions back. Nothing is closed.
    pub fn clear_all(&self) -> Vec<Session> {
        self.entries().drain().map(|(_, session)| session).collect()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.entries().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
