//! In-process row/column store
//!
//! A `MemoryFactory` plays the role of a filesystem: each path maps to a
//! committed image that `MemoryStore`s load on open and replace on commit.
//! Like a locked SQLite file, a path has at most one open store at a time.
//! Faults (lock contention, structural corruption, failing token resolution,
//! unreadable rows) can be injected per path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Oid, RowStore, StoreError, StoreFactory, StoreResult, Token};
use crate::cache::canonical_path;

#[derive(Debug, Clone, Default)]
struct Image {
    tokens: Vec<String>,
    rows: HashSet<Oid>,
    tables: HashMap<Token, Vec<Oid>>,
    cells: HashMap<(Oid, Token), String>,
    members: HashMap<Oid, Vec<Oid>>,
}

#[derive(Debug, Default)]
struct MemoryFile {
    image: Image,
    commits: usize,
    /// A `MemoryStore` is open on this file
    held: bool,
    locked: bool,
    corrupt: bool,
    failing_tokens: HashSet<String>,
    unreadable_rows: HashSet<Oid>,
}

type SharedFile = Arc<Mutex<MemoryFile>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A store opened from a `MemoryFactory`. Changes are private until `commit`.
pub struct MemoryStore {
    path: PathBuf,
    working: Image,
    file: SharedFile,
}

impl MemoryStore {
    fn check_row(&self, oid: Oid) -> StoreResult<()> {
        if lock(&self.file).unreadable_rows.contains(&oid) {
            return Err(StoreError::RowUnreadable(oid, "injected fault".to_string()));
        }
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        lock(&self.file).held = false;
    }
}

impl RowStore for MemoryStore {
    fn string_to_token(&mut self, name: &str) -> StoreResult<Token> {
        if lock(&self.file).failing_tokens.contains(name) {
            return Err(StoreError::Failure(format!(
                "cannot resolve {} in {}",
                name,
                self.path.display()
            )));
        }
        if let Some(index) = self.working.tokens.iter().position(|t| t == name) {
            return Ok(Token(index as u32 + 1));
        }
        self.working.tokens.push(name.to_string());
        Ok(Token(self.working.tokens.len() as u32))
    }

    fn has_row(&self, oid: Oid) -> StoreResult<bool> {
        self.check_row(oid)?;
        Ok(self.working.rows.contains(&oid))
    }

    fn new_row(&mut self, table: Token, oid: Oid) -> StoreResult<()> {
        if self.working.rows.insert(oid) {
            self.working.tables.entry(table).or_default().push(oid);
        }
        Ok(())
    }

    fn cell(&self, oid: Oid, column: Token) -> StoreResult<Option<String>> {
        self.check_row(oid)?;
        Ok(self.working.cells.get(&(oid, column)).cloned())
    }

    fn set_cell(&mut self, oid: Oid, column: Token, value: &str) -> StoreResult<()> {
        self.working.cells.insert((oid, column), value.to_string());
        Ok(())
    }

    fn remove_cell(&mut self, oid: Oid, column: Token) -> StoreResult<()> {
        self.working.cells.remove(&(oid, column));
        Ok(())
    }

    fn table_len(&self, table: Token) -> StoreResult<usize> {
        Ok(self.working.tables.get(&table).map_or(0, Vec::len))
    }

    fn table_row_at(&self, table: Token, pos: usize) -> StoreResult<Option<Oid>> {
        Ok(self
            .working
            .tables
            .get(&table)
            .and_then(|rows| rows.get(pos))
            .copied())
    }

    fn members_len(&self, list: Oid) -> StoreResult<usize> {
        Ok(self.working.members.get(&list).map_or(0, Vec::len))
    }

    fn member_at(&self, list: Oid, pos: usize) -> StoreResult<Option<Oid>> {
        Ok(self
            .working
            .members
            .get(&list)
            .and_then(|members| members.get(pos))
            .copied())
    }

    fn push_member(&mut self, list: Oid, member: Oid) -> StoreResult<()> {
        self.working.members.entry(list).or_default().push(member);
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let mut file = lock(&self.file);
        file.image = self.working.clone();
        file.commits += 1;
        Ok(())
    }
}

/// Path-keyed set of in-memory stores
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    files: Arc<Mutex<HashMap<PathBuf, SharedFile>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn file(&self, path: &Path) -> Option<SharedFile> {
        lock(&self.files).get(&canonical_path(path)).cloned()
    }

    fn file_or_create(&self, path: &Path) -> SharedFile {
        lock(&self.files)
            .entry(canonical_path(path))
            .or_default()
            .clone()
    }

    /// Simulate another process holding the file
    pub fn set_locked(&self, path: &Path, locked: bool) {
        lock(&self.file_or_create(path)).locked = locked;
    }

    /// Create (or damage) a file so that opening it reports corruption
    pub fn set_corrupt(&self, path: &Path) {
        lock(&self.file_or_create(path)).corrupt = true;
    }

    /// Make resolution of `name` fail in every store opened for `path`
    pub fn fail_token(&self, path: &Path, name: &str) {
        lock(&self.file_or_create(path))
            .failing_tokens
            .insert(name.to_string());
    }

    /// Make every read of `oid` fail
    pub fn poison_row(&self, path: &Path, oid: Oid) {
        lock(&self.file_or_create(path)).unreadable_rows.insert(oid);
    }

    /// Number of commits that reached `path`
    pub fn commits(&self, path: &Path) -> usize {
        self.file(path).map_or(0, |file| lock(&file).commits)
    }

    pub fn is_corrupt(&self, path: &Path) -> bool {
        self.file(path).is_some_and(|file| lock(&file).corrupt)
    }
}

impl StoreFactory for MemoryFactory {
    fn open(&self, path: &Path, create: bool) -> StoreResult<Box<dyn RowStore>> {
        let file = match self.file(path) {
            Some(file) => file,
            None if create => self.file_or_create(path),
            None => return Err(StoreError::NotFound(path.to_path_buf())),
        };

        let working = {
            let mut guard = lock(&file);
            if guard.locked || guard.held {
                return Err(StoreError::Locked(path.to_path_buf()));
            }
            if guard.corrupt {
                return Err(StoreError::Corrupt(
                    path.to_path_buf(),
                    "bad header".to_string(),
                ));
            }
            guard.held = true;
            guard.image.clone()
        };

        Ok(Box::new(MemoryStore {
            path: path.to_path_buf(),
            working,
            file,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.file(path).is_some()
    }

    fn rename_aside(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let mut files = lock(&self.files);
        let file = files
            .remove(&canonical_path(from))
            .ok_or_else(|| StoreError::NotFound(from.to_path_buf()))?;
        files.insert(canonical_path(to), file);
        Ok(())
    }
}
