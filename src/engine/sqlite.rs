//! SQLite-backed row/column store

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};

use super::schema;
use super::{Oid, RowStore, StoreError, StoreFactory, StoreResult, Token};

/// Row/column store kept in a SQLite file.
///
/// The connection holds an exclusive lock on the file from open until it is
/// dropped; any other connection fails with `Locked`. Writes open an immediate
/// transaction that stays open until `commit`, so a store dropped without
/// committing loses its pending changes.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    in_tx: bool,
}

impl SqliteStore {
    /// Open an existing database file, or create it
    pub fn open(path: &Path) -> StoreResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| classify(path, e))?;
        Self::init(conn, path.to_path_buf())
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> StoreResult<Self> {
        // Lock contention is reported to the caller, never waited out.
        conn.busy_timeout(Duration::ZERO).map_err(|e| classify(&path, e))?;

        // Once taken, file locks are kept until the connection closes.
        conn.query_row("PRAGMA locking_mode = EXCLUSIVE", [], |row| row.get::<_, String>(0))
            .map_err(|e| classify(&path, e))?;

        // The first real read is where SQLite notices a damaged or foreign file.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| classify(&path, e))?;

        // Take the exclusive lock now, so a second holder fails at open.
        conn.execute_batch("BEGIN EXCLUSIVE").map_err(|e| classify(&path, e))?;
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, []).map_err(|e| classify(&path, e))?;
        }
        conn.execute_batch("COMMIT").map_err(|e| classify(&path, e))?;

        Ok(Self {
            conn,
            path,
            in_tx: false,
        })
    }

    fn begin(&mut self) -> rusqlite::Result<()> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_tx = true;
        }
        Ok(())
    }

    fn err(&self, e: rusqlite::Error) -> StoreError {
        classify(&self.path, e)
    }

    fn lookup_token(&self, name: &str) -> rusqlite::Result<Option<u32>> {
        self.conn
            .query_row("SELECT id FROM tokens WHERE name = ?1", [name], |row| row.get(0))
            .optional()
    }

    fn insert_token(&mut self, name: &str) -> rusqlite::Result<u32> {
        self.begin()?;
        self.conn.execute("INSERT INTO tokens (name) VALUES (?1)", [name])?;
        Ok(self.conn.last_insert_rowid() as u32)
    }

    fn insert_row(&mut self, table: Token, oid: Oid) -> rusqlite::Result<()> {
        self.begin()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO rows (scope, row_id) VALUES (?1, ?2)",
            params![oid.scope.0, oid.id],
        )?;
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO table_rows (table_kind, pos, scope, row_id)
            SELECT ?1, COALESCE(MAX(pos) + 1, 0), ?2, ?3 FROM table_rows WHERE table_kind = ?1
            "#,
            params![table.0, oid.scope.0, oid.id],
        )?;
        Ok(())
    }

    fn write_cell(&mut self, oid: Oid, column: Token, value: &str) -> rusqlite::Result<()> {
        self.begin()?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO cells (scope, row_id, column_token, value)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![oid.scope.0, oid.id, column.0, value],
        )?;
        Ok(())
    }

    fn delete_cell(&mut self, oid: Oid, column: Token) -> rusqlite::Result<()> {
        self.begin()?;
        self.conn.execute(
            "DELETE FROM cells WHERE scope = ?1 AND row_id = ?2 AND column_token = ?3",
            params![oid.scope.0, oid.id, column.0],
        )?;
        Ok(())
    }

    fn append_member(&mut self, list: Oid, member: Oid) -> rusqlite::Result<()> {
        self.begin()?;
        self.conn.execute(
            r#"
            INSERT INTO members (list_scope, list_id, pos, member_scope, member_id)
            SELECT ?1, ?2, COALESCE(MAX(pos) + 1, 0), ?3, ?4 FROM members
            WHERE list_scope = ?1 AND list_id = ?2
            "#,
            params![list.scope.0, list.id, member.scope.0, member.id],
        )?;
        Ok(())
    }

    fn row_to_oid(row: &rusqlite::Row) -> rusqlite::Result<Oid> {
        Ok(Oid::new(Token(row.get(0)?), row.get(1)?))
    }
}

impl RowStore for SqliteStore {
    fn string_to_token(&mut self, name: &str) -> StoreResult<Token> {
        if let Some(id) = self.lookup_token(name).map_err(|e| self.err(e))? {
            return Ok(Token(id));
        }
        let id = self.insert_token(name).map_err(|e| self.err(e))?;
        Ok(Token(id))
    }

    fn has_row(&self, oid: Oid) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM rows WHERE scope = ?1 AND row_id = ?2",
                params![oid.scope.0, oid.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::RowUnreadable(oid, e.to_string()))?;
        Ok(found.is_some())
    }

    fn new_row(&mut self, table: Token, oid: Oid) -> StoreResult<()> {
        self.insert_row(table, oid).map_err(|e| self.err(e))
    }

    fn cell(&self, oid: Oid, column: Token) -> StoreResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM cells WHERE scope = ?1 AND row_id = ?2 AND column_token = ?3",
                params![oid.scope.0, oid.id, column.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.err(e))
    }

    fn set_cell(&mut self, oid: Oid, column: Token, value: &str) -> StoreResult<()> {
        self.write_cell(oid, column, value).map_err(|e| self.err(e))
    }

    fn remove_cell(&mut self, oid: Oid, column: Token) -> StoreResult<()> {
        self.delete_cell(oid, column).map_err(|e| self.err(e))
    }

    fn table_len(&self, table: Token) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM table_rows WHERE table_kind = ?1",
                [table.0],
                |row| row.get(0),
            )
            .map_err(|e| self.err(e))?;
        Ok(count as usize)
    }

    fn table_row_at(&self, table: Token, pos: usize) -> StoreResult<Option<Oid>> {
        self.conn
            .query_row(
                "SELECT scope, row_id FROM table_rows WHERE table_kind = ?1 AND pos = ?2",
                params![table.0, pos as i64],
                Self::row_to_oid,
            )
            .optional()
            .map_err(|e| self.err(e))
    }

    fn members_len(&self, list: Oid) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM members WHERE list_scope = ?1 AND list_id = ?2",
                params![list.scope.0, list.id],
                |row| row.get(0),
            )
            .map_err(|e| self.err(e))?;
        Ok(count as usize)
    }

    fn member_at(&self, list: Oid, pos: usize) -> StoreResult<Option<Oid>> {
        self.conn
            .query_row(
                r#"
                SELECT member_scope, member_id FROM members
                WHERE list_scope = ?1 AND list_id = ?2 AND pos = ?3
                "#,
                params![list.scope.0, list.id, pos as i64],
                Self::row_to_oid,
            )
            .optional()
            .map_err(|e| self.err(e))
    }

    fn push_member(&mut self, list: Oid, member: Oid) -> StoreResult<()> {
        self.append_member(list, member).map_err(|e| self.err(e))
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT").map_err(|e| self.err(e))?;
            self.in_tx = false;
        }
        Ok(())
    }
}

/// Opens `SqliteStore`s from the filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteFactory;

impl StoreFactory for SqliteFactory {
    fn open(&self, path: &Path, create: bool) -> StoreResult<Box<dyn RowStore>> {
        if !path.exists() && !create {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        Ok(Box::new(SqliteStore::open(path)?))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename_aside(&self, from: &Path, to: &Path) -> StoreResult<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }
}

/// Map SQLite failures onto the engine's open-time categories
fn classify(path: &Path, err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Locked(path.to_path_buf())
        }
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StoreError::Corrupt(path.to_path_buf(), err.to_string())
        }
        _ => StoreError::Sqlite(err),
    }
}
