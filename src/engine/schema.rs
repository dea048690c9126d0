//! SQLite layout used by `SqliteStore`

/// Token names, one row per interned name
pub const CREATE_TOKENS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
)
"#;

/// Every row that exists, by oid
pub const CREATE_ROWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rows (
    scope INTEGER NOT NULL,
    row_id INTEGER NOT NULL,
    PRIMARY KEY (scope, row_id)
)
"#;

/// Ordered row-sets. `pos` is the native order of a table, dense from 0.
pub const CREATE_TABLE_ROWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS table_rows (
    table_kind INTEGER NOT NULL,
    pos INTEGER NOT NULL,
    scope INTEGER NOT NULL,
    row_id INTEGER NOT NULL,
    PRIMARY KEY (table_kind, pos),
    UNIQUE (table_kind, scope, row_id)
)
"#;

/// String cells
pub const CREATE_CELLS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cells (
    scope INTEGER NOT NULL,
    row_id INTEGER NOT NULL,
    column_token INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (scope, row_id, column_token)
)
"#;

/// Member row-sets of list rows, `pos` dense from 0. Members may refer to rows
/// that no longer exist.
pub const CREATE_MEMBERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS members (
    list_scope INTEGER NOT NULL,
    list_id INTEGER NOT NULL,
    pos INTEGER NOT NULL,
    member_scope INTEGER NOT NULL,
    member_id INTEGER NOT NULL,
    PRIMARY KEY (list_scope, list_id, pos)
)
"#;

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TOKENS_TABLE,
        CREATE_ROWS_TABLE,
        CREATE_TABLE_ROWS_TABLE,
        CREATE_CELLS_TABLE,
        CREATE_MEMBERS_TABLE,
    ]
}
