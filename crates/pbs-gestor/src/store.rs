// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporting store access.
//!
//! The sink only needs keyed upserts, transactions and a "latest row" query, which is what
//! [`ReportingStore`] exposes. [`SqliteStore`] is the implementation used by the daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension, ToSql};
use tracing::{debug, warn};

use crate::errors::StoreError;

pub const DEFAULT_JOB_TABLE: &str = "pbsjob";
pub const DEFAULT_RESOURCE_TABLE: &str = "pbsjobarr";
pub const DEFAULT_LOG_TABLE: &str = "pbslog";

/// A column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(value) => ToSqlOutput::from(*value),
            Value::Text(value) => ToSqlOutput::from(value.as_str()),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(value) => Value::Integer(value),
            ValueRef::Real(value) => Value::Text(value.to_string()),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

/// Column name to value.
pub type Row = BTreeMap<String, Value>;

/// The tables the ingester writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Job,
    JobResource,
    Log,
}

impl Table {
    /// Surrogate key column of the table.
    #[must_use]
    pub fn id_column(self) -> &'static str {
        match self {
            Table::Job => "ji_pbsjobidx",
            Table::JobResource => "ji_pbsjobarridx",
            Table::Log => "idx",
        }
    }
}

/// Physical table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub job: String,
    pub resource: String,
    pub log: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            job: DEFAULT_JOB_TABLE.to_string(),
            resource: DEFAULT_RESOURCE_TABLE.to_string(),
            log: DEFAULT_LOG_TABLE.to_string(),
        }
    }
}

impl TableNames {
    #[must_use]
    pub fn name(&self, table: Table) -> &str {
        match table {
            Table::Job => &self.job,
            Table::JobResource => &self.resource,
            Table::Log => &self.log,
        }
    }

    /// Checks every name is a plain SQL identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidIdentifier`] for the first name that isn't.
    pub fn validate(&self) -> Result<(), StoreError> {
        for name in [&self.job, &self.resource, &self.log] {
            check_identifier(name)?;
        }
        Ok(())
    }
}

/// Whether `name` can be spliced into SQL as a table or column name.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(name: &str) -> Result<(), StoreError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// What to do when a row with the same key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Replace every non-key column with the new values.
    Overwrite,
    /// Keep the existing row untouched.
    InsertIfAbsent,
}

/// Narrow repository interface over the reporting database.
pub trait ReportingStore {
    /// Cheap liveness probe of the underlying connection.
    fn is_alive(&mut self) -> bool;

    /// Drops any existing connection and opens a new one.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened.
    fn reconnect(&mut self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error when no transaction can be started.
    fn begin(&mut self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error when the open transaction cannot be committed.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error when the open transaction cannot be rolled back.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Inserts `row` unless a row with the same values in `key_columns` exists, in which case
    /// `mode` decides whether the existing row is overwritten. Returns the surrogate id of the
    /// resulting row.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid column names, a key column missing from `row`, or a database
    /// failure.
    fn upsert_by_key(
        &mut self,
        table: Table,
        key_columns: &[&str],
        row: &Row,
        mode: UpsertMode,
    ) -> Result<i64, StoreError>;

    /// Returns the row with the greatest `order_column`, if the table has any.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid column name or a database failure.
    fn query_latest(&mut self, table: Table, order_column: &str)
        -> Result<Option<Row>, StoreError>;
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// `SQLite` backed reporting store.
pub struct SqliteStore {
    location: Location,
    names: TableNames,
    conn: Option<Connection>,
}

impl SqliteStore {
    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if a table name is invalid or the database cannot be opened.
    pub fn open(path: impl AsRef<Path>, names: TableNames) -> Result<Self, StoreError> {
        names.validate()?;
        let location = Location::File(path.as_ref().to_path_buf());
        let conn = connect(&location)?;
        Ok(Self {
            location,
            names,
            conn: Some(conn),
        })
    }

    /// Creates a private in-memory database, mostly useful for tests.
    ///
    /// The data lives as long as the connection: after [`SqliteStore::disconnect`],
    /// [`ReportingStore::reconnect`] fails with [`StoreError::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns an error if a table name is invalid or the database cannot be created.
    pub fn in_memory(names: TableNames) -> Result<Self, StoreError> {
        names.validate()?;
        let location = Location::Memory;
        let conn = connect(&location)?;
        Ok(Self {
            location,
            names,
            conn: Some(conn),
        })
    }

    #[must_use]
    pub fn table_names(&self) -> &TableNames {
        &self.names
    }

    /// Creates the job, resource and log tables if they don't exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Provisioning`] naming the table whose DDL failed.
    pub fn provision(&mut self) -> Result<(), StoreError> {
        let names = self.names.clone();
        let conn = self.conn()?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        for (table, ddl) in [
            (&names.job, job_table_ddl(&names.job)),
            (&names.resource, resource_table_ddl(&names.resource, &names.job)),
            (&names.log, log_table_ddl(&names.log)),
        ] {
            conn.execute_batch(&ddl)
                .map_err(|source| StoreError::Provisioning {
                    table: table.clone(),
                    source,
                })?;
            debug!("Table {} provisioned", table);
        }
        Ok(())
    }

    /// Closes the connection; the next [`ReportingStore::is_alive`] reports false.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Error closing reporting store connection: {}", e);
            }
        }
    }

    /// Looks up a job row by its PBS job id.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn find_job(&mut self, job_id: &str) -> Result<Option<Row>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE ji_jobid = ?1", self.names.job);
        self.select_one(&sql, &[Value::from(job_id)])
    }

    /// Resource name/value pairs stored for a PBS job id, in name order.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn resources_for(&mut self, job_id: &str) -> Result<Vec<(String, String)>, StoreError> {
        let sql = format!(
            "SELECT r.ji_arrresource, r.ji_arrvalue FROM {resource} r \
             JOIN {job} j ON j.ji_pbsjobidx = r.ji_pbsjobidx \
             WHERE j.ji_jobid = ?1 ORDER BY r.ji_arrresource, r.ji_arrvalue",
            resource = self.names.resource,
            job = self.names.job,
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([job_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All checkpoint rows ordered by day.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn checkpoints(&mut self) -> Result<Vec<Row>, StoreError> {
        let sql = format!("SELECT * FROM {} ORDER BY filename", self.names.log);
        self.select_all(&sql, &[])
    }

    /// Number of rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn count_rows(&mut self, table: Table) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.names.name(table));
        let conn = self.conn()?;
        let count = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    fn conn(&mut self) -> Result<&mut Connection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::Disconnected)
    }

    fn select_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let row = stmt
            .query_row(params_from_iter(params.iter()), |row| read_row(row, &columns))
            .optional()?;
        Ok(row)
    }

    fn select_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| read_row(row, &columns))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ReportingStore for SqliteStore {
    fn is_alive(&mut self) -> bool {
        match &self.conn {
            Some(conn) => conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok(),
            None => false,
        }
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        // an in-memory database is gone once its connection closes
        if matches!(self.location, Location::Memory) {
            return match self.conn {
                Some(_) => Ok(()),
                None => Err(StoreError::Disconnected),
            };
        }
        self.disconnect();
        self.conn = Some(connect(&self.location)?);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn()?.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn()?.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn upsert_by_key(
        &mut self,
        table: Table,
        key_columns: &[&str],
        row: &Row,
        mode: UpsertMode,
    ) -> Result<i64, StoreError> {
        for column in row.keys() {
            check_identifier(column)?;
        }
        let mut key_values = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            check_identifier(column)?;
            let value = row
                .get(*column)
                .ok_or_else(|| StoreError::MissingKey((*column).to_string()))?;
            key_values.push(value);
        }

        let table_name = self.names.name(table).to_string();
        let id_column = table.id_column();
        // IS matches NULL keys as equal, like the unique constraints would not
        let filter = key_columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("\"{column}\" IS ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let conn = self.conn()?;

        let existing: Option<i64> = {
            let sql = format!("SELECT {id_column} FROM {table_name} WHERE {filter}");
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.query_row(params_from_iter(key_values.iter()), |r| r.get(0))
                .optional()?
        };

        if let Some(id) = existing {
            let updates: Vec<(&String, &Value)> = row
                .iter()
                .filter(|(column, _)| !key_columns.contains(&column.as_str()))
                .collect();
            if mode == UpsertMode::Overwrite && !updates.is_empty() {
                let assignments = updates
                    .iter()
                    .enumerate()
                    .map(|(i, (column, _))| format!("\"{column}\" = ?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {table_name} SET {assignments} WHERE {id_column} = ?{}",
                    updates.len() + 1
                );
                let mut params: Vec<&dyn ToSql> =
                    updates.iter().map(|(_, value)| *value as &dyn ToSql).collect();
                params.push(&id);
                conn.prepare_cached(&sql)?.execute(params.as_slice())?;
            }
            return Ok(id);
        }

        let columns = row
            .keys()
            .map(|column| format!("\"{column}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=row.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("INSERT INTO {table_name} ({columns}) VALUES ({placeholders})");
        conn.prepare_cached(&sql)?
            .execute(params_from_iter(row.values()))?;
        Ok(conn.last_insert_rowid())
    }

    fn query_latest(
        &mut self,
        table: Table,
        order_column: &str,
    ) -> Result<Option<Row>, StoreError> {
        check_identifier(order_column)?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY \"{order_column}\" DESC LIMIT 1",
            self.names.name(table)
        );
        self.select_one(&sql, &[])
    }
}

const CONNECTION_PRAGMAS: &str = r"
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
";

fn connect(location: &Location) -> Result<Connection, StoreError> {
    let conn = match location {
        Location::File(path) => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?,
        Location::Memory => Connection::open_in_memory()?,
    };
    conn.execute_batch(CONNECTION_PRAGMAS)?;
    Ok(conn)
}

fn read_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Row> {
    let mut values = Row::new();
    for (i, column) in columns.iter().enumerate() {
        values.insert(column.clone(), Value::from(row.get_ref(i)?));
    }
    Ok(values)
}

fn job_table_ddl(table: &str) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS {table} (
    ji_pbsjobidx INTEGER PRIMARY KEY AUTOINCREMENT,
    ji_jobid TEXT NOT NULL UNIQUE,
    ji_jobname TEXT,
    ji_user TEXT,
    ji_group TEXT,
    ji_project TEXT,
    ji_sv_name TEXT,
    ji_queue TEXT,
    ji_priority INTEGER,
    ji_cr_time TEXT,
    ji_quetime TEXT,
    ji_runcount INTEGER,
    ji_eligible_time INTEGER,
    ji_start_time TEXT,
    ji_end_time TEXT,
    ji_sessionid INTEGER,
    ji_exitstat INTEGER,
    ji_exechost TEXT,
    ji_execvnode TEXT,
    ji_event_type TEXT
);
"
    )
}

fn resource_table_ddl(table: &str, job_table: &str) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS {table} (
    ji_pbsjobarridx INTEGER PRIMARY KEY AUTOINCREMENT,
    ji_pbsjobidx INTEGER NOT NULL REFERENCES {job_table}(ji_pbsjobidx),
    ji_arrresource TEXT NOT NULL,
    ji_arrvalue TEXT,
    UNIQUE(ji_pbsjobidx, ji_arrresource, ji_arrvalue)
);
"
    )
}

fn log_table_ddl(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    idx INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    "start" TEXT,
    "end" TEXT
);
"#
    )
}
