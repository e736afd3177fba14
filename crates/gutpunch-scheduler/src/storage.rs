use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::{debug, error};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    time::MonotonicClock,
};

/// The two tables the gateway knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Jobs,
    Queues,
}

const JOB_COLUMNS: &[&str] = &[
    "job_id",
    "queue_id",
    "job_name",
    "parameters",
    "status",
    "scheduled_time",
    "retries",
    "max_retries",
    "started_at",
    "completed_at",
    "created_at",
    "updated_at",
];

const QUEUE_COLUMNS: &[&str] = &[
    "queue_id",
    "name",
    "description",
    "priority",
    "enqueued",
    "enqueued_at",
    "created_at",
];

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Jobs => "jobs",
            Table::Queues => "queues",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Jobs => JOB_COLUMNS,
            Table::Queues => QUEUE_COLUMNS,
        }
    }

    pub fn primary_key(self) -> &'static str {
        match self {
            Table::Jobs => "job_id",
            Table::Queues => "queue_id",
        }
    }

    /// Column names are spliced into SQL text, so only known ones pass.
    pub fn check(self, column: &str) -> Result<()> {
        if self.columns().contains(&column) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidColumn {
                table: self.name(),
                column: column.to_string(),
            })
        }
    }
}

/// Conjunction of `column = value` conditions. `Value::Null` matches `IS NULL`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Render ` WHERE ...` (or nothing) and collect the bound values.
    fn render(&self, table: Table, params: &mut Vec<Value>) -> Result<String> {
        if self.clauses.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(self.clauses.len());
        for (column, value) in &self.clauses {
            table.check(column)?;
            if matches!(value, Value::Null) {
                parts.push(format!("{column} IS NULL"));
            } else {
                params.push(value.clone());
                parts.push(format!("{column} = ?{}", params.len()));
            }
        }
        Ok(format!(" WHERE {}", parts.join(" AND ")))
    }
}

/// Single shared SQLite connection for every repository.
///
/// Statements are serialised through the `Mutex`, which gives the
/// single-writer semantics an embedded single-file store expects. After
/// [`Gateway::close`] every call fails with [`SchedulerError::StorageClosed`].
pub struct Gateway {
    conn: Mutex<Option<Connection>>,
    clock: MonotonicClock,
}

impl Gateway {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            clock: MonotonicClock::new(),
        })
    }

    /// Open (or create) a file-backed store with WAL journaling.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        debug!(path = %path.as_ref().display(), "storage gateway opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Source of every `*_at` timestamp written through this gateway.
    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic while holding the lock can't leave a rusqlite Connection in
        // a torn state, so a poisoned guard is still usable.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` against the live connection, logging any failure.
    pub fn with_conn<T>(&self, op: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(SchedulerError::StorageClosed)?;
        f(conn).map_err(|e| {
            error!(op, "storage operation failed: {e}");
            e
        })
    }

    /// Insert one row and return its generated primary key.
    pub fn insert(&self, table: Table, record: &[(&str, Value)]) -> Result<i64> {
        let mut columns = Vec::with_capacity(record.len());
        for (column, _) in record {
            table.check(column)?;
            columns.push(*column);
        }
        let placeholders: Vec<String> = (1..=record.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name(),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.with_conn("insert", |conn| {
            conn.execute(&sql, params_from_iter(record.iter().map(|(_, v)| v)))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Select every column of matching rows, ordered ascending by `order_by`.
    pub fn select<T, F>(
        &self,
        table: Table,
        filter: &Filter,
        order_by: &[&str],
        mut map: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut params = Vec::new();
        let where_clause = filter.render(table, &mut params)?;
        let order_clause = render_order(table, order_by)?;
        let sql = format!(
            "SELECT {} FROM {}{}{}",
            table.columns().join(", "),
            table.name(),
            where_clause,
            order_clause
        );
        self.with_conn("select", |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| map(row))?
                .collect::<rusqlite::Result<Vec<T>>>()?;
            Ok(rows)
        })
    }

    /// First matching row, if any.
    pub fn select_one<T, F>(
        &self,
        table: Table,
        filter: &Filter,
        map: F,
    ) -> Result<Option<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let rows = self.select(table, filter, &[table.primary_key()], map)?;
        Ok(rows.into_iter().next())
    }

    /// `UPDATE table SET ... WHERE ...`; returns the affected row count.
    pub fn update(
        &self,
        table: Table,
        assignments: &[(&str, Value)],
        filter: &Filter,
    ) -> Result<usize> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let mut params = Vec::with_capacity(assignments.len());
        let mut sets = Vec::with_capacity(assignments.len());
        for (column, value) in assignments {
            table.check(column)?;
            params.push(value.clone());
            sets.push(format!("{column} = ?{}", params.len()));
        }
        let where_clause = filter.render(table, &mut params)?;
        let sql = format!("UPDATE {} SET {}{}", table.name(), sets.join(", "), where_clause);
        self.with_conn("update", |conn| {
            Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
        })
    }

    /// Hard delete of matching rows; returns the affected row count.
    pub fn delete(&self, table: Table, filter: &Filter) -> Result<usize> {
        let mut params = Vec::new();
        let where_clause = filter.render(table, &mut params)?;
        let sql = format!("DELETE FROM {}{}", table.name(), where_clause);
        self.with_conn("delete", |conn| {
            Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
        })
    }

    /// Arbitrary parameterised query, for predicates `select` can't express.
    pub fn query_raw<T, F>(&self, sql: &str, params: &[Value], mut map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn("query_raw", |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| map(row))?
                .collect::<rusqlite::Result<Vec<T>>>()?;
            Ok(rows)
        })
    }

    /// Arbitrary parameterised statement; returns the affected row count.
    pub fn execute_raw(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.with_conn("execute_raw", |conn| {
            Ok(conn.execute(sql, params_from_iter(params.iter()))?)
        })
    }

    /// Release the connection. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        if let Some(conn) = guard.take() {
            if let Err((conn, e)) = conn.close() {
                error!("failed to close storage gateway: {e}");
                *guard = Some(conn);
                return Err(e.into());
            }
            debug!("storage gateway closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

fn render_order(table: Table, order_by: &[&str]) -> Result<String> {
    if order_by.is_empty() {
        return Ok(String::new());
    }
    for column in order_by {
        table.check(column)?;
    }
    Ok(format!(" ORDER BY {}", order_by.join(", ")))
}
