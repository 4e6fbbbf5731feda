//! # Stage: SQLite Document Driver
//!
//! ## Responsibility
//! Stores causes and statistics as JSON documents in SQLite.  Columns that
//! queries filter on (`name`, `removed`, statistics keys) are denormalised
//! next to the document so `StatisticsFilter` translates to a
//! parameterised `WHERE` clause.
//!
//! ## Guarantees
//! - One serialised writer connection; every call takes the lock briefly
//! - Schema versioned with `PRAGMA user_version`
//! - Listing order is insertion order (`rowid`)

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};

use super::document::{CauseQuery, DocumentDriver};
use crate::error::StorageError;
use crate::model::{FailureCause, Statistics, StatisticsFilter, Tombstone};

const BACKEND: &str = "sqlite";

const MIGRATIONS: &[(&str, u32)] = &[(V001_INITIAL, 1)];

const V001_INITIAL: &str = "
CREATE TABLE IF NOT EXISTS failure_causes (
    id       TEXT PRIMARY KEY,
    name     TEXT NOT NULL,
    removed  INTEGER NOT NULL DEFAULT 0,
    doc      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_failure_causes_removed ON failure_causes(removed);

CREATE TABLE IF NOT EXISTS statistics (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    project_name  TEXT NOT NULL,
    build_number  INTEGER NOT NULL,
    start_time    INTEGER NOT NULL,
    result        TEXT NOT NULL,
    master        TEXT NOT NULL,
    node_name     TEXT NOT NULL,
    doc           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_statistics_project_time ON statistics(project_name, start_time);
";

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::query(BACKEND, e)
}

fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current: u32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| StorageError::MigrationFailed {
            version: 0,
            message: e.to_string(),
        })?;
    for (sql, version) in MIGRATIONS {
        if current < *version {
            conn.execute_batch(sql).map_err(|e| StorageError::MigrationFailed {
                version: *version,
                message: e.to_string(),
            })?;
            conn.pragma_update(None, "user_version", version)
                .map_err(|e| StorageError::MigrationFailed {
                    version: *version,
                    message: e.to_string(),
                })?;
            tracing::info!(version = version, "applied knowledge base migration");
        }
    }
    Ok(())
}

pub struct SqliteDriver {
    conn: Mutex<Connection>,
}

impl SqliteDriver {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::connection(BACKEND, e))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(|e| StorageError::connection(BACKEND, e))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::connection(BACKEND, e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::query(BACKEND, "connection lock poisoned"))?;
        f(&guard)
    }

    pub fn schema_version(&self) -> Result<u32, StorageError> {
        self.with_conn(|conn| {
            conn.pragma_query_value(None, "user_version", |row| row.get(0))
                .map_err(sql_err)
        })
    }
}

fn decode_cause(doc: String) -> Result<FailureCause, StorageError> {
    Ok(serde_json::from_str(&doc)?)
}

/// Translate a statistics filter into a `WHERE` clause and its parameters.
fn statistics_where(filter: &StatisticsFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(p) = &filter.project_name {
        clauses.push("project_name = ?".into());
        args.push(Box::new(p.clone()));
    }
    if !filter.build_numbers.is_empty() {
        let marks = vec!["?"; filter.build_numbers.len()].join(", ");
        clauses.push(format!("build_number IN ({marks})"));
        for n in &filter.build_numbers {
            args.push(Box::new(*n as i64));
        }
    }
    if let Some(t) = filter.since {
        clauses.push("start_time >= ?".into());
        args.push(Box::new(t as i64));
    }
    if let Some(t) = filter.until {
        clauses.push("start_time < ?".into());
        args.push(Box::new(t as i64));
    }
    if let Some(r) = filter.result {
        clauses.push("result = ?".into());
        args.push(Box::new(r.to_string()));
    }
    if let Some(r) = filter.exclude_result {
        clauses.push("result != ?".into());
        args.push(Box::new(r.to_string()));
    }
    if let Some(m) = &filter.master {
        clauses.push("master = ?".into());
        args.push(Box::new(m.clone()));
    }
    if let Some(n) = &filter.node_name {
        clauses.push("node_name = ?".into());
        args.push(Box::new(n.clone()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

impl DocumentDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn get(&self, id: &str) -> Result<Option<FailureCause>, StorageError> {
        self.with_conn(|conn| {
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM failure_causes WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(sql_err)?;
            doc.map(decode_cause).transpose()
        })
    }

    fn find(&self, query: &CauseQuery) -> Result<Vec<FailureCause>, StorageError> {
        self.with_conn(|conn| {
            let mut sql = String::from("SELECT doc FROM failure_causes WHERE 1 = 1");
            let mut args: Vec<Box<dyn ToSql>> = Vec::new();
            if !query.include_removed {
                sql.push_str(" AND removed = 0");
            }
            if let Some(cat) = &query.category {
                sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(doc, '$.categories') WHERE value = ?)");
                args.push(Box::new(cat.clone()));
            }
            sql.push_str(" ORDER BY rowid");

            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let docs = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            docs.into_iter().map(decode_cause).collect()
        })
    }

    fn insert(&self, cause: &FailureCause) -> Result<(), StorageError> {
        let doc = serde_json::to_string(cause)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO failure_causes (id, name, removed, doc) VALUES (?1, ?2, ?3, ?4)",
                params![cause.id, cause.name, cause.is_removed(), doc],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    fn update(&self, cause: &FailureCause) -> Result<bool, StorageError> {
        let doc = serde_json::to_string(cause)?;
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE failure_causes SET name = ?2, removed = ?3, doc = ?4 WHERE id = ?1",
                    params![cause.id, cause.name, cause.is_removed(), doc],
                )
                .map_err(sql_err)?;
            Ok(n > 0)
        })
    }

    fn tombstone(&self, id: &str, tombstone: &Tombstone) -> Result<Option<FailureCause>, StorageError> {
        let stone = serde_json::to_string(tombstone)?;
        self.with_conn(|conn| {
            let doc: Option<String> = conn
                .query_row(
                    "UPDATE failure_causes SET removed = 1, doc = json_set(doc, '$.removed', json(?2))
                     WHERE id = ?1 RETURNING doc",
                    params![id, stone],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            doc.map(decode_cause).transpose()
        })
    }

    fn touch_last_occurred(&self, id: &str, time: u64) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE failure_causes SET doc = json_set(doc, '$.lastOccurred', ?2)
                     WHERE id = ?1
                       AND (json_extract(doc, '$.lastOccurred') IS NULL
                            OR json_extract(doc, '$.lastOccurred') < ?2)",
                    params![id, time as i64],
                )
                .map_err(sql_err)?;
            Ok(n > 0)
        })
    }

    fn append_statistics(&self, stat: &Statistics) -> Result<(), StorageError> {
        let doc = serde_json::to_string(stat)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO statistics (project_name, build_number, start_time, result, master, node_name, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stat.project_name,
                    stat.build_number as i64,
                    stat.start_time as i64,
                    stat.result,
                    stat.master,
                    stat.node_name,
                    doc
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    fn find_statistics(&self, filter: &StatisticsFilter, limit: Option<usize>) -> Result<Vec<Statistics>, StorageError> {
        let (where_clause, mut args) = statistics_where(filter);
        let mut sql = format!("SELECT doc FROM statistics {where_clause} ORDER BY start_time DESC, seq DESC");
        if let Some(n) = limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(n as i64));
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let docs = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            docs.into_iter()
                .map(|d| serde_json::from_str(&d).map_err(StorageError::from))
                .collect()
        })
    }
}
