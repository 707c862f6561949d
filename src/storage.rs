//! Durable detection log.
//!
//! A `PersistenceSink` owns one connection to a backing store. Each source
//! gets its own table, named by `derive_table_id`. Batches are appended in a
//! single transaction and keyed by `DetectionRecord::record_key`, so a batch
//! that is retried after an ambiguous failure never produces duplicates.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use rusqlite::{params, Connection, OpenFlags};
use sha2::{Digest, Sha256};

use crate::buffer::DetectionRecord;
use crate::detect::Detection;
use crate::error::PersistenceError;

/// Namespace prefix for per-source tables.
pub const TABLE_PREFIX: &str = "inference_log_";

/// One column of the detection log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
}

/// Column layout of a detection log table.
pub const DETECTION_COLUMNS: &[Column] = &[
    Column { name: "record_key", sql_type: "TEXT NOT NULL DEFAULT ''" },
    Column { name: "source_id", sql_type: "TEXT NOT NULL DEFAULT ''" },
    Column { name: "run_timestamp", sql_type: "INTEGER NOT NULL DEFAULT 0" },
    Column { name: "run_id", sql_type: "TEXT NOT NULL DEFAULT ''" },
    Column { name: "frame_id", sql_type: "INTEGER NOT NULL DEFAULT 0" },
    Column { name: "time_sec", sql_type: "REAL NOT NULL DEFAULT 0" },
    Column { name: "class_name", sql_type: "TEXT NOT NULL DEFAULT ''" },
    Column { name: "confidence", sql_type: "REAL NOT NULL DEFAULT 0" },
    Column { name: "x_min", sql_type: "INTEGER NOT NULL DEFAULT 0" },
    Column { name: "y_min", sql_type: "INTEGER NOT NULL DEFAULT 0" },
    Column { name: "x_max", sql_type: "INTEGER NOT NULL DEFAULT 0" },
    Column { name: "y_max", sql_type: "INTEGER NOT NULL DEFAULT 0" },
];

/// Backing store for detection records.
pub trait PersistenceSink: Send {
    /// Create the table if needed and add any missing columns. Idempotent.
    fn ensure_schema(&mut self, table_id: &str, columns: &[Column]) -> Result<(), PersistenceError>;

    /// Append `records` atomically. Returns how many were newly stored;
    /// records whose key is already present are skipped.
    fn append_batch(
        &mut self,
        table_id: &str,
        records: &[DetectionRecord],
    ) -> Result<usize, PersistenceError>;

    /// Release the connection. Further calls fail with `Connect`.
    fn close(&mut self) -> Result<(), PersistenceError>;
}

impl<P: PersistenceSink + ?Sized> PersistenceSink for Box<P> {
    fn ensure_schema(&mut self, table_id: &str, columns: &[Column]) -> Result<(), PersistenceError> {
        (**self).ensure_schema(table_id, columns)
    }

    fn append_batch(
        &mut self,
        table_id: &str,
        records: &[DetectionRecord],
    ) -> Result<usize, PersistenceError> {
        (**self).append_batch(table_id, records)
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        (**self).close()
    }
}

fn strip_re() -> &'static Regex {
    static STRIP_RE: OnceLock<Regex> = OnceLock::new();
    STRIP_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]").unwrap())
}

fn table_id_re() -> &'static Regex {
    static TABLE_ID_RE: OnceLock<Regex> = OnceLock::new();
    TABLE_ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9_]{1,128}$").unwrap())
}

/// Longest identifier accepted by `validate_table_id`.
const MAX_TABLE_ID_LEN: usize = 128;
/// Hex digits of the token digest kept when a token is shortened.
const TOKEN_DIGEST_LEN: usize = 16;

/// Stable table identifier for a source path.
///
/// Takes the base filename, maps `.` to `_`, strips everything outside
/// `[A-Za-z0-9_]`, lower-cases and prefixes `TABLE_PREFIX`. Tokens too long
/// for an identifier keep their head and gain a digest of the full token.
pub fn derive_table_id(source_path: &str) -> String {
    let trimmed = source_path.trim_end_matches(['/', '\\']);
    let base = trimmed
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(trimmed);
    let dotted = base.replace('.', "_");
    let token = strip_re().replace_all(&dotted, "").to_lowercase();
    let token = if token.is_empty() {
        "unnamed".to_string()
    } else {
        token
    };
    format!("{}{}", TABLE_PREFIX, shorten_token(token))
}

fn shorten_token(token: String) -> String {
    let max_token = MAX_TABLE_ID_LEN - TABLE_PREFIX.len();
    if token.len() <= max_token {
        return token;
    }
    let digest = hex::encode(Sha256::digest(token.as_bytes()));
    // token is ASCII after stripping, so byte slicing is char-aligned
    let head = &token[..max_token - TOKEN_DIGEST_LEN - 1];
    format!("{}_{}", head, &digest[..TOKEN_DIGEST_LEN])
}

fn validate_table_id(table_id: &str) -> Result<(), PersistenceError> {
    if table_id_re().is_match(table_id) {
        Ok(())
    } else {
        Err(PersistenceError::Schema(format!(
            "invalid table identifier '{}'",
            table_id
        )))
    }
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqlitePersistenceSink {
    conn: Option<Connection>,
}

impl SqlitePersistenceSink {
    /// Open (or create) the database. `file:` URIs are opened in URI mode.
    pub fn open(db_path: &str) -> Result<Self, PersistenceError> {
        let conn = open_db_connection(db_path)
            .map_err(|e| PersistenceError::Connect(format!("{}: {}", db_path, e)))?;
        if !db_path.starts_with("file:") && db_path != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(|e| PersistenceError::Connect(format!("{}: {}", db_path, e)))?;
        }
        Ok(Self { conn: Some(conn) })
    }

    pub fn open_path(path: &Path) -> Result<Self, PersistenceError> {
        Self::open(&path.to_string_lossy())
    }

    fn conn(&mut self) -> Result<&mut Connection, PersistenceError> {
        self.conn
            .as_mut()
            .ok_or_else(|| PersistenceError::Connect("connection closed".into()))
    }

    /// Read back stored records in insertion order.
    pub fn read_records(
        &mut self,
        table_id: &str,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>, PersistenceError> {
        validate_table_id(table_id)?;
        let conn = self.conn()?;
        let sql = format!(
            "SELECT record_key, source_id, run_timestamp, run_id, frame_id, time_sec, \
             class_name, confidence, x_min, y_min, x_max, y_max FROM {} ORDER BY id ASC LIMIT ?1",
            table_id
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit.min(i64::MAX as usize) as i64], |row| {
                Ok(DetectionRecord {
                    record_key: row.get(0)?,
                    source_id: row.get(1)?,
                    run_timestamp: row.get(2)?,
                    run_id: row.get(3)?,
                    detection: Detection {
                        frame_id: row.get::<_, i64>(4)? as u64,
                        time_sec: row.get(5)?,
                        class_name: row.get(6)?,
                        confidence: row.get::<_, f64>(7)? as f32,
                        x_min: row.get(8)?,
                        y_min: row.get(9)?,
                        x_max: row.get(10)?,
                        y_max: row.get(11)?,
                    },
                })
            })
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        let records = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        Ok(records)
    }

    /// Detection log tables present in the database.
    pub fn list_tables(&mut self) -> Result<Vec<String>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| PersistenceError::Schema(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        Ok(names
            .into_iter()
            .filter(|name| name.starts_with(TABLE_PREFIX))
            .collect())
    }
}

impl PersistenceSink for SqlitePersistenceSink {
    fn ensure_schema(&mut self, table_id: &str, columns: &[Column]) -> Result<(), PersistenceError> {
        validate_table_id(table_id)?;
        let conn = self.conn()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT);",
            table_id
        ))
        .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        ensure_columns(conn, table_id, columns)?;
        if columns.iter().any(|c| c.name == "record_key") {
            conn.execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{0}_record_key ON {0}(record_key);",
                table_id
            ))
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        }
        Ok(())
    }

    fn append_batch(
        &mut self,
        table_id: &str,
        records: &[DetectionRecord],
    ) -> Result<usize, PersistenceError> {
        validate_table_id(table_id)?;
        let conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| PersistenceError::Insert(e.to_string()))?;
        let mut inserted = 0usize;
        {
            let sql = format!(
                r#"
                INSERT OR IGNORE INTO {}(record_key, source_id, run_timestamp, run_id, frame_id,
                    time_sec, class_name, confidence, x_min, y_min, x_max, y_max)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                table_id
            );
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| PersistenceError::Insert(e.to_string()))?;
            for record in records {
                let d = &record.detection;
                let frame_id = i64::try_from(d.frame_id)
                    .map_err(|_| PersistenceError::Insert("frame id exceeds i64 range".into()))?;
                inserted += stmt
                    .execute(params![
                        record.record_key,
                        record.source_id,
                        record.run_timestamp,
                        record.run_id,
                        frame_id,
                        d.time_sec,
                        d.class_name,
                        d.confidence as f64,
                        d.x_min,
                        d.y_min,
                        d.x_max,
                        d.y_max
                    ])
                    .map_err(|e| PersistenceError::Insert(e.to_string()))?;
            }
        }
        tx.commit()
            .map_err(|e| PersistenceError::Insert(e.to_string()))?;
        Ok(inserted)
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| PersistenceError::Connect(e.to_string())),
            None => Ok(()),
        }
    }
}

fn open_db_connection(db_path: &str) -> rusqlite::Result<Connection> {
    if db_path.starts_with("file:") {
        return Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        );
    }
    Connection::open(db_path)
}

/// Add any of `columns` missing from `table`.
fn ensure_columns(conn: &Connection, table: &str, columns: &[Column]) -> Result<(), PersistenceError> {
    let existing = {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| PersistenceError::Schema(e.to_string()))?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        names
    };
    for column in columns {
        if existing.contains(column.name) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {};",
            table, column.name, column.sql_type
        ))
        .map_err(|e| PersistenceError::Schema(e.to_string()))?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<&'static str>,
    records: Vec<DetectionRecord>,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    append_calls: usize,
    closed: bool,
}

/// In-memory store. Clones share state, so a handle kept outside the
/// pipeline can inspect what was committed.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPersistenceSink {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryPersistenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, PersistenceError> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::Connect("in-memory store lock poisoned".into()))
    }

    pub fn records(&self, table_id: &str) -> Vec<DetectionRecord> {
        self.lock()
            .map(|state| {
                state
                    .tables
                    .get(table_id)
                    .map(|t| t.records.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn append_calls(&self) -> usize {
        self.lock().map(|s| s.append_calls).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(false)
    }
}

impl PersistenceSink for InMemoryPersistenceSink {
    fn ensure_schema(&mut self, table_id: &str, columns: &[Column]) -> Result<(), PersistenceError> {
        validate_table_id(table_id)?;
        let mut state = self.lock()?;
        if state.closed {
            return Err(PersistenceError::Connect("connection closed".into()));
        }
        let table = state.tables.entry(table_id.to_string()).or_default();
        for column in columns {
            if !table.columns.contains(&column.name) {
                table.columns.push(column.name);
            }
        }
        Ok(())
    }

    fn append_batch(
        &mut self,
        table_id: &str,
        records: &[DetectionRecord],
    ) -> Result<usize, PersistenceError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(PersistenceError::Connect("connection closed".into()));
        }
        state.append_calls += 1;
        let table = state
            .tables
            .get_mut(table_id)
            .ok_or_else(|| PersistenceError::Insert(format!("no such table: {}", table_id)))?;
        let mut inserted = 0;
        for record in records {
            if table.keys.insert(record.record_key.clone()) {
                table.records.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.lock()?.closed = true;
        Ok(())
    }
}
