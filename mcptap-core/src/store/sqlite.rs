//! Buffered SQLite implementation of [`MessageStore`].
//!
//! Message writes go through a bounded channel into a dedicated writer
//! thread, which batches them into single transactions (flushed when the
//! batch fills or on a periodic tick). The writer owns its own connection;
//! direct operations (sessions, approvals, tool registry, queries) share a
//! second connection behind a mutex — two open connections total, with
//! SQLite's own locking (WAL mode, 5 s busy timeout) arbitrating between
//! them.
//!
//! Flush failures are logged and skipped: message logging is at-most-once by
//! design and must never stall the proxy pumps.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params, params_from_iter};

use crate::Direction;
use crate::jsonrpc::MessageKind;

use super::{
    ApprovalRecord, LogEntry, MessageStore, QueryFilter, Session, Stats, StoreError,
    ToolAnalytics, ToolAnalyticsSummary, ToolRecord,
};

/// Tuning for the buffered writer.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the enqueue channel. Full means drop-with-warning.
    pub write_buffer: usize,
    /// Entries per flush transaction.
    pub batch_size: usize,
    /// Periodic flush tick for partially filled batches.
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_buffer: 1024,
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    session_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    kind TEXT NOT NULL,
    method TEXT,
    msg_id TEXT,
    payload TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    blocked INTEGER NOT NULL DEFAULT 0,
    audit INTEGER NOT NULL DEFAULT 0,
    scrub_count INTEGER NOT NULL DEFAULT 0,
    matched_rules TEXT,
    tool_name TEXT,
    policy_action TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_method ON messages(method);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    command TEXT NOT NULL,
    args TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    session_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    method TEXT,
    tool_name TEXT,
    rule_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    decision TEXT NOT NULL,
    decided_at TEXT
);

CREATE TABLE IF NOT EXISTS tool_registry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    first_seen TEXT NOT NULL,
    UNIQUE(session_id, tool_name)
);
CREATE INDEX IF NOT EXISTS idx_tool_registry_session ON tool_registry(session_id);
CREATE INDEX IF NOT EXISTS idx_tool_registry_tool ON tool_registry(tool_name);
";

/// Columns of a full `messages` row, in scan order.
const ENTRY_COLUMNS: &str = "id, timestamp, session_id, direction, kind, method, msg_id, \
                             payload, size_bytes, blocked, audit, scrub_count, matched_rules, \
                             tool_name, policy_action";

const INSERT_MESSAGE: &str = "INSERT INTO messages (timestamp, session_id, direction, kind, \
                              method, msg_id, payload, size_bytes, blocked, audit, scrub_count, \
                              matched_rules, tool_name, policy_action) \
                              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

/// SQLite-backed message store with a background batch writer.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    writer_tx: Mutex<Option<SyncSender<LogEntry>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStore {
    /// Open (or create) the database, run migrations, and start the writer.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let open_err = |source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        };

        let write_conn = Connection::open(path).map_err(open_err)?;
        apply_pragmas(&write_conn).map_err(open_err)?;
        write_conn.execute_batch(SCHEMA).map_err(open_err)?;
        run_migrations(&write_conn);

        let read_conn = Connection::open(path).map_err(open_err)?;
        apply_pragmas(&read_conn).map_err(open_err)?;

        let (tx, rx) = std::sync::mpsc::sync_channel(config.write_buffer.max(1));
        let batch_size = config.batch_size.max(1);
        let flush_interval = config.flush_interval;
        let handle = std::thread::Builder::new()
            .name("mcptap-store-writer".to_string())
            .spawn(move || writer_loop(write_conn, rx, batch_size, flush_interval))
            .map_err(StoreError::Writer)?;

        Ok(Self {
            conn: Mutex::new(read_conn),
            writer_tx: Mutex::new(Some(tx)),
            writer_handle: Mutex::new(Some(handle)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
}

/// Additive, idempotent migrations for databases created by older builds.
/// `ALTER TABLE … ADD COLUMN` fails on columns that already exist; those
/// errors are expected and ignored.
fn run_migrations(conn: &Connection) {
    for stmt in [
        "ALTER TABLE messages ADD COLUMN audit INTEGER NOT NULL DEFAULT 0",
        "ALTER TABLE messages ADD COLUMN scrub_count INTEGER NOT NULL DEFAULT 0",
        "ALTER TABLE messages ADD COLUMN matched_rules TEXT",
        "ALTER TABLE messages ADD COLUMN tool_name TEXT",
        "ALTER TABLE messages ADD COLUMN policy_action TEXT",
    ] {
        let _ = conn.execute(stmt, []);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background Writer
// ─────────────────────────────────────────────────────────────────────────────

fn writer_loop(
    mut conn: Connection,
    rx: Receiver<LogEntry>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
    loop {
        match rx.recv_timeout(flush_interval) {
            Ok(entry) => {
                batch.push(entry);
                if batch.len() >= batch_size {
                    flush_batch(&mut conn, &mut batch);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() {
                    flush_batch(&mut conn, &mut batch);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !batch.is_empty() {
                    flush_batch(&mut conn, &mut batch);
                }
                return;
            }
        }
    }
}

fn flush_batch(conn: &mut Connection, batch: &mut Vec<LogEntry>) {
    let result = write_batch(conn, batch);
    if let Err(e) = result {
        tracing::error!(error = %e, entries = batch.len(), "message batch flush failed");
    }
    batch.clear();
}

fn write_batch(conn: &mut Connection, batch: &[LogEntry]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_MESSAGE)?;
        for e in batch {
            let matched_rules = if e.matched_rules.is_empty() {
                None
            } else {
                serde_json::to_string(&e.matched_rules).ok()
            };
            let insert = stmt.execute(params![
                format_ts(&e.timestamp),
                e.session_id,
                e.direction.as_str(),
                e.kind.as_str(),
                e.method,
                e.msg_id,
                e.payload,
                e.size_bytes,
                e.blocked as i64,
                e.audit as i64,
                e.scrub_count,
                matched_rules,
                none_if_empty(&e.tool_name),
                none_if_empty(&e.policy_action),
            ]);
            if let Err(err) = insert {
                tracing::error!(error = %err, method = %e.method, "insert message failed");
            }
        }
    }
    tx.commit()
}

fn none_if_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Scanning
// ─────────────────────────────────────────────────────────────────────────────

struct EntryRow {
    id: i64,
    timestamp: String,
    session_id: String,
    direction: String,
    kind: String,
    method: Option<String>,
    msg_id: Option<String>,
    payload: String,
    size_bytes: i64,
    blocked: i64,
    audit: i64,
    scrub_count: i64,
    matched_rules: Option<String>,
    tool_name: Option<String>,
    policy_action: Option<String>,
}

fn scan_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        session_id: row.get(2)?,
        direction: row.get(3)?,
        kind: row.get(4)?,
        method: row.get(5)?,
        msg_id: row.get(6)?,
        payload: row.get(7)?,
        size_bytes: row.get(8)?,
        blocked: row.get(9)?,
        audit: row.get(10)?,
        scrub_count: row.get(11)?,
        matched_rules: row.get(12)?,
        tool_name: row.get(13)?,
        policy_action: row.get(14)?,
    })
}

fn entry_from_row(row: EntryRow) -> Result<LogEntry, StoreError> {
    let direction =
        Direction::from_str_opt(&row.direction).ok_or_else(|| StoreError::Decode {
            column: "direction",
            value: row.direction.clone(),
        })?;
    let kind = MessageKind::from_str_opt(&row.kind).ok_or_else(|| StoreError::Decode {
        column: "kind",
        value: row.kind.clone(),
    })?;
    let matched_rules = row
        .matched_rules
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    Ok(LogEntry {
        id: row.id,
        timestamp: parse_ts(&row.timestamp),
        session_id: row.session_id,
        direction,
        kind,
        method: row.method.unwrap_or_default(),
        msg_id: row.msg_id.unwrap_or_default(),
        payload: row.payload,
        size_bytes: row.size_bytes,
        blocked: row.blocked != 0,
        audit: row.audit != 0,
        scrub_count: row.scrub_count,
        matched_rules,
        tool_name: row.tool_name.unwrap_or_default(),
        policy_action: row.policy_action.unwrap_or_default(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageStore Implementation
// ─────────────────────────────────────────────────────────────────────────────

impl MessageStore for SqliteStore {
    fn log_message(&self, entry: LogEntry) {
        let guard = self
            .writer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(method = %entry.method, "store closed, dropping message");
            return;
        };
        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(method = %entry.method, "write buffer full, dropping message");
            }
            Err(TrySendError::Disconnected(entry)) => {
                tracing::warn!(method = %entry.method, "writer gone, dropping message");
            }
        }
    }

    fn query(&self, filter: &QueryFilter) -> Result<Vec<LogEntry>, StoreError> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(session) = &filter.session_id {
            conditions.push("session_id = ?");
            args.push(session.clone());
        }
        if let Some(direction) = filter.direction {
            conditions.push("direction = ?");
            args.push(direction.as_str().to_string());
        }
        if let Some(method) = &filter.method {
            conditions.push("method = ?");
            args.push(method.clone());
        }
        if let Some(kind) = filter.kind {
            conditions.push("kind = ?");
            args.push(kind.as_str().to_string());
        }
        if let Some(since) = &filter.since {
            conditions.push("timestamp >= ?");
            args.push(format_ts(since));
        }

        let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM messages");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC");

        let limit = if filter.limit > 0 { filter.limit } else { 200 };
        sql.push_str(&format!(" LIMIT {limit}"));
        if filter.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", filter.offset));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), scan_entry_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(entry_from_row(row?)?);
        }
        Ok(entries)
    }

    fn get_message(&self, id: i64) -> Result<Option<LogEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM messages WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], scan_entry_row)?;
        match rows.next() {
            Some(row) => Ok(Some(entry_from_row(row?)?)),
            None => Ok(None),
        }
    }

    fn stats(&self, session_id: Option<&str>) -> Result<Stats, StoreError> {
        let conn = self.conn();
        let mut stats = Stats::default();

        let (where_clause, args): (&str, Vec<String>) = match session_id {
            Some(s) => (" WHERE session_id = ?", vec![s.to_string()]),
            None => ("", Vec::new()),
        };

        let totals_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0), COALESCE(SUM(blocked), 0), \
             COALESCE(SUM(scrub_count), 0), COALESCE(SUM(audit), 0) FROM messages{where_clause}"
        );
        conn.query_row(&totals_sql, params_from_iter(args.iter()), |row| {
            stats.total_messages = row.get(0)?;
            stats.total_bytes = row.get(1)?;
            stats.blocked_count = row.get(2)?;
            stats.scrub_count = row.get(3)?;
            stats.audit_count = row.get(4)?;
            Ok(())
        })?;

        let kinds_sql = format!("SELECT kind, COUNT(*) FROM messages{where_clause} GROUP BY kind");
        let mut stmt = conn.prepare(&kinds_sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            match kind.as_str() {
                "request" => stats.request_count = count,
                "response" => stats.response_count = count,
                "notification" => stats.notification_count = count,
                "error" => stats.error_count = count,
                _ => {}
            }
        }

        let mut method_sql = "SELECT method, COUNT(*) FROM messages \
                              WHERE method IS NOT NULL AND method != ''"
            .to_string();
        if session_id.is_some() {
            method_sql.push_str(" AND session_id = ?");
        }
        method_sql.push_str(" GROUP BY method ORDER BY COUNT(*) DESC LIMIT 20");
        let mut stmt = conn.prepare(&method_sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (method, count) = row?;
            stats.method_counts.insert(method, count);
        }

        Ok(stats)
    }

    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let args_json = serde_json::to_string(&session.args).unwrap_or_else(|_| "[]".to_string());
        self.conn().execute(
            "INSERT INTO sessions (id, started_at, command, args) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.id,
                format_ts(&session.started_at),
                session.command,
                args_json
            ],
        )?;
        Ok(())
    }

    fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE sessions SET ended_at = ?1 WHERE id = ?2",
            params![format_ts(&Utc::now()), session_id],
        )?;
        Ok(())
    }

    fn log_approval(&self, record: &ApprovalRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO approvals (id, timestamp, session_id, direction, method, \
             tool_name, rule_name, payload, decision, decided_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                format_ts(&record.timestamp),
                record.session_id,
                record.direction,
                record.method,
                record.tool_name,
                record.rule_name,
                record.payload,
                record.decision,
                record.decided_at.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn get_approvals(&self, session_id: Option<&str>) -> Result<Vec<ApprovalRecord>, StoreError> {
        let mut sql = "SELECT id, timestamp, session_id, direction, method, tool_name, \
                       rule_name, payload, decision, decided_at FROM approvals"
            .to_string();
        let mut args: Vec<String> = Vec::new();
        if let Some(s) = session_id {
            sql.push_str(" WHERE session_id = ?");
            args.push(s.to_string());
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT 100");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(ApprovalRecord {
                id: row.get(0)?,
                timestamp: parse_ts(&row.get::<_, String>(1)?),
                session_id: row.get(2)?,
                direction: row.get(3)?,
                method: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                tool_name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                rule_name: row.get(6)?,
                payload: row.get(7)?,
                decision: row.get(8)?,
                decided_at: row.get::<_, Option<String>>(9)?.map(|s| parse_ts(&s)),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn register_tools(&self, session_id: &str, tools: &[ToolRecord]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO tool_registry (session_id, tool_name, description, \
                 first_seen) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = format_ts(&Utc::now());
            for tool in tools {
                if let Err(e) =
                    stmt.execute(params![session_id, tool.tool_name, tool.description, now])
                {
                    tracing::error!(error = %e, tool = %tool.tool_name, "insert tool failed");
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_tool_analytics(
        &self,
        session_id: Option<&str>,
    ) -> Result<ToolAnalyticsSummary, StoreError> {
        let (where_clause, args): (&str, Vec<String>) = match session_id {
            Some(s) => (" WHERE session_id = ?", vec![s.to_string()]),
            None => ("", Vec::new()),
        };

        let sql = format!(
            "SELECT tr.tool_name, tr.description, \
                    COALESCE(u.call_count, 0) AS call_count, \
                    COALESCE(u.sessions_used, 0) AS sessions_used, \
                    COALESCE(u.last_used, '') AS last_used \
             FROM ( \
                 SELECT DISTINCT tool_name, description FROM tool_registry{where_clause} \
             ) tr \
             LEFT JOIN ( \
                 SELECT tool_name, COUNT(*) AS call_count, \
                        COUNT(DISTINCT session_id) AS sessions_used, \
                        MAX(timestamp) AS last_used \
                 FROM messages \
                 WHERE tool_name IS NOT NULL AND tool_name != '' \
                 GROUP BY tool_name \
             ) u ON tr.tool_name = u.tool_name \
             ORDER BY call_count DESC, tr.tool_name ASC"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(ToolAnalytics {
                tool_name: row.get(0)?,
                description: row.get(1)?,
                call_count: row.get(2)?,
                sessions_used: row.get(3)?,
                last_used: row.get(4)?,
            })
        })?;

        let mut summary = ToolAnalyticsSummary::default();
        for row in rows {
            let tool = row?;
            summary.total_available += 1;
            if tool.call_count > 0 {
                summary.total_used += 1;
            }
            summary.tools.push(tool);
        }
        Ok(summary)
    }

    fn get_tool_usage_counts(
        &self,
        last_n_sessions: u32,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut sql = "SELECT tool_name, COUNT(*) FROM messages \
                       WHERE tool_name IS NOT NULL AND tool_name != ''"
            .to_string();
        let mut args: Vec<i64> = Vec::new();
        if last_n_sessions > 0 {
            sql.push_str(
                " AND session_id IN (SELECT id FROM sessions ORDER BY started_at DESC LIMIT ?)",
            );
            args.push(i64::from(last_n_sessions));
        }
        sql.push_str(" GROUP BY tool_name");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (name, count) = row?;
            counts.insert(name, count);
        }
        Ok(counts)
    }

    fn close(&self) {
        let tx = self
            .writer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx); // disconnects the channel; the writer drains and exits
        let handle = self
            .writer_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("store writer thread panicked");
            }
        }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db"), StoreConfig::default()).unwrap();
        (dir, store)
    }

    fn entry(session: &str, method: &str, tool: &str) -> LogEntry {
        let payload = format!(r#"{{"jsonrpc":"2.0","id":1,"method":"{method}"}}"#);
        LogEntry {
            id: 0,
            timestamp: Utc::now(),
            session_id: session.to_string(),
            direction: Direction::HostToServer,
            kind: MessageKind::Request,
            method: method.to_string(),
            msg_id: "1".to_string(),
            size_bytes: payload.len() as i64,
            payload,
            blocked: false,
            audit: false,
            scrub_count: 0,
            matched_rules: Vec::new(),
            tool_name: tool.to_string(),
            policy_action: String::new(),
        }
    }

    fn session(id: &str, started_at: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            started_at,
            ended_at: None,
            command: "cat".to_string(),
            args: vec!["-u".to_string()],
        }
    }

    #[test]
    fn test_log_close_query_round_trip() {
        let (_dir, store) = temp_store();
        let mut e = entry("s1", "tools/call", "read_file");
        e.blocked = true;
        e.audit = true;
        e.scrub_count = 3;
        e.matched_rules = vec!["rule-a".to_string(), "rule-b".to_string()];
        e.policy_action = "audit".to_string();
        store.log_message(e.clone());
        store.close();

        let entries = store.query(&QueryFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        let got = &entries[0];
        assert!(got.id > 0);
        assert_eq!(got.method, "tools/call");
        assert_eq!(got.payload, e.payload);
        assert_eq!(got.size_bytes, e.payload.len() as i64);
        assert!(got.blocked);
        assert!(got.audit);
        assert_eq!(got.scrub_count, 3);
        assert_eq!(got.matched_rules, vec!["rule-a", "rule-b"]);
        assert_eq!(got.tool_name, "read_file");
        assert_eq!(got.policy_action, "audit");
        assert_eq!(got.direction, Direction::HostToServer);
        assert_eq!(got.kind, MessageKind::Request);
    }

    #[test]
    fn test_query_filters_and_order() {
        let (_dir, store) = temp_store();
        store.log_message(entry("s1", "tools/list", ""));
        store.log_message(entry("s2", "tools/call", "read_file"));
        store.log_message(entry("s1", "tools/call", "write_file"));
        store.close();

        let all = store.query(&QueryFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        // Newest first.
        assert!(all[0].id > all[1].id && all[1].id > all[2].id);

        let s1 = store
            .query(&QueryFilter {
                session_id: Some("s1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(s1.len(), 2);

        let calls = store
            .query(&QueryFilter {
                method: Some("tools/call".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(calls.len(), 2);

        let limited = store
            .query(&QueryFilter {
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);

        let offset = store
            .query(&QueryFilter {
                limit: 1,
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(offset.len(), 1);
        assert_eq!(offset[0].id, all[2].id);
    }

    #[test]
    fn test_get_message() {
        let (_dir, store) = temp_store();
        store.log_message(entry("s1", "ping", ""));
        store.close();

        let all = store.query(&QueryFilter::default()).unwrap();
        let got = store.get_message(all[0].id).unwrap().unwrap();
        assert_eq!(got.method, "ping");
        assert!(store.get_message(9999).unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = temp_store();
        let mut blocked = entry("s1", "tools/call", "read_file");
        blocked.blocked = true;
        store.log_message(blocked);
        store.log_message(entry("s1", "tools/call", "read_file"));
        let mut resp = entry("s1", "", "");
        resp.kind = MessageKind::Response;
        store.log_message(resp);
        store.close();

        let stats = store.stats(None).unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.response_count, 1);
        assert_eq!(stats.blocked_count, 1);
        assert_eq!(stats.method_counts.get("tools/call"), Some(&2));
        assert!(stats.total_bytes > 0);

        let scoped = store.stats(Some("other")).unwrap();
        assert_eq!(scoped.total_messages, 0);
    }

    #[test]
    fn test_sessions_lifecycle() {
        let (_dir, store) = temp_store();
        store
            .create_session(&session("s1", Utc::now()))
            .unwrap();
        store.end_session("s1").unwrap();
        // A second create with the same id violates the primary key.
        assert!(store.create_session(&session("s1", Utc::now())).is_err());
    }

    #[test]
    fn test_approvals_round_trip() {
        let (_dir, store) = temp_store();
        let record = ApprovalRecord {
            id: "apr-1".to_string(),
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            direction: "host_to_server".to_string(),
            method: "tools/call".to_string(),
            tool_name: "delete_file".to_string(),
            rule_name: "review-deletes".to_string(),
            payload: "{}".to_string(),
            decision: "pending".to_string(),
            decided_at: None,
        };
        store.log_approval(&record).unwrap();

        // Re-log with the decided state; same id replaces.
        let mut decided = record.clone();
        decided.decision = "approved".to_string();
        decided.decided_at = Some(Utc::now());
        store.log_approval(&decided).unwrap();

        let records = store.get_approvals(Some("s1")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, "approved");
        assert!(records[0].decided_at.is_some());

        assert!(store.get_approvals(Some("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_register_tools_idempotent() {
        let (_dir, store) = temp_store();
        let tools = vec![ToolRecord {
            session_id: "s1".to_string(),
            tool_name: "read_file".to_string(),
            description: "Reads a file".to_string(),
        }];
        store.register_tools("s1", &tools).unwrap();

        let first = store.get_tool_analytics(Some("s1")).unwrap();
        assert_eq!(first.total_available, 1);
        let first_desc = first.tools[0].description.clone();

        // Re-registering (even with a different description) is ignored.
        let changed = vec![ToolRecord {
            session_id: "s1".to_string(),
            tool_name: "read_file".to_string(),
            description: "Something else".to_string(),
        }];
        store.register_tools("s1", &changed).unwrap();

        let second = store.get_tool_analytics(Some("s1")).unwrap();
        assert_eq!(second.total_available, 1);
        assert_eq!(second.tools[0].description, first_desc);
    }

    #[test]
    fn test_tool_usage_counts_scoped_to_recent_sessions() {
        let (_dir, store) = temp_store();
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        store.create_session(&session("old", old)).unwrap();
        store.create_session(&session("new", new)).unwrap();

        store.log_message(entry("old", "tools/call", "read_file"));
        store.log_message(entry("new", "tools/call", "read_file"));
        store.log_message(entry("new", "tools/call", "write_file"));
        store.close();

        let all = store.get_tool_usage_counts(0).unwrap();
        assert_eq!(all.get("read_file"), Some(&2));
        assert_eq!(all.get("write_file"), Some(&1));

        let recent = store.get_tool_usage_counts(1).unwrap();
        assert_eq!(recent.get("read_file"), Some(&1));
        assert_eq!(recent.get("write_file"), Some(&1));
    }

    #[test]
    fn test_tool_analytics_ordering() {
        let (_dir, store) = temp_store();
        let tools = ["alpha", "beta", "gamma"]
            .iter()
            .map(|name| ToolRecord {
                session_id: "s1".to_string(),
                tool_name: name.to_string(),
                description: String::new(),
            })
            .collect::<Vec<_>>();
        store.register_tools("s1", &tools).unwrap();

        for _ in 0..3 {
            store.log_message(entry("s1", "tools/call", "gamma"));
        }
        store.log_message(entry("s1", "tools/call", "beta"));
        store.close();

        let summary = store.get_tool_analytics(None).unwrap();
        assert_eq!(summary.total_available, 3);
        assert_eq!(summary.total_used, 2);
        let names: Vec<&str> = summary.tools.iter().map(|t| t.tool_name.as_str()).collect();
        assert_eq!(names, ["gamma", "beta", "alpha"]);
        assert_eq!(summary.tools[0].call_count, 3);
        assert_eq!(summary.tools[0].sessions_used, 1);
        assert!(!summary.tools[0].last_used.is_empty());
    }

    #[test]
    fn test_log_after_close_is_dropped() {
        let (_dir, store) = temp_store();
        store.close();
        store.log_message(entry("s1", "ping", ""));
        assert!(store.query(&QueryFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_open_reopens_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = SqliteStore::open(&path, StoreConfig::default()).unwrap();
            store.log_message(entry("s1", "ping", ""));
            store.close();
        }
        let store = SqliteStore::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.query(&QueryFilter::default()).unwrap().len(), 1);
    }
}
