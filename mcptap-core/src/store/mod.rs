//! Persistence layer: models, the narrow store interface, and the SQLite
//! implementation.
//!
//! The proxy core treats the database as an opaque transactional key-row
//! store behind [`MessageStore`]. Message writes are buffered and batched
//! (see [`SqliteStore`]); everything else is a direct synchronous call.

mod sqlite;

pub use sqlite::{SqliteStore, StoreConfig};

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Direction;
use crate::jsonrpc::MessageKind;

// ─────────────────────────────────────────────────────────────────────────────
// Models
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted MCP message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Row id, assigned by the store. Zero until persisted.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub method: String,
    /// Verbatim JSON-RPC id fragment, `""` when absent.
    pub msg_id: String,
    pub payload: String,
    pub size_bytes: i64,
    pub blocked: bool,
    pub audit: bool,
    pub scrub_count: i64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub matched_rules: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub tool_name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub policy_action: String,
}

/// One execution of a downstream subprocess under the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub command: String,
    pub args: Vec<String>,
}

/// Filters for querying persisted messages.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub session_id: Option<String>,
    pub direction: Option<Direction>,
    pub method: Option<String>,
    pub kind: Option<MessageKind>,
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows; defaults to 200 when zero or negative.
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate statistics over persisted messages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_messages: i64,
    pub request_count: i64,
    pub response_count: i64,
    pub notification_count: i64,
    pub error_count: i64,
    pub blocked_count: i64,
    /// Top-20 methods by message count.
    pub method_counts: HashMap<String, i64>,
    pub total_bytes: i64,
    pub scrub_count: i64,
    pub audit_count: i64,
}

/// An approval decision, persisted for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub direction: String,
    pub method: String,
    pub tool_name: String,
    pub rule_name: String,
    pub payload: String,
    pub decision: String,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Lifecycle stage of an approval event on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalEventKind {
    Requested,
    Resolved,
}

/// Published on the event bus when an approval is requested or resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalEvent {
    #[serde(rename = "type")]
    pub kind: ApprovalEventKind,
    pub record: ApprovalRecord,
}

/// A tool advertised by an MCP server in a `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
}

/// Computed analytics for one tool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolAnalytics {
    pub tool_name: String,
    pub description: String,
    pub call_count: i64,
    pub sessions_used: i64,
    pub last_used: String,
}

/// Full tool analytics response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolAnalyticsSummary {
    pub total_available: i64,
    pub total_used: i64,
    pub tools: Vec<ToolAnalytics>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Interface
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("open database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("create database directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("start store writer: {0}")]
    Writer(#[source] std::io::Error),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("corrupt {column} value {value:?}")]
    Decode {
        column: &'static str,
        value: String,
    },
}

/// The narrow persistence interface used by the interception core.
///
/// `log_message` is the only hot-path operation and must never block or fail
/// the caller; everything else is a synchronous read or a small direct write.
pub trait MessageStore: Send + Sync {
    /// Enqueue a message for asynchronous persistence. Never blocks; drops
    /// (with a warning) when the write buffer is full.
    fn log_message(&self, entry: LogEntry);

    /// Retrieve messages matching the filter, newest first.
    fn query(&self, filter: &QueryFilter) -> Result<Vec<LogEntry>, StoreError>;

    /// Retrieve a single message by row id.
    fn get_message(&self, id: i64) -> Result<Option<LogEntry>, StoreError>;

    /// Aggregate statistics, optionally scoped to one session.
    fn stats(&self, session_id: Option<&str>) -> Result<Stats, StoreError>;

    /// Record a new proxy session.
    fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Mark a session as ended.
    fn end_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Record an approval decision (idempotent per id).
    fn log_approval(&self, record: &ApprovalRecord) -> Result<(), StoreError>;

    /// Retrieve approval records, newest first, optionally scoped to one
    /// session.
    fn get_approvals(&self, session_id: Option<&str>) -> Result<Vec<ApprovalRecord>, StoreError>;

    /// Register tools advertised in a `tools/list` response. Idempotent per
    /// `(session_id, tool_name)`: re-registration preserves the original
    /// `first_seen`.
    fn register_tools(&self, session_id: &str, tools: &[ToolRecord]) -> Result<(), StoreError>;

    /// Tool registry joined with aggregated usage, ordered by call count
    /// descending then name ascending.
    fn get_tool_analytics(
        &self,
        session_id: Option<&str>,
    ) -> Result<ToolAnalyticsSummary, StoreError>;

    /// Per-tool call counts, optionally scoped to the N most recently
    /// started sessions (`0` means all sessions).
    fn get_tool_usage_counts(
        &self,
        last_n_sessions: u32,
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// Stop accepting writes, drain the outstanding batch, and join the
    /// writer. Reads keep working after close.
    fn close(&self);
}
