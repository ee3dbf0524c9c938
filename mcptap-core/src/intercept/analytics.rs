//! Tool analytics: correlates `tools/list` requests with their responses,
//! registers advertised tools, and optionally prunes rarely used ones from
//! the response before it reaches the host.
//!
//! Correlation is cross-direction: a host→server `tools/list` request id is
//! remembered until the matching server→host response arrives. A janitor
//! task evicts entries whose responses never came, so dropped responses
//! cannot grow the map without bound.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use crate::Direction;
use crate::jsonrpc::{JsonRpcMessage, MessageKind};
use crate::store::{MessageStore, ToolRecord};

use super::{InterceptError, InterceptedMessage, Interceptor, META_TOOLS_PRUNED};

/// How often the janitor sweeps the pending-request map.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Pending entries older than this are presumed orphaned and evicted.
const PENDING_HORIZON: TimeDelta = TimeDelta::minutes(5);

/// Controls which tools are pruned from `tools/list` responses.
#[derive(Debug, Clone, Default)]
pub struct PruneConfig {
    /// Prune tools with zero calls in the last N sessions (0 disables).
    pub unused_sessions: u32,
    /// Keep only the top K most-used tools (0 disables).
    pub keep_top_k: usize,
    /// Tool names that are never pruned.
    pub always_keep: Vec<String>,
}

impl PruneConfig {
    fn enabled(&self) -> bool {
        self.unused_sessions > 0 || self.keep_top_k > 0
    }
}

/// A `tools/list` request waiting for its response.
#[derive(Debug, Clone)]
struct PendingRequest {
    session_id: String,
    timestamp: DateTime<Utc>,
}

pub struct ToolAnalyticsInterceptor {
    store: Arc<dyn MessageStore>,
    prune: PruneConfig,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    janitor: tokio::task::JoinHandle<()>,
}

impl ToolAnalyticsInterceptor {
    /// Create the interceptor and start its janitor task. Must be called
    /// from within a tokio runtime.
    pub fn new(store: Arc<dyn MessageStore>, prune: PruneConfig) -> Self {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let janitor = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(JANITOR_INTERVAL);
                tick.tick().await; // first tick is immediate
                loop {
                    tick.tick().await;
                    let cutoff = Utc::now() - PENDING_HORIZON;
                    evict_stale(&pending, cutoff);
                }
            })
        };
        Self {
            store,
            prune,
            pending,
            janitor,
        }
    }

    fn handle_list_response(
        &self,
        msg: &mut InterceptedMessage,
        pending: PendingRequest,
    ) -> Vec<u8> {
        let Some(result_raw) = msg.parsed.result.as_deref() else {
            return msg.raw_bytes.clone();
        };

        let result: Value = match serde_json::from_str(result_raw.get()) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "failed to parse tools/list result");
                return msg.raw_bytes.clone();
            }
        };
        let tools: Vec<Value> = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Register every named tool against the requesting session.
        let records: Vec<ToolRecord> = tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?;
                Some(ToolRecord {
                    session_id: pending.session_id.clone(),
                    tool_name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect();

        tracing::info!(
            session = %pending.session_id,
            tool_count = records.len(),
            "tools/list response"
        );

        if !records.is_empty() {
            if let Err(e) = self.store.register_tools(&pending.session_id, &records) {
                tracing::error!(error = %e, "failed to register tools");
            }
        }

        if !self.prune.enabled() {
            return msg.raw_bytes.clone();
        }

        let usage = match self.store.get_tool_usage_counts(self.prune.unused_sessions) {
            Ok(u) => u,
            Err(e) => {
                tracing::error!(error = %e, "failed to get usage counts for pruning");
                return msg.raw_bytes.clone();
            }
        };

        let (kept, pruned_count) = apply_pruning(tools, &usage, &self.prune);
        if pruned_count == 0 {
            return msg.raw_bytes.clone();
        }

        msg.set_meta(META_TOOLS_PRUNED, pruned_count as u64);
        tracing::info!(kept = kept.len(), pruned = pruned_count, "pruned tools from response");

        rebuild_response(&msg.parsed, result, kept).unwrap_or_else(|| msg.raw_bytes.clone())
    }
}

impl Drop for ToolAnalyticsInterceptor {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

#[async_trait]
impl Interceptor for ToolAnalyticsInterceptor {
    fn name(&self) -> &'static str {
        "tool-analytics"
    }

    async fn intercept(
        &self,
        _cancel: &CancellationToken,
        msg: &mut InterceptedMessage,
    ) -> Result<Option<Vec<u8>>, InterceptError> {
        if msg.parse_error.is_some() {
            return Ok(Some(msg.raw_bytes.clone()));
        }

        // Track outgoing tools/list requests by id.
        if msg.direction == Direction::HostToServer && msg.parsed.method_str() == "tools/list" {
            if let Some(id) = msg.parsed.id.as_deref() {
                lock(&self.pending).insert(
                    id.get().to_string(),
                    PendingRequest {
                        session_id: msg.session_id.clone(),
                        timestamp: msg.timestamp,
                    },
                );
            }
            return Ok(Some(msg.raw_bytes.clone()));
        }

        // Correlate server→host responses with a tracked request.
        if msg.direction == Direction::ServerToHost && msg.parsed.kind() == MessageKind::Response {
            if let Some(id) = msg.parsed.id.as_deref() {
                let pending = lock(&self.pending).remove(id.get());
                if let Some(pending) = pending {
                    return Ok(Some(self.handle_list_response(msg, pending)));
                }
            }
        }

        Ok(Some(msg.raw_bytes.clone()))
    }
}

/// Apply the configured pruning strategies. Returns the kept tools and the
/// number removed. Tools without a parseable name are always kept.
fn apply_pruning(
    tools: Vec<Value>,
    usage: &HashMap<String, i64>,
    config: &PruneConfig,
) -> (Vec<Value>, usize) {
    let always_keep: HashSet<&str> = config.always_keep.iter().map(String::as_str).collect();

    struct ToolInfo {
        value: Value,
        name: String,
        count: i64,
    }

    let mut kept: Vec<Value> = Vec::new();
    let mut infos: Vec<ToolInfo> = Vec::new();
    for tool in tools {
        match tool.get("name").and_then(Value::as_str).map(str::to_string) {
            Some(name) => {
                let count = usage.get(&name).copied().unwrap_or(0);
                infos.push(ToolInfo {
                    value: tool,
                    name,
                    count,
                });
            }
            None => kept.push(tool), // unparseable — keep it
        }
    }

    let mut keep_set: HashSet<String> = HashSet::new();

    // Strategy 1: drop tools with no calls in the recent-session window.
    if config.unused_sessions > 0 {
        for info in &infos {
            if always_keep.contains(info.name.as_str()) || info.count > 0 {
                keep_set.insert(info.name.clone());
            }
        }
    } else {
        for info in &infos {
            keep_set.insert(info.name.clone());
        }
    }

    // Strategy 2: cap the non-always-keep survivors at the top K by usage.
    if config.keep_top_k > 0 {
        let mut in_set: Vec<&ToolInfo> = infos
            .iter()
            .filter(|i| keep_set.contains(&i.name) && !always_keep.contains(i.name.as_str()))
            .collect();

        if in_set.len() > config.keep_top_k {
            in_set.sort_by(|a, b| b.count.cmp(&a.count));
            let mut new_keep: HashSet<String> =
                always_keep.iter().map(|s| s.to_string()).collect();
            for info in in_set.iter().take(config.keep_top_k) {
                new_keep.insert(info.name.clone());
            }
            keep_set = new_keep;
        }
    }

    for name in &always_keep {
        keep_set.insert((*name).to_string());
    }

    let mut pruned = 0;
    for info in infos {
        if keep_set.contains(&info.name) {
            kept.push(info.value);
        } else {
            pruned += 1;
        }
    }

    (kept, pruned)
}

/// Rebuild a `tools/list` response envelope with the kept tool set,
/// preserving every other field of the original result (pagination cursors
/// and the like). `None` means the caller should fall back to the original
/// bytes.
fn rebuild_response(parsed: &JsonRpcMessage, mut result: Value, kept: Vec<Value>) -> Option<Vec<u8>> {
    result.as_object_mut()?.insert("tools".to_string(), Value::Array(kept));

    let result_raw = RawValue::from_string(serde_json::to_string(&result).ok()?).ok()?;
    let envelope = JsonRpcMessage {
        jsonrpc: "2.0".to_string(),
        id: parsed.id.clone(),
        result: Some(result_raw),
        ..Default::default()
    };
    serde_json::to_vec(&envelope).ok()
}

/// Drop pending entries older than the cutoff.
fn evict_stale(pending: &Mutex<HashMap<String, PendingRequest>>, cutoff: DateTime<Utc>) {
    lock(pending).retain(|_, p| p.timestamp >= cutoff);
}

fn lock(
    pending: &Mutex<HashMap<String, PendingRequest>>,
) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
