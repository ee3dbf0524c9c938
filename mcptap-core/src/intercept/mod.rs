//! The interceptor chain: the three-way `forward` / `drop` / `block`
//! contract and the fixed composition the proxy runs every message through.
//!
//! Interceptors communicate through the message's metadata map — a key set
//! by an earlier interceptor is visible to every later one on the same
//! message. The chain updates `raw_bytes` between stages, so a rewrite by
//! one interceptor (scrubbing, pruning) is what the next one sees.

pub mod analytics;
pub mod approval;
pub mod logging;
pub mod policy;
pub mod scrub;

pub use analytics::{PruneConfig, ToolAnalyticsInterceptor};
pub use approval::ApprovalInterceptor;
pub use logging::LoggingInterceptor;
pub use policy::PolicyInterceptor;
pub use scrub::ScrubInterceptor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::Direction;
use crate::jsonrpc::{self, JsonRpcMessage};

// ─────────────────────────────────────────────────────────────────────────────
// Metadata Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Final policy action (`deny`, `require_approval`, `audit`).
pub const META_POLICY_ACTION: &str = "policy_action";
/// Name of the rule behind the policy action.
pub const META_POLICY_RULE: &str = "policy_rule";
/// Names of every matching policy rule, in rule order.
pub const META_MATCHED_RULES: &str = "matched_rules";
/// Message is flagged for audit.
pub const META_AUDIT: &str = "audit";
/// Number of redactions applied by the scrubber.
pub const META_SCRUB_COUNT: &str = "scrub_count";
/// Number of tools removed from a `tools/list` response.
pub const META_TOOLS_PRUNED: &str = "tools_pruned";

// ─────────────────────────────────────────────────────────────────────────────
// Intercepted Message
// ─────────────────────────────────────────────────────────────────────────────

/// A raw JSON-RPC line wrapped with parse results and chain metadata.
#[derive(Debug, Clone)]
pub struct InterceptedMessage {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub direction: Direction,
    /// The current bytes, without a trailing newline. Updated by the chain
    /// after each interceptor that rewrites the message.
    pub raw_bytes: Vec<u8>,
    /// Minimal parse; zeroed when `parse_error` is set.
    pub parsed: JsonRpcMessage,
    pub parse_error: Option<String>,
    /// Inter-interceptor contract channel. See the `META_*` keys.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InterceptedMessage {
    /// Wrap and parse a raw line.
    pub fn new(session_id: String, direction: Direction, raw_bytes: Vec<u8>) -> Self {
        let (parsed, parse_error) = jsonrpc::parse(&raw_bytes);
        Self {
            timestamp: Utc::now(),
            session_id,
            direction,
            raw_bytes,
            parsed,
            parse_error,
            metadata: HashMap::new(),
        }
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interceptor Contract
// ─────────────────────────────────────────────────────────────────────────────

/// A deliberate block (or an abort) raised by an interceptor.
///
/// Only the policy evaluator and the approval flow block on purpose; every
/// other failure inside an interceptor is logged and treated as "forward
/// unchanged".
#[derive(Debug, Clone, thiserror::Error)]
pub enum InterceptError {
    #[error("blocked by policy rule {rule:?}")]
    PolicyDenied { rule: String },

    #[error("denied by human review (rule: {rule})")]
    ApprovalDenied { rule: String },

    #[error("approval timed out (rule: {rule})")]
    ApprovalTimeout { rule: String },

    #[error("cancelled while awaiting approval")]
    Cancelled,
}

/// A single unit in the chain.
///
/// Return semantics:
/// - `Ok(Some(bytes))`: forward the (possibly rewritten) message
/// - `Ok(None)`: drop the message silently
/// - `Err(e)`: block the message; the proxy answers with a JSON-RPC error
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn intercept(
        &self,
        cancel: &CancellationToken,
        msg: &mut InterceptedMessage,
    ) -> Result<Option<Vec<u8>>, InterceptError>;
}

/// Runs interceptors in order, threading rewritten bytes between stages.
/// Processing stops at the first interceptor that drops or blocks.
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the message through all interceptors.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        msg: &mut InterceptedMessage,
    ) -> Result<Option<Vec<u8>>, InterceptError> {
        for interceptor in &self.interceptors {
            match interceptor.intercept(cancel, msg).await? {
                Some(bytes) => msg.raw_bytes = bytes,
                None => {
                    tracing::debug!(
                        interceptor = interceptor.name(),
                        method = msg.parsed.method_str(),
                        "message dropped"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(msg.raw_bytes.clone()))
    }
}
