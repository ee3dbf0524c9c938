//! Logging interceptor: persists every message and publishes it for live
//! subscribers. Always last in the chain so the record reflects the final,
//! fully annotated state. Never blocks, never modifies.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::policy::extract_tool_name;
use crate::store::{LogEntry, MessageStore};

use super::{
    InterceptError, InterceptedMessage, Interceptor, META_AUDIT, META_MATCHED_RULES,
    META_POLICY_ACTION, META_SCRUB_COUNT,
};

pub struct LoggingInterceptor {
    store: Arc<dyn MessageStore>,
    bus: EventBus,
}

impl LoggingInterceptor {
    pub fn new(store: Arc<dyn MessageStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }
}

/// Build the persisted record for a message in its current chain state.
pub fn entry_from_message(msg: &InterceptedMessage) -> LogEntry {
    let matched_rules = msg
        .metadata
        .get(META_MATCHED_RULES)
        .and_then(|v| v.as_array())
        .map(|rules| {
            rules
                .iter()
                .filter_map(|r| r.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let tool_name = if msg.parsed.method_str() == "tools/call" {
        extract_tool_name(msg.parsed.params.as_deref())
    } else {
        String::new()
    };

    LogEntry {
        id: 0,
        timestamp: msg.timestamp,
        session_id: msg.session_id.clone(),
        direction: msg.direction,
        kind: msg.parsed.kind(),
        method: msg.parsed.method_str().to_string(),
        msg_id: msg.parsed.id_str().to_string(),
        payload: String::from_utf8_lossy(&msg.raw_bytes).into_owned(),
        size_bytes: msg.raw_bytes.len() as i64,
        blocked: false,
        audit: msg.meta_bool(META_AUDIT),
        scrub_count: msg.meta_u64(META_SCRUB_COUNT).unwrap_or(0) as i64,
        matched_rules,
        tool_name,
        policy_action: msg.meta_str(META_POLICY_ACTION).unwrap_or("").to_string(),
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn intercept(
        &self,
        _cancel: &CancellationToken,
        msg: &mut InterceptedMessage,
    ) -> Result<Option<Vec<u8>>, InterceptError> {
        let entry = entry_from_message(msg);

        // Async enqueue; neither path may stall the pumps.
        self.store.log_message(entry.clone());
        self.bus.publish(Arc::new(entry));

        Ok(Some(msg.raw_bytes.clone()))
    }
}
