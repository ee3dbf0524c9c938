//! Approval interceptor: holds flagged messages until a human decides.
//!
//! Reacts to the `policy_action = require_approval` annotation left by the
//! policy interceptor. The caller's task blocks on the ticket's decision
//! channel; timeout delivery arrives on the same channel, and caller
//! cancellation removes the ticket explicitly so it does not linger until
//! the timer fires.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalDecision, ApprovalManager, ApprovalRequest};
use crate::policy::{Action, extract_tool_name};

use super::{
    InterceptError, InterceptedMessage, Interceptor, META_POLICY_ACTION, META_POLICY_RULE,
};

pub struct ApprovalInterceptor {
    manager: ApprovalManager,
}

impl ApprovalInterceptor {
    pub fn new(manager: ApprovalManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Interceptor for ApprovalInterceptor {
    fn name(&self) -> &'static str {
        "approval"
    }

    async fn intercept(
        &self,
        cancel: &CancellationToken,
        msg: &mut InterceptedMessage,
    ) -> Result<Option<Vec<u8>>, InterceptError> {
        if msg.meta_str(META_POLICY_ACTION) != Some(Action::RequireApproval.as_str()) {
            return Ok(Some(msg.raw_bytes.clone()));
        }

        let rule_name = msg
            .meta_str(META_POLICY_RULE)
            .unwrap_or_default()
            .to_string();
        let method = msg.parsed.method_str().to_string();
        let tool_name = if method == "tools/call" {
            extract_tool_name(msg.parsed.params.as_deref())
        } else {
            String::new()
        };

        let (ticket, decision_rx) = self.manager.submit(ApprovalRequest {
            timestamp: msg.timestamp,
            session_id: msg.session_id.clone(),
            direction: msg.direction,
            method,
            tool_name,
            rule_name: rule_name.clone(),
            payload: String::from_utf8_lossy(&msg.raw_bytes).into_owned(),
        });

        tokio::select! {
            decision = decision_rx => match decision {
                Ok(ApprovalDecision::Approved) => Ok(Some(msg.raw_bytes.clone())),
                Ok(ApprovalDecision::Denied) => {
                    Err(InterceptError::ApprovalDenied { rule: rule_name })
                }
                Ok(ApprovalDecision::Timeout) => {
                    Err(InterceptError::ApprovalTimeout { rule: rule_name })
                }
                // A dropped sender means the ticket was removed without a
                // decision — treat like cancellation.
                Ok(ApprovalDecision::Pending) | Err(_) => Err(InterceptError::Cancelled),
            },
            _ = cancel.cancelled() => {
                self.manager.remove(&ticket.id);
                Err(InterceptError::Cancelled)
            }
        }
    }
}
