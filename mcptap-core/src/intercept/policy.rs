//! Policy interceptor: evaluates the rule engine against each message.
//!
//! Deny blocks immediately. Require-approval and audit only annotate the
//! metadata; the approval interceptor and the logger act on those
//! annotations downstream.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::policy::{Action, Engine, extract_tool_name};

use super::{
    InterceptError, InterceptedMessage, Interceptor, META_AUDIT, META_MATCHED_RULES,
    META_POLICY_ACTION, META_POLICY_RULE,
};

pub struct PolicyInterceptor {
    engine: Engine,
}

impl PolicyInterceptor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Interceptor for PolicyInterceptor {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn intercept(
        &self,
        _cancel: &CancellationToken,
        msg: &mut InterceptedMessage,
    ) -> Result<Option<Vec<u8>>, InterceptError> {
        if msg.parse_error.is_some() {
            return Ok(Some(msg.raw_bytes.clone()));
        }

        let method = msg.parsed.method_str().to_string();
        let tool_name = if method == "tools/call" {
            extract_tool_name(msg.parsed.params.as_deref())
        } else {
            String::new()
        };
        let payload = String::from_utf8_lossy(&msg.raw_bytes).into_owned();

        let result = self
            .engine
            .evaluate(msg.direction, &method, &tool_name, &payload);

        if result.matched_rules.is_empty() {
            return Ok(Some(msg.raw_bytes.clone()));
        }

        msg.set_meta(META_MATCHED_RULES, result.matched_rules.clone());

        match result.action {
            Some(Action::Deny) => {
                msg.set_meta(META_POLICY_ACTION, Action::Deny.as_str());
                msg.set_meta(META_POLICY_RULE, result.deny_rule.clone());
                Err(InterceptError::PolicyDenied {
                    rule: result.deny_rule,
                })
            }
            Some(Action::RequireApproval) => {
                msg.set_meta(META_POLICY_ACTION, Action::RequireApproval.as_str());
                msg.set_meta(META_POLICY_RULE, result.approval_rule);
                Ok(Some(msg.raw_bytes.clone()))
            }
            Some(Action::Audit) => {
                msg.set_meta(META_POLICY_ACTION, Action::Audit.as_str());
                msg.set_meta(META_AUDIT, true);
                Ok(Some(msg.raw_bytes.clone()))
            }
            None => Ok(Some(msg.raw_bytes.clone())),
        }
    }
}
