//! Policy rule evaluation.
//!
//! A single ordered pass over the rule list. Every matching rule's name is
//! accumulated; the first matching deny and the first matching approval rule
//! are remembered; the final action follows the precedence
//! deny > require_approval > audit.

use serde::Deserialize;
use serde_json::value::RawValue;

use crate::Direction;

use super::{Action, Rule};

/// Outcome of evaluating all rules against one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    /// Final action, `None` when no matching rule carries one.
    pub action: Option<Action>,
    /// Names of every matching rule, in rule order.
    pub matched_rules: Vec<String>,
    /// Name of the first matching `deny` rule.
    pub deny_rule: String,
    /// Name of the first matching `require_approval` rule.
    pub approval_rule: String,
}

/// Evaluates an ordered rule list against message attributes.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    rules: Vec<Rule>,
}

impl Engine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Check all rules against the given message attributes.
    ///
    /// Precedence: deny > require_approval > audit. Once a deny has been
    /// seen, the final action is fixed; later approval or audit matches
    /// still land in `matched_rules` but do not change it.
    pub fn evaluate(
        &self,
        direction: Direction,
        method: &str,
        tool_name: &str,
        payload: &str,
    ) -> MatchResult {
        let mut result = MatchResult::default();

        for rule in &self.rules {
            if !rule_matches(rule, direction, method, tool_name, payload) {
                continue;
            }

            result.matched_rules.push(rule.name.clone());

            match rule.action {
                Action::Deny => {
                    if result.action != Some(Action::Deny) {
                        result.action = Some(Action::Deny);
                        result.deny_rule = rule.name.clone();
                    }
                }
                Action::RequireApproval => {
                    if result.action != Some(Action::Deny) {
                        if result.action != Some(Action::RequireApproval) {
                            result.approval_rule = rule.name.clone();
                        }
                        result.action = Some(Action::RequireApproval);
                    }
                }
                Action::Audit => {
                    if result.action.is_none() {
                        result.action = Some(Action::Audit);
                    }
                }
            }
        }

        result
    }
}

fn rule_matches(
    rule: &Rule,
    direction: Direction,
    method: &str,
    tool_name: &str,
    payload: &str,
) -> bool {
    if let Some(rule_dir) = rule.direction {
        if rule_dir != direction {
            return false;
        }
    }

    if !rule.methods.is_empty() && !rule.methods.iter().any(|m| m == method) {
        return false;
    }

    if !rule.tools.is_empty() {
        if tool_name.is_empty() || !rule.tools.iter().any(|t| t == tool_name) {
            return false;
        }
    }

    // All patterns must match (AND semantics).
    rule.patterns.iter().all(|re| re.is_match(payload))
}

/// Extract the tool name from `tools/call` params.
///
/// MCP `tools/call` params look like `{"name": "tool_name", "arguments": {…}}`.
/// Any parse failure yields the empty string.
pub fn extract_tool_name(params: Option<&RawValue>) -> String {
    #[derive(Deserialize)]
    struct Params {
        #[serde(default)]
        name: String,
    }

    params
        .and_then(|raw| serde_json::from_str::<Params>(raw.get()).ok())
        .map(|p| p.name)
        .unwrap_or_default()
}
