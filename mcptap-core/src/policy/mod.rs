//! Security policy model: rules, actions, and scrubber settings.
//!
//! The in-memory model is what the engine evaluates; [`loader`] produces it
//! from a YAML file with all regexes compiled up front.

pub mod engine;
pub mod loader;

pub use engine::{Engine, MatchResult, extract_tool_name};
pub use loader::PolicyError;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Direction;

/// What to do when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Block the message and answer with a synthesized error.
    Deny,
    /// Hold the message until a human decides (or a timeout fires).
    RequireApproval,
    /// Forward, but flag the persisted record for audit.
    Audit,
}

impl Action {
    /// The metadata/database string for this action.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Deny => "deny",
            Action::RequireApproval => "require_approval",
            Action::Audit => "audit",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single policy rule.
///
/// Empty `methods`/`tools` mean "any"; `direction: None` means "any".
/// All `patterns` must match the raw payload (AND semantics).
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub action: Action,
    pub direction: Option<Direction>,
    pub methods: Vec<String>,
    pub tools: Vec<String>,
    pub patterns: Vec<Regex>,
}

/// A user-supplied scrubbing pattern appended to the built-in set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
    pub label: String,
}

/// Scrubber section of the policy file.
#[derive(Debug, Clone, Default)]
pub struct ScrubberSettings {
    pub enabled: bool,
    pub custom_patterns: Vec<CustomPattern>,
}

/// The full in-memory policy: ordered rules plus scrubber settings.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub version: String,
    pub rules: Vec<Rule>,
    pub scrubber: ScrubberSettings,
}
