//! Policy file loading: YAML parse followed by regex compilation.
//!
//! Rule patterns that fail to compile are load errors (a silently inert deny
//! rule would be worse than a startup failure). Scrubber custom patterns are
//! validated later, at scrubber construction, where invalid entries are
//! skipped.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Direction;

use super::{Action, CustomPattern, PolicyConfig, Rule, ScrubberSettings};

/// Errors from loading or compiling a policy file.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("read policy file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse policy YAML: {reason}")]
    Parse { reason: String },

    #[error("rule {rule:?} pattern {pattern:?}: {source}")]
    Pattern {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// Raw serde mirror of the YAML file; compiled into the in-memory model below.

#[derive(Debug, Deserialize)]
struct RawPolicyFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    scrubber: RawScrubber,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    name: String,
    action: Action,
    #[serde(default)]
    direction: Option<Direction>,
    #[serde(default)]
    methods: Vec<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawScrubber {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    custom_patterns: Vec<CustomPattern>,
}

/// Read and compile a policy YAML file.
pub fn load(path: &Path) -> Result<PolicyConfig, PolicyError> {
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    from_str(&text)
}

/// Parse and compile a policy from YAML text.
pub fn from_str(text: &str) -> Result<PolicyConfig, PolicyError> {
    let raw: RawPolicyFile = serde_yaml::from_str(text).map_err(|e| PolicyError::Parse {
        reason: e.to_string(),
    })?;

    let mut rules = Vec::with_capacity(raw.rules.len());
    for r in raw.rules {
        let mut patterns = Vec::with_capacity(r.patterns.len());
        for p in r.patterns {
            let re = regex::Regex::new(&p).map_err(|source| PolicyError::Pattern {
                rule: r.name.clone(),
                pattern: p.clone(),
                source,
            })?;
            patterns.push(re);
        }
        rules.push(Rule {
            name: r.name,
            action: r.action,
            direction: r.direction,
            methods: r.methods,
            tools: r.tools,
            patterns,
        });
    }

    Ok(PolicyConfig {
        version: raw.version,
        rules,
        scrubber: ScrubberSettings {
            enabled: raw.scrubber.enabled,
            custom_patterns: raw.scrubber.custom_patterns,
        },
    })
}
