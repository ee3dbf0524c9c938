//! CLI argument types for the `mcptap` proxy.
//!
//! Defined separately from `main.rs` so tests can construct them directly.

use std::path::PathBuf;

use clap::Parser;

use crate::framing::DEFAULT_MAX_MESSAGE_BYTES;

/// Transparent recording, policy, and approval proxy for MCP servers.
///
/// Sits between an MCP client and a downstream server, captures every
/// JSON-RPC message in both directions, and applies policy, redaction,
/// approval, and tool-pruning transforms before forwarding.
#[derive(Parser, Debug)]
#[command(name = "mcptap", version)]
pub struct Cli {
    /// SQLite database path.
    #[arg(long, default_value_os_t = default_db_path())]
    pub db: PathBuf,

    /// Path to a security policy YAML file.
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Enable PII scrubbing of server responses.
    #[arg(long)]
    pub scrub_pii: bool,

    /// Timeout in seconds for human approval requests.
    #[arg(long, default_value_t = 60)]
    pub approval_timeout_secs: u64,

    /// Prune tools unused in the last N sessions (0 = disabled).
    #[arg(long, default_value_t = 0)]
    pub prune_unused: u32,

    /// Keep only the top K most-used tools (0 = disabled).
    #[arg(long, default_value_t = 0)]
    pub prune_keep_top: usize,

    /// Comma-separated tool names that are never pruned.
    #[arg(long)]
    pub prune_keep: Option<String>,

    /// Session identifier (a fresh random id when omitted).
    #[arg(long)]
    pub session_id: Option<String>,

    /// Maximum JSON-RPC line size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Enable debug logging (logs go to stderr; stdout carries JSON-RPC).
    #[arg(long)]
    pub verbose: bool,

    /// Downstream MCP server command and arguments (after `--`).
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// The `--prune-keep` list, split and trimmed.
    pub fn prune_keep_list(&self) -> Vec<String> {
        self.prune_keep
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// `~/.mcptap/mcptap.db`, falling back to the working directory when no
/// home directory is available.
pub fn default_db_path() -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".mcptap").join("mcptap.db")
}
