//! mcptap core — transport-agnostic interception library.
//!
//! This library holds everything the stdio proxy binary (`mcptap`) does not
//! need to own itself: the minimal JSON-RPC codec, the policy rule engine,
//! the PII scrubber, the human-approval coordinator, tool analytics and
//! pruning, the buffered SQLite message store, the fan-out event bus, and
//! the interceptor chain that ties them together.
//!
//! The split mirrors the transport boundary: nothing in this crate reads or
//! writes a socket, pipe, or child process. A message enters as raw bytes
//! plus a [`Direction`], flows through the chain, and leaves as raw bytes
//! (or a block/drop decision).

use serde::{Deserialize, Serialize};

pub mod approval;
pub mod bus;
pub mod intercept;
pub mod jsonrpc;
pub mod policy;
pub mod store;

// ─────────────────────────────────────────────────────────────────────────────
// Shared Transport Types
// ─────────────────────────────────────────────────────────────────────────────

/// Direction a message flows through the proxy.
///
/// Both pumps tag every intercepted message with its direction; interceptors
/// use it to scope their behavior (the scrubber only touches server→host
/// traffic, the tool pruner correlates host→server requests with server→host
/// responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Message flowing from the LLM host to the downstream MCP server.
    HostToServer,
    /// Message flowing from the downstream MCP server to the LLM host.
    ServerToHost,
}

impl Direction {
    /// The wire/database string for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::HostToServer => "host_to_server",
            Direction::ServerToHost => "server_to_host",
        }
    }

    /// Parse the wire/database string back into a direction.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "host_to_server" => Some(Direction::HostToServer),
            "server_to_host" => Some(Direction::ServerToHost),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_round_trip() {
        for dir in [Direction::HostToServer, Direction::ServerToHost] {
            assert_eq!(Direction::from_str_opt(dir.as_str()), Some(dir));
        }
        assert_eq!(Direction::from_str_opt("sideways"), None);
    }

    #[test]
    fn test_direction_serde() {
        let json = serde_json::to_string(&Direction::ServerToHost).unwrap();
        assert_eq!(json, "\"server_to_host\"");
    }
}
