//! mcptap — transparent stdio proxy for MCP servers.
//!
//! The binary crate owns everything transport-shaped: CLI argument types,
//! NDJSON line framing, and the bidirectional pump pair around the
//! downstream child process. The interception pipeline itself lives in
//! `mcptap-core`.

pub mod cli;
pub mod framing;
pub mod proxy;
