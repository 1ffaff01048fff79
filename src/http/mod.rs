//! HTTP transport for MCP sessions
//!
//! Exposes the JSON-RPC endpoint, the per-session event stream, and general metadata endpoints.

pub mod handlers;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const CORRELATION_HEADER: &str = "x-request-id";
