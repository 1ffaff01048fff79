//! Model Context Protocol (MCP) envelope handling and method dispatch
//!
//! Provides protocol-level specifics surrounding JSON-RPC validation, request context, and routing.

pub mod context;
pub mod dispatcher;
pub mod rpc;
