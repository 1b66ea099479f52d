//! cell-sandbox daemon library
//!
//! Runs untrusted notebook cells in throwaway containers:
//! - Configuration with environment overrides
//! - Execution orchestrator (staging, deadline, forced kill, cleanup)
//! - Backend trait and the Docker CLI implementation
//! - MCP server implementation using rmcp

pub mod backend;
pub mod config;
pub mod executor;
pub mod mcp;
