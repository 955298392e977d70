//! MCP server giving LLM agents guarded operational access to Redis.
//!
//! Works against a single server, a cluster, or a sentinel-managed master.
//! Tools cover large-key analysis, key inspection, command execution behind
//! a safety classifier, batches and pipelines, database switching and
//! clearing, and server, database and cluster introspection.

pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod format;
pub mod info;
pub mod safety;
pub mod scanner;
pub mod server;
