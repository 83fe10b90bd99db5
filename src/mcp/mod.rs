//! Retrieval tool surface.
//!
//! A small fixed set of tools exposed over two transports: line-delimited
//! JSON-RPC 2.0 on stdio and an HTTP endpoint accepting JSON-RPC POSTs.
//! No tool accepts raw SQL and nothing here can mutate the catalog or the
//! source database.

pub mod http;
pub mod protocol;
pub mod stdio;

pub use protocol::McpState;
