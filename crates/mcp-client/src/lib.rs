//! `tm-mcp-client`: per-user clients for remote tool servers (MCP over SSE).
//!
//! - [`protocol`]: JSON-RPC 2.0 and MCP payload types.
//! - [`transport`]: the SSE transport (`GET` event stream, `POST` messages).
//! - [`client`]: one initialized session with one server.
//! - [`manager`]: per-user session cache with idle reaping; exposes remote
//!   tools as [`tm_tools::Tool`]s.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::{McpClient, McpError};
pub use manager::UserClientManager;
pub use protocol::RemoteToolDef;
pub use transport::{McpTransport, SseTransport, TransportError, USER_ID_HEADER};
