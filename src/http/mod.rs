//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.0 and HTTP/1.1 wire protocol spoken by the
//! server: incremental request parsing, response serialization and the
//! per-connection state machine that ties them together.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The per-socket state machine driving parser → dispatcher → writer
//! - **`parser`**: Incremental request parser (request line, headers, length or chunked body)
//! - **`request`**: HTTP request representation, methods and target decoding
//! - **`headers`**: Ordered, case-insensitive header multimap shared by requests and responses
//! - **`body`**: Request bodies, kept in memory or spooled to a temporary file
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Chooses framing and serializes responses onto the socket
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Parse buffered bytes, wait for more (idle deadline)
//!        └──────┬──────┘
//!               │ Request (or protocol fault) parsed
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatching    │ ← Route, then serve file / run CGI
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Flush head and body with the chosen framing
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection, next pipelined request)
//!               └─ Close → Closing → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use webserv::config::Config;
//! use webserv::handler::Dispatcher;
//! use webserv::http::connection::{ConnInfo, Connection};
//! use webserv::router::Router;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::load("webserv.yaml")?);
//!     let dispatcher = Arc::new(Dispatcher::new(Router::new(config, vec![0])));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!
//!     loop {
//!         let (socket, peer) = listener.accept().await?;
//!         let info = ConnInfo { peer, local: socket.local_addr()? };
//!         let dispatcher = dispatcher.clone();
//!         tokio::spawn(async move {
//!             if let Err(e) = Connection::new(socket, info, dispatcher).run().await {
//!                 eprintln!("Connection error: {}", e);
//!             }
//!         });
//!     }
//! }
//! ```

pub mod body;
pub mod connection;
pub mod headers;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

/// Finds the first occurrence of `needle` in `haystack`.
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Returns true for bytes allowed in an HTTP token (RFC 9110 `tchar`).
pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
