//! webserv - HTTP/1.1 server with static files, uploads and CGI
//!
//! Core library for the connection state machine, request parsing, routing,
//! file handlers and the CGI gateway.

pub mod cgi;
pub mod config;
pub mod handler;
pub mod http;
pub mod router;
pub mod server;
