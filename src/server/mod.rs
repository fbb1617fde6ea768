//! Listening sockets and the accept loops feeding connection tasks.

pub mod listener;

pub use listener::run;
