use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::handler::Dispatcher;
use crate::http::parser::{ParseError, ParserLimits, RequestParser};
use crate::http::request::{Method, Request, Version};
use crate::http::response::StatusCode;
use crate::http::writer::{ResponseWriter, WriteOptions};

const READ_CHUNK: usize = 8192;
/// Parsed requests waiting behind the one being served.
const MAX_PIPELINED: usize = 16;
/// How long input is drained after a fault response before closing.
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on bytes discarded while lingering.
const LINGER_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Addresses of an accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

/// Work parsed off the wire, served strictly in arrival order.
#[derive(Debug)]
pub enum Pending {
    Request(Request),
    /// The stream became unparseable; answered, then the connection closes.
    Fault(ParseError),
    /// A request stalled part way through past the idle timeout.
    Timeout,
}

pub enum ConnectionState {
    Reading,
    Dispatching(Pending),
    Writing(ResponseWriter),
    /// `linger` drains unread input before the socket is dropped.
    Closing { linger: bool },
    Closed,
}

/// One client connection.
///
/// Generic over the transport so the state machine can be driven by a
/// `TcpStream` in production and an in-memory duplex pipe in tests.
pub struct Connection<S> {
    stream: S,
    info: ConnInfo,
    dispatcher: Arc<Dispatcher>,
    buffer: BytesMut,
    parser: RequestParser,
    pending: VecDeque<Pending>,
    faulted: bool,
    idle_timeout: Duration,
    state: ConnectionState,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, info: ConnInfo, dispatcher: Arc<Dispatcher>) -> Self {
        let limits = dispatcher.router().limits();
        let parser = RequestParser::new(ParserLimits::from(limits));
        let idle_timeout = limits.keepalive_timeout();
        Self {
            stream,
            info,
            dispatcher,
            buffer: BytesMut::with_capacity(4096),
            parser,
            pending: VecDeque::new(),
            faulted: false,
            idle_timeout,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            self.state = match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => self.read_next().await?,

                ConnectionState::Dispatching(pending) => self.dispatch(pending).await,

                ConnectionState::Writing(mut writer) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if writer.keep_alive() && !(self.faulted && self.pending.is_empty()) {
                        ConnectionState::Reading // go back for next request
                    } else {
                        ConnectionState::Closing {
                            linger: self.faulted,
                        }
                    }
                }

                ConnectionState::Closing { linger } => {
                    self.close(linger).await;
                    ConnectionState::Closed
                }

                ConnectionState::Closed => {
                    break;
                }
            };
        }

        Ok(())
    }

    /// Waits for the next piece of work: a queued request, a fault, or EOF.
    async fn read_next(&mut self) -> anyhow::Result<ConnectionState> {
        loop {
            self.parse_buffered();
            if let Some(next) = self.pending.pop_front() {
                return Ok(ConnectionState::Dispatching(next));
            }
            if self.faulted {
                return Ok(ConnectionState::Closing { linger: true });
            }

            self.buffer.reserve(READ_CHUNK);
            match timeout(self.idle_timeout, self.stream.read_buf(&mut self.buffer)).await {
                Err(_) => {
                    if self.parser.in_progress() || !self.buffer.is_empty() {
                        self.faulted = true;
                        return Ok(ConnectionState::Dispatching(Pending::Timeout));
                    }
                    debug!(peer = %self.info.peer, "idle connection timed out");
                    return Ok(ConnectionState::Closing { linger: false });
                }
                Ok(Ok(0)) => {
                    // Client closed connection
                    trace!(peer = %self.info.peer, "peer closed");
                    return Ok(ConnectionState::Closing { linger: false });
                }
                Ok(Ok(n)) => {
                    trace!(peer = %self.info.peer, bytes = n, "read");
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Moves every complete request in the buffer onto the pending queue.
    fn parse_buffered(&mut self) {
        while !self.faulted && self.pending.len() < MAX_PIPELINED {
            match self.parser.parse(&mut self.buffer, self.dispatcher.router()) {
                Ok(Some(request)) => self.pending.push_back(Pending::Request(request)),
                Ok(None) => break,
                Err(e) => {
                    self.faulted = true;
                    self.pending.push_back(Pending::Fault(e));
                }
            }
        }
    }

    async fn dispatch(&mut self, pending: Pending) -> ConnectionState {
        match pending {
            Pending::Request(request) => {
                let response = self.dispatcher.dispatch(&request, &self.info).await;
                info!(
                    peer = %self.info.peer,
                    method = ?request.method,
                    path = %request.path,
                    status = response.status.as_u16(),
                    "request served"
                );
                let options = WriteOptions {
                    version: request.version,
                    keep_alive: request.keep_alive(),
                    head_only: request.method == Method::HEAD,
                };
                ConnectionState::Writing(ResponseWriter::new(response, options))
            }
            Pending::Fault(error) => {
                warn!(peer = %self.info.peer, error = %error, "rejecting request");
                self.write_fault(error.status())
            }
            Pending::Timeout => {
                warn!(peer = %self.info.peer, "request timed out");
                self.write_fault(StatusCode::RequestTimeout)
            }
        }
    }

    fn write_fault(&self, status: StatusCode) -> ConnectionState {
        let response = self.dispatcher.fault_response(status);
        let options = WriteOptions {
            version: Version::Http11,
            keep_alive: false,
            head_only: false,
        };
        ConnectionState::Writing(ResponseWriter::new(response, options))
    }

    /// Shuts down the write side, then optionally drains input so the client
    /// reads the response instead of a reset.
    async fn close(&mut self, linger: bool) {
        if let Err(e) = self.stream.shutdown().await {
            trace!(peer = %self.info.peer, error = %e, "shutdown failed");
        }
        if !linger {
            return;
        }
        let deadline = Instant::now() + LINGER_TIMEOUT;
        let mut drained = 0usize;
        let mut scratch = [0u8; 8192];
        while drained < LINGER_MAX_BYTES {
            match timeout_at(deadline, self.stream.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => drained += n,
                _ => break,
            }
        }
        trace!(peer = %self.info.peer, bytes = drained, "lingering close done");
    }
}
