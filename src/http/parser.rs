use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;

use crate::config::Limits;
use crate::http::body::BodySink;
use crate::http::headers::Headers;
use crate::http::request::{Method, Request, Target, Version};
use crate::http::response::StatusCode;
use crate::http::{find_bytes, is_token_byte};

/// Room left on the request line for the method and version around the target.
const REQUEST_LINE_SLACK: usize = 32;
/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;
/// Hex digits needed for any chunk size that fits in a u64.
const MAX_CHUNK_DIGITS: usize = 16;

/// Why a request could not be parsed. Every variant maps to the status sent
/// back before the connection is closed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("invalid method token")]
    InvalidMethod,
    #[error("method {0} is not implemented")]
    UnsupportedMethod(String),
    #[error("request target exceeds the configured length")]
    UriTooLong,
    #[error("invalid request target")]
    InvalidTarget,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
    #[error("malformed header line")]
    InvalidHeader,
    #[error("header section exceeds the configured size")]
    HeadersTooLarge,
    #[error("missing Host header")]
    MissingHost,
    #[error("empty Host header")]
    EmptyHost,
    #[error("duplicate Host header")]
    DuplicateHost,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported transfer coding {0}")]
    UnsupportedTransferEncoding(String),
    #[error("request body length required")]
    LengthRequired,
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("malformed chunk framing")]
    InvalidChunk,
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("failed to store request body: {0}")]
    Storage(#[from] io::Error),
}

impl ParseError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedMethod(_) | ParseError::UnsupportedTransferEncoding(_) => {
                StatusCode::NotImplemented
            }
            ParseError::UriTooLong => StatusCode::UriTooLong,
            ParseError::UnsupportedVersion(_) => StatusCode::HttpVersionNotSupported,
            ParseError::HeadersTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            ParseError::PayloadTooLarge { .. } => StatusCode::PayloadTooLarge,
            ParseError::Storage(_) => StatusCode::InternalServerError,
            _ => StatusCode::BadRequest,
        }
    }
}

/// Resolves the body-size limit for a request whose head has been parsed.
///
/// The router implements this so the limit of the matched location applies
/// before a single body byte is buffered.
pub trait BodyLimit {
    fn max_body_size(&self, request: &Request) -> u64;
}

impl BodyLimit for u64 {
    fn max_body_size(&self, _request: &Request) -> u64 {
        *self
    }
}

/// Size limits enforced while parsing.
#[derive(Debug, Clone)]
pub struct ParserLimits {
    pub max_uri_length: usize,
    pub max_header_bytes: usize,
    /// Bodies larger than this are spooled to a temporary file.
    pub body_memory_threshold: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        ParserLimits::from(&Limits::default())
    }
}

impl From<&Limits> for ParserLimits {
    fn from(limits: &Limits) -> Self {
        Self {
            max_uri_length: limits.max_uri_length,
            max_header_bytes: limits.max_header_bytes,
            body_memory_threshold: limits.body_memory_threshold.as_usize(),
        }
    }
}

enum State {
    RequestLine,
    Headers(Box<Request>),
    Body(Box<Request>, BodyState),
}

enum BodyState {
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
}

struct BodyProgress {
    sink: BodySink,
    limit: u64,
    /// Length of the chunk that was completed last.
    last_chunk: u64,
}

/// Incremental HTTP/1.x request parser.
///
/// Bytes are fed through [`RequestParser::parse`] as they arrive. Consumed
/// bytes are removed from the buffer, so whatever remains after a request
/// completes belongs to the next pipelined request.
pub struct RequestParser {
    limits: ParserLimits,
    state: State,
    header_bytes: usize,
    body: Option<BodyProgress>,
}

impl RequestParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            state: State::RequestLine,
            header_bytes: 0,
            body: None,
        }
    }

    /// True while a request has been partially received.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, State::RequestLine)
    }

    /// Parses as much of `buf` as possible.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(request))` - a complete request was consumed from `buf`
    /// * `Ok(None)` - more bytes are needed
    /// * `Err(e)` - the stream is malformed; the parser must not be fed again
    pub fn parse<L: BodyLimit + ?Sized>(
        &mut self,
        buf: &mut BytesMut,
        limit: &L,
    ) -> Result<Option<Request>, ParseError> {
        loop {
            match std::mem::replace(&mut self.state, State::RequestLine) {
                State::RequestLine => {
                    let max = self.limits.max_uri_length + REQUEST_LINE_SLACK;
                    let Some(line) = take_line(buf, max, ParseError::UriTooLong)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        continue;
                    }
                    let request = parse_request_line(&line, &self.limits)?;
                    self.header_bytes = 0;
                    self.state = State::Headers(Box::new(request));
                }
                State::Headers(mut request) => {
                    let budget = self.limits.max_header_bytes.saturating_sub(self.header_bytes);
                    let Some(line) = take_line(buf, budget, ParseError::HeadersTooLarge)? else {
                        self.state = State::Headers(request);
                        return Ok(None);
                    };
                    self.header_bytes += line.len() + 2;
                    if self.header_bytes > self.limits.max_header_bytes {
                        return Err(ParseError::HeadersTooLarge);
                    }
                    if !line.is_empty() {
                        let (name, value) = parse_header_line(&line)?;
                        request.headers.append(name, value);
                        self.state = State::Headers(request);
                        continue;
                    }

                    validate_host(&request)?;
                    let max = limit.max_body_size(&request);
                    let body_state = match body_framing(&request)? {
                        Framing::None | Framing::Length(0) => return Ok(Some(*request)),
                        Framing::Length(n) if n > max => {
                            return Err(ParseError::PayloadTooLarge { limit: max });
                        }
                        Framing::Length(n) => BodyState::Length { remaining: n },
                        Framing::Chunked => BodyState::ChunkSize,
                    };
                    self.body = Some(BodyProgress {
                        sink: BodySink::new(self.limits.body_memory_threshold),
                        limit: max,
                        last_chunk: 0,
                    });
                    self.state = State::Body(request, body_state);
                }
                State::Body(mut request, body_state) => {
                    let Some(progress) = self.body.as_mut() else {
                        return Err(ParseError::InvalidChunk);
                    };
                    match step_body(buf, progress, body_state, &mut self.header_bytes, &self.limits)? {
                        Step::Pending(next) => {
                            self.state = State::Body(request, next);
                            return Ok(None);
                        }
                        Step::Continue(next) => {
                            self.state = State::Body(request, next);
                        }
                        Step::Complete => {
                            if let Some(progress) = self.body.take() {
                                request.body = progress.sink.finish()?;
                            }
                            return Ok(Some(*request));
                        }
                    }
                }
            }
        }
    }
}

enum Step {
    Pending(BodyState),
    Continue(BodyState),
    Complete,
}

fn step_body(
    buf: &mut BytesMut,
    progress: &mut BodyProgress,
    state: BodyState,
    header_bytes: &mut usize,
    limits: &ParserLimits,
) -> Result<Step, ParseError> {
    match state {
        BodyState::Length { remaining } => {
            if buf.is_empty() {
                return Ok(Step::Pending(BodyState::Length { remaining }));
            }
            let n = remaining.min(buf.len() as u64) as usize;
            progress.sink.write(&buf[..n])?;
            buf.advance(n);
            let remaining = remaining - n as u64;
            if remaining == 0 {
                Ok(Step::Complete)
            } else {
                Ok(Step::Pending(BodyState::Length { remaining }))
            }
        }
        BodyState::ChunkSize => {
            let Some(line) = take_line(buf, MAX_CHUNK_LINE, ParseError::InvalidChunkSize)? else {
                return Ok(Step::Pending(BodyState::ChunkSize));
            };
            if line.is_empty() && swallowed_last_chunk(progress)? {
                return Ok(Step::Complete);
            }
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                return Ok(Step::Continue(BodyState::Trailers));
            }
            if progress.sink.len().saturating_add(size) > progress.limit {
                return Err(ParseError::PayloadTooLarge {
                    limit: progress.limit,
                });
            }
            progress.last_chunk = size;
            Ok(Step::Continue(BodyState::ChunkData { remaining: size }))
        }
        BodyState::ChunkData { remaining } => {
            if buf.is_empty() {
                return Ok(Step::Pending(BodyState::ChunkData { remaining }));
            }
            let n = remaining.min(buf.len() as u64) as usize;
            progress.sink.write(&buf[..n])?;
            buf.advance(n);
            let remaining = remaining - n as u64;
            if remaining == 0 {
                Ok(Step::Continue(BodyState::ChunkDataEnd))
            } else {
                Ok(Step::Pending(BodyState::ChunkData { remaining }))
            }
        }
        BodyState::ChunkDataEnd => match buf.first() {
            None => Ok(Step::Pending(BodyState::ChunkDataEnd)),
            Some(b'\n') => {
                buf.advance(1);
                Ok(Step::Continue(BodyState::ChunkSize))
            }
            Some(b'\r') if buf.len() < 2 => Ok(Step::Pending(BodyState::ChunkDataEnd)),
            Some(b'\r') if buf[1] == b'\n' => {
                buf.advance(2);
                Ok(Step::Continue(BodyState::ChunkSize))
            }
            Some(_) => Err(ParseError::InvalidChunk),
        },
        BodyState::Trailers => {
            let budget = limits.max_header_bytes.saturating_sub(*header_bytes);
            let Some(line) = take_line(buf, budget, ParseError::HeadersTooLarge)? else {
                return Ok(Step::Pending(BodyState::Trailers));
            };
            *header_bytes += line.len() + 2;
            if line.is_empty() {
                Ok(Step::Complete)
            } else {
                parse_header_line(&line)?;
                Ok(Step::Continue(BodyState::Trailers))
            }
        }
    }
}

/// Handles clients that announce the final data chunk three bytes too long,
/// so its data swallows the `CRLF 0` of the last-chunk line and the empty
/// line that follows is the terminating CRLF.
fn swallowed_last_chunk(progress: &mut BodyProgress) -> Result<bool, ParseError> {
    const MARKER: &[u8] = b"\r\n0";
    if progress.last_chunk <= MARKER.len() as u64 {
        return Ok(false);
    }
    if progress.sink.tail(MARKER.len())?.as_deref() != Some(MARKER) {
        return Ok(false);
    }
    progress.sink.truncate(MARKER.len() as u64)?;
    Ok(true)
}

/// Removes one line from the front of `buf`, without its terminator.
///
/// Accepts CRLF and bare LF. Fails with `overflow` once the line is longer
/// than `max`, even if its end has not arrived yet.
fn take_line(
    buf: &mut BytesMut,
    max: usize,
    overflow: ParseError,
) -> Result<Option<Vec<u8>>, ParseError> {
    let Some(pos) = find_bytes(buf, b"\n") else {
        if buf.len() > max {
            return Err(overflow);
        }
        return Ok(None);
    };
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    if line.len() > max {
        return Err(overflow);
    }
    Ok(Some(line.to_vec()))
}

fn parse_request_line(line: &[u8], limits: &ParserLimits) -> Result<Request, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine);
    };
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::BadRequestLine);
    }
    if target.len() > limits.max_uri_length {
        return Err(ParseError::UriTooLong);
    }

    let version = parse_version(version)?;
    let method = parse_method(method)?;
    let parts = Target::parse(target)?;
    if parts.path == "*" && method != Method::OPTIONS {
        return Err(ParseError::InvalidTarget);
    }

    Ok(Request {
        method,
        target: target.to_string(),
        path: parts.path,
        raw_path: parts.raw_path,
        query: parts.query,
        version,
        authority: parts.authority,
        headers: Headers::new(),
        body: Default::default(),
    })
}

fn parse_version(token: &str) -> Result<Version, ParseError> {
    match token {
        "HTTP/1.1" => Ok(Version::Http11),
        "HTTP/1.0" => Ok(Version::Http10),
        other if other.starts_with("HTTP/") => {
            Err(ParseError::UnsupportedVersion(other.to_string()))
        }
        _ => Err(ParseError::BadRequestLine),
    }
}

fn parse_method(token: &str) -> Result<Method, ParseError> {
    if let Some(method) = Method::from_str(token) {
        return Ok(method);
    }
    if token.bytes().all(is_token_byte) {
        Err(ParseError::UnsupportedMethod(token.to_string()))
    } else {
        Err(ParseError::InvalidMethod)
    }
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    // obsolete line folding
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::InvalidHeader);
    }
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
        return Err(ParseError::InvalidHeader);
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    Ok((
        String::from_utf8_lossy(name).into_owned(),
        value.trim_matches(|c| c == ' ' || c == '\t').to_string(),
    ))
}

fn validate_host(request: &Request) -> Result<(), ParseError> {
    match request.headers.count("Host") {
        0 if request.version == Version::Http11 => Err(ParseError::MissingHost),
        0 => Ok(()),
        1 => match request.headers.get("Host") {
            Some(host) if host.trim().is_empty() => Err(ParseError::EmptyHost),
            _ => Ok(()),
        },
        _ => Err(ParseError::DuplicateHost),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
}

fn body_framing(request: &Request) -> Result<Framing, ParseError> {
    let codings: Vec<String> = request
        .headers
        .get_all("Transfer-Encoding")
        .flat_map(|v| v.split(','))
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    if !codings.is_empty() {
        return match codings.as_slice() {
            [only] if only == "chunked" => Ok(Framing::Chunked),
            _ => Err(ParseError::UnsupportedTransferEncoding(codings.join(", "))),
        };
    }

    let mut length = None;
    for value in request.headers.get_all("Content-Length").flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let n: u64 = value.parse().map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(previous) if previous != n => return Err(ParseError::InvalidContentLength),
            _ => length = Some(n),
        }
    }

    match length {
        Some(n) => Ok(Framing::Length(n)),
        None if request.method.requires_body_framing() => Err(ParseError::LengthRequired),
        None => Ok(Framing::None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidChunkSize)?;
    let size = line.split(';').next().unwrap_or("").trim_matches(|c| c == ' ' || c == '\t');
    if size.is_empty()
        || size.len() > MAX_CHUNK_DIGITS
        || !size.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(ParseError::InvalidChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunkSize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut parser = RequestParser::new(ParserLimits::default());
        let mut buf = BytesMut::from(input);
        parser.parse(&mut buf, &u64::MAX)
    }

    #[test]
    fn parse_simple_get() {
        let req = parse_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();

        assert_eq!(req.path, "/");
        assert_eq!(req.headers.get("Host").unwrap(), "example.com");
    }

    #[test]
    fn chunk_size_accepts_extensions() {
        assert_eq!(parse_chunk_size(b"1a;name=value").unwrap(), 26);
        assert!(parse_chunk_size(b"g").is_err());
        assert!(parse_chunk_size(b"").is_err());
    }

    #[test]
    fn framing_prefers_chunked() {
        let req = parse_all(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(req.body.is_empty());
    }
}
