use std::io::Read;
use std::time::SystemTime;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::request::Version;
use crate::http::response::{Response, ResponseBody};

const HTTP_VERSION: &str = "HTTP/1.1";
pub const SERVER_NAME: &str = concat!("webserv/", env!("CARGO_PKG_VERSION"));
const FILE_CHUNK: usize = 64 * 1024;

/// Headers owned by the writer; handler-supplied values are discarded.
const FRAMING_HEADERS: [&str; 5] = [
    "Content-Length",
    "Transfer-Encoding",
    "Connection",
    "Keep-Alive",
    "Date",
];

/// How the end of a response body is signalled to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body bytes follow the head.
    NoBody,
    ContentLength(u64),
    Chunked,
    /// The body ends when the connection closes.
    Close,
}

/// Per-request facts the writer needs besides the response itself.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub version: Version,
    /// Whether the client asked for the connection to stay open.
    pub keep_alive: bool,
    /// HEAD requests get the headers of a GET without its body.
    pub head_only: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            version: Version::Http11,
            keep_alive: true,
            head_only: false,
        }
    }
}

fn choose_framing(response: &Response, options: &WriteOptions) -> Framing {
    if !response.status.allows_body() {
        return Framing::NoBody;
    }
    match response.body.len() {
        Some(len) => Framing::ContentLength(len),
        None if options.head_only => Framing::NoBody,
        None if options.version == Version::Http11 => Framing::Chunked,
        None => Framing::Close,
    }
}

fn serialize_head(response: &Response, framing: Framing, keep_alive: bool) -> Vec<u8> {
    let mut buf = Vec::new();

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        response.status.as_u16(),
        response.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    let mut push = |name: &str, value: &str| {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    };

    push("Date", &httpdate::fmt_http_date(SystemTime::now()));
    if !response.headers.contains("Server") {
        push("Server", SERVER_NAME);
    }
    for (name, value) in response.headers.iter() {
        if FRAMING_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        push(name, value);
    }
    match framing {
        Framing::ContentLength(len) => push("Content-Length", &len.to_string()),
        Framing::Chunked => push("Transfer-Encoding", "chunked"),
        Framing::NoBody | Framing::Close => {}
    }
    push("Connection", if keep_alive { "keep-alive" } else { "close" });

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes one response onto a stream.
pub struct ResponseWriter {
    head: Vec<u8>,
    written: usize,
    body: ResponseBody,
    framing: Framing,
    head_only: bool,
    keep_alive: bool,
}

impl ResponseWriter {
    pub fn new(response: Response, options: WriteOptions) -> Self {
        let framing = choose_framing(&response, &options);
        let keep_alive = options.keep_alive && !response.close && framing != Framing::Close;
        Self {
            head: serialize_head(&response, framing, keep_alive),
            written: 0,
            body: response.body,
            framing,
            head_only: options.head_only,
            keep_alive,
        }
    }

    /// Whether the connection may carry another request afterwards.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The serialized status line and headers.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Writes the head and then the body according to the chosen framing.
    ///
    /// An error part way through leaves a truncated response on the wire;
    /// the caller must close the connection.
    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.head.len() {
            let n = stream.write(&self.head[self.written..]).await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        let body = std::mem::take(&mut self.body);
        let send_body = !self.head_only && self.framing != Framing::NoBody;

        match body {
            ResponseBody::Empty => {}
            ResponseBody::Bytes(bytes) => {
                if send_body {
                    stream.write_all(&bytes).await?;
                }
            }
            ResponseBody::File { mut file, len } => {
                if send_body {
                    let mut chunk = vec![0u8; FILE_CHUNK];
                    let mut remaining = len;
                    while remaining > 0 {
                        let want = remaining.min(FILE_CHUNK as u64) as usize;
                        let n = file.read(&mut chunk[..want])?;
                        if n == 0 {
                            return Err(anyhow::anyhow!("file shrank while sending"));
                        }
                        stream.write_all(&chunk[..n]).await?;
                        remaining -= n as u64;
                    }
                }
            }
            ResponseBody::Stream(mut cgi) => {
                if !send_body {
                    cgi.abort().await;
                } else {
                    while let Some(data) = cgi.next_chunk().await? {
                        if self.framing == Framing::Chunked {
                            stream.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
                            stream.write_all(&data).await?;
                            stream.write_all(b"\r\n").await?;
                        } else {
                            stream.write_all(&data).await?;
                        }
                    }
                    if self.framing == Framing::Chunked {
                        stream.write_all(b"0\r\n\r\n").await?;
                    }
                }
            }
        }

        stream.flush().await?;
        Ok(())
    }
}
