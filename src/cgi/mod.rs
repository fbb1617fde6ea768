//! CGI/1.1 gateway.
//!
//! A request whose path names a script with a registered extension is
//! handed to the script's interpreter:
//!
//! 1. the environment is built from the request ([`env::build`])
//! 2. the interpreter is spawned in the script's directory ([`CgiProcess`])
//! 3. the body is fed to stdin while stdout is collected
//! 4. the header block is parsed ([`output::split_output`]) and turned into a
//!    response, buffered or streamed depending on its size
//!
//! Every child is reaped: on exit, on timeout (after a kill) and, through
//! `kill_on_drop`, when the connection owning it goes away.

pub mod env;
pub mod output;
pub mod process;

pub use process::{CgiProcess, CgiStream};

use bytes::BytesMut;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::time::timeout_at;
use tracing::{debug, info};

use crate::config::{Limits, Location};
use crate::http::body::Body;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::router::path;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to spawn CGI interpreter: {0}")]
    Spawn(#[source] io::Error),
    #[error("CGI script timed out after {0:?}")]
    Timeout(Duration),
    #[error("CGI script exited with {0}")]
    Failed(ExitStatus),
    #[error("CGI script produced no valid header block")]
    InvalidOutput,
    #[error("CGI pipe error: {0}")]
    Io(#[from] io::Error),
}

impl CgiError {
    pub fn status(&self) -> StatusCode {
        match self {
            CgiError::Timeout(_) => StatusCode::GatewayTimeout,
            _ => StatusCode::InternalServerError,
        }
    }
}

/// The script named by a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    /// Script path relative to the location root, e.g. `sub/test.py`.
    pub script: String,
    /// Remainder of the path after the script, e.g. `/extra/path`.
    pub path_info: String,
    pub extension: String,
}

/// Finds the first path segment whose extension has an interpreter.
///
/// ```
/// # use webserv::cgi::locate_script;
/// # use webserv::config::Config;
/// let config = Config::from_yaml_str(r#"
/// servers:
///   - listen: ["127.0.0.1:8080"]
///     root: /srv
///     locations:
///       - path: /cgi-bin
///         cgi: { .py: /usr/bin/python3 }
/// "#).unwrap();
/// let location = &config.servers[0].locations[0];
/// let target = locate_script(location, "/test.py/extra/path").unwrap();
/// assert_eq!(target.script, "test.py");
/// assert_eq!(target.path_info, "/extra/path");
/// ```
pub fn locate_script(location: &Location, relative: &str) -> Option<ScriptTarget> {
    if !location.is_cgi() {
        return None;
    }
    let segments = path::normalize(relative).ok()?;
    for (i, segment) in segments.iter().enumerate() {
        let Some((_, ext)) = segment.rsplit_once('.') else {
            continue;
        };
        let extension = format!(".{ext}");
        if location.cgi_interpreter(&extension).is_none() {
            continue;
        }
        let path_info = if i + 1 < segments.len() {
            format!("/{}", segments[i + 1..].join("/"))
        } else {
            String::new()
        };
        return Some(ScriptTarget {
            script: segments[..=i].join("/"),
            path_info,
            extension,
        });
    }
    None
}

/// Everything needed to run one script for one request.
#[derive(Debug)]
pub struct CgiRequest<'a> {
    pub request: &'a Request,
    pub interpreter: &'a Path,
    /// Absolute path of the script.
    pub script_path: PathBuf,
    /// URL path of the script, e.g. `/cgi-bin/test.py`.
    pub script_name: String,
    pub path_info: String,
    pub path_translated: Option<PathBuf>,
    pub server_name: String,
    pub server_port: u16,
    pub remote: SocketAddr,
}

/// Runs CGI scripts under the daemon's timeout and buffering limits.
#[derive(Debug, Clone)]
pub struct CgiGateway {
    timeout: Duration,
    buffer_limit: usize,
}

struct Collected {
    stdout: ChildStdout,
    output: BytesMut,
    eof: bool,
}

impl CgiGateway {
    pub fn new(timeout: Duration, buffer_limit: usize) -> Self {
        Self {
            timeout,
            buffer_limit,
        }
    }

    pub fn from_limits(limits: &Limits) -> Self {
        Self::new(limits.cgi_timeout(), limits.cgi_buffer_limit.as_usize())
    }

    /// Runs the script and converts its output into a response.
    pub async fn execute(&self, cgi: &CgiRequest<'_>) -> Result<Response, CgiError> {
        let env = env::build(cgi);
        let (mut process, stdin, stdout) =
            CgiProcess::spawn(cgi.interpreter, &cgi.script_path, &env, self.timeout)
                .map_err(CgiError::Spawn)?;

        let feed = feed_stdin(stdin, &cgi.request.body);
        let collect = collect_output(stdout, self.buffer_limit);
        let collected = match timeout_at(process.deadline(), async {
            let (fed, collected) = tokio::join!(feed, collect);
            if let Err(e) = fed {
                debug!(error = %e, "CGI stopped reading its input");
            }
            collected
        })
        .await
        {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => {
                process.kill_and_reap().await;
                return Err(CgiError::Io(e));
            }
            Err(_) => {
                process.kill_and_reap().await;
                return Err(process.timed_out());
            }
        };

        let Collected {
            stdout,
            mut output,
            eof,
        } = collected;

        if eof {
            let status = process.wait().await?;
            info!(
                script = %cgi.script_name,
                pid = ?process.pid(),
                exit = %status,
                elapsed = ?process.elapsed(),
                "CGI finished"
            );
            if !status.success() {
                return Err(CgiError::Failed(status));
            }
            let (head, body_start) = output::split_output(&output)?;
            let body = output.split_off(body_start).freeze();
            let mut builder = ResponseBuilder::new(head.status);
            for (name, value) in head.headers.iter() {
                builder = builder.header(name, value);
            }
            return Ok(builder.body(body).build());
        }

        // Too large to buffer: the header block is complete, the rest streams.
        let (head, body_start) = match output::find_header_boundary(&output) {
            Some(_) => output::split_output(&output)?,
            None => {
                process.kill_and_reap().await;
                return Err(CgiError::InvalidOutput);
            }
        };
        let pending = output.split_off(body_start).freeze();
        debug!(script = %cgi.script_name, pid = ?process.pid(), "streaming CGI output");
        let mut builder = ResponseBuilder::new(head.status);
        for (name, value) in head.headers.iter() {
            builder = builder.header(name, value);
        }
        Ok(builder
            .stream(CgiStream::new(process, stdout, pending))
            .build())
    }
}

/// Writes the request body to the script, then closes its stdin.
async fn feed_stdin(mut stdin: ChildStdin, body: &Body) -> io::Result<()> {
    let mut reader = body.reader()?;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        stdin.write_all(&chunk[..n]).await?;
    }
    stdin.shutdown().await?;
    Ok(())
}

/// Reads stdout until EOF, or until more than `limit` bytes including a
/// complete header block are buffered.
async fn collect_output(mut stdout: ChildStdout, limit: usize) -> io::Result<Collected> {
    let mut output = BytesMut::with_capacity(READ_CHUNK);
    loop {
        output.reserve(READ_CHUNK);
        let n = stdout.read_buf(&mut output).await?;
        if n == 0 {
            return Ok(Collected {
                stdout,
                output,
                eof: true,
            });
        }
        if output.len() > limit {
            return Ok(Collected {
                stdout,
                output,
                eof: false,
            });
        }
    }
}
