//! Child process handling for CGI scripts.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace, warn};

use super::CgiError;

/// stderr bytes kept for the log; the rest is discarded.
const MAX_STDERR_LOG: u64 = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;
/// Upper bound on waiting for a killed child to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// A running CGI script.
///
/// The child is spawned with `kill_on_drop`, so dropping a `CgiProcess`
/// (e.g. because the client went away) kills the script and leaves the
/// runtime to reap it.
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    pid: Option<u32>,
    script: PathBuf,
    timeout: Duration,
    deadline: Instant,
}

impl CgiProcess {
    /// Runs `interpreter script` inside the script's directory.
    pub fn spawn(
        interpreter: &Path,
        script: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> io::Result<(Self, ChildStdin, ChildStdout)> {
        let dir = script.parent().unwrap_or(Path::new("."));
        let mut child = Command::new(interpreter)
            .arg(script)
            .env_clear()
            .envs(env)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("CGI child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("CGI child stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, script.to_path_buf()));
        }

        let pid = child.id();
        debug!(script = %script.display(), pid = ?pid, "CGI spawned");
        Ok((
            Self {
                child,
                pid,
                script: script.to_path_buf(),
                timeout,
                deadline: Instant::now() + timeout,
            },
            stdin,
            stdout,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// The moment the script runs out of time.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.timeout.saturating_sub(self.deadline.saturating_duration_since(Instant::now()))
    }

    /// Waits for the script to exit, killing it at the deadline.
    pub async fn wait(&mut self) -> Result<ExitStatus, CgiError> {
        match timeout_at(self.deadline, self.child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => {
                self.kill_and_reap().await;
                Err(CgiError::Io(e))
            }
            Err(_) => {
                self.kill_and_reap().await;
                Err(self.timed_out())
            }
        }
    }

    /// Kills the script and waits for it to be reaped.
    pub async fn kill_and_reap(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // already exited; still needs reaping below
            debug!(pid = ?self.pid, error = %e, "CGI kill failed");
        }
        match timeout(REAP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "CGI reaped"),
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "CGI reap failed"),
            Err(_) => warn!(pid = ?self.pid, "CGI did not exit after kill"),
        }
    }

    pub(crate) fn timed_out(&self) -> CgiError {
        warn!(script = %self.script.display(), pid = ?self.pid, timeout = ?self.timeout, "CGI timed out");
        CgiError::Timeout(self.timeout)
    }
}

async fn log_stderr<R: AsyncRead + Unpin>(mut stderr: R, script: PathBuf) {
    let mut captured = Vec::new();
    if let Err(e) = (&mut stderr).take(MAX_STDERR_LOG).read_to_end(&mut captured).await {
        debug!(error = %e, "CGI stderr read failed");
        return;
    }
    // keep draining so the script never blocks on a full pipe
    if let Err(e) = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await {
        trace!(error = %e, "CGI stderr drain failed");
    }
    let text = String::from_utf8_lossy(&captured);
    let text = text.trim_end();
    if !text.is_empty() {
        warn!(script = %script.display(), stderr = %text, "CGI stderr output");
    }
}

/// The body of a CGI response that was too large to buffer.
///
/// Yields stdout in chunks until EOF, then checks the exit status. The
/// script's deadline still applies while streaming.
#[derive(Debug)]
pub struct CgiStream {
    process: CgiProcess,
    stdout: ChildStdout,
    pending: Option<Bytes>,
    finished: bool,
}

impl CgiStream {
    pub(crate) fn new(process: CgiProcess, stdout: ChildStdout, pending: Bytes) -> Self {
        Self {
            process,
            stdout,
            pending: Some(pending).filter(|p| !p.is_empty()),
            finished: false,
        }
    }

    /// Next piece of output, `None` after a successful exit.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CgiError> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        if self.finished {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match timeout_at(self.process.deadline(), self.stdout.read_buf(&mut buf)).await {
            Err(_) => {
                self.finished = true;
                self.process.kill_and_reap().await;
                Err(self.process.timed_out())
            }
            Ok(Err(e)) => {
                self.finished = true;
                self.process.kill_and_reap().await;
                Err(CgiError::Io(e))
            }
            Ok(Ok(0)) => {
                self.finished = true;
                let status = self.process.wait().await?;
                if status.success() {
                    debug!(pid = ?self.process.pid(), elapsed = ?self.process.elapsed(), "CGI stream finished");
                    Ok(None)
                } else {
                    Err(CgiError::Failed(status))
                }
            }
            Ok(Ok(_)) => Ok(Some(buf.freeze())),
        }
    }

    /// Stops the script without reading the rest of its output.
    pub async fn abort(&mut self) {
        if !self.finished {
            self.finished = true;
            self.process.kill_and_reap().await;
        }
    }
}
