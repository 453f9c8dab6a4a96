//! Subprocess control abstraction.
//!
//! Orchestration code never touches `tokio::process` directly; it goes
//! through [`ProcessHandle`] and [`ProcessSpawner`] so the same logic can be
//! exercised against scripted fakes (see [`crate::testing`]) without
//! starting real processes.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Signals understood by [`ProcessHandle::signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination (SIGTERM on unix) so the process can flush.
    Term,
    /// Forceful kill (SIGKILL on unix).
    Kill,
}

/// Exit information for a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Capability set over one live child process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Process id, as reported at spawn time.
    fn id(&self) -> u32;

    /// Write `line` plus a terminating newline to the child's stdin.
    async fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read the next stdout line. `None` means the stream hit EOF.
    async fn read_stdout_line(&mut self) -> io::Result<Option<String>>;

    /// Read the next stderr line. `None` means the stream hit EOF.
    async fn read_stderr_line(&mut self) -> io::Result<Option<String>>;

    /// Non-blocking exit check. `Some` once the process has exited.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Deliver a signal. Signalling an already-dead process is a no-op.
    fn signal(&mut self, signal: Signal) -> io::Result<()>;
}

/// Spawns children with a uniform stdio policy.
pub trait ProcessSpawner: Send + Sync {
    /// Spawn `program` with piped stdin/stdout/stderr. The child is killed
    /// if its handle is dropped, so a lost handle never leaks a process.
    fn spawn(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>>;

    /// Spawn a long-lived service with detached (null) stdio. The child
    /// outlives its handle; used for starting the engine server itself.
    fn spawn_service(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Production spawner over `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let id = child.id().unwrap_or(0);
        debug!("spawned '{}' (pid {})", program, id);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        Ok(Box::new(TokioProcess {
            child,
            id,
            stdin,
            stdout,
            stderr,
        }))
    }

    fn spawn_service(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let id = child.id().unwrap_or(0);
        debug!("spawned service '{}' (pid {})", program, id);

        let _ = child.stdin.take();
        Ok(Box::new(TokioProcess {
            child,
            id,
            stdin: None,
            stdout: None,
            stderr: None,
        }))
    }
}

struct TokioProcess {
    child: Child,
    id: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn id(&self) -> u32 {
        self.id
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin not piped"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn read_stdout_line(&mut self) -> io::Result<Option<String>> {
        match self.stdout.as_mut() {
            Some(lines) => lines.next_line().await,
            None => Ok(None),
        }
    }

    async fn read_stderr_line(&mut self) -> io::Result<Option<String>> {
        match self.stderr.as_mut() {
            Some(lines) => lines.next_line().await,
            None => Ok(None),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ExitStatus {
                code: status.code(),
            }))
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        Ok(ExitStatus {
            code: status.code(),
        })
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        // Already reaped: nothing to deliver.
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(self.id as i32, sig) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Exited between try_wait and kill.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: Signal) -> io::Result<()> {
        // No graceful signal on this platform; both map to a hard kill.
        self.child.start_kill()
    }
}

/// Terminate a child gracefully: SIGTERM, a bounded grace window, then
/// SIGKILL. Always reaps the process before returning.
pub async fn terminate_with_grace(handle: &mut dyn ProcessHandle, grace: Duration) -> ExitStatus {
    if let Err(e) = handle.signal(Signal::Term) {
        warn!("failed to signal process {}: {}", handle.id(), e);
    }

    let tick = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < grace {
        match handle.try_wait() {
            Ok(Some(status)) => return status,
            Ok(None) => {}
            Err(e) => {
                warn!("error checking process {}: {}", handle.id(), e);
                break;
            }
        }
        sleep(tick).await;
        waited += tick;
    }

    warn!("process {} didn't exit gracefully, killing", handle.id());
    if let Err(e) = handle.signal(Signal::Kill) {
        warn!("failed to kill process {}: {}", handle.id(), e);
    }
    handle.wait().await.unwrap_or(ExitStatus { code: None })
}
