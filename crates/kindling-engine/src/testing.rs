//! Scripted fakes for exercising orchestration without real subprocesses
//! or a running engine server.
//!
//! [`ScriptedSpawner`] hands out [`ProcessHandle`]s whose behavior is
//! queued up front, and records every spawn/signal so tests can assert on
//! process lifecycle ordering. [`StaticEngine`] is an [`EngineApi`] over a
//! fixed model listing.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::catalog::ModelDescriptor;
use crate::client::EngineApi;
use crate::error::EngineError;
use crate::process::{ExitStatus, ProcessHandle, ProcessSpawner, Signal};

/// Behavior of one scripted process.
#[derive(Debug, Clone)]
pub enum ScriptBehavior {
    /// Reply with this stdout line each time a line is written to stdin,
    /// staying alive until signaled.
    EchoOnWrite(String),
    /// Emit the given output, then EOF; already exited with `code`.
    OneShot {
        stdout: Vec<String>,
        stderr: Vec<String>,
        code: i32,
    },
    /// Produce no output and never exit on its own.
    Silent,
    /// Accept one stdin write, then exit with `code` without answering.
    ExitOnWrite { code: i32 },
    /// Fail the spawn itself.
    SpawnError(io::ErrorKind),
}

impl ScriptBehavior {
    /// A process that exits immediately with status 0 and no output.
    pub fn exit_ok() -> Self {
        ScriptBehavior::OneShot {
            stdout: vec![],
            stderr: vec![],
            code: 0,
        }
    }

    /// A process that prints one stdout line and exits 0.
    pub fn one_line(line: &str) -> Self {
        ScriptBehavior::OneShot {
            stdout: vec![line.to_string()],
            stderr: vec![],
            code: 0,
        }
    }
}

/// Lifecycle events recorded by the spawner, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned { pid: u32, command: String },
    Signaled { pid: u32, signal: Signal },
    Exited { pid: u32 },
}

/// A [`ProcessSpawner`] that replays queued [`ScriptBehavior`]s.
pub struct ScriptedSpawner {
    scripts: Mutex<VecDeque<ScriptBehavior>>,
    default: Mutex<ScriptBehavior>,
    events: Arc<Mutex<Vec<ProcessEvent>>>,
    next_pid: AtomicU32,
    live: Arc<AtomicUsize>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            default: Mutex::new(ScriptBehavior::Silent),
            events: Arc::new(Mutex::new(Vec::new())),
            next_pid: AtomicU32::new(1),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue the behavior for the next spawn. Spawns beyond the queue get
    /// the default behavior.
    pub fn push(&self, behavior: ScriptBehavior) {
        self.scripts.lock().unwrap().push_back(behavior);
    }

    /// Set the behavior used when the queue is empty (initially `Silent`).
    pub fn set_default(&self, behavior: ScriptBehavior) {
        *self.default.lock().unwrap() = behavior;
    }

    /// All recorded events, in order.
    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Commands spawned so far, e.g. `"ollama run phi3:mini"`.
    pub fn spawned_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProcessEvent::Spawned { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Number of scripted processes currently alive.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> ScriptBehavior {
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().unwrap().clone())
    }

    fn build(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        let behavior = self.next_behavior();
        if let ScriptBehavior::SpawnError(kind) = behavior {
            return Err(io::Error::new(kind, "scripted spawn failure"));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        self.events
            .lock()
            .unwrap()
            .push(ProcessEvent::Spawned { pid, command });

        let inner = match behavior {
            ScriptBehavior::EchoOnWrite(reply) => ProcInner {
                echo: Some(reply),
                ..ProcInner::alive()
            },
            ScriptBehavior::OneShot {
                stdout,
                stderr,
                code,
            } => ProcInner {
                stdout: stdout.into(),
                stderr: stderr.into(),
                exit: Some(ExitStatus { code: Some(code) }),
                ..ProcInner::alive()
            },
            ScriptBehavior::Silent => ProcInner::alive(),
            ScriptBehavior::ExitOnWrite { code } => ProcInner {
                die_on_write: Some(code),
                ..ProcInner::alive()
            },
            ScriptBehavior::SpawnError(_) => unreachable!(),
        };

        if inner.exit.is_none() {
            self.live.fetch_add(1, Ordering::SeqCst);
        }

        Ok(Box::new(ScriptedProcess {
            pid,
            inner: Mutex::new(inner),
            notify: Notify::new(),
            events: Arc::clone(&self.events),
            live: Arc::clone(&self.live),
        }))
    }
}

impl Default for ScriptedSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        self.build(program, args)
    }

    fn spawn_service(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        self.build(program, args)
    }
}

struct ProcInner {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
    echo: Option<String>,
    die_on_write: Option<i32>,
    exit: Option<ExitStatus>,
}

impl ProcInner {
    fn alive() -> Self {
        Self {
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            echo: None,
            die_on_write: None,
            exit: None,
        }
    }
}

struct ScriptedProcess {
    pid: u32,
    inner: Mutex<ProcInner>,
    notify: Notify,
    events: Arc<Mutex<Vec<ProcessEvent>>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedProcess {
    /// Transition to exited exactly once, releasing the live count.
    fn mark_exited(&self, code: Option<i32>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.exit.is_some() {
            return false;
        }
        inner.exit = Some(ExitStatus { code });
        drop(inner);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .push(ProcessEvent::Exited { pid: self.pid });
        self.notify.notify_one();
        true
    }
}

#[async_trait]
impl ProcessHandle for ScriptedProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let die_code = {
            let mut inner = self.inner.lock().unwrap();
            if inner.exit.is_some() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process exited"));
            }
            let _ = line;
            if let Some(reply) = inner.echo.clone() {
                inner.stdout.push_back(reply);
                self.notify.notify_one();
            }
            inner.die_on_write.take()
        };
        if let Some(code) = die_code {
            self.mark_exited(Some(code));
        }
        Ok(())
    }

    async fn read_stdout_line(&mut self) -> io::Result<Option<String>> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(line) = inner.stdout.pop_front() {
                    return Ok(Some(line));
                }
                if inner.exit.is_some() {
                    return Ok(None);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn read_stderr_line(&mut self) -> io::Result<Option<String>> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(line) = inner.stderr.pop_front() {
                    return Ok(Some(line));
                }
                if inner.exit.is_some() {
                    return Ok(None);
                }
            }
            self.notify.notified().await;
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(self.inner.lock().unwrap().exit)
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if let Some(status) = inner.exit {
                    return Ok(status);
                }
            }
            self.notify.notified().await;
        }
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        // Signalling an exited process is a no-op, as with a real child.
        if self.inner.lock().unwrap().exit.is_some() {
            return Ok(());
        }
        self.events.lock().unwrap().push(ProcessEvent::Signaled {
            pid: self.pid,
            signal,
        });
        self.mark_exited(None);
        Ok(())
    }
}

impl Drop for ScriptedProcess {
    // Mirrors `kill_on_drop(true)`: a dropped handle never leaks a child.
    fn drop(&mut self) {
        self.mark_exited(None);
    }
}

/// An [`EngineApi`] over a fixed (or queued) model listing.
pub struct StaticEngine {
    healthy: AtomicBool,
    current: Mutex<Vec<ModelDescriptor>>,
    queued: Mutex<VecDeque<Vec<ModelDescriptor>>>,
    list_calls: AtomicUsize,
    base_url: String,
}

impl StaticEngine {
    pub fn with_models(models: Vec<ModelDescriptor>) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            current: Mutex::new(models),
            queued: Mutex::new(VecDeque::new()),
            list_calls: AtomicUsize::new(0),
            base_url: "http://127.0.0.1:11434".to_string(),
        }
    }

    /// Queue a listing to be returned by the next `list_models` call.
    /// Once consumed it becomes the current listing.
    pub fn push_listing(&self, models: Vec<ModelDescriptor>) {
        self.queued.lock().unwrap().push_back(models);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// How many times `list_models` has been called.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineApi for StaticEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unreachable(self.base_url.clone()))
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, EngineError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.queued.lock().unwrap().pop_front() {
            *self.current.lock().unwrap() = next;
        }
        Ok(self.current.lock().unwrap().clone())
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
