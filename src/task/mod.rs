//! External process invocation for the Xcode toolchain.
//!
//! Every toolchain binary the crate touches (`xcodebuild`, `lipo`, `xcrun`,
//! `dwarfdump`, `dsymutil`, `strip`, `codesign`) is invoked through the
//! [`TaskRunner`] trait. A runner yields a stream of [`TaskEvent`]s — launch
//! notification followed by interleaved stdout/stderr output — and exactly
//! one terminal outcome: collected stdout on success, or a [`TaskError`].
//!
//! The real implementation is [`ProcessRunner`]; tests substitute
//! [`crate::mock::ScriptedRunner`].

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Result type for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors from a single toolchain invocation
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {code}: {stderr}", code = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Cooperative cancellation token shared between the embedding caller and
/// every in-flight invocation. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One toolchain invocation: program, arguments, working directory, and an
/// optional wall-clock deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
            timeout: None,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-style rendering for diagnostics and progress events.
    pub fn display_command(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Lifecycle events observed during one invocation.
///
/// Zero or more `Stdout`/`Stderr` events follow a single `Launch`; the
/// terminal outcome is the return value of [`TaskRunner::run`], never an
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// The process was spawned.
    Launch { command: String },
    /// A line of standard output (without trailing newline).
    Stdout(Vec<u8>),
    /// A line of standard error (without trailing newline).
    Stderr(Vec<u8>),
}

/// Contract for invoking an external toolchain process.
///
/// `run` streams events to `sink` as they arrive and returns the collected
/// stdout on success. Implementations must observe `cancel` at least at
/// launch and while waiting, terminating the child when it fires.
pub trait TaskRunner: Send + Sync {
    fn run(
        &self,
        request: &TaskRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TaskEvent),
    ) -> TaskResult<Vec<u8>>;
}

enum Chunk {
    Out(Vec<u8>),
    Err(Vec<u8>),
}

/// Runs real processes via `std::process::Command` with piped output,
/// streaming each line through reader threads into the caller's sink.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl TaskRunner for ProcessRunner {
    fn run(
        &self,
        request: &TaskRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TaskEvent),
    ) -> TaskResult<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = request.current_dir {
            command.current_dir(dir);
        }
        // Own process group, so termination reaches every helper the
        // toolchain spawns, not just the direct child.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| TaskError::Spawn {
            program: request.program.clone(),
            source,
        })?;

        sink(TaskEvent::Launch {
            command: request.display_command(),
        });

        let (tx, rx) = mpsc::channel();

        let stdout = child.stdout.take();
        let tx_out = tx.clone();
        let stdout_handle = std::thread::spawn(move || {
            if let Some(stdout) = stdout {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            if tx_out.send(Chunk::Out(line.into_bytes())).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        let stderr = child.stderr.take();
        let tx_err = tx;
        let stderr_handle = std::thread::spawn(move || {
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => {
                            if tx_err.send(Chunk::Err(line.into_bytes())).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        let started = Instant::now();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let status = loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(Chunk::Out(line)) => {
                    stdout_buf.extend_from_slice(&line);
                    stdout_buf.push(b'\n');
                    sink(TaskEvent::Stdout(line));
                    continue;
                }
                Ok(Chunk::Err(line)) => {
                    stderr_buf.extend_from_slice(&line);
                    stderr_buf.push(b'\n');
                    sink(TaskEvent::Stderr(line));
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Streams are closed but the child may still be running;
                    // keep polling its exit below.
                    std::thread::sleep(Duration::from_millis(50));
                }
            }

            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(TaskError::Cancelled);
            }

            if let Some(timeout) = request.timeout {
                if started.elapsed() >= timeout {
                    terminate(&mut child);
                    return Err(TaskError::Timeout {
                        program: request.program.clone(),
                        timeout,
                    });
                }
            }

            if let Some(status) = child.try_wait()? {
                // Drain whatever the readers still have buffered.
                while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(50)) {
                    match chunk {
                        Chunk::Out(line) => {
                            stdout_buf.extend_from_slice(&line);
                            stdout_buf.push(b'\n');
                            sink(TaskEvent::Stdout(line));
                        }
                        Chunk::Err(line) => {
                            stderr_buf.extend_from_slice(&line);
                            stderr_buf.push(b'\n');
                            sink(TaskEvent::Stderr(line));
                        }
                    }
                }
                break status;
            }
        };

        // The reader threads are never joined: a grandchild that inherited
        // the pipes can hold the write ends open long after the direct
        // child exited. The threads finish on their own once the pipes
        // close.
        drop(stdout_handle);
        drop(stderr_handle);

        if status.success() {
            Ok(stdout_buf)
        } else {
            Err(TaskError::Failed {
                program: request.program.clone(),
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            })
        }
    }
}

/// Stop `child` and everything it spawned. The child leads its own process
/// group, so the signal reaches grandchildren too: SIGTERM first, SIGKILL
/// after a short grace period.
#[cfg(unix)]
fn terminate(child: &mut std::process::Child) {
    let group = child.id() as libc::pid_t;
    unsafe { libc::kill(-group, libc::SIGTERM) };

    let grace = Instant::now();
    while grace.elapsed() < Duration::from_millis(500) {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    unsafe { libc::kill(-group, libc::SIGKILL) };
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}
