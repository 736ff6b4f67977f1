//! Worker process management.
//!
//! Provides `WorkerHandle` for spawning and talking to one isolated worker
//! process, and `WorkerKillHandle` for killing it from another thread.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::registry::Catalog;

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

const WORKER_PATH_ENV: &str = "TESSERA_WORKER_PATH";

fn worker_binary_name() -> &'static str {
    if cfg!(windows) {
        "tessera-worker.exe"
    } else {
        "tessera-worker"
    }
}

/// Location of the worker executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    path: PathBuf,
}

impl WorkerProgram {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find the worker binary.
    ///
    /// An explicit path wins. Otherwise looks in order at:
    /// 1. `TESSERA_WORKER_PATH` environment variable
    /// 2. Same directory as the current executable (and its parent, for
    ///    test binaries under `deps/`)
    /// 3. System PATH
    /// 4. The workspace `target/` directory
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Self::new(path));
            }
            return Err(Error::Spawn(format!(
                "worker binary not found at {}",
                path.display()
            )));
        }

        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Self::new(path));
            }
            tracing::warn!(
                "{} points at missing file {}",
                WORKER_PATH_ENV,
                path.display()
            );
        }

        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let candidates = [Some(exe_dir.as_path()), exe_dir.parent()];
            for dir in candidates.into_iter().flatten() {
                let path = dir.join(worker_binary_name());
                if path.exists() {
                    return Ok(Self::new(path));
                }
            }
        }

        if let Ok(path) = which::which(worker_binary_name()) {
            return Ok(Self::new(path));
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in ["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(worker_binary_name());
                if path.exists() {
                    return Ok(Self::new(path.canonicalize().unwrap_or(path)));
                }
            }
        }

        Err(Error::Spawn(format!(
            "Could not find tessera-worker binary. Set {} or ensure it's in PATH.",
            WORKER_PATH_ENV
        )))
    }
}

/// Handle to a worker process.
///
/// Calls are blocking; run them on a blocking thread.
pub struct WorkerHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    /// Set once the process has been killed or reaped.
    dead: bool,
    /// Shared with kill handles; set when a forced kill was requested.
    kill_requested: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Spawn a worker process and verify it answers a ping.
    pub fn spawn(program: &WorkerProgram) -> Result<Self> {
        let mut child = Command::new(program.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!(
                    "Failed to spawn worker process '{}': {}",
                    program.path().display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to get worker stdout".to_string()))?;

        let pid = child.id();
        let mut handle = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            pid,
            dead: false,
            kill_requested: Arc::new(AtomicBool::new(false)),
        };

        let handshake = handle
            .send_command(&WorkerCommand::Ping)
            .and_then(|()| handle.recv_response());
        match handshake {
            Ok(WorkerResponse::Pong) => {
                tracing::debug!("Worker {} is up", pid);
                Ok(handle)
            }
            Ok(other) => Err(Error::Spawn(format!(
                "Unexpected handshake response from worker {}: {:?}",
                pid, other
            ))),
            Err(e) => Err(Error::Spawn(format!(
                "Worker {} failed the handshake: {}",
                pid, e
            ))),
        }
    }

    fn send_command(&mut self, cmd: &WorkerCommand) -> Result<()> {
        if self.dead {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, cmd)
    }

    fn recv_response(&mut self) -> Result<WorkerResponse> {
        if self.dead {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        read_message(&mut self.stdout)
    }

    /// Send a command and read its response, treating a broken pipe as a
    /// crash of the worker.
    fn round_trip(&mut self, cmd: &WorkerCommand) -> Result<WorkerResponse> {
        let result = self
            .send_command(cmd)
            .and_then(|()| self.recv_response());
        result.map_err(|e| self.crashed(e))
    }

    /// Reap a worker whose pipe broke and describe why it died.
    fn crashed(&mut self, cause: Error) -> Error {
        if self.dead {
            return Error::WorkerCrashed {
                pid: self.pid,
                message: cause.to_string(),
            };
        }
        self.dead = true;
        let _ = self.child.kill();
        let message = match self.child.wait() {
            Ok(status) => format!("{} ({})", status, cause),
            Err(_) => cause.to_string(),
        };
        Error::WorkerCrashed {
            pid: self.pid,
            message,
        }
    }

    /// Fetch the worker's unit catalog.
    pub fn describe(&mut self) -> Result<Catalog> {
        match self.round_trip(&WorkerCommand::Describe)? {
            WorkerResponse::Catalog { catalog_json } => Ok(serde_json::from_slice(&catalog_json)?),
            other => Err(Error::Ipc(format!(
                "Unexpected response to Describe: {:?}",
                other
            ))),
        }
    }

    /// Run a unit and return its output as JSON bytes.
    pub fn execute(&mut self, unit: &str, args_json: Vec<u8>) -> Result<Vec<u8>> {
        let cmd = WorkerCommand::Execute {
            unit: unit.to_string(),
            args_json,
        };

        match self.round_trip(&cmd)? {
            WorkerResponse::Output { value_json } => Ok(value_json),
            WorkerResponse::Error { message } => Err(Error::Execution(message)),
            WorkerResponse::Panic { message } => {
                Err(Error::Execution(format!("unit {} panicked: {}", unit, message)))
            }
            WorkerResponse::UnknownUnit { unit } => Err(Error::UnitNotFound(unit)),
            other => Err(Error::Ipc(format!(
                "Unexpected response when executing: {:?}",
                other
            ))),
        }
    }

    /// Handle that can kill this worker from any thread.
    pub fn kill_handle(&self) -> WorkerKillHandle {
        WorkerKillHandle {
            pid: self.pid,
            killed: Arc::clone(&self.kill_requested),
        }
    }

    /// Whether a forced kill was requested through a kill handle.
    pub fn was_killed(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    /// Kill the worker process immediately and reap it.
    pub fn kill(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;
        self.kill_requested.store(true, Ordering::SeqCst);

        if let Err(e) = self.child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker {}: {}", self.pid, e);
            }
        }
        let _ = self.child.wait();
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.dead || self.was_killed() {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Graceful shutdown: ask the worker to exit and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        if self.dead {
            return Ok(());
        }

        let ack = self
            .send_command(&WorkerCommand::Shutdown)
            .and_then(|()| self.recv_response());
        if let Err(e) = ack {
            tracing::debug!("Worker {} did not acknowledge shutdown: {}", self.pid, e);
        }

        self.dead = true;
        match self.child.wait() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error::Ipc(format!(
                "Worker {} exited with status: {}",
                self.pid, status
            ))),
            Err(e) => Err(Error::Ipc(format!("Failed to wait for worker: {}", e))),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("dead", &self.dead)
            .finish()
    }
}

/// Thread-safe handle for killing a worker from another thread.
#[derive(Clone, Debug)]
pub struct WorkerKillHandle {
    pid: u32,
    killed: Arc<AtomicBool>,
}

impl WorkerKillHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the worker process with SIGKILL.
    ///
    /// The blocked call on the worker's pipe then fails and the worker is
    /// reaped by whoever owns its `WorkerHandle`.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                tracing::debug!(
                    "kill({}) failed: {}",
                    self.pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        #[cfg(not(unix))]
        tracing::warn!(
            "Forced kill of worker {} is not supported on this platform",
            self.pid
        );
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_explicit_missing() {
        let result = WorkerProgram::resolve(Some(Path::new("/nonexistent/tessera-worker")));
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[test]
    fn test_resolve_explicit_existing() {
        let exe = std::env::current_exe().unwrap();
        let program = WorkerProgram::resolve(Some(&exe)).unwrap();
        assert_eq!(program.path(), exe.as_path());
    }

    #[test]
    fn test_spawn_missing_binary() {
        let program = WorkerProgram::new("/nonexistent/tessera-worker");
        let err = WorkerHandle::spawn(&program).unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_non_worker_fails_handshake() {
        // `true` exits immediately without answering the ping.
        let Ok(path) = which::which("true") else {
            return;
        };
        let err = WorkerHandle::spawn(&WorkerProgram::new(path)).unwrap_err();
        assert!(matches!(err, Error::Spawn(msg) if msg.contains("handshake")));
    }
}
