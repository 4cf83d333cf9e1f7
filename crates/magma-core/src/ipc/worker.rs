//! Worker process management.
//!
//! Provides `WorkerHandle` for spawning and talking to a `magma-worker`
//! child, and `WorkerKillHandle` for killing it from another thread.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::WORKER_PATH_ENV;
use crate::error::{Error, Result};

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

const WORKER_NAME: &str = if cfg!(windows) {
    "magma-worker.exe"
} else {
    "magma-worker"
};

/// Handle to a worker process.
///
/// The process is killed when the handle is dropped.
pub struct WorkerHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    /// Taken by the executor's reader thread once the job starts.
    stdout: Option<BufReader<ChildStdout>>,
    killed: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Spawn a worker and verify it answers a ping.
    pub fn spawn(worker_path: &Path) -> Result<Self> {
        let mut child = Command::new(worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to stderr
            .spawn()
            .map_err(|e| {
                Error::Worker(format!(
                    "Failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let mut handle = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: Some(BufReader::new(stdout)),
            killed: Arc::new(AtomicBool::new(false)),
        };

        handle.send_command(&WorkerCommand::Ping)?;
        match handle.recv_response()? {
            WorkerResponse::Pong => Ok(handle),
            other => Err(Error::Ipc(format!(
                "Unexpected response from worker: {:?}",
                other
            ))),
        }
    }

    /// Send a command to the worker.
    pub fn send_command(&mut self, cmd: &WorkerCommand) -> Result<()> {
        if self.is_killed() {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, cmd)
    }

    /// Receive a response from the worker.
    pub fn recv_response(&mut self) -> Result<WorkerResponse> {
        if self.is_killed() {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| Error::Ipc("Worker stdout already taken".to_string()))?;
        read_message(stdout)
    }

    /// Take the response stream, e.g. to read it on another thread.
    pub fn take_stdout(&mut self) -> Option<BufReader<ChildStdout>> {
        self.stdout.take()
    }

    /// Kill handle sharing this worker's killed flag.
    pub fn kill_handle(&self) -> WorkerKillHandle {
        WorkerKillHandle {
            pid: self.pid(),
            killed: Arc::clone(&self.killed),
        }
    }

    /// Kill the worker process immediately and reap it.
    pub fn kill(&mut self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);

        if let Err(e) = self.child.kill() {
            // InvalidInput means the process already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker: {}", e);
            }
        }
        self.child.wait()?;
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.kill();
        }
    }
}

/// Thread-safe handle for killing a worker from another thread.
#[derive(Debug, Clone)]
pub struct WorkerKillHandle {
    pid: u32,
    killed: Arc<AtomicBool>,
}

impl WorkerKillHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the worker process. Only the first call sends a signal.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Killing worker process {}", self.pid);

        #[cfg(unix)]
        {
            // SIGKILL for immediate termination
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = Command::new("taskkill")
                .args(["/F", "/PID", &self.pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }

    /// Check if kill has been requested.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Find the magma-worker binary.
///
/// Looks in the following order:
/// 1. The configured path
/// 2. `MAGMA_WORKER_PATH` environment variable
/// 3. Same directory as the current executable
/// 4. System PATH
/// 5. `target/debug` or `target/release` of the workspace
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Worker(format!(
            "configured worker binary {} does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(WORKER_NAME);
        if worker_path.exists() {
            return Ok(worker_path);
        }
        // Test binaries live one level below the profile directory
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(WORKER_NAME);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    let workspace = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..").join("..");
    for profile in ["debug", "release"] {
        let path = workspace.join("target").join(profile).join(WORKER_NAME);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Worker(format!(
        "could not find the {} binary",
        WORKER_NAME
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_configured_path_wins() {
        let temp = TempDir::new().unwrap();
        let fake = temp.path().join("my-worker");
        std::fs::write(&fake, b"").unwrap();

        assert_eq!(find_worker_binary(Some(&fake)).unwrap(), fake);
    }

    #[test]
    fn test_missing_configured_path_is_worker_error() {
        let result = find_worker_binary(Some(Path::new("/nonexistent/magma-worker")));
        assert!(matches!(result, Err(Error::Worker(_))));
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let result = WorkerHandle::spawn(Path::new("/nonexistent/magma-worker"));
        assert!(matches!(result, Err(Error::Worker(_))));
    }
}
