//! Child-process plumbing shared by the command-backed walkers and the text
//! search driver.

use std::io::Read;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::error::{Result, SearchError};

const WATCH_POLL: Duration = Duration::from_millis(50);

/// Owns a child process and guarantees it is signalled when the owner goes
/// away or the search is cancelled, whether or not a reader is blocked on
/// its output. A watcher thread polls the cancellation token and delivers
/// the kill; readers then observe end-of-stream.
pub struct ChildGuard {
    child: Arc<Mutex<Child>>,
    program: String,
    watcher: Option<JoinHandle<()>>,
}

impl ChildGuard {
    /// Spawns `command` with piped stdout/stderr and a closed stdin, watched
    /// by `token`.
    pub fn spawn(mut command: Command, program: &str, token: CancellationToken) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command.spawn().map_err(|error| {
            SearchError::Internal(format!("failed to spawn {program}: {error}"))
        })?;
        let child = Arc::new(Mutex::new(child));

        let watched = child.clone();
        let watcher = thread::spawn(move || loop {
            thread::sleep(WATCH_POLL);
            // The owner may hold the lock briefly; check again next tick.
            let Ok(mut child) = watched.try_lock() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => {}
            }
            if token.is_cancelled().is_none() {
                let _ = child.kill();
                break;
            }
        });

        Ok(Self {
            child,
            program: program.to_string(),
            watcher: Some(watcher),
        })
    }

    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child.lock().ok().and_then(|mut child| child.stdout.take())
    }

    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.child.lock().ok().and_then(|mut child| child.stderr.take())
    }

    /// Kills the child, ignoring the race where it already exited.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Waits for the child and returns its exit code (-1 when terminated by
    /// a signal). Polls rather than blocking under the lock, so the watcher
    /// can still deliver a cancellation kill.
    pub fn wait(&self) -> Result<i32> {
        loop {
            {
                let mut child = self.child.lock().map_err(|_| {
                    SearchError::Internal("child process lock poisoned".to_string())
                })?;
                if let Some(status) = child.try_wait()? {
                    return Ok(status.code().unwrap_or(-1));
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            if matches!(child.try_wait(), Ok(None) | Err(_)) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

/// Drains the child's stderr on its own thread so a chatty child cannot
/// deadlock against a full pipe.
pub struct StderrCapture {
    handle: Option<JoinHandle<String>>,
}

impl StderrCapture {
    pub fn start(stderr: Option<ChildStderr>) -> Self {
        let handle = stderr.map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });
        Self { handle }
    }

    /// Joins the reader thread and returns everything the child wrote.
    pub fn join(mut self) -> String {
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}
