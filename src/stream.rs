//! Per-container I/O stream handles.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed write half handed to callers.
pub type StreamWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Boxed read half handed to callers.
pub type StreamReader = Pin<Box<dyn AsyncRead + Send>>;

/// Transport-level identifiers of the three stdio channels of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamIds {
    pub stdin: u64,
    pub stdout: u64,
    pub stderr: u64,
}

impl StreamIds {
    /// Returns the three ids in stdin, stdout, stderr order.
    #[must_use]
    pub fn as_array(&self) -> [u64; 3] {
        [self.stdin, self.stdout, self.stderr]
    }

    /// Returns true if the triple repeats an id.
    #[must_use]
    pub fn has_internal_duplicate(&self) -> bool {
        self.stdin == self.stdout || self.stdin == self.stderr || self.stdout == self.stderr
    }
}

/// Stdio handles for one container workload.
///
/// The handles belong to the caller, who closes them by dropping. The ids
/// stay reserved in the owning session until the session is unregistered.
pub struct IoStream {
    /// Write end feeding the workload's standard input.
    pub stdin: StreamWriter,
    /// Read end of the workload's standard output.
    pub stdout: StreamReader,
    /// Read end of the workload's standard error.
    pub stderr: StreamReader,
    pub stdin_id: u64,
    pub stdout_id: u64,
    pub stderr_id: u64,
}

impl IoStream {
    /// Bundles handles with their stream ids.
    #[must_use]
    pub fn new(
        ids: StreamIds,
        stdin: StreamWriter,
        stdout: StreamReader,
        stderr: StreamReader,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            stdin_id: ids.stdin,
            stdout_id: ids.stdout,
            stderr_id: ids.stderr,
        }
    }

    /// Creates a stream whose stdin discards and whose outputs are at EOF.
    #[must_use]
    pub fn inert(ids: StreamIds) -> Self {
        Self::new(
            ids,
            Box::pin(tokio::io::sink()),
            Box::pin(tokio::io::empty()),
            Box::pin(tokio::io::empty()),
        )
    }

    /// Returns the stream ids.
    #[must_use]
    pub fn ids(&self) -> StreamIds {
        StreamIds {
            stdin: self.stdin_id,
            stdout: self.stdout_id,
            stderr: self.stderr_id,
        }
    }
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStream")
            .field("stdin_id", &self.stdin_id)
            .field("stdout_id", &self.stdout_id)
            .field("stderr_id", &self.stderr_id)
            .finish_non_exhaustive()
    }
}
