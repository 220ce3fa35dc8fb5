//! Pipes between a worker and its payload process

use crate::Result;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// The two pipes wired to a payload's standard streams
#[derive(Debug)]
pub struct PayloadPipes {
    /// Payload stdin: worker writes, payload reads
    pub stdin_tx: File,
    pub stdin_rx: File,

    /// Payload stdout/stderr: payload writes, worker reads
    pub output_tx: File,
    pub output_rx: File,
}

impl PayloadPipes {
    /// Create both pipes, close-on-exec on every end
    ///
    /// The payload gets its ends through `dup2`, which clears the flag on
    /// the duplicates only.
    pub fn new() -> Result<Self> {
        let (stdin_rx, stdin_tx) = create_pipe()?;
        let (output_rx, output_tx) = create_pipe()?;

        Ok(Self {
            stdin_tx,
            stdin_rx,
            output_tx,
            output_rx,
        })
    }

    /// Split the pipes into worker and payload ends
    pub fn split(self) -> (WorkerEnds, PayloadEnds) {
        let worker = WorkerEnds {
            stdin_tx: Some(self.stdin_tx),
            output_rx: Some(self.output_rx),
        };

        let payload = PayloadEnds {
            stdin_rx: self.stdin_rx,
            output_tx: self.output_tx,
        };

        (worker, payload)
    }
}

/// Worker end (relay side)
///
/// Each end is dropped, and thereby closed, once its direction is done:
/// closing `stdin_tx` gives the payload EOF, and `output_rx` is dropped
/// after the payload closed its side.
#[derive(Debug)]
pub struct WorkerEnds {
    pub stdin_tx: Option<File>,
    pub output_rx: Option<File>,
}

impl WorkerEnds {
    /// Signal end of input to the payload
    pub fn close_stdin(&mut self) {
        self.stdin_tx = None;
    }

    pub fn close_output(&mut self) {
        self.output_rx = None;
    }
}

/// Payload end, consumed in the forked payload process
#[derive(Debug)]
pub struct PayloadEnds {
    stdin_rx: File,
    output_tx: File,
}

impl PayloadEnds {
    #[must_use]
    pub fn stdin_fd(&self) -> RawFd {
        self.stdin_rx.as_raw_fd()
    }

    #[must_use]
    pub fn output_fd(&self) -> RawFd {
        self.output_tx.as_raw_fd()
    }
}

/// Create a pipe (returns read end, write end)
fn create_pipe() -> Result<(File, File)> {
    let (read_end, write_end): (OwnedFd, OwnedFd) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;

    Ok((File::from(read_end), File::from(write_end)))
}
