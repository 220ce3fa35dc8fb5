//! Capture sinks for payload output
//!
//! In [`CaptureMode::Live`] the payload writes into a pipe and the worker
//! relays each chunk to the client as soon as it arrives. In
//! [`CaptureMode::Buffered`] the payload writes into an anonymous memfd that
//! the worker reads back in one piece after the payload has been reaped.

use crate::{BrigError, Result};
use memfd::{FileSeal, Memfd, MemfdOptions};
use nix::sys::resource::{Resource, setrlimit};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::{AsRawFd, RawFd};

/// Where the payload's stdout and stderr go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Pipe, relayed while the payload runs
    #[default]
    Live,
    /// Memfd, sent after the payload exits
    Buffered,
}

/// Memfd-backed output sink
#[derive(Debug)]
pub struct BufferedSink {
    memfd: Memfd,
}

impl BufferedSink {
    /// Create an empty sink, close-on-exec and sealable
    pub fn new() -> Result<Self> {
        let memfd = MemfdOptions::default()
            .allow_sealing(true)
            .close_on_exec(true)
            .create("brig_output")
            .map_err(|e| BrigError::Process(format!("failed to create memfd: {e}")))?;

        Ok(Self { memfd })
    }

    /// Descriptor the payload's stdout and stderr are duplicated from
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.memfd.as_raw_fd()
    }

    /// Cap how much the payload process can write into the sink
    ///
    /// Sets `RLIMIT_FSIZE` one byte past `max_bytes`, so a payload that hits
    /// the cap is stopped by SIGXFSZ rather than silently truncated. Called
    /// in the payload process before `exec`.
    pub fn limit_writer(max_bytes: usize) -> Result<()> {
        let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
        setrlimit(Resource::RLIMIT_FSIZE, limit, limit)
            .map_err(|e| BrigError::Limits(format!("failed to set output limit: {e}")))
    }

    /// Freeze the contents once the payload is gone
    pub fn seal(&self) -> Result<()> {
        self.memfd
            .add_seals(&[FileSeal::SealWrite, FileSeal::SealGrow, FileSeal::SealShrink])
            .map_err(|e| BrigError::Process(format!("failed to seal memfd: {e}")))
    }

    /// Read back at most `limit` bytes of output
    ///
    /// The second value is `true` when the sink held more than `limit`.
    pub fn drain(&self, limit: usize) -> Result<(Vec<u8>, bool)> {
        let mut file = self.memfd.as_file();
        file.seek(SeekFrom::Start(0))?;

        let cap = u64::try_from(limit).unwrap_or(u64::MAX);
        let mut output = Vec::new();
        file.take(cap.saturating_add(1)).read_to_end(&mut output)?;

        let truncated = output.len() > limit;
        output.truncate(limit);
        Ok((output, truncated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(sink: &BufferedSink, data: &[u8]) -> std::io::Result<()> {
        let mut file = sink.memfd.as_file();
        file.write_all(data)
    }

    #[test]
    fn drain_returns_everything_written() {
        let sink = BufferedSink::new().unwrap();
        write(&sink, b"line one\n").unwrap();
        write(&sink, b"line two\n").unwrap();

        let (output, truncated) = sink.drain(1024).unwrap();
        assert_eq!(output, b"line one\nline two\n");
        assert!(!truncated);
    }

    #[test]
    fn drain_reports_truncation() {
        let sink = BufferedSink::new().unwrap();
        write(&sink, b"0123456789").unwrap();

        let (output, truncated) = sink.drain(4).unwrap();
        assert_eq!(output, b"0123");
        assert!(truncated);
    }

    #[test]
    fn sealed_sink_rejects_writes() {
        let sink = BufferedSink::new().unwrap();
        write(&sink, b"done").unwrap();
        sink.seal().unwrap();

        assert!(write(&sink, b"more").is_err());
        assert_eq!(sink.drain(16).unwrap().0, b"done");
    }

    #[test]
    fn capture_mode_names() {
        let mode: CaptureMode = serde_json::from_str("\"buffered\"").unwrap();
        assert_eq!(mode, CaptureMode::Buffered);
        assert_eq!(CaptureMode::default(), CaptureMode::Live);
    }
}
