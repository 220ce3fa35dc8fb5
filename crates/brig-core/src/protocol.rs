//! Wire protocol for daemon communication
//!
//! One request/response pair per connection. The client sends payload bytes
//! followed by a single NUL; anything after the NUL is ignored. The server
//! answers with captured output (plus an optional diagnostic) followed by a
//! single NUL, then closes the connection.

use std::os::fd::AsFd;

/// Request and response terminator
pub const TERMINATOR: u8 = 0;

/// Chunk size used when the pipe buffer size cannot be queried
pub const FALLBACK_CHUNK: usize = 512;

/// Diagnostic sent when the wall-clock ceiling fires
pub const TIMEOUT_MESSAGE: &[u8] = b"Wall-clock limit exceeded, giving up";

/// Diagnostic sent when the payload exceeds its CPU soft limit
pub const CPU_LIMIT_MESSAGE: &[u8] = b"CPU time limit exceeded, giving up";

/// Diagnostic sent when the worker is asked to terminate
pub const SIGNAL_MESSAGE: &[u8] = b"Signal received";

/// Diagnostic sent when the request is larger than allowed
pub const REQUEST_TOO_LARGE_MESSAGE: &[u8] = b"Request too large";

/// Diagnostic sent when the payload produces more output than allowed
pub const OUTPUT_TOO_LARGE_MESSAGE: &[u8] = b"Output limit exceeded, giving up";

/// What one chunk contributed to the request
#[derive(Debug, PartialEq, Eq)]
pub enum Feed<'a> {
    /// Request continues past this chunk
    Partial(&'a [u8]),
    /// Terminator seen; the slice is the last piece of payload
    Complete(&'a [u8]),
    /// Chunk arrived after completion and is discarded
    Ignored,
}

/// Splits an incoming byte stream at the first terminator
#[derive(Debug, Default)]
pub struct RequestFramer {
    received: usize,
    complete: bool,
}

impl RequestFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one received chunk
    pub fn feed<'a>(&mut self, chunk: &'a [u8]) -> Feed<'a> {
        if self.complete {
            return Feed::Ignored;
        }
        match chunk.iter().position(|&b| b == TERMINATOR) {
            Some(end) => {
                self.complete = true;
                self.received += end;
                Feed::Complete(&chunk[..end])
            }
            None => {
                self.received += chunk.len();
                Feed::Partial(chunk)
            }
        }
    }

    /// Payload bytes accepted so far
    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Collect a full response: everything before the terminator
///
/// Returns `None` while the terminator has not arrived yet.
#[must_use]
pub fn split_response(buffer: &[u8]) -> Option<&[u8]> {
    buffer
        .iter()
        .position(|&b| b == TERMINATOR)
        .map(|end| &buffer[..end])
}

/// Relay chunk size: one pipe-buffer unit of `fd`, or 512 bytes
pub fn chunk_size(fd: impl AsFd) -> usize {
    nix::unistd::fpathconf(fd, nix::unistd::PathconfVar::PIPE_BUF)
        .ok()
        .flatten()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
        .unwrap_or(FALLBACK_CHUNK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_first_terminator() {
        let mut framer = RequestFramer::new();
        assert_eq!(framer.feed(b"print("), Feed::Partial(b"print("));
        assert_eq!(framer.feed(b"1)\0junk\0"), Feed::Complete(b"1)"));
        assert!(framer.is_complete());
        assert_eq!(framer.received(), 8);
    }

    #[test]
    fn bytes_after_terminator_are_ignored() {
        let mut framer = RequestFramer::new();
        assert_eq!(framer.feed(b"\0"), Feed::Complete(b""));
        assert_eq!(framer.feed(b"second request"), Feed::Ignored);
        assert_eq!(framer.received(), 0);
    }

    #[test]
    fn response_needs_terminator() {
        assert_eq!(split_response(b"partial"), None);
        assert_eq!(split_response(b"hello\n\0"), Some(&b"hello\n"[..]));
    }

    #[test]
    fn chunk_size_of_pipe_is_pipe_buf() {
        let (read, _write) = nix::unistd::pipe().unwrap();
        let size = chunk_size(&read);
        assert!(size >= FALLBACK_CHUNK);
        assert_eq!(size % FALLBACK_CHUNK, 0);
    }
}
