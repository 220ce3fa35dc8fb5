//! Per-connection worker
//!
//! A worker owns one accepted connection. It forks a payload process that
//! runs the configured command under the resource envelope, relays the
//! request into the payload's stdin and the payload's output back to the
//! client, and always ends the response with the terminator before leaving
//! through `_exit`.

use crate::capture::{BufferedSink, CaptureMode};
use crate::isolation::{Identity, ResourceEnvelope};
use crate::pipe::{PayloadEnds, PayloadPipes, WorkerEnds};
use crate::process::{self, WaitOutcome, WaitPolicy};
use crate::protocol::{
    self, Feed, OUTPUT_TOO_LARGE_MESSAGE, REQUEST_TOO_LARGE_MESSAGE, RequestFramer,
    SIGNAL_MESSAGE, TERMINATOR, TIMEOUT_MESSAGE,
};
use crate::result::PayloadOutcome;
use crate::signals::SignalLatch;
use crate::{BrigError, Result, sys};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid, User, alarm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

/// Relay poll timeout in milliseconds
const POLL_INTERVAL_MS: u8 = 20;

/// Output buffered for a slow client before the payload's pipe is left to fill
const PENDING_CHUNKS: usize = 64;

/// Write timeout for the final response
const FINISH_TIMEOUT: Duration = Duration::from_secs(1);

/// What a worker runs and under which ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Program executed in the payload process
    pub command: PathBuf,

    /// Arguments after the program name
    pub args: Vec<String>,

    /// Complete environment of the payload; nothing else is inherited
    pub env: BTreeMap<String, String>,

    /// Resource limits of the payload process
    pub envelope: ResourceEnvelope,

    /// Wall-clock ceiling for the whole connection in seconds
    pub wall_clock_secs: u32,

    /// How payload output is captured
    pub capture: CaptureMode,

    /// Largest accepted request
    pub max_request_bytes: usize,

    /// Largest relayed output
    pub max_output_bytes: usize,

    /// User the payload runs as
    ///
    /// The worker itself keeps the jail's identity, so a payload under a
    /// different uid cannot signal its worker or the supervisor.
    pub user: Option<String>,

    /// Group the payload runs as; the user's primary group when unset
    pub group: Option<String>,

    /// Numeric ids for `user` and `group`, filled by
    /// [`WorkerSettings::resolve_identity`]
    #[serde(skip)]
    pub identity: Option<Identity>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/usr/bin/python3"),
            args: vec!["-".into()],
            env: BTreeMap::from([
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("HOME".to_string(), "/".to_string()),
            ]),
            envelope: ResourceEnvelope::default(),
            wall_clock_secs: 6,
            capture: CaptureMode::Live,
            max_request_bytes: 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            user: None,
            group: None,
            identity: None,
        }
    }
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<()> {
        self.envelope.validate()?;
        if self.wall_clock_secs == 0 {
            return Err(BrigError::Config("wall clock limit must be non-zero".into()));
        }
        if self.max_request_bytes == 0 || self.max_output_bytes == 0 {
            return Err(BrigError::Config("size limits must be non-zero".into()));
        }
        if !self.command.is_absolute() {
            return Err(BrigError::Config(format!(
                "payload command must be an absolute path: {}",
                self.command.display()
            )));
        }
        Ok(())
    }

    /// Look up the payload user and group on the host
    ///
    /// Has to happen before the jail pivots away from the host's name
    /// services.
    pub fn resolve_identity(&mut self) -> Result<()> {
        let mut identity = Identity::resolve(self.user.as_deref(), self.group.as_deref())?;
        if identity.gid.is_none() {
            if let Some(uid) = identity.uid {
                identity.gid = User::from_uid(uid)
                    .map_err(|e| BrigError::Identity(format!("lookup of uid {uid} failed: {e}")))?
                    .map(|user| user.gid);
            }
        }
        tracing::debug!(uid = ?identity.uid, gid = ?identity.gid, "payload identity resolved");
        self.identity = Some(identity);
        Ok(())
    }

    /// Identity the payload switches to before exec
    pub fn payload_identity(&self) -> Result<Identity> {
        match self.identity {
            Some(identity) => Ok(identity),
            None if self.user.is_none() && self.group.is_none() => Ok(Identity::default()),
            None => Err(BrigError::Identity(
                "payload user configured but never resolved".into(),
            )),
        }
    }
}

/// How the connection ends
#[derive(Debug, PartialEq, Eq)]
struct Verdict {
    status: i32,
    diagnostic: Option<Vec<u8>>,
}

impl Verdict {
    /// Exit 1 without explanation
    const fn failed() -> Self {
        Self {
            status: 1,
            diagnostic: None,
        }
    }

    fn abort(message: &[u8]) -> Self {
        Self {
            status: 1,
            diagnostic: Some(message.to_vec()),
        }
    }

    fn from_outcome(outcome: PayloadOutcome) -> Self {
        Self {
            status: outcome.worker_status(),
            diagnostic: outcome.diagnostic(),
        }
    }

    fn interrupted(signal: Signal) -> Self {
        match signal {
            Signal::SIGALRM => Self::abort(TIMEOUT_MESSAGE),
            Signal::SIGXCPU => Self::from_outcome(PayloadOutcome::CpuLimit),
            _ => Self::abort(SIGNAL_MESSAGE),
        }
    }
}

/// Serve one connection and exit
///
/// Runs in a freshly forked worker process. The wall-clock alarm is armed
/// before the first request byte is read.
pub fn handle(stream: UnixStream, settings: &WorkerSettings) -> ! {
    let mut relay = Relay::new(stream, settings);

    let latch = match SignalLatch::install(&[
        Signal::SIGALRM,
        Signal::SIGXCPU,
        Signal::SIGTERM,
        Signal::SIGINT,
    ]) {
        Ok(latch) => latch,
        Err(e) => {
            tracing::error!(error = %e, "worker signal setup failed");
            relay.finish(Verdict::failed())
        }
    };
    let _ = alarm::set(settings.wall_clock_secs);

    let verdict = relay.run(&latch).unwrap_or_else(|e| {
        tracing::error!(error = %e, "relay failed");
        Verdict::failed()
    });
    relay.finish(verdict)
}

struct Relay<'a> {
    settings: &'a WorkerSettings,
    stream: UnixStream,
    /// Output accepted from the payload but not yet sent
    pending: Vec<u8>,
    /// Total output accepted so far
    relayed: usize,
    /// Payload process still to be reaped
    payload: Option<Pid>,
    /// Exit status once reaped
    reaped: Option<WaitStatus>,
}

impl<'a> Relay<'a> {
    const fn new(stream: UnixStream, settings: &'a WorkerSettings) -> Self {
        Self {
            settings,
            stream,
            pending: Vec::new(),
            relayed: 0,
            payload: None,
            reaped: None,
        }
    }

    fn run(&mut self, latch: &SignalLatch) -> Result<Verdict> {
        let sink = match self.settings.capture {
            CaptureMode::Live => None,
            CaptureMode::Buffered => Some(BufferedSink::new()?),
        };

        let (mut ends, payload_ends) = PayloadPipes::new()?.split();
        let pid = spawn_payload(self.settings, &payload_ends, sink.as_ref())?;
        drop(payload_ends);
        self.payload = Some(pid);
        if sink.is_some() {
            ends.close_output();
        }
        tracing::debug!(%pid, capture = ?self.settings.capture, "payload started");

        self.stream.set_nonblocking(true)?;
        if let Some(stdin) = &ends.stdin_tx {
            sys::set_nonblocking(stdin)?;
        }
        if let Some(output) = &ends.output_rx {
            sys::set_nonblocking(output)?;
        }

        let chunk = ends
            .stdin_tx
            .as_ref()
            .map_or(protocol::FALLBACK_CHUNK, protocol::chunk_size);

        if let Some(verdict) = self.relay(latch, &mut ends, chunk)? {
            return Ok(verdict);
        }

        let outcome = self.outcome()?;
        if let Some(sink) = &sink {
            sink.seal()?;
            let room = self.settings.max_output_bytes - self.relayed;
            let (output, truncated) = sink.drain(room)?;
            self.accept_output(&output);
            if truncated {
                return Ok(Verdict::abort(OUTPUT_TOO_LARGE_MESSAGE));
            }
        }

        tracing::debug!(%pid, ?outcome, bytes = self.relayed, "payload finished");
        Ok(Verdict::from_outcome(outcome))
    }

    /// Move bytes until the payload is reaped and its output drained
    ///
    /// Returns a verdict when the connection has to end early, `None` once
    /// the payload finished normally.
    fn relay(
        &mut self,
        latch: &SignalLatch,
        ends: &mut WorkerEnds,
        chunk: usize,
    ) -> Result<Option<Verdict>> {
        let mut framer = RequestFramer::new();
        let mut inbound: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; chunk];
        let backlog = chunk * PENDING_CHUNKS;

        loop {
            if let Some(signal) = latch.raised() {
                tracing::info!(%signal, "worker interrupted");
                return Ok(Some(Verdict::interrupted(signal)));
            }

            self.try_reap()?;
            if ends.stdin_tx.is_none() {
                inbound.clear();
            }
            if framer.is_complete() && inbound.is_empty() && ends.stdin_tx.is_some() {
                ends.close_stdin();
            }
            if self.payload_reaped() && ends.output_rx.is_none() {
                return Ok(None);
            }

            let want_request = !framer.is_complete() && inbound.is_empty();
            let mut socket_events = PollFlags::empty();
            if want_request {
                socket_events |= PollFlags::POLLIN;
            }
            if !self.pending.is_empty() {
                socket_events |= PollFlags::POLLOUT;
            }
            let stdin_events = if inbound.is_empty() {
                PollFlags::empty()
            } else {
                PollFlags::POLLOUT
            };
            let output_events = if self.pending.len() < backlog {
                PollFlags::POLLIN
            } else {
                PollFlags::empty()
            };

            let ready = {
                let mut fds = Vec::with_capacity(3);
                let mut slots = [None; 3];
                if !socket_events.is_empty() {
                    slots[0] = Some(fds.len());
                    fds.push(PollFd::new(self.stream.as_fd(), socket_events));
                }
                if let (Some(stdin), false) = (&ends.stdin_tx, stdin_events.is_empty()) {
                    slots[1] = Some(fds.len());
                    fds.push(PollFd::new(stdin.as_fd(), stdin_events));
                }
                if let (Some(output), false) = (&ends.output_rx, output_events.is_empty()) {
                    slots[2] = Some(fds.len());
                    fds.push(PollFd::new(output.as_fd(), output_events));
                }

                if fds.is_empty() {
                    std::thread::sleep(Duration::from_millis(u64::from(POLL_INTERVAL_MS)));
                    continue;
                }
                match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(BrigError::Process(format!("relay poll failed: {e}"))),
                }
                slots.map(|slot| {
                    slot.and_then(|i| fds[i].revents())
                        .unwrap_or_else(PollFlags::empty)
                })
            };
            let [socket_ready, stdin_ready, output_ready] = ready;
            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            let writable = PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;

            // Request bytes from the client
            if want_request && socket_ready.intersects(readable) {
                match self.stream.read(&mut buf) {
                    Ok(0) => {
                        tracing::warn!(received = framer.received(), "client left before end of request");
                        return Ok(Some(Verdict::failed()));
                    }
                    Ok(n) => match framer.feed(&buf[..n]) {
                        Feed::Partial(data) | Feed::Complete(data) => inbound.extend_from_slice(data),
                        Feed::Ignored => {}
                    },
                    Err(e) if is_transient(&e) => {}
                    Err(e) => return Err(e.into()),
                }
                if framer.received() > self.settings.max_request_bytes {
                    tracing::warn!(limit = self.settings.max_request_bytes, "request too large");
                    return Ok(Some(Verdict::abort(REQUEST_TOO_LARGE_MESSAGE)));
                }
            }

            // Request bytes into the payload, one pipe-buffer unit at a time
            if stdin_ready.intersects(writable) {
                if let Some(stdin) = ends.stdin_tx.as_mut() {
                    let len = inbound.len().min(chunk);
                    match stdin.write(&inbound[..len]) {
                        Ok(n) => {
                            inbound.drain(..n);
                        }
                        Err(e) if is_transient(&e) => {}
                        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                            tracing::debug!("payload closed its stdin");
                            ends.close_stdin();
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            // Output from the payload
            if output_ready.intersects(readable) {
                if let Some(output) = ends.output_rx.as_mut() {
                    match output.read(&mut buf) {
                        Ok(0) => ends.close_output(),
                        Ok(n) => {
                            let room = self.settings.max_output_bytes - self.relayed;
                            if n > room {
                                self.accept_output(&buf[..room]);
                                tracing::warn!(limit = self.settings.max_output_bytes, "output too large");
                                return Ok(Some(Verdict::abort(OUTPUT_TOO_LARGE_MESSAGE)));
                            }
                            self.accept_output(&buf[..n]);
                        }
                        Err(e) if is_transient(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            // Output to the client
            if !self.pending.is_empty() && socket_ready.intersects(writable) {
                match self.stream.write(&self.pending) {
                    Ok(n) => {
                        self.pending.drain(..n);
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "client stopped reading");
                        return Ok(Some(Verdict::failed()));
                    }
                }
            }
        }
    }

    fn accept_output(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        self.relayed += data.len();
    }

    /// Reap the payload if it has exited, without blocking
    fn try_reap(&mut self) -> Result<()> {
        if let Some(pid) = self.payload {
            let policy = WaitPolicy::polling(1, Duration::ZERO);
            match process::wait_for_pid(pid, policy, WaitPidFlag::empty())? {
                WaitOutcome::Reaped(status) => {
                    self.payload = None;
                    self.reaped = Some(status);
                }
                WaitOutcome::Gone => {
                    return Err(BrigError::Process(format!("payload {pid} vanished")));
                }
                WaitOutcome::Pending | WaitOutcome::Interrupted => {}
            }
        }
        Ok(())
    }

    const fn payload_reaped(&self) -> bool {
        self.reaped.is_some()
    }

    fn outcome(&self) -> Result<PayloadOutcome> {
        self.reaped
            .map(PayloadOutcome::from_status)
            .ok_or_else(|| BrigError::Process("payload not reaped".into()))
    }

    /// Send what is left, the diagnostic and the terminator, then exit
    fn finish(mut self, verdict: Verdict) -> ! {
        alarm::cancel();

        if let Some(pid) = self.payload.take() {
            if let Err(e) = process::patient_terminate(pid, WaitPidFlag::empty()) {
                tracing::warn!(%pid, error = %e, "failed to stop payload");
            }
        }

        let mut response = std::mem::take(&mut self.pending);
        if let Some(diagnostic) = &verdict.diagnostic {
            response.extend_from_slice(diagnostic);
        }
        response.push(TERMINATOR);

        let sent = self
            .stream
            .set_nonblocking(false)
            .and_then(|()| self.stream.set_write_timeout(Some(FINISH_TIMEOUT)))
            .and_then(|()| self.stream.write_all(&response));
        if let Err(e) = sent {
            tracing::debug!(error = %e, "response not delivered");
        }
        let _ = self.stream.shutdown(Shutdown::Both);

        tracing::debug!(status = verdict.status, "worker done");
        sys::exit_now(verdict.status)
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Fork the payload process; returns its pid in the worker
fn spawn_payload(
    settings: &WorkerSettings,
    ends: &PayloadEnds,
    sink: Option<&BufferedSink>,
) -> Result<Pid> {
    let identity = settings.payload_identity()?;
    let program = cstring(settings.command.as_os_str().as_bytes())?;
    let mut argv = vec![program.clone()];
    for arg in &settings.args {
        argv.push(cstring(arg.as_bytes())?);
    }
    let envp = settings
        .env
        .iter()
        .map(|(key, value)| cstring(format!("{key}={value}").as_bytes()))
        .collect::<Result<Vec<_>>>()?;

    // SAFETY: the worker is single-threaded; the child only execs or exits
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            let error = exec_payload(settings, identity, ends, sink, &program, &argv, &envp);
            let message = format!("failed to execute {}: {error}\n", settings.command.display());
            let _ = nix::unistd::write(std::io::stderr(), message.as_bytes());
            sys::exit_now(127)
        }
        Err(e) => Err(BrigError::Process(format!("failed to fork payload: {e}"))),
    }
}

/// Wire the standard streams, switch identity, apply limits and exec;
/// returns only on failure
fn exec_payload(
    settings: &WorkerSettings,
    identity: Identity,
    ends: &PayloadEnds,
    sink: Option<&BufferedSink>,
    program: &CString,
    argv: &[CString],
    envp: &[CString],
) -> BrigError {
    let output = sink.map_or_else(|| ends.output_fd(), BufferedSink::as_raw_fd);

    for (from, to) in [
        (ends.stdin_fd(), libc::STDIN_FILENO),
        (output, libc::STDOUT_FILENO),
        (output, libc::STDERR_FILENO),
    ] {
        // SAFETY: both descriptors are open; dup2 clears close-on-exec on `to`
        if unsafe { libc::dup2(from, to) } < 0 {
            return BrigError::Io(std::io::Error::last_os_error());
        }
    }

    if let Err(e) = identity.drop_privileges() {
        return e;
    }
    if let Err(e) = settings.envelope.apply() {
        return e;
    }
    if sink.is_some() {
        if let Err(e) = BufferedSink::limit_writer(settings.max_output_bytes) {
            return e;
        }
    }

    // SAFETY: restoring the default disposition before exec
    let _ = unsafe { nix::sys::signal::signal(Signal::SIGPIPE, nix::sys::signal::SigHandler::SigDfl) };

    match nix::unistd::execve(program, argv, envp) {
        Ok(never) => match never {},
        Err(e) => BrigError::Nix(e),
    }
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| BrigError::Config("payload command line contains a NUL byte".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_python_from_stdin() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.command, PathBuf::from("/usr/bin/python3"));
        assert_eq!(settings.args, vec!["-".to_string()]);
        assert_eq!(settings.env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(settings.wall_clock_secs, 6);
        settings.validate().unwrap();
    }

    #[test]
    fn relative_command_is_rejected() {
        let settings = WorkerSettings {
            command: PathBuf::from("python3"),
            ..WorkerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn latched_signals_map_to_diagnostics() {
        assert_eq!(
            Verdict::interrupted(Signal::SIGALRM).diagnostic.as_deref(),
            Some(TIMEOUT_MESSAGE)
        );
        assert_eq!(
            Verdict::interrupted(Signal::SIGXCPU).diagnostic.as_deref(),
            Some(protocol::CPU_LIMIT_MESSAGE)
        );
        let term = Verdict::interrupted(Signal::SIGTERM);
        assert_eq!(term.diagnostic.as_deref(), Some(SIGNAL_MESSAGE));
        assert_eq!(term.status, 1);
    }

    #[test]
    fn unresolved_payload_user_is_refused() {
        let settings = WorkerSettings {
            user: Some("nobody".into()),
            ..WorkerSettings::default()
        };
        let err = settings.payload_identity().unwrap_err();
        assert!(matches!(err, BrigError::Identity(_)));
    }

    #[test]
    fn no_payload_user_keeps_worker_identity() {
        let identity = WorkerSettings::default().payload_identity().unwrap();
        assert_eq!(identity, Identity::default());
    }

    #[test]
    fn payload_user_gets_primary_group() {
        let mut settings = WorkerSettings {
            user: Some("root".into()),
            ..WorkerSettings::default()
        };
        settings.resolve_identity().unwrap();
        let identity = settings.payload_identity().unwrap();
        assert_eq!(identity.uid, Some(nix::unistd::Uid::from_raw(0)));
        assert_eq!(identity.gid, Some(nix::unistd::Gid::from_raw(0)));
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let settings: WorkerSettings =
            serde_json::from_str(r#"{"command": "/bin/sh", "capture": "buffered"}"#).unwrap();
        assert_eq!(settings.command, PathBuf::from("/bin/sh"));
        assert_eq!(settings.capture, CaptureMode::Buffered);
        assert_eq!(settings.max_output_bytes, 1024 * 1024);
    }
}
