//! The Process Control Object (`# 4.2`) — the user-visible handle and the
//! largest single component of the core (~45% per `# 2`).

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::bytes::Regex;

use crate::buffer::OutstandingBuffer;
use crate::config::{Flags, PcoConfig};
use crate::error::{Error, Result};
use crate::pty::PtyChannel;
use crate::registry;
use crate::status::StatusWord;

/// Maximum length, in bytes, of a formatted command line handed to
/// [`Pco::send`] — the "bounded internal buffer" `# 4.2` describes.
pub const SEND_MAX_LEN: usize = 8192;

/// Lifecycle state (`# 4.2`, "State machine (PCO)").
///
/// `repr(u8)` so it fits in the [`AtomicU8`] `PcoShared::state` holds —
/// `# 5` requires this field be "read atomically with respect to the
/// asynchronous reaper", which in the original C meant a `sig_atomic_t`
/// plus a masked-signal critical section; here the reaper thread and any
/// application thread simply load/store the same atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Alive = 1,
    Zombie = 2,
    Dead = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Init,
            1 => State::Alive,
            2 => State::Zombie,
            _ => State::Dead,
        }
    }
}

/// What a [`Pco::recv`] call returns on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The regex matched; carries the display buffer (prefix through the
    /// end of the match).
    Found(Vec<u8>),
    /// Either no regex was given and bytes arrived, or `RECV_ON_THE_FLOW`
    /// returned complete lines early, or EOF/error arrived with some
    /// bytes already buffered.
    Data(Vec<u8>),
    /// The timeout expired with no match and no new bytes worth reporting
    /// as `Data` under the regex path; accumulated bytes, if any, remain
    /// in the outstanding buffer for the next call.
    Timeout,
}

/// The state shared between the application-facing [`Pco`] handle and the
/// process-wide registry/reaper (`# 3`, "Ownership").
///
/// `state`, `pid`, and `status` are the three scalars `# 5` singles out as
/// written by both the reaper and the application; everything else here
/// (`channel`, `outstanding`) is application-owned and the reaper never
/// touches it, matching `# 5`'s "Reception buffer ... application-owned,
/// never touched by the reaper."
pub struct PcoShared {
    pub(crate) state: AtomicU8,
    pub(crate) pid: AtomicI32,
    pub(crate) status: AtomicI32,
    debug_level: AtomicU32,
    channel: Mutex<Option<PtyChannel>>,
    outstanding: Mutex<OutstandingBuffer>,
    argv: Mutex<Vec<String>>,
}

impl PcoShared {
    #[cfg(test)]
    pub(crate) fn new_for_test(state: State) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            pid: AtomicI32::new(0),
            status: AtomicI32::new(0),
            debug_level: AtomicU32::new(0),
            channel: Mutex::new(None),
            outstanding: Mutex::new(OutstandingBuffer::new(crate::config::DEFAULT_BUF_INCREMENT)),
            argv: Mutex::new(Vec::new()),
        }
    }
}

/// The PDIP public handle (`pdip_t`).
///
/// Cloning a `Pco` is cheap (it's an `Arc` around [`PcoShared`]) but the
/// API contract still requires the caller to serialize concurrent calls on
/// the *same* object (`# 3`'s "No two concurrent `recv` calls on the same
/// PCO" invariant, `# 5`'s "Concurrent operations on the same PCO must be
/// serialized by the caller").
#[derive(Clone)]
pub struct Pco {
    shared: Arc<PcoShared>,
    config: PcoConfig,
}

impl Pco {
    /// `pdip_new`: allocates a PDIP context in state `Init`.
    pub fn new(config: PcoConfig) -> Self {
        Self {
            shared: Arc::new(PcoShared {
                state: AtomicU8::new(State::Init as u8),
                pid: AtomicI32::new(0),
                status: AtomicI32::new(0),
                debug_level: AtomicU32::new(config.debug_level),
                channel: Mutex::new(None),
                outstanding: Mutex::new(OutstandingBuffer::new(config.buf_resize_increment)),
                argv: Mutex::new(Vec::new()),
            }),
            config,
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn pid(&self) -> Option<i32> {
        let pid = self.shared.pid.load(Ordering::SeqCst);
        (pid != 0).then_some(pid)
    }

    /// `set_debug_level`: adjusts this object's debug verbosity at
    /// runtime (`# 6`'s PCO public-surface table), independent of
    /// [`PcoConfig::with_debug_level`]'s construction-time default.
    /// Shared across every clone of this handle, since it describes the
    /// underlying object rather than any one caller's view of it.
    pub fn set_debug_level(&self, level: u32) {
        self.shared.debug_level.store(level, Ordering::SeqCst);
    }

    pub fn debug_level(&self) -> u32 {
        self.shared.debug_level.load(Ordering::SeqCst)
    }

    /// `pdip_fd`: the PTY master file descriptor, if alive.
    #[cfg(unix)]
    pub fn fd(&self) -> Result<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        let channel = self.shared.channel.lock().expect("channel mutex poisoned");
        match channel.as_ref() {
            Some(c) => c.master_raw_fd().ok_or_else(|| Error::Pty("no fd available".into())),
            None => Err(Error::WrongState { state: self.state() }),
        }
    }

    /// `exec`: spawns `argv[0]` with the remaining elements as arguments.
    ///
    /// Rejects `Alive` (busy) and `Zombie` (status not yet reaped);
    /// accepts `Init` and `Dead` (re-`exec`, resetting owned resources
    /// first, `# 4.2`'s state machine).
    pub fn exec(&self, argv: &[String]) -> Result<i32> {
        if argv.is_empty() {
            return Err(Error::InvalidArgument("argv must be non-empty".into()));
        }

        match self.state() {
            State::Alive => return Err(Error::BusyOrDuplicate),
            State::Zombie => {
                return Err(Error::WrongState {
                    state: State::Zombie,
                })
            }
            State::Dead => self.reset_for_reexec(),
            State::Init => {}
        }

        let (channel, pid) = PtyChannel::open(argv, self.config.affinity.as_ref())?;

        if self.debug_level() > 0 {
            log::debug!("pco: exec'd {argv:?} as pid {pid}");
        }

        *self.shared.argv.lock().expect("argv mutex poisoned") = argv.to_vec();
        self.shared.pid.store(pid, Ordering::SeqCst);
        registry::register(pid, &self.shared);
        *self.shared.channel.lock().expect("channel mutex poisoned") = Some(channel);

        // The reaper may have already raced us to `Zombie` if the exec
        // inside the fork failed instantly (`# 4.2`: "the design must
        // tolerate this by allowing the reaper to move an INIT object
        // directly to ZOMBIE"). We only move Init -> Alive if nobody beat
        // us to it; either way `exec` itself succeeded in spawning.
        let _ = self.shared.state.compare_exchange(
            State::Init as u8,
            State::Alive as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        Ok(pid)
    }

    fn reset_for_reexec(&self) {
        let old_pid = self.shared.pid.swap(0, Ordering::SeqCst);
        if old_pid != 0 {
            registry::unregister(old_pid);
        }
        *self.shared.channel.lock().expect("channel mutex poisoned") = None;
        self.shared
            .outstanding
            .lock()
            .expect("outstanding mutex poisoned")
            .take();
        self.shared.status.store(0, Ordering::SeqCst);
        self.shared.state.store(State::Init as u8, Ordering::SeqCst);
    }

    /// `send`: writes a formatted command line through the PTY. Requires
    /// `Alive`. `data` must already be formatted by the caller (Rust has
    /// no `printf`-style varargs); the bounded-buffer check this performs
    /// is exactly `# 8`'s boundary test: "send of a formatted string
    /// exceeding the internal send limit returns an error and does not
    /// transmit."
    pub fn send(&self, data: &str) -> Result<usize> {
        if data.len() > SEND_MAX_LEN {
            return Err(Error::ResourceExhaustion(format!(
                "formatted command line of {} bytes exceeds the {SEND_MAX_LEN}-byte send limit",
                data.len()
            )));
        }
        if self.state() != State::Alive {
            return Err(Error::WrongState { state: self.state() });
        }
        let channel = self.shared.channel.lock().expect("channel mutex poisoned");
        let channel = channel.as_ref().ok_or(Error::WrongState { state: self.state() })?;
        channel.write_all(data.as_bytes())
    }

    /// `flush`: transfers ownership of the outstanding buffer to the
    /// caller. Idempotent — a second call returns an empty vector
    /// (`# 4.2`, `# 8`).
    pub fn flush(&self) -> Result<Vec<u8>> {
        Ok(self
            .shared
            .outstanding
            .lock()
            .expect("outstanding mutex poisoned")
            .take())
    }

    /// `sig`: delivers `signum` to the child. Requires `Alive`; re-checks
    /// the pid atomically against the reaper before delivering it
    /// (`# 4.2`).
    pub fn sig(&self, signum: i32) -> Result<()> {
        if self.state() != State::Alive {
            return Err(Error::WrongState { state: self.state() });
        }
        let pid = self.shared.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(Error::NotFound);
        }
        let rc = unsafe { libc::kill(pid, signum) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Err(Error::NotFound);
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// `status`: `Dead` returns the stored exit word immediately; `Zombie`
    /// reaps synchronously regardless of `blocking`; `Alive` + non-
    /// blocking returns "would block" (`Error::Timeout`); `Alive` +
    /// blocking waits for the child to exit (`# 4.2`).
    pub fn status(&self, blocking: bool) -> Result<StatusWord> {
        match self.state() {
            State::Init => Err(Error::InvalidArgument("no child has been exec'd".into())),
            State::Dead => Ok(StatusWord::from_wait_status(
                self.shared.status.load(Ordering::SeqCst),
            )),
            State::Zombie => self.reap_blocking(),
            State::Alive => {
                if !blocking {
                    return Err(Error::Timeout);
                }
                self.reap_blocking()
            }
        }
    }

    fn reap_blocking(&self) -> Result<StatusWord> {
        let pid = self.shared.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(Error::NotFound);
        }
        let mut raw: i32 = 0;
        let rc = unsafe { libc::waitpid(pid, &mut raw, 0) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                // The reaper beat us to it; trust whatever it already
                // stored.
                return Ok(StatusWord::from_wait_status(
                    self.shared.status.load(Ordering::SeqCst),
                ));
            }
            return Err(Error::Io(err));
        }
        self.shared.status.store(raw, Ordering::SeqCst);
        self.shared.state.store(State::Dead as u8, Ordering::SeqCst);
        Ok(StatusWord::from_wait_status(raw))
    }

    /// `delete`: `Alive` sends SIGTERM, waits a grace period, escalates to
    /// SIGKILL, then reaps; `Zombie` reaps; `Dead`/`Init` proceed
    /// directly. Unlinks from the registry and frees owned resources.
    pub fn delete(&self) -> Result<StatusWord> {
        const GRACE: Duration = Duration::from_millis(30);

        let status = match self.state() {
            State::Init => StatusWord::from_exit_code(0),
            State::Dead => StatusWord::from_wait_status(self.shared.status.load(Ordering::SeqCst)),
            State::Zombie => self.reap_blocking()?,
            State::Alive => {
                let pid = self.shared.pid.load(Ordering::SeqCst);
                if pid != 0 {
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                    let deadline = Instant::now() + GRACE;
                    let mut exited = false;
                    while Instant::now() < deadline {
                        let mut raw = 0;
                        let rc = unsafe { libc::waitpid(pid, &mut raw, libc::WNOHANG) };
                        if rc == pid {
                            self.shared.status.store(raw, Ordering::SeqCst);
                            exited = true;
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    if !exited {
                        unsafe {
                            libc::kill(pid, libc::SIGKILL);
                        }
                        let mut raw = 0;
                        unsafe { libc::waitpid(pid, &mut raw, 0) };
                        self.shared.status.store(raw, Ordering::SeqCst);
                    }
                }
                self.shared.state.store(State::Dead as u8, Ordering::SeqCst);
                StatusWord::from_wait_status(self.shared.status.load(Ordering::SeqCst))
            }
        };

        let pid = self.shared.pid.swap(0, Ordering::SeqCst);
        if pid != 0 {
            registry::unregister(pid);
        }
        if let Some(channel) = self.shared.channel.lock().expect("channel mutex poisoned").take() {
            channel.release_child_handle();
        }
        self.shared
            .outstanding
            .lock()
            .expect("outstanding mutex poisoned")
            .take();

        Ok(status)
    }

    /// `recv`: the regex-synchronized receive pipeline (`# 4.2`'s table
    /// and numbered steps).
    pub fn recv(&self, pattern: Option<&str>, timeout: Option<Duration>) -> Result<RecvOutcome> {
        match pattern {
            None => self.recv_no_regex(timeout),
            Some(p) => self.recv_with_regex(p, timeout),
        }
    }

    fn recv_no_regex(&self, timeout: Option<Duration>) -> Result<RecvOutcome> {
        {
            let mut outstanding = self.shared.outstanding.lock().expect("outstanding mutex poisoned");
            if !outstanding.is_empty() {
                return Ok(RecvOutcome::Data(outstanding.take()));
            }
        }

        match timeout {
            None => {
                let mut buf = [0u8; 4096];
                let n = self.channel_read_blocking(&mut buf)?;
                if n == 0 {
                    return Err(Error::PeerGone("EOF on PTY with nothing buffered".into()));
                }
                Ok(RecvOutcome::Data(buf[..n].to_vec()))
            }
            Some(t) => {
                let mut buf = [0u8; 4096];
                match self.channel_read_timeout(&mut buf, t)? {
                    Some(0) | None => Ok(RecvOutcome::Timeout),
                    Some(n) => Ok(RecvOutcome::Data(buf[..n].to_vec())),
                }
            }
        }
    }

    fn recv_with_regex(&self, pattern: &str, timeout: Option<Duration>) -> Result<RecvOutcome> {
        let multiline_pattern = format!("(?m){pattern}");
        let regex = Regex::new(&multiline_pattern)?;
        let on_the_flow = self.config.flags.contains(Flags::RECV_ON_THE_FLOW);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut outstanding =
                    self.shared.outstanding.lock().expect("outstanding mutex poisoned");
                if let Some(m) = regex.find(outstanding.as_slice()) {
                    let end = if m.start() == m.end() {
                        // Always advance by one on a zero-length match —
                        // the consistent rule `# 9`'s Open Question (a)
                        // asks a port to pick, generalizing the original's
                        // LF-only nudge.
                        (m.end() + 1).min(outstanding.len())
                    } else {
                        m.end()
                    };
                    let tail = outstanding.split_off_as_new_tail(end);
                    let display = outstanding.take();
                    *outstanding = tail;
                    return Ok(RecvOutcome::Found(display));
                }

                if on_the_flow {
                    if let Some(line_end) = outstanding.last_complete_line_end() {
                        let tail = outstanding.split_off_as_new_tail(line_end);
                        let display = outstanding.take();
                        *outstanding = tail;
                        return Ok(RecvOutcome::Data(display));
                    }
                }
            }

            let mut buf = [0u8; 4096];
            let read_result = match deadline {
                None => self.channel_read_blocking(&mut buf).map(Some),
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        let mut outstanding = self
                            .shared
                            .outstanding
                            .lock()
                            .expect("outstanding mutex poisoned");
                        let _ = &mut outstanding;
                        return Ok(RecvOutcome::Timeout);
                    }
                    self.channel_read_timeout(&mut buf, remaining)
                }
            };

            match read_result {
                Ok(Some(0)) => {
                    let mut outstanding =
                        self.shared.outstanding.lock().expect("outstanding mutex poisoned");
                    if outstanding.is_empty() {
                        return Err(Error::PeerGone("EOF on PTY with nothing buffered".into()));
                    }
                    return Ok(RecvOutcome::Data(outstanding.take()));
                }
                Ok(Some(n)) => {
                    self.shared
                        .outstanding
                        .lock()
                        .expect("outstanding mutex poisoned")
                        .append(&buf[..n]);
                }
                Ok(None) => return Ok(RecvOutcome::Timeout),
                Err(e) => {
                    let mut outstanding =
                        self.shared.outstanding.lock().expect("outstanding mutex poisoned");
                    if outstanding.is_empty() {
                        return Err(e);
                    }
                    return Ok(RecvOutcome::Data(outstanding.take()));
                }
            }
        }
    }

    fn channel_read_blocking(&self, buf: &mut [u8]) -> Result<usize> {
        let channel = self.shared.channel.lock().expect("channel mutex poisoned");
        let channel = channel.as_ref().ok_or(Error::WrongState { state: self.state() })?;
        channel.read(buf)
    }

    fn channel_read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let channel = self.shared.channel.lock().expect("channel mutex poisoned");
        let channel = channel.as_ref().ok_or(Error::WrongState { state: self.state() })?;
        channel.read_timeout(buf, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_object_starts_in_init_state() {
        let pco = Pco::new(PcoConfig::new());
        assert_eq!(pco.state(), State::Init);
        assert_eq!(pco.pid(), None);
    }

    #[test]
    fn exec_rejects_empty_argv() {
        let pco = Pco::new(PcoConfig::new());
        assert!(pco.exec(&[]).is_err());
    }

    #[test]
    fn set_debug_level_is_visible_through_every_clone() {
        let pco = Pco::new(PcoConfig::new());
        assert_eq!(pco.debug_level(), 0);
        let clone = pco.clone();
        clone.set_debug_level(2);
        assert_eq!(pco.debug_level(), 2);
    }

    #[test]
    fn send_before_exec_is_rejected() {
        let pco = Pco::new(PcoConfig::new());
        assert!(matches!(pco.send("echo hi\n"), Err(Error::WrongState { .. })));
    }

    #[test]
    fn send_over_the_limit_is_rejected_without_transmitting() {
        // Still Init, with no channel to write through at all — the only
        // way this can return an error is the length guard itself, since
        // the state check runs second and would report WrongState instead
        // of ResourceExhaustion if the length guard weren't catching it
        // first.
        let pco = Pco::new(PcoConfig::new());
        let too_long = "a".repeat(SEND_MAX_LEN + 1);
        assert!(matches!(
            pco.send(&too_long),
            Err(Error::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn flush_on_freshly_created_object_is_empty_and_idempotent() {
        let pco = Pco::new(PcoConfig::new());
        assert!(pco.flush().unwrap().is_empty());
        assert!(pco.flush().unwrap().is_empty());
    }
}
