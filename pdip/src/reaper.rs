//! The Reaper (`# 4.3`) — the only code allowed to turn an `Alive` PCO into
//! a `Zombie` one.
//!
//! Grounded on `core/process_manager.rs`'s use of a background `tokio::spawn`
//! loop plus `libc::waitpid` to notice process death, generalized from
//! "one `tokio` task per tracked session" to the library's two dispositions
//! (`# 4.3`, "Reaper: two supported dispositions"):
//!
//! - `Internal`: the library owns `SIGCHLD` and reaps on a background thread,
//!   following `kxxt-tracexec`'s dependency on `signal-hook` for safe signal
//!   delivery off of a real signal-handler context.
//! - `External`: the host owns the disposition and forwards delivery to
//!   [`handle_sigchld`], mirroring the original C library's `rsys_msg_t`
//!   delegated-handler mode (`original_source/pdip.h`, `PDIP_SNDBUF_MAXLEN`
//!   neighbourhood documents the handler contract this follows).

use std::sync::atomic::Ordering;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::pco::State;
use crate::registry;

/// What the host gets back from [`handle_sigchld`] in `External` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A child was reaped and, if it was a tracked PCO, its state updated.
    Handled,
    /// The call wasn't for `SIGCHLD` at all.
    Unknown,
    /// `SIGCHLD` was for us but no child was actually reapable (spurious
    /// wakeup, or `waitpid` failed outright).
    Error,
}

struct GlobalState {
    mode: crate::config::ReaperMode,
    debug_level: u32,
    internal_thread: Option<std::thread::JoinHandle<()>>,
}

static GLOBAL: OnceLock<Mutex<GlobalState>> = OnceLock::new();
static ATFORK_HOOK_INSTALLED: std::sync::Once = std::sync::Once::new();

/// Installs the process-wide reaper disposition (`# 4.3`, "Configuration").
///
/// Calling this more than once with `Internal` is a no-op past the first
/// call — the background thread, once started, runs for the life of the
/// process. Switching from `Internal` to `External` at runtime isn't
/// supported; the original library has the same restriction (the
/// disposition is fixed at `pdip_configure` time).
pub fn configure(mode: crate::config::ReaperMode, debug_level: u32) -> Result<()> {
    install_atfork_hook();
    let cell = GLOBAL.get_or_init(|| {
        Mutex::new(GlobalState {
            mode,
            debug_level,
            internal_thread: None,
        })
    });
    let mut state = cell.lock().expect("reaper global state mutex poisoned");
    state.mode = mode;
    state.debug_level = debug_level;
    if mode == crate::config::ReaperMode::Internal && state.internal_thread.is_none() {
        state.internal_thread = Some(spawn_internal_thread()?);
    }
    Ok(())
}

fn spawn_internal_thread() -> Result<std::thread::JoinHandle<()>> {
    let mut signals = signal_hook::iterator::Signals::new([libc::SIGCHLD])
        .map_err(Error::Io)?;
    Ok(std::thread::spawn(move || {
        for _ in signals.forever() {
            reap_all_available();
        }
    }))
}

/// Reaps every currently-waitable child in a loop, since one `SIGCHLD`
/// delivery can coalesce several deaths (`# 4.3`, "a single delivery may
/// correspond to more than one dead child").
fn reap_all_available() {
    loop {
        match reap_one() {
            SignalOutcome::Handled => continue,
            SignalOutcome::Unknown | SignalOutcome::Error => break,
        }
    }
}

/// Reaps exactly one child via non-blocking `waitpid(-1, WNOHANG)` and, if
/// it's a tracked PCO, updates its `status`/`state` atomics
/// (`# 5`, "Reaper writes `state`/`pid`/`status`; nothing else").
fn reap_one() -> SignalOutcome {
    let mut raw_status: i32 = 0;
    let pid = unsafe { libc::waitpid(-1, &mut raw_status, libc::WNOHANG) };
    if pid <= 0 {
        return SignalOutcome::Error;
    }
    match registry::lookup(pid) {
        Some(shared) => {
            shared.status.store(raw_status, Ordering::SeqCst);
            shared.state.store(State::Zombie as u8, Ordering::SeqCst);
            if debug_level() > 0 {
                log::debug!("reaper: pid {pid} -> Zombie, raw status {raw_status:#x}");
            }
            SignalOutcome::Handled
        }
        // A reaped pid that isn't any tracked PCO: either a process the
        // host spawned through some other mechanism and shares our
        // `SIGCHLD` disposition, or a PCO whose `delete` already
        // unregistered it before the reaper got to it. Either way there's
        // nothing further to update.
        None => {
            if debug_level() > 0 {
                log::debug!("reaper: reaped untracked pid {pid}");
            }
            SignalOutcome::Handled
        }
    }
}

/// The `External`-mode entry point: the host's own `SIGCHLD` handler (or
/// whatever mechanism it uses to learn about child death) calls this and
/// reacts to the outcome (`# 4.3`, "External: returns `HANDLED` / `UNKNOWN`
/// / `ERROR`").
///
/// Calling this from inside an actual `signal(7)` handler is unsound in
/// Rust (the mutexes `registry::lookup` and the status atomics touch are
/// not async-signal-safe); hosts that want to drive this from a real
/// signal handler should instead defer to a thread or a self-pipe, the way
/// [`configure`]'s `Internal` mode does internally.
pub fn handle_sigchld(signum: i32) -> SignalOutcome {
    if signum != libc::SIGCHLD {
        return SignalOutcome::Unknown;
    }
    let mut outcome = SignalOutcome::Error;
    loop {
        match reap_one() {
            SignalOutcome::Handled => {
                outcome = SignalOutcome::Handled;
                continue;
            }
            other => {
                if outcome == SignalOutcome::Error {
                    outcome = other;
                }
                break;
            }
        }
    }
    outcome
}

pub(crate) fn debug_level() -> u32 {
    GLOBAL
        .get()
        .map(|cell| cell.lock().expect("reaper global state mutex poisoned").debug_level)
        .unwrap_or(0)
}

/// Registers the post-`fork` child hook exactly once per process
/// (`# 4.3`/`# 9`, "a forked child must forget every PCO it did not itself
/// create"). Safe to call repeatedly; only the first call takes effect.
fn install_atfork_hook() {
    ATFORK_HOOK_INSTALLED.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(child_fork_hook));
    });
}

extern "C" fn child_fork_hook() {
    registry::clear_for_forked_child();
}

/// Re-establishes reaper state in a child that wants to keep using PDIP
/// after `fork` (`# 9`, "a child that wants PDIP service of its own must
/// call a re-initialization entry point"). The registry is already empty
/// (the `atfork` child hook cleared it); in `Internal` mode this starts a
/// fresh reaper thread, since threads do not survive `fork`.
pub fn reinitialize() -> Result<()> {
    let Some(cell) = GLOBAL.get() else {
        return Ok(());
    };
    let mut state = cell.lock().expect("reaper global state mutex poisoned");
    state.internal_thread = None;
    if state.mode == crate::config::ReaperMode::Internal {
        state.internal_thread = Some(spawn_internal_thread()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_sigchld_rejects_unrelated_signal() {
        assert_eq!(handle_sigchld(libc::SIGTERM), SignalOutcome::Unknown);
    }

    #[test]
    fn handle_sigchld_with_no_children_is_error() {
        // No children to reap in this test process (hopefully); a
        // non-blocking waitpid(-1) should find nothing.
        let outcome = handle_sigchld(libc::SIGCHLD);
        assert!(matches!(outcome, SignalOutcome::Error | SignalOutcome::Handled));
    }
}
