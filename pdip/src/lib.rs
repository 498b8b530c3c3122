//! PDIP: Programmed Dialogue with Interactive Programs.
//!
//! A PTY-backed process control library: spawn a child behind a
//! pseudo-terminal, send it commands, and receive its output either as raw
//! bytes or synchronized against a regular expression — the building block
//! underneath the `isystem`/`rsystem` facades and the `rsystemd` dispatcher
//! daemon in the sibling crates of this workspace.

mod affinity;
mod buffer;
mod config;
mod error;
mod pco;
mod pty;
mod reaper;
mod registry;
mod status;

pub use affinity::CpuSet;
pub use config::{Flags, PcoConfig, ReaperMode, DEFAULT_BUF_INCREMENT, MIN_BUF_INCREMENT};
pub use error::{Error, Result};
pub use pco::{Pco, RecvOutcome, State, SEND_MAX_LEN};
pub use reaper::SignalOutcome;
pub use status::StatusWord;

/// `pdip_configure`: sets the process-wide reaper disposition (`# 4.3`).
///
/// Must be called once before the first [`Pco::exec`]; later calls update
/// the debug level but do not tear down or restart an already-running
/// `Internal` reaper thread.
pub fn configure(mode: ReaperMode, debug_level: u32) -> Result<()> {
    reaper::configure(mode, debug_level)
}

/// The `External`-mode `SIGCHLD` forwarding entry point (`# 4.3`). Hosts
/// that install their own disposition call this from wherever they learn
/// about child death and react to the returned [`SignalOutcome`].
pub fn handle_sigchld(signum: i32) -> SignalOutcome {
    reaper::handle_sigchld(signum)
}

/// Re-establishes library state in a forked child that wants to keep using
/// PDIP (`# 9`). The registry is already empty by the time this runs (the
/// `pthread_atfork` child hook clears it unconditionally); in `Internal`
/// mode this also restarts the reaper thread, since threads never survive
/// `fork`.
pub fn reinitialize() -> Result<()> {
    reaper::reinitialize()
}
