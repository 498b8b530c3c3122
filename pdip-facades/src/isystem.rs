//! `isystem()`: an in-process `system()` replacement that keeps one
//! background shell alive for the life of the process instead of
//! fork/exec'ing a fresh one per call (`# 4.5`).
//!
//! Grounded on the teacher's single-instance-per-process pattern for
//! `StatusServer::start` (`core/status_server.rs`), adapted here to a
//! lazily booted, never-recreated [`pdip::Pco`] behind a `Mutex`.

use std::sync::{Mutex, Once};
use std::time::Duration;

use pdip::{Flags, Pco, PcoConfig, RecvOutcome, StatusWord};

use crate::error::{FacadeError, Result};

const PROMPT: &str = "ISYSSHELLPROMPT> $";
const PROMPT_SEND: &str = "PS1='ISYSSHELLPROMPT> '\n";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

static SHELL: Mutex<Option<Pco>> = Mutex::new(None);
static ATFORK_HOOK: Once = Once::new();

fn timeout() -> Duration {
    let secs = std::env::var("ISYS_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

fn install_atfork_hook() {
    ATFORK_HOOK.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(child_fork_hook));
    });
}

extern "C" fn child_fork_hook() {
    // A forked child must not try to drive the parent's background shell
    // (`# 4.5`, "a fork-time callback drops the PCO in the child"). If it
    // wants `isystem` service of its own it calls [`reinitialize`].
    if let Ok(mut guard) = SHELL.lock() {
        guard.take();
    }
}

fn boot() -> pdip::Result<Pco> {
    let config = PcoConfig::new().with_flags(Flags::RECV_ON_THE_FLOW);
    let pco = Pco::new(config);
    pco.exec(&["/bin/sh".to_string()])?;
    pco.recv(Some("[$#] $"), None)?;
    pco.send(PROMPT_SEND)?;
    pco.recv(Some(PROMPT), None)?;
    pco.send("stty -echo\n")?;
    pco.recv(Some(PROMPT), None)?;
    Ok(pco)
}

/// Runs `cmd` on the process's shared background shell, returning its
/// `system(3)`-shaped status word.
pub fn isystem(cmd: &str) -> Result<StatusWord> {
    install_atfork_hook();
    let mut guard = SHELL.lock().expect("isystem shell mutex poisoned");
    if guard.is_none() {
        *guard = Some(boot()?);
    }
    let pco = guard.as_ref().expect("just initialized above");

    pco.send(&format!("{cmd}\n"))?;
    let t = timeout();
    wait_for_prompt(pco, t)?;
    pco.send("echo $?\n")?;
    let display = wait_for_prompt(pco, t)?;
    Ok(parse_status(&display))
}

fn wait_for_prompt(pco: &Pco, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(FacadeError::Pdip(pdip::Error::Timeout));
        }
        match pco.recv(Some(PROMPT), Some(remaining))? {
            RecvOutcome::Found(bytes) => return Ok(bytes),
            RecvOutcome::Data(_) | RecvOutcome::Timeout => continue,
        }
    }
}

fn parse_status(display: &[u8]) -> StatusWord {
    let text = String::from_utf8_lossy(display);
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    let n: i32 = digits.parse().unwrap_or(0);
    StatusWord::from_shell_reported(n)
}

/// Re-establishes the background shell in a forked child that wants
/// `isystem` service of its own (`# 4.5`/`# 9`, `isys_lib_initialize`).
/// The old PCO is already gone (the `atfork` child hook drops it); this
/// just boots a fresh one eagerly instead of waiting for the next call.
pub fn reinitialize() -> Result<()> {
    let mut guard = SHELL.lock().expect("isystem shell mutex poisoned");
    *guard = Some(boot()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_reads_plain_exit_code() {
        assert_eq!(parse_status(b"0\nISYSSHELLPROMPT> ").exit_code(), Some(0));
    }

    #[test]
    fn parse_status_reads_signal_convention() {
        assert_eq!(parse_status(b"137\nISYSSHELLPROMPT> ").term_signal(), Some(9));
    }
}
