//! One pre-forked background shell and the dedicated thread that drives
//! its FSM (`# 4.4`, per-shell FSM for `WAIT_EOC`/`WAIT_STATUS`/`FREEING`).
//!
//! Grounded on the teacher's `spawn_shell` dedicated `pty-reader-{id}`
//! thread (`core/process_manager.rs`): PTY I/O through a [`pdip::Pco`] is
//! blocking, so each shell gets its own OS thread rather than living on
//! the dispatcher's async task. The thread receives [`ShellCommand`]s and
//! reports [`ShellEvent`]s back to the central dispatcher over
//! `tokio::sync::mpsc` channels.

use std::time::Duration;

use pdip::{Flags, Pco, PcoConfig, RecvOutcome, StatusWord};
use tokio::sync::mpsc;

/// The regex anchoring the shell's prompt. Matches the quiet-boot prompt
/// string this module configures the shell to print (`# 4.4` step 3,
/// "the prompt is the universal synchronization point").
const PROMPT: &str = "PDIPSHELLPROMPT> $";
const PROMPT_SEND: &str = "PS1='PDIPSHELLPROMPT> '\n";

/// How long a worker waits for the next command/disconnect signal between
/// polling its control channel while mid-conversation. Not a protocol
/// timeout — just the granularity at which `CLIENT_DCNX` can interrupt.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum ShellCommand {
    Run { client_id: usize, line: String },
    ClientDisconnected,
}

#[derive(Debug)]
pub enum ShellEvent {
    Display {
        shell_id: usize,
        client_id: usize,
        bytes: Vec<u8>,
    },
    Eoc {
        shell_id: usize,
        client_id: usize,
        status: StatusWord,
    },
    ErrorEoc {
        shell_id: usize,
        client_id: usize,
    },
    /// The command's own prompt was found; the worker is about to issue
    /// `echo $?` and move from `WAIT_EOC` to `WAIT_STATUS`.
    StatusRequested { shell_id: usize, client_id: usize },
    /// The shell finished draining a disconnected client's in-flight
    /// response and is ready to be bound again (`FREEING` -> `FREE`).
    Freed { shell_id: usize },
}

/// Boots `/bin/sh` under a fresh PCO and quiets it down to a recognizable
/// prompt (`# 4.4` step 3, "quiet-boot procedure"). Run on a blocking
/// executor thread by the caller — this does real PTY I/O and blocks.
pub fn boot_shell(affinity: pdip::CpuSet) -> pdip::Result<Pco> {
    let config = PcoConfig::new()
        .with_flags(Flags::RECV_ON_THE_FLOW)
        .with_affinity(affinity);
    let pco = Pco::new(config);
    pco.exec(&["/bin/sh".to_string()])?;
    // Wait for the first (default) prompt, install a recognizable one,
    // then wait again before trusting it as the synchronization point.
    pco.recv(Some("[$#] $"), None)?;
    pco.send(PROMPT_SEND)?;
    pco.recv(Some(PROMPT), None)?;
    pco.send("stty -echo\n")?;
    pco.recv(Some(PROMPT), None)?;
    Ok(pco)
}

/// Spawns the worker thread for an already-booted shell, returning the
/// channel the dispatcher uses to send it commands.
pub fn spawn(
    shell_id: usize,
    pco: Pco,
    events_tx: mpsc::Sender<ShellEvent>,
) -> std::io::Result<(mpsc::Sender<ShellCommand>, std::thread::JoinHandle<()>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let handle = std::thread::Builder::new()
        .name(format!("rsys-shell-{shell_id}"))
        .spawn(move || run_worker(shell_id, pco, cmd_rx, events_tx))?;
    Ok((cmd_tx, handle))
}

fn run_worker(
    shell_id: usize,
    pco: Pco,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    events_tx: mpsc::Sender<ShellEvent>,
) {
    while let Some(cmd) = cmd_rx.blocking_recv() {
        let ShellCommand::Run { client_id, line } = cmd else {
            // A disconnect with no command in flight: nothing to drain.
            continue;
        };

        if pco.send(&format!("{line}\n")).is_err() {
            let _ = events_tx.blocking_send(ShellEvent::ErrorEoc { shell_id, client_id });
            continue;
        }

        match drain_until_prompt(&pco, client_id, shell_id, &mut cmd_rx, &events_tx, true) {
            DrainOutcome::PromptFound => {}
            DrainOutcome::ClientGone => continue,
            DrainOutcome::Error => {
                let _ = events_tx.blocking_send(ShellEvent::ErrorEoc { shell_id, client_id });
                continue;
            }
        }

        let _ = events_tx.blocking_send(ShellEvent::StatusRequested { shell_id, client_id });

        if pco.send("echo $?\n").is_err() {
            let _ = events_tx.blocking_send(ShellEvent::ErrorEoc { shell_id, client_id });
            continue;
        }

        let Some(status_text) = recv_prompt_text(&pco, &mut cmd_rx) else {
            let _ = events_tx.blocking_send(ShellEvent::ErrorEoc { shell_id, client_id });
            continue;
        };

        let status = parse_status(&status_text);
        let _ = events_tx.blocking_send(ShellEvent::Eoc {
            shell_id,
            client_id,
            status,
        });
    }
}

/// What [`drain_until_prompt`] found before returning.
enum DrainOutcome {
    /// The prompt matched; the caller can proceed to the next step.
    PromptFound,
    /// The client disconnected mid-drain (the caller already reported
    /// `Freed`/nothing further is owed to a client that's gone).
    ClientGone,
    /// `recv` itself failed (`# 4.4`, `WAIT_EOC {DATA}`, "On error, emit
    /// error EOC and FREE"). Distinct from `ClientGone` so the caller can
    /// tell the dispatcher to free the shell instead of silently hanging
    /// the still-bound client.
    Error,
}

/// Drains `DATA`/`FOUND` events until the prompt is seen, forwarding
/// mid-response chunks as `DISPLAY` frames (`WAIT_EOC` and `FREEING`'s
/// shared "drain until prompt" behavior).
fn drain_until_prompt(
    pco: &Pco,
    client_id: usize,
    shell_id: usize,
    cmd_rx: &mut mpsc::Receiver<ShellCommand>,
    events_tx: &mpsc::Sender<ShellEvent>,
    forward_display: bool,
) -> DrainOutcome {
    loop {
        if let Ok(ShellCommand::ClientDisconnected) = cmd_rx.try_recv() {
            drain_disconnected(pco, shell_id, events_tx);
            return DrainOutcome::ClientGone;
        }
        match pco.recv(Some(PROMPT), Some(POLL_INTERVAL)) {
            Ok(RecvOutcome::Found(_)) => return DrainOutcome::PromptFound,
            Ok(RecvOutcome::Data(bytes)) => {
                if forward_display && !bytes.is_empty() {
                    let _ = events_tx.blocking_send(ShellEvent::Display {
                        shell_id,
                        client_id,
                        bytes,
                    });
                }
            }
            Ok(RecvOutcome::Timeout) => continue,
            Err(e) => {
                log::warn!("shell {shell_id} desynchronized: {e}");
                return DrainOutcome::Error;
            }
        }
    }
}

/// `FREEING`'s own drain, entered once a client has already disconnected:
/// no more `DISPLAY` frames to send, just consume until the prompt
/// reappears so the shell is usable again.
fn drain_disconnected(pco: &Pco, shell_id: usize, events_tx: &mpsc::Sender<ShellEvent>) {
    loop {
        match pco.recv(Some(PROMPT), Some(Duration::from_secs(5))) {
            Ok(RecvOutcome::Found(_)) => break,
            Ok(RecvOutcome::Data(_)) => continue,
            Ok(RecvOutcome::Timeout) => continue,
            Err(e) => {
                log::warn!("shell {shell_id} failed to resynchronize after disconnect: {e}");
                break;
            }
        }
    }
    let _ = events_tx.blocking_send(ShellEvent::Freed { shell_id });
}

fn recv_prompt_text(pco: &Pco, cmd_rx: &mut mpsc::Receiver<ShellCommand>) -> Option<Vec<u8>> {
    loop {
        if let Ok(ShellCommand::ClientDisconnected) = cmd_rx.try_recv() {
            // Still drain this one exchange so the shell stays usable;
            // the caller has already moved the client on.
        }
        match pco.recv(Some(PROMPT), Some(POLL_INTERVAL)) {
            Ok(RecvOutcome::Found(bytes)) => return Some(bytes),
            Ok(RecvOutcome::Data(_)) => continue,
            Ok(RecvOutcome::Timeout) => continue,
            Err(_) => return None,
        }
    }
}

/// Parses the digits `echo $?` printed and encodes them per the
/// `system(3)` convention (`# 4.4`, "Status encoding convention").
fn parse_status(display: &[u8]) -> StatusWord {
    let text = String::from_utf8_lossy(display);
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    let n: i32 = digits.parse().unwrap_or(0);
    StatusWord::from_shell_reported(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_reads_plain_exit_code() {
        let status = parse_status(b"0\nPDIPSHELLPROMPT> ");
        assert_eq!(status.exit_code(), Some(0));
    }

    #[test]
    fn parse_status_reads_signal_convention() {
        let status = parse_status(b"137\nPDIPSHELLPROMPT> ");
        assert_eq!(status.term_signal(), Some(9));
    }
}
