//! The central dispatcher task (`# 4.4`): owns the shell-slot and
//! client-record tables and drives the per-shell FSM in response to
//! connection and shell-worker events.
//!
//! Grounded on `core/status_server.rs`'s single-shared-state async server
//! shape, ported from axum/HTTP onto a raw `tokio::net::UnixListener`
//! accept loop. Unlike that server, the tables here are touched by exactly
//! one task (this one) — every other task only ever sends an event into
//! `events_rx` — so they need no `Arc<RwLock<_>>` at all, per `# 5`'s
//! ambient-stack note on avoiding unnecessary shared-mutable-state wrappers.

use std::collections::HashMap;

use pdip_wire::{Frame, FrameKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::graceful_close;
use crate::shell::{self, ShellCommand, ShellEvent};

/// Shell-slot FSM state (`# 4.4`, "Shell Pool Dispatcher tables").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellState {
    Free,
    Allocated,
    WaitEoc,
    WaitStatus,
    Freeing,
}

struct ShellSlot {
    cmd_tx: mpsc::Sender<ShellCommand>,
    state: ShellState,
    bound_client: Option<usize>,
}

struct ClientSlot {
    to_client: mpsc::Sender<Frame>,
    bound_shell: Option<usize>,
}

enum DispatcherEvent {
    ClientConnected {
        client_id: usize,
        to_client: mpsc::Sender<Frame>,
    },
    ClientCmd {
        client_id: usize,
        line: String,
    },
    ClientDisconnected {
        client_id: usize,
    },
    Shell(ShellEvent),
}

/// Runs the dispatcher forever: boots one shell per affinity entry, binds
/// the listening endpoint, then services connections and shell events in
/// a single task (`# 4.4`, Startup steps 1-4; the graceful-close thread is
/// step 5, spawned by [`crate::graceful_close`] independently of this
/// loop).
pub async fn run(socket_path: &str, affinities: Vec<pdip::CpuSet>) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel::<DispatcherEvent>(256);

    let mut shells = Vec::with_capacity(affinities.len());
    for (shell_id, affinity) in affinities.into_iter().enumerate() {
        let pco = tokio::task::spawn_blocking(move || shell::boot_shell(affinity))
            .await
            .map_err(|e| DispatchError::Io(std::io::Error::other(e.to_string())))?
            .map_err(|e| DispatchError::ShellBootFailed(shell_id, e))?;

        let (shell_events_tx, shell_events_rx) = mpsc::channel::<ShellEvent>(64);
        tokio::spawn(forward_shell_events(shell_events_rx, events_tx.clone()));
        let (cmd_tx, _worker) = shell::spawn(shell_id, pco, shell_events_tx)?;
        shells.push(ShellSlot {
            cmd_tx,
            state: ShellState::Free,
            bound_client: None,
        });
    }
    log::info!("{} shell(s) booted", shells.len());

    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o777));
    }
    log::info!("listening on {socket_path}");

    let mut clients: HashMap<usize, ClientSlot> = HashMap::new();
    let mut next_client_id: usize = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let client_id = next_client_id;
                        next_client_id += 1;
                        tokio::spawn(handle_client(client_id, stream, events_tx.clone()));
                    }
                    Err(e) => log::warn!("accept failed: {e}"),
                }
            }
            Some(event) = events_rx.recv() => {
                handle_event(event, &mut shells, &mut clients).await;
            }
        }
    }
}

/// One task per connected client: reads `CMD` frames off the socket and
/// forwards them as events; a sibling task owns the write half and drains
/// whatever frames the dispatcher decides to send this client.
async fn handle_client(client_id: usize, stream: UnixStream, events_tx: mpsc::Sender<DispatcherEvent>) {
    let (mut read_half, write_half) = stream.into_split();
    let (to_client_tx, to_client_rx) = mpsc::channel::<Frame>(32);
    tokio::spawn(write_loop(write_half, to_client_rx));

    if events_tx
        .send(DispatcherEvent::ClientConnected {
            client_id,
            to_client: to_client_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        let mut header = [0u8; pdip_wire::HEADER_LEN];
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let (kind, length, _status) = match Frame::decode_header(&header) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("client {client_id}: bad frame header: {e}, closing");
                graceful_close::schedule_close(read_half);
                let _ = events_tx
                    .send(DispatcherEvent::ClientDisconnected { client_id })
                    .await;
                return;
            }
        };
        let mut payload = vec![0u8; length as usize];
        if read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        if kind != FrameKind::Cmd {
            log::warn!("client {client_id}: unexpected frame kind from client, closing");
            graceful_close::schedule_close(read_half);
            let _ = events_tx
                .send(DispatcherEvent::ClientDisconnected { client_id })
                .await;
            return;
        }
        let line = String::from_utf8_lossy(&payload).into_owned();
        if events_tx
            .send(DispatcherEvent::ClientCmd { client_id, line })
            .await
            .is_err()
        {
            break;
        }
    }

    let _ = events_tx
        .send(DispatcherEvent::ClientDisconnected { client_id })
        .await;
}

async fn write_loop(mut write_half: tokio::net::unix::OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame.encode()).await.is_err() {
            break;
        }
    }
}

async fn forward_shell_events(mut rx: mpsc::Receiver<ShellEvent>, tx: mpsc::Sender<DispatcherEvent>) {
    while let Some(event) = rx.recv().await {
        if tx.send(DispatcherEvent::Shell(event)).await.is_err() {
            break;
        }
    }
}

async fn handle_event(
    event: DispatcherEvent,
    shells: &mut [ShellSlot],
    clients: &mut HashMap<usize, ClientSlot>,
) {
    match event {
        DispatcherEvent::ClientConnected { client_id, to_client } => {
            clients.insert(
                client_id,
                ClientSlot {
                    to_client,
                    bound_shell: None,
                },
            );
        }

        DispatcherEvent::ClientCmd { client_id, line } => {
            handle_client_cmd(client_id, line, shells, clients).await;
        }

        DispatcherEvent::ClientDisconnected { client_id } => {
            handle_client_disconnected(client_id, shells, clients).await;
        }

        DispatcherEvent::Shell(ShellEvent::Display { shell_id: _, client_id, bytes }) => {
            if let Some(client) = clients.get(&client_id) {
                let _ = client.to_client.send(Frame::display(bytes)).await;
            }
        }

        DispatcherEvent::Shell(ShellEvent::StatusRequested { shell_id, client_id: _ }) => {
            if let Some(shell) = shells.get_mut(shell_id) {
                shell.state = ShellState::WaitStatus;
            }
        }

        DispatcherEvent::Shell(ShellEvent::Eoc { shell_id, client_id, status }) => {
            if let Some(client) = clients.get_mut(&client_id) {
                let _ = client.to_client.send(Frame::eoc(status.as_raw())).await;
                client.bound_shell = None;
            }
            free_shell(shells, shell_id);
        }

        DispatcherEvent::Shell(ShellEvent::ErrorEoc { shell_id, client_id }) => {
            // Sentinel status -1 (`# 7`, "error EOC") when the conversation
            // desynchronized rather than completing normally.
            if let Some(client) = clients.get_mut(&client_id) {
                let _ = client.to_client.send(Frame::eoc(-1)).await;
                client.bound_shell = None;
            }
            free_shell(shells, shell_id);
        }

        DispatcherEvent::Shell(ShellEvent::Freed { shell_id }) => {
            free_shell(shells, shell_id);
        }
    }
}

async fn handle_client_cmd(
    client_id: usize,
    line: String,
    shells: &mut [ShellSlot],
    clients: &mut HashMap<usize, ClientSlot>,
) {
    let Some(client) = clients.get(&client_id) else {
        return;
    };

    let shell_id = match client.bound_shell {
        Some(id) => id,
        None => match find_free_shell(shells) {
            Some(id) => {
                if let Some(client) = clients.get_mut(&client_id) {
                    client.bound_shell = Some(id);
                }
                shells[id].bound_client = Some(client_id);
                shells[id].state = ShellState::Allocated;
                id
            }
            None => {
                // {LINK(client)} had no FREE shell to bind to: distinct
                // BUSY frame, client gives up (`# 4.4`, "Accept loop").
                if let Some(client) = clients.get(&client_id) {
                    let _ = client.to_client.send(Frame::busy()).await;
                }
                return;
            }
        },
    };

    shells[shell_id].state = ShellState::WaitEoc;
    if shells[shell_id]
        .cmd_tx
        .send(ShellCommand::Run { client_id, line })
        .await
        .is_err()
    {
        if let Some(client) = clients.get(&client_id) {
            let _ = client.to_client.send(Frame::oom()).await;
        }
        free_shell(shells, shell_id);
    }
}

async fn handle_client_disconnected(
    client_id: usize,
    shells: &mut [ShellSlot],
    clients: &mut HashMap<usize, ClientSlot>,
) {
    let Some(client) = clients.remove(&client_id) else {
        return;
    };
    let Some(shell_id) = client.bound_shell else {
        return;
    };
    let Some(shell) = shells.get_mut(shell_id) else {
        return;
    };
    match shell.state {
        ShellState::Allocated => {
            shell.state = ShellState::Free;
            shell.bound_client = None;
        }
        ShellState::WaitEoc | ShellState::WaitStatus => {
            shell.state = ShellState::Freeing;
            let _ = shell.cmd_tx.send(ShellCommand::ClientDisconnected).await;
        }
        // A second DCNX racing the first in the same poll pass: no-op
        // (`# 4.4`, `FREEING` {CLIENT_DCNX}).
        ShellState::Freeing | ShellState::Free => {}
    }
}

fn free_shell(shells: &mut [ShellSlot], shell_id: usize) {
    if let Some(shell) = shells.get_mut(shell_id) {
        shell.state = ShellState::Free;
        shell.bound_client = None;
    }
}

fn find_free_shell(shells: &[ShellSlot]) -> Option<usize> {
    shells.iter().position(|s| s.state == ShellState::Free)
}
