//! Dispatcher end-to-end scenarios from `# 8` ("End-to-end scenarios"
//! 5 and 6), driven against a real [`rsystemd::dispatcher::run`] instance
//! over an actual Unix domain socket rather than a mock transport.

use std::time::Duration;

use pdip_wire::{Frame, FrameKind};
use rsystemd::dispatcher;
use tokio::net::UnixStream;
use tokio::time::timeout;

fn unique_socket_path(name: &str) -> String {
    format!("/tmp/rsystemd-test-{name}-{}.sock", std::process::id())
}

async fn send_cmd(stream: &mut UnixStream, cmd: &str) {
    use tokio::io::AsyncWriteExt;
    stream
        .write_all(&Frame::cmd(cmd.as_bytes().to_vec()).encode())
        .await
        .unwrap();
}

/// Reads frames until `EOC`, returning every `DISPLAY` payload plus the
/// final status, or `None` if a `BUSY` frame arrives instead.
async fn read_until_eoc(stream: &mut UnixStream) -> Option<(Vec<Vec<u8>>, i32)> {
    use tokio::io::AsyncReadExt;
    let mut displays = Vec::new();
    loop {
        let mut header = [0u8; pdip_wire::HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let (kind, length, status) = Frame::decode_header(&header).unwrap();
        let mut payload = vec![0u8; length as usize];
        stream.read_exact(&mut payload).await.unwrap();
        match kind {
            FrameKind::Display => displays.push(payload),
            FrameKind::Eoc => return Some((displays, status)),
            FrameKind::Busy => return None,
            FrameKind::Oom | FrameKind::Cmd => panic!("unexpected frame kind {kind:?}"),
        }
    }
}

/// Scenario 5: two clients against a two-shell pool, each running a
/// command that sleeps then echoes a tagged marker; both complete with
/// exit status 0 and a `DISPLAY` payload matching the marker.
#[tokio::test]
async fn dispatcher_round_trip_two_clients_two_shells() {
    let socket_path = unique_socket_path("roundtrip");
    let affinities = vec![pdip::CpuSet::alloc(), pdip::CpuSet::alloc()];
    let socket_path_clone = socket_path.clone();
    tokio::spawn(async move {
        let _ = dispatcher::run(&socket_path_clone, affinities).await;
    });

    wait_for_socket(&socket_path).await;

    let mut client_a = UnixStream::connect(&socket_path).await.unwrap();
    let mut client_b = UnixStream::connect(&socket_path).await.unwrap();

    send_cmd(&mut client_a, "sleep 1; echo done#$$").await;
    send_cmd(&mut client_b, "sleep 1; echo done#$$").await;

    let (result_a, result_b) = tokio::join!(
        timeout(Duration::from_secs(10), read_until_eoc(&mut client_a)),
        timeout(Duration::from_secs(10), read_until_eoc(&mut client_b)),
    );

    for result in [result_a, result_b] {
        let (displays, status) = result.expect("timed out").expect("got BUSY, expected EOC");
        assert_eq!(status, 0);
        let joined = displays.concat();
        let text = String::from_utf8_lossy(&joined);
        assert!(text.contains("done#"), "expected a done#<pid> marker, got {text:?}");
    }

    let _ = std::fs::remove_file(&socket_path);
}

/// Scenario 6: a one-shell pool with two concurrent clients — exactly one
/// is told `BUSY`, the other completes normally.
#[tokio::test]
async fn dispatcher_saturation_one_shell_two_clients() {
    let socket_path = unique_socket_path("saturation");
    let affinities = vec![pdip::CpuSet::alloc()];
    let socket_path_clone = socket_path.clone();
    tokio::spawn(async move {
        let _ = dispatcher::run(&socket_path_clone, affinities).await;
    });

    wait_for_socket(&socket_path).await;

    let mut client_a = UnixStream::connect(&socket_path).await.unwrap();
    let mut client_b = UnixStream::connect(&socket_path).await.unwrap();

    // A long-running command on the first client holds the only shell
    // long enough for the second client's CMD frame to definitely arrive
    // first and find the pool saturated.
    send_cmd(&mut client_a, "sleep 2").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    send_cmd(&mut client_b, "echo should-not-run").await;

    let result_a = timeout(Duration::from_secs(10), read_until_eoc(&mut client_a))
        .await
        .expect("timed out");
    let result_b = timeout(Duration::from_secs(10), read_until_eoc(&mut client_b))
        .await
        .expect("timed out");

    let one_busy = result_a.is_none() as u32 + result_b.is_none() as u32;
    assert_eq!(one_busy, 1, "exactly one client should have been told BUSY");

    let completed = result_a.or(result_b).expect("one client should complete");
    assert_eq!(completed.1, 0);

    let _ = std::fs::remove_file(&socket_path);
}

async fn wait_for_socket(path: &str) {
    for _ in 0..100 {
        if UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("dispatcher never bound {path}");
}
