//! End-to-end tests for the session master over real FIFOs.
//!
//! These tests spawn the compiled `dmux` binary as a foreground master in a
//! temp directory and speak the wire protocol to it through the library's
//! channel layer: admission handshakes, attach/push packets, fan-out, slot
//! release, and the marker file.

use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use dmux::channel::{self, ChannelPair};
use dmux::protocol::{
    ControlRequest, Packet, PacketType, CREATE_REQUEST, MAX_CLIENTS, PACKET_LEN,
};

/// A foreground master process. Killed (and its temp dir removed) on drop.
struct Master {
    child: Child,
    session: PathBuf,
    _dir: tempfile::TempDir,
}

impl Drop for Master {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn dmux_binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_dmux"))
}

/// Spawn `dmux new --foreground` for `argv` and wait for the rendezvous
/// endpoint to appear.
fn spawn_master(argv: &[&str]) -> Master {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("sess");

    let child = dmux_binary()
        .arg("new")
        .arg("--foreground")
        .arg(&session)
        .arg("--")
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn dmux master");

    assert!(
        wait_for(|| channel::miso_path(&session).exists(), Duration::from_secs(5)),
        "rendezvous endpoint never appeared at {session:?}"
    );

    Master {
        child,
        session,
        _dir: dir,
    }
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Perform the admission handshake and return the assigned index without
/// connecting to the slot channel.
fn request_index(session: &Path) -> u8 {
    let rendezvous = channel::connect_pair(session).unwrap();
    channel::write_all(rendezvous.mosi.as_raw_fd(), &[CREATE_REQUEST]).unwrap();
    let mut reply = [0u8; 1];
    channel::read_all(rendezvous.miso.as_raw_fd(), &mut reply).unwrap();
    reply[0]
}

/// Admission handshake plus slot connect.
fn handshake(session: &Path) -> (u8, ChannelPair) {
    let index = request_index(session);
    assert!(
        (index as usize) < MAX_CLIENTS,
        "unexpected server-full reply {index}"
    );
    let pipes = channel::connect_pair(&channel::slot_base(session, index)).unwrap();
    (index, pipes)
}

fn release(session: &Path, index: u8) {
    let rendezvous = channel::connect_pair(session).unwrap();
    channel::write_all(
        rendezvous.mosi.as_raw_fd(),
        &[ControlRequest::Release(index).to_byte()],
    )
    .unwrap();
}

fn send(pipes: &ChannelPair, pkt: &Packet) {
    channel::write_all(pipes.mosi.as_raw_fd(), &pkt.encode()).unwrap();
}

/// Read fanned-out session output until `needle` shows up or the deadline
/// passes. Returns everything read.
fn read_until(pipes: &ChannelPair, needle: &[u8], timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut pfds = [PollFd::new(&pipes.miso, PollFlags::POLLIN)];
        match poll(&mut pfds, remaining.as_millis() as i32) {
            Ok(0) => break,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }

        let mut buf = [0u8; 4096];
        match channel::read_fd(pipes.miso.as_raw_fd(), &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
        }
        if collected
            .windows(needle.len())
            .any(|window| window == needle)
        {
            break;
        }
    }
    collected
}

fn marker_mode(session: &Path) -> u32 {
    std::fs::metadata(session).unwrap().permissions().mode()
}

// ── Admission ───────────────────────────────────────────────────────

#[test]
fn admission_assigns_lowest_free_index() {
    let master = spawn_master(&["/bin/cat"]);

    assert_eq!(request_index(&master.session), 0);
    assert_eq!(request_index(&master.session), 1);
    assert_eq!(request_index(&master.session), 2);

    // Releasing the middle slot makes its index the next assignment.
    release(&master.session, 1);
    assert_eq!(request_index(&master.session), 1);
}

#[test]
fn create_then_release_restores_endpoint_set() {
    let master = spawn_master(&["/bin/cat"]);

    let index = request_index(&master.session);
    let base = channel::slot_base(&master.session, index);
    assert!(wait_for(
        || channel::miso_path(&base).exists() && channel::mosi_path(&base).exists(),
        Duration::from_secs(5)
    ));

    release(&master.session, index);
    assert!(
        wait_for(
            || !channel::miso_path(&base).exists() && !channel::mosi_path(&base).exists(),
            Duration::from_secs(5)
        ),
        "slot endpoints should be unlinked after release"
    );

    // The rendezvous pair survives.
    assert!(channel::miso_path(&master.session).exists());
    assert!(channel::mosi_path(&master.session).exists());
}

#[test]
fn server_full_after_127_clients() {
    let master = spawn_master(&["/bin/cat"]);

    for expected in 0..MAX_CLIENTS as u8 {
        assert_eq!(request_index(&master.session), expected);
    }
    let reply = request_index(&master.session);
    assert!(
        reply as usize >= MAX_CLIENTS,
        "128th client should be refused, got index {reply}"
    );
}

// ── Attach and fan-out ──────────────────────────────────────────────

#[test]
fn attached_client_sees_pty_echo() {
    let master = spawn_master(&["/bin/cat"]);
    let (_index, pipes) = handshake(&master.session);

    send(&pipes, &Packet::bare(PacketType::Attach));
    send(&pipes, &Packet::push(b"ping\n"));

    let output = read_until(&pipes, b"ping", Duration::from_secs(5));
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("ping"), "expected echo, got {text:?}");
}

#[test]
fn fanout_reaches_every_attached_client() {
    let master = spawn_master(&["/bin/cat"]);
    let (_a, pipes_a) = handshake(&master.session);
    let (_b, pipes_b) = handshake(&master.session);

    send(&pipes_a, &Packet::bare(PacketType::Attach));
    send(&pipes_b, &Packet::bare(PacketType::Attach));

    // Give the master a beat to process B's attach before generating
    // output, so both clients are in the fan-out set.
    std::thread::sleep(Duration::from_millis(100));
    send(&pipes_a, &Packet::push(b"tick\n"));

    let out_a = read_until(&pipes_a, b"tick", Duration::from_secs(5));
    let out_b = read_until(&pipes_b, b"tick", Duration::from_secs(5));
    assert!(String::from_utf8_lossy(&out_a).contains("tick"));
    assert!(String::from_utf8_lossy(&out_b).contains("tick"));
}

#[test]
fn unattached_client_receives_nothing() {
    let master = spawn_master(&["/bin/cat"]);
    let (_a, pipes_a) = handshake(&master.session);
    let (_b, pipes_b) = handshake(&master.session);

    // Only A attaches; B just holds a slot.
    send(&pipes_a, &Packet::bare(PacketType::Attach));
    send(&pipes_a, &Packet::push(b"quiet\n"));

    let out_a = read_until(&pipes_a, b"quiet", Duration::from_secs(5));
    assert!(String::from_utf8_lossy(&out_a).contains("quiet"));

    let out_b = read_until(&pipes_b, b"quiet", Duration::from_millis(300));
    assert!(
        out_b.is_empty(),
        "detached client should see no output, got {:?}",
        String::from_utf8_lossy(&out_b)
    );
}

// ── Marker file ─────────────────────────────────────────────────────

#[test]
fn marker_exec_bit_mirrors_attachment() {
    let master = spawn_master(&["/bin/cat"]);
    assert!(wait_for(
        || master.session.exists(),
        Duration::from_secs(5)
    ));
    assert_eq!(marker_mode(&master.session) & 0o100, 0);

    let (_index, pipes) = handshake(&master.session);
    send(&pipes, &Packet::bare(PacketType::Attach));
    assert!(
        wait_for(
            || marker_mode(&master.session) & 0o100 != 0,
            Duration::from_secs(5)
        ),
        "exec bit should be set while a client is attached"
    );

    send(&pipes, &Packet::bare(PacketType::Detach));
    assert!(
        wait_for(
            || marker_mode(&master.session) & 0o100 == 0,
            Duration::from_secs(5)
        ),
        "exec bit should clear after the last detach"
    );
}

// ── Child lifecycle ─────────────────────────────────────────────────

#[test]
fn master_exits_cleanly_when_child_exits() {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("sess");

    let mut child = dmux_binary()
        .arg("new")
        .arg("--foreground")
        .arg(&session)
        .arg("--")
        .args(["/bin/sh", "-c", "exit 0"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let exited = wait_for(
        || matches!(child.try_wait(), Ok(Some(_))),
        Duration::from_secs(10),
    );
    assert!(exited, "master should exit once the child is gone");
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));

    // Teardown removed the endpoints and the marker.
    assert!(!channel::miso_path(&session).exists());
    assert!(!channel::mosi_path(&session).exists());
    assert!(!session.exists());
}

#[test]
fn exec_failure_propagates_to_launcher() {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("sess");

    // Daemonized start: the launcher must relay the exec diagnostic and
    // exit 1, and the session endpoints must not persist.
    let output = dmux_binary()
        .arg("new")
        .arg("-n")
        .arg(&session)
        .arg("--")
        .arg("/no/such/program-for-dmux-e2e")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("could not execute"),
        "missing exec diagnostic in {stderr:?}"
    );

    assert!(
        wait_for(
            || !channel::miso_path(&session).exists(),
            Duration::from_secs(5)
        ),
        "rendezvous endpoint should not persist after exec failure"
    );
}

// ── Push mode ───────────────────────────────────────────────────────

#[test]
fn push_mode_feeds_session_and_releases_slot() {
    let master = spawn_master(&["/bin/cat"]);

    // A library-level attached client observes what push feeds in.
    let (_index, pipes) = handshake(&master.session);
    send(&pipes, &Packet::bare(PacketType::Attach));

    let mut pusher = dmux_binary()
        .arg("push")
        .arg(&master.session)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    {
        use std::io::Write;
        let stdin = pusher.stdin.as_mut().unwrap();
        stdin.write_all(b"pushed\n").unwrap();
    }
    drop(pusher.stdin.take());

    let status = pusher.wait().unwrap();
    assert_eq!(status.code(), Some(0));

    let output = read_until(&pipes, b"pushed", Duration::from_secs(5));
    assert!(String::from_utf8_lossy(&output).contains("pushed"));

    // The pusher's slot (index 1) was released on EOF.
    let base = channel::slot_base(&master.session, 1);
    assert!(wait_for(
        || !channel::miso_path(&base).exists(),
        Duration::from_secs(5)
    ));
}

// ── CLI surface ─────────────────────────────────────────────────────

#[test]
fn attach_to_missing_session_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("no-such-session");

    let output = dmux_binary()
        .arg("attach")
        .arg(&session)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn push_to_missing_session_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("no-such-session");

    let output = dmux_binary()
        .arg("push")
        .arg(&session)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

// ── Packet robustness ───────────────────────────────────────────────

#[test]
fn oversized_push_len_is_dropped_not_fatal() {
    let master = spawn_master(&["/bin/cat"]);
    let (_index, pipes) = handshake(&master.session);
    send(&pipes, &Packet::bare(PacketType::Attach));

    // A PUSH frame claiming more payload than exists must be ignored
    // without dropping the slot.
    let mut bogus = Packet::push(b"x").encode();
    bogus[1] = 0xf0;
    channel::write_all(pipes.mosi.as_raw_fd(), &bogus).unwrap();

    // An unknown packet type is also ignored.
    let mut unknown = [0u8; PACKET_LEN];
    unknown[0] = 0x63;
    channel::write_all(pipes.mosi.as_raw_fd(), &unknown).unwrap();

    // The slot still works afterwards.
    send(&pipes, &Packet::push(b"alive\n"));
    let output = read_until(&pipes, b"alive", Duration::from_secs(5));
    assert!(String::from_utf8_lossy(&output).contains("alive"));
}
